use thiserror::Error;

/// Errors surfaced at the arena API boundary.
///
/// Internal invariant violations (tree corruption, accounting underflow) are
/// programming errors and panic instead of appearing here.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// A configuration or construction parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The underlying virtual-memory operation failed.
    #[error("system error: {0}")]
    SystemError(#[from] std::io::Error),

    /// Allocation alignment was not a power of two.
    #[error("invalid alignment (must be a power of two)")]
    InvalidAlignment,

    /// No free block in the selected shard can satisfy the request.
    #[error("out of memory")]
    OutOfMemory,

    /// Deallocation target is outside the shard's range or misaligned.
    #[error("pointer not owned by this allocator")]
    BadPointer,
}

pub type Result<T> = std::result::Result<T, ArenaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(ArenaError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            ArenaError::InvalidAlignment.to_string(),
            "invalid alignment (must be a power of two)"
        );
        assert_eq!(
            ArenaError::InvalidArgument("capacity must be non-zero").to_string(),
            "invalid argument: capacity must be non-zero"
        );
    }
}
