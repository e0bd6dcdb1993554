//! Contract between the aggregator and whatever transports events out.

use parking_lot::Mutex;

/// Called when a new subscriber attaches and needs the current state.
pub type SnapshotProvider = Box<dyn Fn() -> String + Send + Sync>;

/// Called with inbound text messages; the format is opaque to the core.
pub type CommandHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Receiver of serialized event batches.
///
/// `broadcast` is invoked at least once per aggregator tick whenever the
/// tick drained one or more events; the payload is one JSON array. A sink
/// that panics is isolated by the aggregator and must not assume it can
/// take the allocator down.
pub trait EventSink: Send + Sync {
    fn broadcast(&self, payload: &str);

    fn set_snapshot_provider(&self, provider: SnapshotProvider) {
        let _ = provider;
    }

    fn set_command_handler(&self, handler: CommandHandler) {
        let _ = handler;
    }
}

/// In-memory sink retaining every broadcast payload. Stands in for the
/// WebSocket transport in tests and demos.
#[derive(Default)]
pub struct CollectingSink {
    payloads: Mutex<Vec<String>>,
    snapshot_provider: Mutex<Option<SnapshotProvider>>,
    command_handler: Mutex<Option<CommandHandler>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().clone()
    }

    pub fn take_payloads(&self) -> Vec<String> {
        std::mem::take(&mut self.payloads.lock())
    }

    /// What a freshly attached subscriber would be sent.
    pub fn request_snapshot(&self) -> Option<String> {
        self.snapshot_provider.lock().as_ref().map(|p| p())
    }

    /// Feed an inbound message to the installed handler.
    pub fn deliver_command(&self, message: &str) {
        if let Some(handler) = self.command_handler.lock().as_ref() {
            handler(message);
        }
    }
}

impl EventSink for CollectingSink {
    fn broadcast(&self, payload: &str) {
        self.payloads.lock().push(payload.to_owned());
    }

    fn set_snapshot_provider(&self, provider: SnapshotProvider) {
        *self.snapshot_provider.lock() = Some(provider);
    }

    fn set_command_handler(&self, handler: CommandHandler) {
        *self.command_handler.lock() = Some(handler);
    }
}
