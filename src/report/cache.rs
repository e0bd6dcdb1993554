//! Cache-line occupancy analysis over a live-block snapshot.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::trace::BlockMetadata;

/// Occupancy of a single cache line.
#[derive(Debug, Clone, Serialize)]
pub struct CacheLine {
    pub line_index: usize,
    pub line_offset: usize,
    pub bytes_used: usize,
    pub bytes_wasted: usize,
    pub utilization: f64,
    pub is_split: bool,
    pub tags: Vec<String>,
}

/// Aggregate cache utilization over the whole arena.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub cache_line_size: usize,
    pub total_lines: usize,
    pub active_lines: usize,
    pub fully_utilized: usize,
    pub split_allocations: usize,
    pub avg_utilization: f64,
    pub lines: Vec<CacheLine>,
}

/// Maps blocks onto fixed-width cache lines. Stateless: each `analyze`
/// call produces an independent report.
#[derive(Debug, Clone, Copy)]
pub struct CacheAnalyzer {
    line_size: usize,
}

impl CacheAnalyzer {
    /// A zero or non-power-of-two width falls back to 64.
    pub fn new(line_size: usize) -> Self {
        let line_size = if line_size.is_power_of_two() {
            line_size
        } else {
            64
        };
        Self { line_size }
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Hardware L1 data line width, probed once; 64 when the OS will not
    /// say.
    pub fn detect_line_size() -> usize {
        static DETECTED: Lazy<usize> = Lazy::new(CacheAnalyzer::probe_line_size);
        *DETECTED
    }

    #[cfg(target_os = "linux")]
    fn probe_line_size() -> usize {
        let line = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if line > 0 && (line as usize).is_power_of_two() {
            return line as usize;
        }
        64
    }

    #[cfg(target_os = "macos")]
    fn probe_line_size() -> usize {
        let mut line: usize = 0;
        let mut len = std::mem::size_of::<usize>();
        let name = std::ffi::CString::new("hw.cachelinesize").unwrap();
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                &mut line as *mut usize as *mut libc::c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc == 0 && line > 0 && line.is_power_of_two() {
            return line;
        }
        64
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn probe_line_size() -> usize {
        64
    }

    pub fn analyze(&self, blocks: &[BlockMetadata], arena_capacity: usize) -> CacheReport {
        let line_size = self.line_size;
        let total_lines = arena_capacity.div_ceil(line_size);
        let mut report = CacheReport {
            cache_line_size: line_size,
            total_lines,
            active_lines: 0,
            fully_utilized: 0,
            split_allocations: 0,
            avg_utilization: 0.0,
            lines: Vec::new(),
        };
        if blocks.is_empty() || arena_capacity == 0 {
            return report;
        }

        struct LineAccum {
            bytes_used: usize,
            is_split: bool,
            tags: Vec<String>,
        }
        let mut line_map: BTreeMap<usize, LineAccum> = BTreeMap::new();

        for block in blocks {
            if block.actual_size == 0 {
                continue;
            }
            let start = block.offset;
            let end = block.offset + block.actual_size;
            let first_line = start / line_size;
            let last_line = (end - 1) / line_size;
            let split = last_line > first_line;
            if split {
                report.split_allocations += 1;
            }
            for line in first_line..=last_line {
                let line_start = line * line_size;
                let line_end = line_start + line_size;
                let overlap = end.min(line_end) - start.max(line_start);
                let accum = line_map.entry(line).or_insert_with(|| LineAccum {
                    bytes_used: 0,
                    is_split: false,
                    tags: Vec::new(),
                });
                accum.bytes_used += overlap;
                accum.is_split |= split;
                if !block.tag.is_empty() {
                    accum.tags.push(block.tag.sanitized());
                }
            }
        }

        let mut total_utilization = 0.0;
        for (line_index, accum) in line_map {
            // Overlapping blocks cannot push a line past its width.
            let bytes_used = accum.bytes_used.min(line_size);
            let utilization = bytes_used as f64 / line_size as f64;
            if bytes_used == line_size {
                report.fully_utilized += 1;
            }
            total_utilization += utilization;
            report.lines.push(CacheLine {
                line_index,
                line_offset: line_index * line_size,
                bytes_used,
                bytes_wasted: line_size - bytes_used,
                utilization,
                is_split: accum.is_split,
                tags: accum.tags,
            });
        }
        report.active_lines = report.lines.len();
        if report.active_lines > 0 {
            report.avg_utilization = total_utilization / report.active_lines as f64;
        }
        report
    }
}

impl Default for CacheAnalyzer {
    fn default() -> Self {
        Self::new(64)
    }
}
