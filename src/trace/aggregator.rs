//! Periodic drain of per-thread rings into batches and the event log.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::event::AllocationEvent;
use super::sink::EventSink;
use super::tracker::LocalTracker;

/// Tick period of the drain thread.
pub const TICK: Duration = Duration::from_millis(16);

/// Events retained for `event_log_json`; older entries are shed first.
const LOG_CAPACITY: usize = 1 << 16;

/// Owns the registry of live trackers and the drain thread.
///
/// Trackers are held weakly: a thread that exits (or rebinds to a newer
/// facade) drops its tracker, and the stale handle is pruned on the next
/// drain. Each drained batch is appended to a bounded log and, when a sink
/// is installed, serialized and broadcast. Sink panics are contained.
pub struct Aggregator {
    shared: Arc<AggregatorShared>,
    tick: Option<JoinHandle<()>>,
}

struct AggregatorShared {
    trackers: Mutex<Vec<Weak<LocalTracker>>>,
    log: Mutex<VecDeque<AllocationEvent>>,
    sink: Option<Arc<dyn EventSink>>,
    shutdown: AtomicBool,
}

impl Aggregator {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        let shared = Arc::new(AggregatorShared {
            trackers: Mutex::new(Vec::new()),
            log: Mutex::new(VecDeque::new()),
            sink,
            shutdown: AtomicBool::new(false),
        });
        let tick = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("arenascope-events".into())
                .spawn(move || Self::run(shared))
                .expect("failed to spawn aggregator thread")
        };
        Self {
            shared,
            tick: Some(tick),
        }
    }

    pub fn register(&self, tracker: &Arc<LocalTracker>) {
        self.shared.trackers.lock().push(Arc::downgrade(tracker));
    }

    /// Drain synchronously and serialize the retained log.
    pub fn event_log_json(&self) -> String {
        Self::drain(&self.shared);
        let log = self.shared.log.lock();
        serde_json::to_string(&*log).unwrap_or_else(|_| String::from("[]"))
    }

    fn run(shared: Arc<AggregatorShared>) {
        while !shared.shutdown.load(Ordering::Acquire) {
            thread::sleep(TICK);
            let batch = Self::drain(&shared);
            Self::forward(&shared, &batch);
        }
        // One final drain so nothing recorded before shutdown is lost.
        let batch = Self::drain(&shared);
        Self::forward(&shared, &batch);
    }

    fn drain(shared: &AggregatorShared) -> Vec<AllocationEvent> {
        let mut batch = Vec::new();
        {
            let mut trackers = shared.trackers.lock();
            trackers.retain(|weak| match weak.upgrade() {
                Some(tracker) => {
                    tracker.drain_into(&mut batch);
                    true
                }
                None => false,
            });
        }
        if !batch.is_empty() {
            let mut log = shared.log.lock();
            for event in &batch {
                if log.len() == LOG_CAPACITY {
                    log.pop_front();
                }
                log.push_back(*event);
            }
        }
        batch
    }

    fn forward(shared: &AggregatorShared, batch: &[AllocationEvent]) {
        if batch.is_empty() {
            return;
        }
        tracing::trace!(events = batch.len(), "drained event batch");
        let Some(sink) = &shared.sink else {
            return;
        };
        let payload = serde_json::to_string(batch).unwrap_or_else(|_| String::from("[]"));
        if panic::catch_unwind(AssertUnwindSafe(|| sink.broadcast(&payload))).is_err() {
            tracing::warn!("event sink panicked during broadcast");
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(tick) = self.tick.take() {
            let _ = tick.join();
        }
    }
}
