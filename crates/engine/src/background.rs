//! A background thread that periodically drives idle reclamation so it
//! still runs on processes that open transactions rarely: the two passes
//! are time-gated, not request-gated, so something has to call in on a
//! schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::database::Database;

/// Owns a thread that calls [`Database::reap_idle_work`] on a fixed tick
/// until dropped or told to stop. The tick only needs to be shorter than
/// the shortest idle interval (`PRIORITY_IDLE_INTERVAL_ACTIVE`, 5s) to
/// avoid starving reclamation; `Database::reap_idle_work` itself no-ops
/// between a pass's own interval.
pub struct BackgroundReclaimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundReclaimer {
    pub fn spawn(db: Arc<Database>, tick: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_handle = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_handle.load(Ordering::Relaxed) {
                if let Err(e) = db.reap_idle_work() {
                    warn!(error = %e, "background idle reclamation pass failed");
                }
                std::thread::sleep(tick);
            }
        });
        Self { stop, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundReclaimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
