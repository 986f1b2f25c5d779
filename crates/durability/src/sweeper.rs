//! Expired-log sweeping: claiming a single stale wall-clock
//! hour out of the transaction log and handing back the TIDs found there
//! for rollback playback.

use std::sync::Arc;

use btx_core::{CoreResult, Tid};
use parking_lot::Mutex;

use crate::log::TransactionLog;

/// Claims one stale hour of the transaction log at a time, so concurrent
/// idle passes (across processes sharing a log) don't duplicate work on the
/// same hour. `hour_being_processed` is deliberately a single process-wide
/// slot rather than per-caller state.
pub struct ExpiredLogSweeper {
    log: Arc<dyn TransactionLog>,
    hour_being_processed: Mutex<Option<u64>>,
}

impl ExpiredLogSweeper {
    pub fn new(log: Arc<dyn TransactionLog>) -> Self {
        Self {
            log,
            hour_being_processed: Mutex::new(None),
        }
    }

    /// True while a stale hour is mid-drain — the idle pass uses this to
    /// pick its shorter "active" polling interval.
    pub fn is_draining(&self) -> bool {
        self.hour_being_processed.lock().is_some()
    }

    /// Claim a stale hour (one strictly older than `current_hour`) if one
    /// isn't already being processed, returning every TID found in it.
    /// Returns `None` if nothing is stale or a drain is already in flight.
    pub fn claim_stale_hour(&self, current_hour: u64) -> CoreResult<Option<Vec<Tid>>> {
        let mut guard = self.hour_being_processed.lock();
        if guard.is_some() {
            return Ok(None);
        }
        let Some((_, hour)) = self.log.get_one_expired(current_hour)? else {
            return Ok(None);
        };
        let tids = self.log.get_one_of_hour(hour)?;
        *guard = Some(hour);
        Ok(Some(tids))
    }

    /// Release the claimed hour once every TID in it has been rolled
    /// forward or back.
    pub fn finish_hour(&self) {
        *self.hour_being_processed.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryTransactionLog;
    use crate::function_code::FunctionCode;

    #[test]
    fn claims_only_one_hour_at_a_time() {
        let log = Arc::new(InMemoryTransactionLog::new());
        let tid = Tid::new();
        log.add(tid, FunctionCode::LockTrackedItems, vec![], 1).unwrap();
        let sweeper = ExpiredLogSweeper::new(log);

        let claimed = sweeper.claim_stale_hour(5).unwrap().unwrap();
        assert_eq!(claimed, vec![tid]);
        assert!(sweeper.is_draining());
        assert!(sweeper.claim_stale_hour(5).unwrap().is_none());

        sweeper.finish_hour();
        assert!(!sweeper.is_draining());
    }

    #[test]
    fn nothing_stale_returns_none() {
        let log = Arc::new(InMemoryTransactionLog::new());
        let sweeper = ExpiredLogSweeper::new(log);
        assert!(sweeper.claim_stale_hour(5).unwrap().is_none());
    }
}
