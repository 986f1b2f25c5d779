//! The per-transaction function-code log: append-only progress
//! records, read back for rollback playback and for the expired-log
//! sweeper.

use btx_core::{CoreResult, Tid};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::function_code::FunctionCode;

/// One logged step of a transaction's commit progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub tid: Tid,
    pub code: FunctionCode,
    pub payload: Vec<u8>,
    /// Wall-clock hour bucket this entry was written in, per
    /// [`btx_core::Clock::current_hour`]. Used by the expired-log sweeper to
    /// claim one stale hour at a time.
    pub hour: u64,
}

/// Append-only function-code log, keyed by transaction id.
///
/// Implementations must preserve append order per TID: replay and recovery
/// both depend on log entries for a TID reflecting the order they were
/// written in.
pub trait TransactionLog: Send + Sync {
    /// Append an entry, advancing the TID's logged progress.
    fn add(&self, tid: Tid, code: FunctionCode, payload: Vec<u8>, hour: u64) -> CoreResult<()>;
    /// Delete every entry for a TID (post-commit cleanup, or rollback
    /// completion).
    fn remove(&self, tid: Tid) -> CoreResult<()>;
    /// All entries logged for a TID, in append order.
    fn entries(&self, tid: Tid) -> CoreResult<Vec<LogEntry>>;
    /// An arbitrary TID with entries from an hour strictly older than
    /// `current_hour`, if any — the expired-log sweeper's unit of work.
    fn get_one_expired(&self, current_hour: u64) -> CoreResult<Option<(Tid, u64)>>;
    /// Every TID with entries in a specific hour bucket.
    fn get_one_of_hour(&self, hour: u64) -> CoreResult<Vec<Tid>>;
}

/// In-memory `TransactionLog`.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    entries: DashMap<Tid, Vec<LogEntry>>,
    next_hour_hint: AtomicU64,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn add(&self, tid: Tid, code: FunctionCode, payload: Vec<u8>, hour: u64) -> CoreResult<()> {
        self.next_hour_hint.fetch_max(hour, Ordering::SeqCst);
        self.entries.entry(tid).or_default().push(LogEntry { tid, code, payload, hour });
        Ok(())
    }

    fn remove(&self, tid: Tid) -> CoreResult<()> {
        self.entries.remove(&tid);
        Ok(())
    }

    fn entries(&self, tid: Tid) -> CoreResult<Vec<LogEntry>> {
        Ok(self.entries.get(&tid).map(|e| e.clone()).unwrap_or_default())
    }

    fn get_one_expired(&self, current_hour: u64) -> CoreResult<Option<(Tid, u64)>> {
        for entry in self.entries.iter() {
            let hour = entry.value().iter().map(|e| e.hour).min().unwrap_or(current_hour);
            if hour < current_hour {
                return Ok(Some((*entry.key(), hour)));
            }
        }
        Ok(None)
    }

    fn get_one_of_hour(&self, hour: u64) -> CoreResult<Vec<Tid>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().iter().any(|entry| entry.hour == hour))
            .map(|e| *e.key())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order_per_tid() {
        let log = InMemoryTransactionLog::new();
        let tid = Tid::new();
        log.add(tid, FunctionCode::LockTrackedItems, vec![], 10).unwrap();
        log.add(tid, FunctionCode::CommitTrackedItemsValues, vec![], 10).unwrap();
        let codes: Vec<_> = log.entries(tid).unwrap().into_iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![FunctionCode::LockTrackedItems, FunctionCode::CommitTrackedItemsValues]);
    }

    #[test]
    fn remove_clears_entries() {
        let log = InMemoryTransactionLog::new();
        let tid = Tid::new();
        log.add(tid, FunctionCode::LockTrackedItems, vec![], 1).unwrap();
        log.remove(tid).unwrap();
        assert!(log.entries(tid).unwrap().is_empty());
    }

    #[test]
    fn expired_hour_is_found_and_hour_match_groups_tids() {
        let log = InMemoryTransactionLog::new();
        let old_tid = Tid::new();
        let fresh_tid = Tid::new();
        log.add(old_tid, FunctionCode::LockTrackedItems, vec![], 1).unwrap();
        log.add(fresh_tid, FunctionCode::LockTrackedItems, vec![], 100).unwrap();

        let (found, hour) = log.get_one_expired(50).unwrap().unwrap();
        assert_eq!(found, old_tid);
        assert_eq!(hour, 1);

        let tids = log.get_one_of_hour(1).unwrap();
        assert_eq!(tids, vec![old_tid]);
        assert!(log.get_one_expired(1).unwrap().is_none());
    }
}
