//! The priority log: a separate, per-TID record of handles staged
//! for activation, written once at `beforeFinalize` and consulted only by
//! the idle priority-rollback pass to recover a crashed writer's Phase 1.

use btx_core::{CoreResult, Handle, Tid};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A staged handle tagged with the store/table it belongs to. A transaction
/// can span several stores, so the plain `Handle` isn't enough on its own to
/// know which registry table a priority rollback should write back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityHandle {
    pub store: String,
    pub handle: Handle,
}

/// Handles a transaction staged for activation/removal finalization,
/// captured just before `finalizeCommit` so a crash between
/// `beforeFinalize` and a successful Phase 2 can be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityPayload {
    pub updated: Vec<PriorityHandle>,
    pub removed: Vec<PriorityHandle>,
}

impl PriorityPayload {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// One priority log record plus the wall-clock instant it was written, used
/// by `doPriorityRollbacks`' age-threshold gate.
#[derive(Debug, Clone)]
pub struct PriorityRecord {
    pub tid: Tid,
    pub payload: PriorityPayload,
    pub logged_at_millis: u64,
}

/// Per-TID store of staged-for-activation handles.
pub trait TransactionPriorityLog: Send + Sync {
    /// Whether this deployment keeps a priority log at all. A backend that
    /// returns `false` here disables the idle priority-rollback pass
    /// entirely.
    fn is_enabled(&self) -> bool;
    /// Write the payload for a TID.
    fn add(&self, tid: Tid, payload: PriorityPayload, now_millis: u64) -> CoreResult<()>;
    /// Remove a TID's payload (Phase 2 success).
    fn remove(&self, tid: Tid) -> CoreResult<()>;
    /// Read a single TID's payload.
    fn get(&self, tid: Tid) -> CoreResult<Option<PriorityRecord>>;
    /// Up to `n` records older than `older_than_millis`, or every record
    /// regardless of age when `ignore_age` is set (the post-cache-restart
    /// drain mode).
    fn get_batch(&self, n: usize, older_than_millis: u64, ignore_age: bool) -> CoreResult<Vec<PriorityRecord>>;
    /// Preserve a payload under a separate backup key before attempting its
    /// removal, so a crash mid-remove doesn't lose the record.
    fn write_backup(&self, tid: Tid, payload: &PriorityPayload) -> CoreResult<()>;
    /// Drop a payload's backup once its primary removal has been confirmed.
    fn remove_backup(&self, tid: Tid) -> CoreResult<()>;
}

/// In-memory `TransactionPriorityLog`.
#[derive(Debug, Default)]
pub struct InMemoryPriorityLog {
    records: DashMap<Tid, (PriorityPayload, u64)>,
    backups: DashMap<Tid, PriorityPayload>,
}

impl InMemoryPriorityLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionPriorityLog for InMemoryPriorityLog {
    fn is_enabled(&self) -> bool {
        true
    }

    fn add(&self, tid: Tid, payload: PriorityPayload, now_millis: u64) -> CoreResult<()> {
        self.records.insert(tid, (payload, now_millis));
        Ok(())
    }

    fn remove(&self, tid: Tid) -> CoreResult<()> {
        self.records.remove(&tid);
        Ok(())
    }

    fn get(&self, tid: Tid) -> CoreResult<Option<PriorityRecord>> {
        Ok(self.records.get(&tid).map(|r| PriorityRecord {
            tid,
            payload: r.0.clone(),
            logged_at_millis: r.1,
        }))
    }

    fn get_batch(&self, n: usize, older_than_millis: u64, ignore_age: bool) -> CoreResult<Vec<PriorityRecord>> {
        let mut out: Vec<PriorityRecord> = self
            .records
            .iter()
            .filter(|e| ignore_age || e.value().1 <= older_than_millis)
            .map(|e| PriorityRecord {
                tid: *e.key(),
                payload: e.value().0.clone(),
                logged_at_millis: e.value().1,
            })
            .collect();
        out.sort_by_key(|r| r.logged_at_millis);
        out.truncate(n);
        Ok(out)
    }

    fn write_backup(&self, tid: Tid, payload: &PriorityPayload) -> CoreResult<()> {
        self.backups.insert(tid, payload.clone());
        Ok(())
    }

    fn remove_backup(&self, tid: Tid) -> CoreResult<()> {
        self.backups.remove(&tid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_sorted_oldest_first_and_respects_age_cutoff() {
        let log = InMemoryPriorityLog::new();
        let old = Tid::new();
        let young = Tid::new();
        log.add(old, PriorityPayload { updated: vec![], removed: vec![] }, 100).unwrap();
        log.add(young, PriorityPayload { updated: vec![], removed: vec![] }, 900).unwrap();

        let batch = log.get_batch(10, 500, false).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].tid, old);

        let all = log.get_batch(10, 0, true).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tid, old);
    }

    #[test]
    fn remove_drops_record() {
        let log = InMemoryPriorityLog::new();
        let tid = Tid::new();
        log.add(tid, PriorityPayload { updated: vec![], removed: vec![] }, 1).unwrap();
        log.remove(tid).unwrap();
        assert!(log.get(tid).unwrap().is_none());
    }

    #[test]
    fn backup_round_trips() {
        let log = InMemoryPriorityLog::new();
        let tid = Tid::new();
        let payload = PriorityPayload { updated: vec![], removed: vec![] };
        log.write_backup(tid, &payload).unwrap();
        log.remove_backup(tid).unwrap();
    }
}
