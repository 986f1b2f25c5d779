//! Idle reclamation: two independent, time-gated sweeps that recover
//! work abandoned by crashed or killed writers — a priority-rollback pass
//! over recently-stalled Phase 1 transactions, and an expired-log pass over
//! whole stale hours of the transaction log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use btx_core::limits::{PRIORITY_IDLE_INTERVAL, PRIORITY_IDLE_INTERVAL_ACTIVE};
use btx_core::{Clock, CoreResult, L2Cache, Tid};
use btx_durability::sweeper::ExpiredLogSweeper;
use btx_durability::{PriorityRecord, TransactionPriorityLog};
use tracing::{debug, info};

fn priority_interval(active: bool) -> std::time::Duration {
    if active {
        PRIORITY_IDLE_INTERVAL_ACTIVE
    } else {
        PRIORITY_IDLE_INTERVAL
    }
}

/// Detects a distributed cache restart by watching `is_restarted` flip, so
/// the priority pass can switch into ignore-age mode and drain every
/// priority log instead of only ones past the aging window.
pub struct CacheRestartHelper {
    cache: Arc<dyn L2Cache>,
    observed_restart: AtomicBool,
}

impl CacheRestartHelper {
    pub fn new(cache: Arc<dyn L2Cache>) -> Self {
        Self { cache, observed_restart: AtomicBool::new(false) }
    }

    /// Poll the cache; returns true exactly once per observed restart, so
    /// the caller runs a single ignore-age drain rather than every pass
    /// thereafter.
    pub fn take_restart_event(&self) -> bool {
        if self.cache.is_restarted() {
            !self.observed_restart.swap(true, Ordering::SeqCst)
        } else {
            self.observed_restart.store(false, Ordering::SeqCst);
            false
        }
    }
}

/// Process-wide gating state for the two idle passes. A single instance is
/// shared across every transaction on this process.
#[derive(Default)]
pub struct IdleState {
    last_priority_run_millis: AtomicU64,
    last_expired_run_millis: AtomicU64,
    priority_work_found: AtomicBool,
}

/// Runs the priority-rollback and expired-log passes on demand, called
/// before Phase 1 proceeds.
pub struct IdleReclamation {
    state: IdleState,
    priority_log: Arc<dyn TransactionPriorityLog>,
    sweeper: Arc<ExpiredLogSweeper>,
    restart_helper: CacheRestartHelper,
    clock: Arc<dyn Clock>,
}

impl IdleReclamation {
    pub fn new(
        priority_log: Arc<dyn TransactionPriorityLog>,
        sweeper: Arc<ExpiredLogSweeper>,
        cache: Arc<dyn L2Cache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: IdleState::default(),
            priority_log,
            sweeper,
            restart_helper: CacheRestartHelper::new(cache),
            clock,
        }
    }

    /// Run whichever of the two passes are due. `priority_rollback` and
    /// `rollback_tid` are supplied by the coordinator, which owns the
    /// collaborators needed to actually undo a stalled transaction.
    pub fn reap(
        &self,
        priority_rollback: impl Fn(Tid) -> CoreResult<()>,
        rollback_tid: impl Fn(Tid) -> CoreResult<()>,
    ) -> CoreResult<()> {
        self.maybe_run_priority_pass(&priority_rollback)?;
        self.maybe_run_expired_pass(&rollback_tid)?;
        Ok(())
    }

    fn maybe_run_priority_pass(&self, priority_rollback: &impl Fn(Tid) -> CoreResult<()>) -> CoreResult<bool> {
        if !self.priority_log.is_enabled() {
            return Ok(false);
        }
        let now = self.clock.now_millis();
        let active = self.state.priority_work_found.load(Ordering::SeqCst);
        let interval = priority_interval(active);
        let last = self.state.last_priority_run_millis.load(Ordering::SeqCst);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return Ok(false);
        }
        self.state.last_priority_run_millis.store(now, Ordering::SeqCst);

        let ignore_age = self.restart_helper.take_restart_event();
        let found_work = self.do_priority_rollbacks(priority_rollback, ignore_age)?;
        self.state.priority_work_found.store(found_work, Ordering::SeqCst);
        Ok(found_work)
    }

    /// `doPriorityRollbacks`: idempotent batch drain of priority log
    /// records older than the aging window (or everything, in ignore-age
    /// mode).
    fn do_priority_rollbacks(&self, priority_rollback: &impl Fn(Tid) -> CoreResult<()>, ignore_age: bool) -> CoreResult<bool> {
        const BATCH_SIZE: usize = 32;
        let cutoff = self.clock.now_millis().saturating_sub(btx_core::limits::PRIORITY_LOG_AGING_WINDOW.as_millis() as u64);
        let batch: Vec<PriorityRecord> = self.priority_log.get_batch(BATCH_SIZE, cutoff, ignore_age)?;
        let found_work = !batch.is_empty();
        for record in batch {
            if let Err(e) = priority_rollback(record.tid) {
                debug!(tid = %record.tid, error = %e, "priority rollback attempt failed, will retry next pass");
            }
        }
        Ok(found_work)
    }

    fn maybe_run_expired_pass(&self, rollback_tid: &impl Fn(Tid) -> CoreResult<()>) -> CoreResult<bool> {
        let now = self.clock.now_millis();
        let active = self.sweeper.is_draining();
        let interval = if active {
            btx_core::limits::EXPIRED_LOG_IDLE_INTERVAL_ACTIVE
        } else {
            btx_core::limits::EXPIRED_LOG_IDLE_INTERVAL
        };
        let last = self.state.last_expired_run_millis.load(Ordering::SeqCst);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return Ok(false);
        }
        self.state.last_expired_run_millis.store(now, Ordering::SeqCst);

        let current_hour = self.clock.current_hour();
        let Some(tids) = self.sweeper.claim_stale_hour(current_hour)? else {
            return Ok(false);
        };
        let found_work = !tids.is_empty();
        for tid in tids {
            if let Err(e) = rollback_tid(tid) {
                debug!(%tid, error = %e, "expired-log rollback attempt failed, hour retained for next pass");
            }
        }
        self.sweeper.finish_hour();
        if found_work {
            info!(hour = current_hour, "drained expired transaction log hour");
        }
        Ok(found_work)
    }
}
