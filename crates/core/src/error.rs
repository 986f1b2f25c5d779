//! Error types shared by every layer of the transaction coordinator.
//!
//! Every external-collaborator trait (registry, blob store, caches, store
//! repository, transaction log) returns [`CoreResult`], so a single `?` chain
//! runs from the lowest I/O call up through the coordinator without manual
//! conversion at each crate boundary.

use crate::types::LockKey;
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Unified error type for the transaction coordinator.
///
/// Variants map 1:1 onto the error kinds of the coordinator design: illegal
/// state transitions (`Precondition`), lock/version races (`Conflict`),
/// registry sector contention (`SectorTimeout`), deadline overruns
/// (`Timeout`), collaborator I/O failures (`Backend`), and intents that
/// cannot be re-applied during refetch-and-merge (`Integrity`).
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation was attempted from an illegal transaction state, e.g.
    /// `Phase2Commit` before `Phase1Commit`, or `Begin` twice.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A lock is held by another live owner, or a version read at commit
    /// time no longer matches what was read at classification time.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The registry reported sector-level lock contention. Carries the
    /// contended [`LockKey`] so the coordinator can attempt a takeover via
    /// `priorityRollback` before retrying the failing step.
    #[error("registry sector lock timeout on {}", .lock_key.key)]
    SectorTimeout {
        /// The lock key the registry could not grant.
        lock_key: LockKey,
    },

    /// An operation exceeded its deadline (`maxDuration` or caller context).
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A blob store, cache, or registry call failed. Always drives rollback.
    #[error("backend error: {0}")]
    Backend(String),

    /// A recorded intent (update/remove) could not be re-applied during
    /// refetch-and-merge, e.g. the target item was concurrently removed.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl CoreError {
    /// True for errors the Phase 1 retry loop may recover from locally
    /// (refetch-and-merge or a priority-rollback takeover) without aborting
    /// the whole phase.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, CoreError::Conflict(_) | CoreError::SectorTimeout { .. })
    }

    /// True for errors that must abort the phase and drive rollback.
    pub fn drives_rollback(&self) -> bool {
        matches!(self, CoreError::Backend(_) | CoreError::Integrity(_) | CoreError::Timeout(_))
    }
}
