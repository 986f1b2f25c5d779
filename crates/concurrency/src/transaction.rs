//! Transaction context: identity, mode, phase, and the per-store
//! trackers/backends a session accumulates as it touches stores.

use std::sync::Arc;
use std::time::Duration;

use btx_core::{limits::clamp_max_duration, BlobStore, CoreError, CoreResult, Handle, L2Cache, Registry, Tid, TransactionMode, TransactionPhase};
use btx_storage::NodeRepositoryBackend;

use crate::tracker::ItemActionTracker;

/// Everything a transaction needs to commit against one store: its node
/// backend and its item-action tracker, both scoped to that store's table.
pub struct StoreSession {
    pub store_name: String,
    pub backend: NodeRepositoryBackend,
    pub tracker: ItemActionTracker,
}

/// A handle staged for Phase 2 finalization, tagged with the store it
/// belongs to so `finalize_handles` can be dispatched to the right table.
#[derive(Debug, Clone)]
pub struct StagedHandle {
    pub store_name: String,
    pub handle: Handle,
}

/// Handles staged for Phase 2 finalization, accumulated at the end of
/// Phase 1.
#[derive(Debug, Default, Clone)]
pub struct StagedActivation {
    pub activated: Vec<StagedHandle>,
    pub touched_removed: Vec<StagedHandle>,
}

impl StagedActivation {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.touched_removed.is_empty()
    }

    pub fn for_store<'a>(&'a self, store_name: &'a str) -> impl Iterator<Item = &'a Handle> + 'a {
        self.activated
            .iter()
            .chain(self.touched_removed.iter())
            .filter(move |h| h.store_name == store_name)
            .map(|h| &h.handle)
    }
}

/// A single client session's transaction: identity, mode, lifecycle phase,
/// and the collaborators it was opened against.
pub struct Transaction {
    pub tid: Tid,
    pub mode: TransactionMode,
    pub phase: TransactionPhase,
    pub max_duration: Duration,
    pub cache: Arc<dyn L2Cache>,
    pub registry: Arc<dyn Registry>,
    pub blobs: Arc<dyn BlobStore>,
    pub sessions: Vec<StoreSession>,
    pub staged: StagedActivation,
    pub needs_refetch_and_merge: bool,
}

impl Transaction {
    pub fn begin(
        mode: TransactionMode,
        requested_max_duration: Option<Duration>,
        cache: Arc<dyn L2Cache>,
        registry: Arc<dyn Registry>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            tid: Tid::new(),
            mode,
            phase: TransactionPhase::Begun,
            max_duration: clamp_max_duration(requested_max_duration),
            cache,
            registry,
            blobs,
            sessions: Vec::new(),
            staged: StagedActivation::default(),
            needs_refetch_and_merge: false,
        }
    }

    pub fn add_store_session(&mut self, session: StoreSession) {
        self.sessions.push(session);
    }

    pub fn store_session(&self, name: &str) -> Option<&StoreSession> {
        self.sessions.iter().find(|s| s.store_name == name)
    }

    pub fn has_tracked_items(&self) -> bool {
        self.sessions.iter().any(|s| !s.tracker.is_empty())
    }

    /// Enforce the coordinator's legal-transition table: illegal calls fail
    /// with a stable `Precondition` error rather than panicking.
    pub fn require_phase(&self, expected: TransactionPhase) -> CoreResult<()> {
        if self.phase != expected {
            return Err(CoreError::Precondition(format!(
                "expected phase {:?}, got {:?}",
                expected, self.phase
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btx_storage::{InMemoryBlobStore, InMemoryL2Cache, InMemoryRegistry};

    fn begun() -> Transaction {
        Transaction::begin(
            TransactionMode::Writer,
            None,
            Arc::new(InMemoryL2Cache::new()),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryBlobStore::new()),
        )
    }

    #[test]
    fn begin_clamps_an_unset_duration_to_the_default() {
        let tx = begun();
        assert_eq!(tx.max_duration, btx_core::limits::DEFAULT_MAX_DURATION);
        assert_eq!(tx.phase, TransactionPhase::Begun);
    }

    #[test]
    fn require_phase_rejects_a_mismatched_phase() {
        let mut tx = begun();
        assert!(tx.require_phase(TransactionPhase::Begun).is_ok());
        tx.phase = TransactionPhase::Phase1Done;
        assert!(matches!(tx.require_phase(TransactionPhase::Begun), Err(CoreError::Precondition(_))));
    }

    #[test]
    fn staged_activation_for_store_filters_by_store_name() {
        let mut staged = StagedActivation::default();
        let h = Handle::new_staged(btx_core::LogicalId::new(), btx_core::PhysicalId::new());
        staged.activated.push(StagedHandle { store_name: "orders".into(), handle: h.clone() });
        staged.touched_removed.push(StagedHandle { store_name: "users".into(), handle: h });

        assert_eq!(staged.for_store("orders").count(), 1);
        assert_eq!(staged.for_store("users").count(), 1);
        assert_eq!(staged.for_store("missing").count(), 0);
    }
}
