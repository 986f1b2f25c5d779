//! The 2PC state machine: Phase 1, Phase 2, and rollback, plus the
//! sector-timeout handler that bridges a registry contention error back
//! into a retryable outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use btx_core::{
    CoreError, CoreResult, Handle, ItemId, L1Cache, L2Cache, LockKey, LogicalId, Registry,
    StoreInfo, StoreRepository, Tid, TransactionMode, TransactionPhase,
};
use btx_durability::{FunctionCode, PriorityHandle, PriorityPayload, TransactionLog, TransactionPriorityLog};
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::lock::{acquire_locks, handle_registry_sector_lock_timeout, merge_ids, merge_node_keys, release_locks};
use crate::payload::{
    last_node_ids, last_store_info, ActivelyPersistedPayload, FinalizePayload, NodeIdsPayload,
    StoreInfoPayload, StoreItemIds, TrackedValueIdsPayload,
};
use crate::transaction::{StagedHandle, StoreSession, Transaction};

/// A brief randomized backoff between retry-loop iterations, between lock
/// contention and refetch attempts.
fn jitter_sleep() {
    let millis = rand::thread_rng().gen_range(1..=8);
    std::thread::sleep(Duration::from_millis(millis));
}

/// Which node-staging steps landed for one store during a single Phase 1
/// retry-loop iteration, so a mid-iteration break only undoes what this
/// iteration actually staged.
#[derive(Debug, Default, Clone, Copy)]
struct CommittedSteps {
    root: bool,
    updated: bool,
    removed: bool,
}

/// Drives Phase 1/Phase 2/rollback for transactions sharing one set of
/// durability collaborators.
pub struct Coordinator {
    store_repo: Arc<dyn StoreRepository>,
    l1: Arc<dyn L1Cache>,
    log: Arc<dyn TransactionLog>,
    priority_log: Arc<dyn TransactionPriorityLog>,
    clock: Arc<dyn btx_core::Clock>,
    /// The registry backing every store/table, consulted by
    /// `priority_rollback` to re-verify and write back handles it has no
    /// live transaction to reach through.
    registry: Arc<dyn Registry>,
    cache: Arc<dyn L2Cache>,
    lock_ttl: Duration,
}

impl Coordinator {
    pub fn new(
        store_repo: Arc<dyn StoreRepository>,
        l1: Arc<dyn L1Cache>,
        log: Arc<dyn TransactionLog>,
        priority_log: Arc<dyn TransactionPriorityLog>,
        clock: Arc<dyn btx_core::Clock>,
        registry: Arc<dyn Registry>,
        cache: Arc<dyn L2Cache>,
        lock_ttl: Duration,
    ) -> Self {
        Self { store_repo, l1, log, priority_log, clock, registry, cache, lock_ttl }
    }

    fn log_step(&self, tid: Tid, code: FunctionCode, payload: Vec<u8>) -> CoreResult<()> {
        self.log.add(tid, code, payload, self.clock.current_hour())
    }

    fn load_store_info(&self, name: &str) -> CoreResult<StoreInfo> {
        self.store_repo
            .get(std::slice::from_ref(&name.to_string()))?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| CoreError::Integrity(format!("unknown store {name}")))
    }

    fn load_handles(&self, session: &StoreSession, nodes: &[btx_storage::Node]) -> CoreResult<Vec<Handle>> {
        let ids: Vec<LogicalId> = nodes.iter().map(|n| n.logical_id).collect();
        let handles = session.backend.registry_get(&ids)?;
        handles
            .into_iter()
            .zip(ids)
            .map(|(h, id)| h.ok_or_else(|| CoreError::Integrity(format!("handle {id} missing"))))
            .collect()
    }

    /// Phase 1. Reads intents accumulated on each of `tx`'s
    /// store sessions, locks and classifies nodes, stages blob/registry
    /// writes, and stages (but does not yet persist) handle activation.
    #[instrument(skip_all, fields(tid = %tx.tid))]
    pub fn phase1_commit(&self, tx: &mut Transaction) -> CoreResult<()> {
        tx.require_phase(TransactionPhase::Begun)?;

        if matches!(tx.mode, TransactionMode::ReadOnly) {
            for session in &tx.sessions {
                let info = self.load_store_info(&session.store_name)?;
                let classification = session.backend.classify_modified_nodes(info.count, info.root_node_id);
                if !session.backend.are_fetched_items_intact(&classification.fetched)? {
                    return Err(CoreError::Conflict("reader intactness check failed".into()));
                }
            }
            tx.phase = TransactionPhase::Phase1Done;
            return Ok(());
        }

        if matches!(tx.mode, TransactionMode::NoCheck) || !tx.has_tracked_items() {
            tx.phase = TransactionPhase::Phase1Done;
            return Ok(());
        }

        self.log_step(tx.tid, FunctionCode::LockTrackedItems, Vec::new())?;
        for session in &tx.sessions {
            session.tracker.lock()?;
        }

        let deadline = Instant::now() + tx.max_duration;
        loop {
            if Instant::now() > deadline {
                return Err(CoreError::Timeout(format!("phase1 exceeded max_duration for {}", tx.tid)));
            }

            let mut store_infos = HashMap::new();
            let mut classifications = HashMap::new();
            let mut updated_ids = Vec::new();
            let mut removed_ids = Vec::new();
            for session in &tx.sessions {
                let info = self.load_store_info(&session.store_name)?;
                let classification = session.backend.classify_modified_nodes(info.count, info.root_node_id);
                updated_ids.extend(classification.updated.iter().map(|n| n.logical_id));
                removed_ids.extend(classification.removed.iter().map(|n| n.logical_id));
                classifications.insert(session.store_name.clone(), classification);
                store_infos.insert(session.store_name.clone(), info);
            }

            let ids = merge_ids(&updated_ids, &removed_ids);
            let node_keys = match acquire_locks(tx.cache.as_ref(), tx.tid, &ids, tx.max_duration) {
                Ok(keys) => keys,
                Err(CoreError::SectorTimeout { lock_key }) => {
                    self.resolve_sector_timeout(tx, &lock_key)?;
                    jitter_sleep();
                    tx.needs_refetch_and_merge = true;
                    continue;
                }
                Err(CoreError::Conflict(_)) => {
                    jitter_sleep();
                    tx.needs_refetch_and_merge = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if tx.needs_refetch_and_merge {
                // Re-reading committed node state happens naturally on the
                // next classify_modified_nodes call above; this iteration's
                // fresh classification already reflects it.
                tx.needs_refetch_and_merge = false;
                for session in &tx.sessions {
                    session.tracker.lock()?;
                }
                continue;
            }

            for session in &tx.sessions {
                let info = &store_infos[&session.store_name];
                let written = session.tracker.commit_tracked_items_values(
                    info.value_in_node_segment,
                    info.value_actively_persisted,
                    info.value_globally_cached,
                    info.value_cache_ttl,
                    || ItemId::new(),
                )?;
                self.log_step(
                    tx.tid,
                    FunctionCode::CommitTrackedItemsValues,
                    TrackedValueIdsPayload { store: session.store_name.clone(), ids: written }.encode(),
                )?;
                // Step 6.e: the blobs these pre-commit entries guarded are
                // now reachable from the commit log above, so recovery no
                // longer needs them as a separate signal.
                for precommit_tid in session.tracker.drain_precommit_tids() {
                    self.log.remove(precommit_tid)?;
                }
            }

            let mut needs_retry = false;
            // Which of new-root/updated/removed staging actually landed for
            // a store this iteration, so a mid-loop break only undoes steps
            // that really ran rather than reverting a concurrent writer's
            // legitimately staged work.
            let mut committed_steps: HashMap<String, CommittedSteps> = HashMap::new();
            'sessions: for session in &tx.sessions {
                let classification = &classifications[&session.store_name];
                let mut steps = CommittedSteps::default();

                self.log_step(
                    tx.tid,
                    FunctionCode::CommitNewRootNodes,
                    NodeIdsPayload::new(&session.store_name, &classification.root).encode(),
                )?;
                match session.backend.commit_new_root_nodes(&classification.root) {
                    Ok(true) => steps.root = true,
                    Ok(false) => {
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(CoreError::SectorTimeout { lock_key }) => {
                        self.resolve_sector_timeout(tx, &lock_key)?;
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(e) => return Err(e),
                }

                self.log_step(tx.tid, FunctionCode::AreFetchedItemsIntact, Vec::new())?;
                if !session.backend.are_fetched_items_intact(&classification.fetched)? {
                    committed_steps.insert(session.store_name.clone(), steps);
                    needs_retry = true;
                    break 'sessions;
                }

                self.log_step(
                    tx.tid,
                    FunctionCode::CommitUpdatedNodes,
                    NodeIdsPayload::new(&session.store_name, &classification.updated).encode(),
                )?;
                match session.backend.commit_updated_nodes(&classification.updated) {
                    Ok(true) => steps.updated = true,
                    Ok(false) => {
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(CoreError::SectorTimeout { lock_key }) => {
                        self.resolve_sector_timeout(tx, &lock_key)?;
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(e) => return Err(e),
                }

                self.log_step(
                    tx.tid,
                    FunctionCode::CommitRemovedNodes,
                    NodeIdsPayload::new(&session.store_name, &classification.removed).encode(),
                )?;
                match session.backend.commit_removed_nodes(&classification.removed) {
                    Ok(true) => steps.removed = true,
                    Ok(false) => {
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(e) => return Err(e),
                }

                self.log_step(
                    tx.tid,
                    FunctionCode::CommitAddedNodes,
                    NodeIdsPayload::new(&session.store_name, &classification.added).encode(),
                )?;
                match session.backend.commit_added_nodes(&classification.added) {
                    Ok(()) => {}
                    Err(CoreError::SectorTimeout { lock_key }) => {
                        self.resolve_sector_timeout(tx, &lock_key)?;
                        committed_steps.insert(session.store_name.clone(), steps);
                        needs_retry = true;
                        break 'sessions;
                    }
                    Err(e) => return Err(e),
                }
                committed_steps.insert(session.store_name.clone(), steps);
            }

            if needs_retry {
                self.rollback_partial(tx, &classifications, &committed_steps)?;
                if !node_keys.is_empty() {
                    tx.cache.unlock(&node_keys)?;
                }
                jitter_sleep();
                tx.needs_refetch_and_merge = true;
                continue;
            }

            for info in store_infos.values() {
                self.log_step(
                    tx.tid,
                    FunctionCode::CommitStoreInfo,
                    StoreInfoPayload::new(info.clone()).encode(),
                )?;
            }
            for (_, mut info) in store_infos.clone() {
                info.apply_count_delta();
                self.store_repo.update(vec![info])?;
            }

            self.log_step(tx.tid, FunctionCode::BeforeFinalize, Vec::new())?;
            let mut staged = crate::transaction::StagedActivation::default();
            for session in &tx.sessions {
                let classification = &classifications[&session.store_name];
                let mut updated_handles = self.load_handles(session, &classification.updated)?;
                let mut removed_handles = self.load_handles(session, &classification.removed)?;
                session.backend.activate_inactive_nodes(&mut updated_handles);
                session.backend.touch_nodes(&mut removed_handles);
                staged.activated.extend(updated_handles.into_iter().map(|h| StagedHandle {
                    store_name: session.store_name.clone(),
                    handle: h,
                }));
                staged.touched_removed.extend(removed_handles.into_iter().map(|h| StagedHandle {
                    store_name: session.store_name.clone(),
                    handle: h,
                }));
            }
            if !staged.is_empty() {
                self.priority_log.add(
                    tx.tid,
                    PriorityPayload {
                        updated: staged
                            .activated
                            .iter()
                            .map(|h| PriorityHandle { store: h.store_name.clone(), handle: h.handle.clone() })
                            .collect(),
                        removed: staged
                            .touched_removed
                            .iter()
                            .map(|h| PriorityHandle { store: h.store_name.clone(), handle: h.handle.clone() })
                            .collect(),
                    },
                    self.clock.now_millis(),
                )?;
            }
            tx.staged = staged;

            for session in &tx.sessions {
                session.tracker.check_tracked_items()?;
            }
            if !node_keys.is_empty() && !tx.cache.is_locked(&node_keys)? {
                jitter_sleep();
                continue;
            }

            tx.phase = TransactionPhase::Phase1Done;
            debug!("phase1 committed");
            return Ok(());
        }
    }

    /// Best-effort rollback of whatever landed in this retry-loop
    /// iteration before a `needs_retry` break, so the next iteration
    /// starts clean. The node locks acquired earlier this iteration are
    /// still held, so updated/removed handles are reverted via
    /// `UpdateNoLocks`. Does not touch the function-code log — that rewind
    /// happens only on a terminal failure via `rollback`.
    fn rollback_partial(
        &self,
        tx: &Transaction,
        classifications: &HashMap<String, btx_storage::backend::Classification>,
        committed_steps: &HashMap<String, CommittedSteps>,
    ) -> CoreResult<()> {
        for session in &tx.sessions {
            let Some(classification) = classifications.get(&session.store_name) else { continue };
            let steps = committed_steps.get(&session.store_name).copied().unwrap_or_default();
            // `commit_added_nodes` has no partial-failure outcome short of an
            // error, and its ids are always freshly generated by this
            // session, so undoing it unconditionally is safe cleanup.
            let _ = session.backend.rollback_added_nodes(&classification.added);
            if steps.root {
                let _ = session.backend.rollback_added_nodes(&classification.root);
            }
            if steps.removed {
                if let Ok(handles) = self.load_handles(session, &classification.removed) {
                    let _ = session.backend.rollback_removed_nodes(true, handles);
                }
            }
            if steps.updated {
                if let Ok(handles) = self.load_handles(session, &classification.updated) {
                    let _ = session.backend.rollback_updated_nodes(true, handles);
                }
            }
        }
        Ok(())
    }

    fn resolve_sector_timeout(&self, tx: &Transaction, lock_key: &LockKey) -> CoreResult<()> {
        handle_registry_sector_lock_timeout(tx.cache.as_ref(), tx.max_duration, lock_key, |tid| {
            self.priority_rollback(tid)
        })
    }

    /// Phase 2: persist the staged handle activation
    /// atomically, fire off best-effort warmup/replication, release locks,
    /// and clean up obsolete blobs/registry entries.
    #[instrument(skip_all, fields(tid = %tx.tid))]
    pub fn phase2_commit(&self, tx: &mut Transaction) -> CoreResult<()> {
        tx.require_phase(TransactionPhase::Phase1Done)?;

        let finalize_payload = FinalizePayload {
            tracked_item_values: tx
                .sessions
                .iter()
                .map(|session| StoreItemIds {
                    store: session.store_name.clone(),
                    ids: session.tracker.obsolete_tracked_items_values(),
                })
                .collect(),
        };
        self.log_step(tx.tid, FunctionCode::FinalizeCommit, finalize_payload.encode())?;

        if !tx.staged.is_empty() {
            for session in &tx.sessions {
                let handles: Vec<Handle> = tx.staged.for_store(&session.store_name).cloned().collect();
                if handles.is_empty() {
                    continue;
                }
                if let Err(e) = session.backend.finalize_handles(handles) {
                    if self.node_keys_still_held(tx)? {
                        let _ = self.priority_rollback(tx.tid);
                    } else {
                        self.priority_log.remove(tx.tid)?;
                    }
                    let _ = self.rollback(tx);
                    return Err(e);
                }
            }
        }

        for session in &tx.sessions {
            for handle in tx.staged.for_store(&session.store_name) {
                self.l1.set_node(handle.active_id(), Vec::new(), handle.version);
                self.l1.set_handle(handle.logical_id, handle.active_id());
            }
        }
        self.priority_log.remove(tx.tid)?;

        let node_ids: Vec<LogicalId> = tx
            .staged
            .activated
            .iter()
            .chain(tx.staged.touched_removed.iter())
            .map(|h| h.handle.logical_id)
            .collect();
        let node_keys = merge_node_keys(tx.tid, &node_ids, &[]);
        if !node_keys.is_empty() {
            let _ = tx.cache.unlock(&node_keys);
        }
        for session in &tx.sessions {
            let _ = session.tracker.unlock();
        }

        self.log_step(tx.tid, FunctionCode::DeleteObsoleteEntries, Vec::new())?;
        for session in &tx.sessions {
            let obsolete: Vec<ItemId> = session.tracker.obsolete_tracked_items_values();
            if !obsolete.is_empty() {
                let _ = tx.blobs.remove(&session.store_name, &obsolete);
            }
        }
        self.log_step(tx.tid, FunctionCode::DeleteTrackedItemsValues, Vec::new())?;
        self.log.remove(tx.tid)?;

        for session in &tx.sessions {
            session.backend.clear();
        }
        tx.phase = TransactionPhase::Done;
        Ok(())
    }

    fn node_keys_still_held(&self, tx: &Transaction) -> CoreResult<bool> {
        let node_ids: Vec<LogicalId> = tx
            .staged
            .activated
            .iter()
            .chain(tx.staged.touched_removed.iter())
            .map(|h| h.handle.logical_id)
            .collect();
        let node_keys = merge_node_keys(tx.tid, &node_ids, &[]);
        if node_keys.is_empty() {
            return Ok(false);
        }
        tx.cache.is_locked(&node_keys)
    }

    /// Best-effort recovery of a transaction abandoned mid-`beforeFinalize`,
    /// driven by the idle priority-rollback pass (or a sector-timeout
    /// takeover) with only a `Tid` in hand: no live `Transaction`/session
    /// state survives a crashed writer, so this re-derives everything from
    /// the priority log and the registry directly.
    ///
    /// Re-acquires each staged handle's node lock as `tid` itself (a
    /// takeover, not a new owner), verifies the registry hasn't moved more
    /// than one version past what was staged, and clears
    /// `work_in_progress` via `update_no_locks`. If any handle has drifted
    /// further than that the takeover backs off and leaves the record for
    /// a later pass rather than risk clobbering someone else's commit.
    pub fn priority_rollback(&self, tid: Tid) -> CoreResult<()> {
        let Some(record) = self.priority_log.get(tid)? else { return Ok(()) };
        let staged: Vec<&PriorityHandle> =
            record.payload.updated.iter().chain(record.payload.removed.iter()).collect();
        if staged.is_empty() {
            return self.finish_priority_rollback(tid, &record.payload);
        }

        let ids: Vec<LogicalId> = staged.iter().map(|g| g.handle.logical_id).collect();
        let locks = acquire_locks(self.cache.as_ref(), tid, &ids, self.lock_ttl)?;

        let mut current_by_id = HashMap::with_capacity(staged.len());
        let mut verified = true;
        for group in &staged {
            let current = self
                .registry
                .get(&group.store, std::slice::from_ref(&group.handle.logical_id))?
                .into_iter()
                .next()
                .flatten();
            let ok = matches!(
                &current,
                Some(h) if h.version == group.handle.version || h.version == group.handle.version + 1
            );
            if !ok {
                verified = false;
                break;
            }
            current_by_id.insert(group.handle.logical_id, current);
        }

        if !verified {
            release_locks(self.cache.as_ref(), &locks)?;
            warn!(%tid, "priority rollback takeover too far from staged version, deferring");
            return Ok(());
        }

        for group in &staged {
            let mut handle = match current_by_id.remove(&group.handle.logical_id).flatten() {
                Some(h) if h.version == group.handle.version + 1 => h,
                _ => group.handle.clone(),
            };
            handle.finalize();
            self.registry.update_no_locks(&group.store, false, vec![handle])?;
        }

        release_locks(self.cache.as_ref(), &locks)?;
        self.finish_priority_rollback(tid, &record.payload)
    }

    fn finish_priority_rollback(&self, tid: Tid, payload: &PriorityPayload) -> CoreResult<()> {
        if self.priority_log.remove(tid).is_err() {
            self.priority_log.write_backup(tid, payload)?;
            self.priority_log.remove(tid)?;
            self.priority_log.remove_backup(tid)?;
        }
        Ok(())
    }

    /// Rollback: gated by how far the commit progressed,
    /// undoes each staged step in reverse.
    #[instrument(skip_all, fields(tid = %tx.tid))]
    pub fn rollback(&self, tx: &mut Transaction) -> CoreResult<()> {
        let entries = self.log.entries(tx.tid)?;
        let committed = FunctionCode::highest(entries.iter().map(|e| e.code));

        if committed == FunctionCode::AddActivelyPersistedItem {
            for entry in entries.iter().filter(|e| e.code == FunctionCode::AddActivelyPersistedItem) {
                let payload = ActivelyPersistedPayload::decode(&entry.payload);
                tx.blobs.remove(&payload.store, &[payload.item_id])?;
            }
            self.log.remove(tx.tid)?;
            tx.phase = TransactionPhase::Done;
            return Ok(());
        }

        if committed > FunctionCode::FinalizeCommit {
            return Err(CoreError::Precondition("cannot roll back a committed transaction".into()));
        }

        for session in &tx.sessions {
            let added_ids = last_node_ids(&entries, FunctionCode::CommitAddedNodes, &session.store_name);
            let root_ids = last_node_ids(&entries, FunctionCode::CommitNewRootNodes, &session.store_name);
            let removed_ids = last_node_ids(&entries, FunctionCode::CommitRemovedNodes, &session.store_name);
            let updated_ids = last_node_ids(&entries, FunctionCode::CommitUpdatedNodes, &session.store_name);
            let node_keys = merge_node_keys(tx.tid, &updated_ids, &removed_ids);
            let locked = if node_keys.is_empty() { false } else { tx.cache.is_locked(&node_keys)? };

            if committed >= FunctionCode::CommitAddedNodes {
                session.backend.rollback_added_nodes_by_id(&added_ids)?;
            }
            if committed >= FunctionCode::CommitNewRootNodes {
                session.backend.rollback_added_nodes_by_id(&root_ids)?;
            }
            if committed >= FunctionCode::CommitRemovedNodes {
                session.backend.rollback_removed_nodes_by_id(locked, &removed_ids)?;
            }
            if committed >= FunctionCode::CommitUpdatedNodes {
                session.backend.rollback_updated_nodes_by_id(locked, &updated_ids)?;
            }
            if committed >= FunctionCode::CommitStoreInfo {
                if let Some(info) = last_store_info(&entries, &session.store_name) {
                    self.store_repo.update(vec![info])?;
                }
            }

            if !node_keys.is_empty() {
                tx.cache.unlock(&node_keys)?;
            }
            session.tracker.unlock()?;
            session.backend.clear();
        }

        self.log.remove(tx.tid)?;
        self.priority_log.remove(tx.tid)?;
        tx.phase = TransactionPhase::Done;
        warn!(?committed, "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btx_core::{BlobStore, Clock, L2Cache, Registry, StoreInfo, SystemClock};
    use btx_durability::{InMemoryPriorityLog, InMemoryTransactionLog};
    use btx_storage::{InMemoryBlobStore, InMemoryL1Cache, InMemoryL2Cache, InMemoryRegistry, InMemoryStoreRepository};

    struct Harness {
        coordinator: Coordinator,
        registry: Arc<InMemoryRegistry>,
        blobs: Arc<InMemoryBlobStore>,
        cache: Arc<InMemoryL2Cache>,
        store_repo: Arc<InMemoryStoreRepository>,
        log: Arc<InMemoryTransactionLog>,
        clock: Arc<dyn Clock>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(InMemoryRegistry::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let cache = Arc::new(InMemoryL2Cache::new());
        let store_repo = Arc::new(InMemoryStoreRepository::new());
        let log = Arc::new(InMemoryTransactionLog::new());
        let priority_log = Arc::new(InMemoryPriorityLog::new());
        let l1 = Arc::new(InMemoryL1Cache::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let coordinator = Coordinator::new(
            store_repo.clone() as Arc<dyn StoreRepository>,
            l1 as Arc<dyn btx_core::L1Cache>,
            log.clone() as Arc<dyn TransactionLog>,
            priority_log as Arc<dyn TransactionPriorityLog>,
            clock.clone(),
            registry.clone() as Arc<dyn Registry>,
            cache.clone() as Arc<dyn L2Cache>,
            Duration::from_secs(30),
        );
        Harness { coordinator, registry, blobs, cache, store_repo, log, clock }
    }

    fn provision(h: &Harness, store: &str) -> LogicalId {
        let root_id = LogicalId::new();
        let physical = btx_core::PhysicalId::new();
        let node = btx_storage::Node::new_staged(root_id, physical, true);
        h.blobs.add(store, physical, node.payload().unwrap()).unwrap();
        h.registry.add(store, vec![Handle::new_staged(root_id, physical)]).unwrap();
        h.store_repo.add(vec![StoreInfo::new(store, root_id, 64)]).unwrap();
        root_id
    }

    fn begin(h: &Harness, store: &str) -> Transaction {
        let mut tx = Transaction::begin(
            TransactionMode::Writer,
            None,
            h.cache.clone() as Arc<dyn L2Cache>,
            h.registry.clone() as Arc<dyn Registry>,
            h.blobs.clone() as Arc<dyn btx_core::BlobStore>,
        );
        tx.add_store_session(StoreSession {
            store_name: store.to_string(),
            backend: btx_storage::NodeRepositoryBackend::new(store, h.registry.clone() as Arc<dyn Registry>, h.blobs.clone() as Arc<dyn btx_core::BlobStore>),
            tracker: crate::tracker::ItemActionTracker::new(
                store,
                tx.tid,
                h.blobs.clone() as Arc<dyn btx_core::BlobStore>,
                h.cache.clone() as Arc<dyn L2Cache>,
                h.log.clone() as Arc<dyn TransactionLog>,
                h.clock.clone(),
            ),
        });
        tx
    }

    #[test]
    fn phase1_and_phase2_commit_an_item_add() {
        let h = harness();
        provision(&h, "orders");
        let mut tx = begin(&h, "orders");
        tx.store_session("orders").unwrap().tracker.add(ItemId::new(), b"v".to_vec(), false, false, None).unwrap();

        h.coordinator.phase1_commit(&mut tx).unwrap();
        assert_eq!(tx.phase, TransactionPhase::Phase1Done);
        h.coordinator.phase2_commit(&mut tx).unwrap();
        assert_eq!(tx.phase, TransactionPhase::Done);
        assert!(h.log.entries(tx.tid).unwrap().is_empty());
    }

    #[test]
    fn phase2_before_phase1_is_rejected() {
        let h = harness();
        provision(&h, "orders");
        let mut tx = begin(&h, "orders");
        let err = h.coordinator.phase2_commit(&mut tx).unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[test]
    fn rollback_of_a_never_logged_transaction_just_clears_state() {
        let h = harness();
        provision(&h, "orders");
        let mut tx = begin(&h, "orders");
        h.coordinator.rollback(&mut tx).unwrap();
        assert_eq!(tx.phase, TransactionPhase::Done);
    }
}
