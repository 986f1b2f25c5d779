//! Node repository backend: stages node writes to the blob store and
//! registry, and undoes them again during rollback.
//!
//! One backend instance is scoped to a single store (identified by `table`,
//! the registry/blob-store table name). The session's local cache of
//! touched nodes lives here rather than on the transaction itself, since
//! it's the backend that knows how to classify and commit it.

use btx_core::{BlobStore, CoreError, CoreResult, Handle, LogicalId, Registry};
use dashmap::DashMap;
use std::sync::Arc;

use crate::model::{ItemActionRecord, Node, NodeAction};

/// Output of `classify_modified_nodes`: the five buckets Phase 1 commits in
/// order, running `commitNewRootNodes` before `commitUpdatedNodes` before
/// `commitRemovedNodes` before `commitAddedNodes`.
#[derive(Debug, Default, Clone)]
pub struct Classification {
    pub updated: Vec<Node>,
    pub removed: Vec<Node>,
    pub added: Vec<Node>,
    pub fetched: Vec<Node>,
    pub root: Vec<Node>,
}

/// Per-store commit/rollback surface over a `Registry` + `BlobStore` pair.
pub struct NodeRepositoryBackend {
    table: String,
    registry: Arc<dyn Registry>,
    blobs: Arc<dyn BlobStore>,
    local_cache: DashMap<LogicalId, ItemActionRecord>,
}

impl NodeRepositoryBackend {
    pub fn new(table: impl Into<String>, registry: Arc<dyn Registry>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            table: table.into(),
            registry,
            blobs,
            local_cache: DashMap::new(),
        }
    }

    /// Record a node touched by the session under way.
    pub fn track(&self, record: ItemActionRecord) {
        self.local_cache.insert(record.node.logical_id, record);
    }

    /// Look up a node previously tracked by this session.
    pub fn get_tracked(&self, id: LogicalId) -> Option<ItemActionRecord> {
        self.local_cache.get(&id).map(|r| r.clone())
    }

    /// Partition the local cache into the five commit buckets.
    ///
    /// A new root node — `node.is_root` with no prior count for the store —
    /// is split out from plain `added` so concurrent creators can be merged
    /// by `commit_new_root_nodes` instead of colliding in
    /// `commit_added_nodes`.
    pub fn classify_modified_nodes(&self, store_count: i64, root_id: LogicalId) -> Classification {
        let mut out = Classification::default();
        for entry in self.local_cache.iter() {
            let record = entry.value();
            match record.action {
                NodeAction::Default | NodeAction::Get => out.fetched.push(record.node.clone()),
                NodeAction::Update => out.updated.push(record.node.clone()),
                NodeAction::Remove => out.removed.push(record.node.clone()),
                NodeAction::Add => {
                    if record.node.is_root && store_count == 0 && record.node.logical_id == root_id {
                        out.root.push(record.node.clone());
                    } else {
                        out.added.push(record.node.clone());
                    }
                }
            }
        }
        out
    }

    fn load_handle(&self, id: LogicalId) -> CoreResult<Option<Handle>> {
        Ok(self.registry.get(&self.table, &[id])?.into_iter().next().flatten())
    }

    /// Fetch handles by logical id, for callers (the coordinator) that need
    /// them directly rather than through a commit/rollback operation.
    pub fn registry_get(&self, ids: &[LogicalId]) -> CoreResult<Vec<Option<Handle>>> {
        self.registry.get(&self.table, ids)
    }

    /// Create handles for concurrently-raced root nodes. Returns `false` if
    /// a handle for the root already exists — the caller must refetch and
    /// merge instead of treating this session's root as authoritative.
    pub fn commit_new_root_nodes(&self, nodes: &[Node]) -> CoreResult<bool> {
        for node in nodes {
            if self.load_handle(node.logical_id)?.is_some() {
                return Ok(false);
            }
        }
        for node in nodes {
            self.blobs.add(&self.table, node.physical_id, node.payload()?)?;
            self.registry
                .add(&self.table, vec![Handle::new_staged(node.logical_id, node.physical_id)])?;
        }
        Ok(true)
    }

    /// Stage updated nodes into their handle's inactive slot. Returns
    /// `false` on an optimistic version mismatch. A `SectorTimeout` from the
    /// registry propagates unchanged for the coordinator's sector-timeout
    /// handler to resolve before the caller retries.
    pub fn commit_updated_nodes(&self, nodes: &[Node]) -> CoreResult<bool> {
        let mut staged = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut handle = self.load_handle(node.logical_id)?.ok_or_else(|| {
                CoreError::Integrity(format!("update target {} has no handle", node.logical_id))
            })?;
            if handle.version != node.version {
                return Ok(false);
            }
            handle.stage_update(node.physical_id);
            self.blobs.add(&self.table, node.physical_id, node.payload()?)?;
            staged.push(handle);
        }
        self.registry.update(&self.table, staged)?;
        Ok(true)
    }

    /// Mark removed nodes deleted. Returns `false` if the handle is already
    /// deleted or its version no longer matches.
    pub fn commit_removed_nodes(&self, nodes: &[Node]) -> CoreResult<bool> {
        let mut staged = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut handle = self.load_handle(node.logical_id)?.ok_or_else(|| {
                CoreError::Integrity(format!("removal target {} has no handle", node.logical_id))
            })?;
            if handle.is_deleted || handle.version != node.version {
                return Ok(false);
            }
            handle.is_deleted = true;
            handle.work_in_progress = true;
            staged.push(handle);
        }
        self.registry.update(&self.table, staged)?;
        Ok(true)
    }

    /// Write blobs and fresh version-0 handles for newly added non-root
    /// nodes.
    pub fn commit_added_nodes(&self, nodes: &[Node]) -> CoreResult<()> {
        for node in nodes {
            self.blobs.add(&self.table, node.physical_id, node.payload()?)?;
        }
        let handles = nodes
            .iter()
            .map(|n| Handle::new_staged(n.logical_id, n.physical_id))
            .collect();
        self.registry.add(&self.table, handles)
    }

    /// True iff every fetched node's version still matches the registry.
    pub fn are_fetched_items_intact(&self, nodes: &[Node]) -> CoreResult<bool> {
        let ids: Vec<LogicalId> = nodes.iter().map(|n| n.logical_id).collect();
        let handles = self.registry.get(&self.table, &ids)?;
        for (node, handle) in nodes.iter().zip(handles) {
            match handle {
                Some(h) if h.version == node.version && !h.is_deleted => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Flip handles' active slot in memory; not yet persisted — the
    /// caller writes them back via `finalize_handles` during
    /// `finalizeCommit`.
    pub fn activate_inactive_nodes(&self, handles: &mut [Handle]) {
        for h in handles.iter_mut() {
            h.activate();
        }
    }

    /// Bump version and clear WIP on removed handles in memory; same
    /// staged-not-persisted contract as `activate_inactive_nodes`.
    pub fn touch_nodes(&self, handles: &mut [Handle]) {
        for h in handles.iter_mut() {
            h.touch_removed();
        }
    }

    /// Persist activated/touched handles, all-or-nothing, without
    /// re-acquiring sector locks (the session already holds the
    /// equivalent node locks from Phase 1).
    pub fn finalize_handles(&self, handles: Vec<Handle>) -> CoreResult<()> {
        self.registry.update_no_locks(&self.table, true, handles)
    }

    /// Undo `commit_added_nodes`/`commit_new_root_nodes`: remove the staged
    /// blobs and registry handles outright.
    pub fn rollback_added_nodes(&self, nodes: &[Node]) -> CoreResult<()> {
        let physical_ids: Vec<_> = nodes.iter().map(|n| n.physical_id).collect();
        let logical_ids: Vec<_> = nodes.iter().map(|n| n.logical_id).collect();
        self.blobs.remove(&self.table, &physical_ids)?;
        self.registry.remove(&self.table, &logical_ids)
    }

    /// Undo `commit_updated_nodes`: remove the staged inactive blob and
    /// clear WIP on the handle. Uses `UpdateNoLocks` when the session still
    /// holds the sector locks from Phase 1, else `Update` (which
    /// re-acquires them).
    pub fn rollback_updated_nodes(&self, locked: bool, mut handles: Vec<Handle>) -> CoreResult<()> {
        for handle in handles.iter_mut() {
            if let Some(inactive) = handle.inactive_id() {
                self.blobs.remove(&self.table, &[inactive])?;
            }
            handle.finalize();
        }
        if locked {
            self.registry.update_no_locks(&self.table, false, handles)
        } else {
            self.registry.update(&self.table, handles).map(|_| ())
        }
    }

    /// Undo `commit_removed_nodes`: clear the deletion mark and WIP.
    pub fn rollback_removed_nodes(&self, locked: bool, mut handles: Vec<Handle>) -> CoreResult<()> {
        for handle in handles.iter_mut() {
            handle.revert_removal();
        }
        if locked {
            self.registry.update_no_locks(&self.table, false, handles)
        } else {
            self.registry.update(&self.table, handles).map(|_| ())
        }
    }

    /// Load handles for a batch of logical ids, skipping ids with no handle
    /// (already removed, or never committed — safe to ignore during replay).
    fn load_handles(&self, ids: &[LogicalId]) -> CoreResult<Vec<Handle>> {
        Ok(self.registry.get(&self.table, ids)?.into_iter().flatten().collect())
    }

    /// `rollback_added_nodes`, driven by logged ids rather than a live local
    /// cache — used by crash recovery, which replays from the function-code
    /// log instead of a session's in-memory classification.
    pub fn rollback_added_nodes_by_id(&self, ids: &[LogicalId]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let handles = self.load_handles(ids)?;
        let physical_ids: Vec<_> = handles.iter().map(|h| h.active_id()).collect();
        self.blobs.remove(&self.table, &physical_ids)?;
        self.registry.remove(&self.table, ids)
    }

    /// `rollback_updated_nodes`, driven by logged ids.
    pub fn rollback_updated_nodes_by_id(&self, locked: bool, ids: &[LogicalId]) -> CoreResult<()> {
        let handles = self.load_handles(ids)?;
        if handles.is_empty() {
            return Ok(());
        }
        self.rollback_updated_nodes(locked, handles)
    }

    /// `rollback_removed_nodes`, driven by logged ids.
    pub fn rollback_removed_nodes_by_id(&self, locked: bool, ids: &[LogicalId]) -> CoreResult<()> {
        let handles = self.load_handles(ids)?;
        if handles.is_empty() {
            return Ok(());
        }
        self.rollback_removed_nodes(locked, handles)
    }

    /// Drop a node from the local cache once it's no longer relevant
    /// (e.g. after a successful rollback or a refetch replacing it).
    pub fn forget(&self, id: LogicalId) {
        self.local_cache.remove(&id);
    }

    /// Clear the entire local cache (used when a transaction ends).
    pub fn clear(&self) {
        self.local_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{InMemoryBlobStore, InMemoryRegistry};
    use btx_core::PhysicalId;

    fn backend() -> NodeRepositoryBackend {
        NodeRepositoryBackend::new("orders", Arc::new(InMemoryRegistry::new()), Arc::new(InMemoryBlobStore::new()))
    }

    #[test]
    fn new_root_nodes_commit_once_then_refuse_a_second_root() {
        let backend = backend();
        let root = Node::new_staged(LogicalId::new(), PhysicalId::new(), true);
        assert!(backend.commit_new_root_nodes(&[root.clone()]).unwrap());
        assert!(!backend.commit_new_root_nodes(&[root]).unwrap());
    }

    #[test]
    fn updated_nodes_with_stale_version_are_refused() {
        let backend = backend();
        let id = LogicalId::new();
        let root = Node::new_staged(id, PhysicalId::new(), true);
        backend.commit_new_root_nodes(&[root]).unwrap();

        let mut stale = Node::new_staged(id, PhysicalId::new(), true);
        stale.version = 7;
        assert!(!backend.commit_updated_nodes(&[stale]).unwrap());

        let mut current = Node::new_staged(id, PhysicalId::new(), true);
        current.version = 0;
        assert!(backend.commit_updated_nodes(&[current]).unwrap());
    }

    #[test]
    fn fetched_items_become_stale_after_a_concurrent_update() {
        let backend = backend();
        let id = LogicalId::new();
        let root = Node::new_staged(id, PhysicalId::new(), true);
        backend.commit_new_root_nodes(&[root.clone()]).unwrap();
        assert!(backend.are_fetched_items_intact(&[root.clone()]).unwrap());

        let mut update = Node::new_staged(id, PhysicalId::new(), true);
        update.version = 0;
        backend.commit_updated_nodes(&[update]).unwrap();
        assert!(!backend.are_fetched_items_intact(&[root]).unwrap());
    }

    #[test]
    fn rollback_updated_nodes_drops_the_staged_blob_and_clears_wip() {
        let backend = backend();
        let id = LogicalId::new();
        let root = Node::new_staged(id, PhysicalId::new(), true);
        backend.commit_new_root_nodes(&[root]).unwrap();
        let mut handle = backend.registry_get(&[id]).unwrap().remove(0).unwrap();
        handle.stage_update(PhysicalId::new());

        backend.rollback_updated_nodes(false, vec![handle.clone()]).unwrap();
        let after = backend.registry_get(&[id]).unwrap().remove(0).unwrap();
        assert!(!after.work_in_progress);
    }

    #[test]
    fn rollback_added_nodes_by_id_removes_the_blob_and_handle() {
        let backend = backend();
        let id = LogicalId::new();
        let added = Node::new_staged(id, PhysicalId::new(), false);
        backend.commit_added_nodes(std::slice::from_ref(&added)).unwrap();
        assert!(backend.registry_get(&[id]).unwrap()[0].is_some());

        backend.rollback_added_nodes_by_id(&[id]).unwrap();
        assert!(backend.registry_get(&[id]).unwrap()[0].is_none());
    }

    #[test]
    fn rollback_updated_nodes_by_id_is_a_no_op_for_an_unknown_id() {
        let backend = backend();
        backend.rollback_updated_nodes_by_id(false, &[LogicalId::new()]).unwrap();
    }

    #[test]
    fn sector_timeout_propagates_from_commit_updated_nodes() {
        let registry = Arc::new(InMemoryRegistry::new());
        let backend = NodeRepositoryBackend::new("orders", Arc::clone(&registry) as Arc<dyn Registry>, Arc::new(InMemoryBlobStore::new()));
        let id = LogicalId::new();
        let root = Node::new_staged(id, PhysicalId::new(), true);
        backend.commit_new_root_nodes(&[root]).unwrap();

        registry.arm_sector_fault("orders", btx_core::Tid::new());
        let mut update = Node::new_staged(id, PhysicalId::new(), true);
        update.version = 0;
        let err = backend.commit_updated_nodes(&[update]).unwrap_err();
        assert!(matches!(err, CoreError::SectorTimeout { .. }));
    }
}
