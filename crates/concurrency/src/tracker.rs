//! Item-action tracker: per-store bookkeeping of what a session
//! intends to do with each item it has touched, plus value externalization
//! and per-item locking.

use std::sync::Arc;
use std::time::Duration;

use btx_core::{
    format_item_lock_key, BlobStore, Clock, CoreError, CoreResult, ItemAction, ItemId,
    ItemLockRecord, L2Cache, Tid,
};
use btx_durability::{FunctionCode, TransactionLog};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::payload::ActivelyPersistedPayload;

/// Bookkeeping for one tracked item.
#[derive(Debug, Clone)]
pub struct ItemActionRecord {
    pub item_id: ItemId,
    pub action: ItemAction,
    pub version_in_db: u64,
    pub value: Option<Vec<u8>>,
    pub value_needs_fetch: bool,
    pub persisted: bool,
}

/// Per-store tracker of in-flight item intents.
pub struct ItemActionTracker {
    table: String,
    tid: Tid,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn L2Cache>,
    log: Arc<dyn TransactionLog>,
    clock: Arc<dyn Clock>,
    items: DashMap<ItemId, ItemActionRecord>,
    for_deletion: Mutex<Vec<ItemId>>,
    locked_keys: Mutex<Vec<String>>,
    /// Fresh TIDs minted for pre-commit `AddActivelyPersistedItem` log
    /// entries, drained and removed from the log once
    /// `commit_tracked_items_values` lands so only a crash before that point
    /// leaves one behind for recovery to act on.
    precommit_tids: Mutex<Vec<Tid>>,
}

impl ItemActionTracker {
    pub fn new(
        table: impl Into<String>,
        tid: Tid,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn L2Cache>,
        log: Arc<dyn TransactionLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table: table.into(),
            tid,
            blobs,
            cache,
            log,
            clock,
            items: DashMap::new(),
            for_deletion: Mutex::new(Vec::new()),
            locked_keys: Mutex::new(Vec::new()),
            precommit_tids: Mutex::new(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Log an `AddActivelyPersistedItem` entry under a fresh pre-commit TID,
    /// so a crash before this transaction reaches `finalizeCommit` leaves
    /// behind a record recovery can use to delete the orphaned blob.
    fn log_precommit(&self, item_id: ItemId) -> CoreResult<()> {
        let precommit_tid = Tid::new();
        self.log.add(
            precommit_tid,
            FunctionCode::AddActivelyPersistedItem,
            ActivelyPersistedPayload { store: self.table.clone(), item_id }.encode(),
            self.clock.current_hour(),
        )?;
        self.precommit_tids.lock().push(precommit_tid);
        Ok(())
    }

    /// Pre-commit TIDs logged so far, removed from the caller's bookkeeping
    /// (the caller is responsible for deleting their log entries once the
    /// values they guard have landed for good).
    pub fn drain_precommit_tids(&self) -> Vec<Tid> {
        std::mem::take(&mut *self.precommit_tids.lock())
    }

    /// Record a brand-new item. Under active persistence the value is
    /// written through immediately (and cached, if the store is globally
    /// cached) rather than waiting for `commit_tracked_items_values`.
    pub fn add(
        &self,
        item_id: ItemId,
        value: Vec<u8>,
        actively_persisted: bool,
        globally_cached: bool,
        cache_ttl: Option<Duration>,
    ) -> CoreResult<()> {
        let mut record = ItemActionRecord {
            item_id,
            action: ItemAction::Add,
            version_in_db: 0,
            value: Some(value.clone()),
            value_needs_fetch: false,
            persisted: false,
        };
        if actively_persisted {
            self.blobs.add(&self.table, item_id, value.clone())?;
            self.log_precommit(item_id)?;
            record.persisted = true;
            if globally_cached {
                self.cache.set_value(&format!("V{item_id}"), value, cache_ttl)?;
            }
        }
        record.version_in_db += 1;
        self.items.insert(item_id, record);
        Ok(())
    }

    /// Upsert an update intent, preserving `Add` if the item was added
    /// earlier in the same transaction.
    pub fn update(
        &self,
        item_id: ItemId,
        value: Vec<u8>,
        actively_persisted: bool,
        globally_cached: bool,
        cache_ttl: Option<Duration>,
    ) -> CoreResult<()> {
        let keep_add = self.items.get(&item_id).map(|r| r.action == ItemAction::Add).unwrap_or(false);
        if actively_persisted {
            self.blobs.update(&self.table, item_id, value.clone())?;
            self.log_precommit(item_id)?;
            if globally_cached {
                self.cache.set_value(&format!("V{item_id}"), value.clone(), cache_ttl)?;
            }
        }
        self.items.insert(
            item_id,
            ItemActionRecord {
                item_id,
                action: if keep_add { ItemAction::Add } else { ItemAction::Update },
                version_in_db: self.items.get(&item_id).map(|r| r.version_in_db).unwrap_or(0) + 1,
                value: Some(value),
                value_needs_fetch: false,
                persisted: actively_persisted,
            },
        );
        Ok(())
    }

    /// Remove an item. A not-yet-committed `Add` is simply dropped (and its
    /// blob, if any, enqueued for deletion); otherwise the record is marked
    /// `Remove`.
    pub fn remove(&self, item_id: ItemId) {
        let was_add = self.items.get(&item_id).map(|r| r.action == ItemAction::Add).unwrap_or(false);
        if was_add {
            self.items.remove(&item_id);
            self.for_deletion.lock().push(item_id);
        } else {
            self.items.insert(
                item_id,
                ItemActionRecord {
                    item_id,
                    action: ItemAction::Remove,
                    version_in_db: 0,
                    value: None,
                    value_needs_fetch: false,
                    persisted: false,
                },
            );
        }
    }

    /// Fetch an item's value, going to the cache/blob store if it was
    /// externalized and hasn't been pulled into this session yet.
    pub fn get(&self, item_id: ItemId, globally_cached: bool) -> CoreResult<Option<Vec<u8>>> {
        if let Some(mut record) = self.items.get_mut(&item_id) {
            if record.value_needs_fetch {
                let cache_key = format!("V{item_id}");
                let value = if globally_cached {
                    match self.cache.get_value(&cache_key)? {
                        Some(v) => Some(v),
                        None => self.blobs.get_one(&self.table, item_id)?,
                    }
                } else {
                    self.blobs.get_one(&self.table, item_id)?
                };
                if let Some(v) = &value {
                    if globally_cached {
                        self.cache.set_value(&cache_key, v.clone(), None)?;
                    }
                }
                record.value = value.clone();
                record.value_needs_fetch = false;
                return Ok(value);
            }
            return Ok(record.value.clone());
        }
        self.items.insert(
            item_id,
            ItemActionRecord {
                item_id,
                action: ItemAction::Get,
                version_in_db: 0,
                value: None,
                value_needs_fetch: true,
                persisted: false,
            },
        );
        self.get(item_id, globally_cached)
    }

    /// Write an owner-stamped lock record for every tracked item. Fails
    /// with `Conflict` if any key is already held by a different owner.
    pub fn lock(&self) -> CoreResult<()> {
        let mut acquired = Vec::new();
        for entry in self.items.iter() {
            let key = format_item_lock_key(entry.key());
            let record = ItemLockRecord { lock_id: self.tid, action: entry.value().action };
            if !self.cache.set_item_lock(&key, record)? {
                match self.cache.get_item_lock(&key)? {
                    Some(existing) if existing.lock_id == self.tid => {}
                    _ => {
                        self.unlock_keys(&acquired)?;
                        return Err(CoreError::Conflict(format!("item lock held by another owner: {key}")));
                    }
                }
            }
            // Close the Lock/Get race: re-read to confirm the record landed.
            if self.cache.get_item_lock(&key)?.is_none() {
                self.unlock_keys(&acquired)?;
                return Err(CoreError::Conflict(format!("can't attain a lock: {key}")));
            }
            acquired.push(key);
        }
        *self.locked_keys.lock() = acquired;
        Ok(())
    }

    /// Re-confirm every tracked item's lock still belongs to this session.
    pub fn check_tracked_items(&self) -> CoreResult<()> {
        for key in self.locked_keys.lock().iter() {
            match self.cache.get_item_lock(key)? {
                Some(record) if record.lock_id == self.tid => {}
                _ => return Err(CoreError::Conflict(format!("item lock lost: {key}"))),
            }
        }
        Ok(())
    }

    fn unlock_keys(&self, keys: &[String]) -> CoreResult<()> {
        for key in keys {
            self.cache.delete_item_lock(key)?;
        }
        Ok(())
    }

    /// Release every lock this session holds.
    pub fn unlock(&self) -> CoreResult<()> {
        let keys = std::mem::take(&mut *self.locked_keys.lock());
        self.unlock_keys(&keys)
    }

    /// Externalize in-flight values that aren't already in-node or
    /// actively persisted: assign a fresh blob id (so readers still on the
    /// prior id keep seeing old data), write the blob, and clear the
    /// in-memory value. Superseded ids for `Remove`/`Update` that were
    /// still externally-fetched are queued for post-commit deletion.
    pub fn commit_tracked_items_values(
        &self,
        in_node: bool,
        actively_persisted: bool,
        globally_cached: bool,
        cache_ttl: Option<Duration>,
        fresh_id: impl Fn() -> ItemId,
    ) -> CoreResult<Vec<ItemId>> {
        if in_node || actively_persisted {
            return Ok(Vec::new());
        }
        let mut written = Vec::new();
        let ids: Vec<ItemId> = self.items.iter().map(|e| *e.key()).collect();
        for id in ids {
            let mut entry = self.items.get_mut(&id).unwrap();
            if !matches!(entry.action, ItemAction::Add | ItemAction::Update) {
                continue;
            }
            let Some(value) = entry.value.take() else { continue };
            let new_id = fresh_id();
            self.blobs.add(&self.table, new_id, value.clone())?;
            if globally_cached {
                self.cache.set_value(&format!("V{new_id}"), value, cache_ttl)?;
            }
            entry.item_id = new_id;
            entry.value = None;
            entry.value_needs_fetch = true;
            written.push(new_id);
        }
        Ok(written)
    }

    /// Blob ids newly created by `commit_tracked_items_values`, to be
    /// deleted on rollback.
    pub fn for_rollback_tracked_items_values(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|e| matches!(e.value().action, ItemAction::Add | ItemAction::Update) && e.value().value_needs_fetch)
            .map(|e| *e.key())
            .collect()
    }

    /// Blob ids superseded by this commit, to be deleted during post-commit
    /// cleanup.
    pub fn obsolete_tracked_items_values(&self) -> Vec<ItemId> {
        self.for_deletion.lock().clone()
    }

    pub fn queue_for_deletion(&self, item_id: ItemId) {
        self.for_deletion.lock().push(item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btx_core::SystemClock;
    use btx_durability::InMemoryTransactionLog;
    use btx_storage::{InMemoryBlobStore, InMemoryL2Cache};

    fn tracker() -> ItemActionTracker {
        ItemActionTracker::new(
            "orders",
            Tid::new(),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryL2Cache::new()),
            Arc::new(InMemoryTransactionLog::new()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn add_then_get_returns_the_inline_value() {
        let t = tracker();
        let id = ItemId::new();
        t.add(id, b"v1".to_vec(), false, false, None).unwrap();
        assert_eq!(t.get(id, false).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn update_preserves_add_action_within_the_same_transaction() {
        let t = tracker();
        let id = ItemId::new();
        t.add(id, b"v1".to_vec(), false, false, None).unwrap();
        t.update(id, b"v2".to_vec(), false, false, None).unwrap();
        assert_eq!(t.get(id, false).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn remove_of_an_uncommitted_add_queues_it_for_deletion_instead_of_tracking_removal() {
        let t = tracker();
        let id = ItemId::new();
        t.add(id, b"v1".to_vec(), false, false, None).unwrap();
        t.remove(id);
        assert_eq!(t.obsolete_tracked_items_values(), vec![id]);
        assert!(t.is_empty());
    }

    #[test]
    fn lock_then_unlock_round_trips_and_conflicts_with_another_tracker() {
        let cache = Arc::new(InMemoryL2Cache::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let id = ItemId::new();

        let log = Arc::new(InMemoryTransactionLog::new());
        let clock = Arc::new(SystemClock);

        let a = ItemActionTracker::new(
            "orders",
            Tid::new(),
            Arc::clone(&blobs),
            Arc::clone(&cache) as Arc<dyn L2Cache>,
            Arc::clone(&log) as Arc<dyn TransactionLog>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        a.add(id, b"v1".to_vec(), false, false, None).unwrap();
        a.lock().unwrap();

        let b = ItemActionTracker::new(
            "orders",
            Tid::new(),
            Arc::clone(&blobs),
            Arc::clone(&cache) as Arc<dyn L2Cache>,
            Arc::clone(&log) as Arc<dyn TransactionLog>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        b.add(id, b"v2".to_vec(), false, false, None).unwrap();
        assert!(matches!(b.lock().unwrap_err(), CoreError::Conflict(_)));

        a.unlock().unwrap();
        b.lock().unwrap();
    }

    #[test]
    fn commit_tracked_items_values_is_a_no_op_when_values_live_in_node() {
        let t = tracker();
        let id = ItemId::new();
        t.add(id, b"v1".to_vec(), false, false, None).unwrap();
        let written = t.commit_tracked_items_values(true, false, false, None, ItemId::new).unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn commit_tracked_items_values_externalizes_when_not_in_node() {
        let t = tracker();
        let id = ItemId::new();
        t.add(id, b"v1".to_vec(), false, false, None).unwrap();
        let written = t.commit_tracked_items_values(false, false, false, None, ItemId::new).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(t.for_rollback_tracked_items_values(), written);
    }
}
