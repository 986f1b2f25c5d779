//! In-memory reference implementations of the `btx-core` collaborator
//! traits. These exist so the coordinator can be exercised and
//! tested without a real distributed cache, blob store, or B-tree registry
//! backing it — they are demo/test scaffolding, not a production backend.

use btx_core::{
    BlobStore, CoreError, CoreResult, Handle, ItemLockRecord, L1Cache, L2Cache, LockKey,
    LogicalId, PhysicalId, Registry, StoreInfo, StoreRepository, Tid,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn table_key(table: &str, id: impl std::fmt::Display) -> String {
    format!("{table}/{id}")
}

/// In-memory blob store keyed by `table/id`.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn get_one(&self, table: &str, id: PhysicalId) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(&table_key(table, id)).map(|v| v.clone()))
    }

    fn add(&self, table: &str, id: PhysicalId, payload: Vec<u8>) -> CoreResult<()> {
        self.blobs.insert(table_key(table, id), payload);
        Ok(())
    }

    fn update(&self, table: &str, id: PhysicalId, payload: Vec<u8>) -> CoreResult<()> {
        self.blobs.insert(table_key(table, id), payload);
        Ok(())
    }

    fn remove(&self, table: &str, ids: &[PhysicalId]) -> CoreResult<()> {
        for id in ids {
            self.blobs.remove(&table_key(table, *id));
        }
        Ok(())
    }
}

/// In-memory registry. To let tests exercise the sector-timeout takeover
/// path without a real distributed lock manager, each table carries
/// a "sector fault" flag: when armed, the next `update` call on that table
/// returns `CoreError::SectorTimeout` instead of writing through.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    handles: DashMap<String, Handle>,
    sector_faults: DashMap<String, Tid>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot sector-lock-timeout fault for the next `update` call
    /// against `table`, as if `lock_id` already held the registry's sector
    /// lock.
    pub fn arm_sector_fault(&self, table: &str, lock_id: Tid) {
        self.sector_faults.insert(table.to_string(), lock_id);
    }

    fn key(table: &str, id: LogicalId) -> String {
        table_key(table, id)
    }
}

impl Registry for InMemoryRegistry {
    fn get(&self, table: &str, ids: &[LogicalId]) -> CoreResult<Vec<Option<Handle>>> {
        Ok(ids
            .iter()
            .map(|id| self.handles.get(&Self::key(table, *id)).map(|h| h.clone()))
            .collect())
    }

    fn add(&self, table: &str, handles: Vec<Handle>) -> CoreResult<()> {
        for handle in handles {
            self.handles.insert(Self::key(table, handle.logical_id), handle);
        }
        Ok(())
    }

    fn update(&self, table: &str, handles: Vec<Handle>) -> CoreResult<()> {
        if let Some((_, lock_id)) = self.sector_faults.remove(table) {
            return Err(CoreError::SectorTimeout {
                lock_key: LockKey::new(format!("sector:{table}"), lock_id),
            });
        }
        self.update_no_locks(table, false, handles)
    }

    fn update_no_locks(&self, table: &str, all_or_nothing: bool, handles: Vec<Handle>) -> CoreResult<()> {
        if all_or_nothing {
            for handle in &handles {
                if !self.handles.contains_key(&Self::key(table, handle.logical_id)) {
                    return Err(CoreError::Integrity(format!(
                        "update_no_locks: handle {} missing",
                        handle.logical_id
                    )));
                }
            }
        }
        for handle in handles {
            self.handles.insert(Self::key(table, handle.logical_id), handle);
        }
        Ok(())
    }

    fn remove(&self, table: &str, ids: &[LogicalId]) -> CoreResult<()> {
        for id in ids {
            self.handles.remove(&Self::key(table, *id));
        }
        Ok(())
    }
}

/// In-memory L2 (distributed) cache: owner-stamped locks, item lock
/// records, and the externalized value cache, each with a simple
/// expires-at so TTLs behave like the real thing under a test clock.
#[derive(Default)]
pub struct InMemoryL2Cache {
    locks: DashMap<String, (Tid, Instant)>,
    item_locks: DashMap<String, ItemLockRecord>,
    values: DashMap<String, (Vec<u8>, Option<Instant>)>,
    dual_locks: Mutex<HashMap<String, Instant>>,
    restarted: AtomicBool,
}

impl InMemoryL2Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the restart flag, simulating a cache process bounce. Used by
    /// idle-pass tests exercising the ignore-age path.
    pub fn simulate_restart(&self) {
        self.restarted.store(true, Ordering::SeqCst);
    }

    fn is_live(expires_at: &Instant) -> bool {
        Instant::now() < *expires_at
    }
}

impl L2Cache for InMemoryL2Cache {
    fn lock(&self, keys: &[LockKey], ttl: Duration) -> CoreResult<(bool, Option<Tid>)> {
        let expires_at = Instant::now() + ttl;
        for key in keys {
            if let Some(existing) = self.locks.get(&key.key) {
                let (owner, expiry) = *existing;
                if owner != key.lock_id && Self::is_live(&expiry) {
                    return Ok((false, Some(owner)));
                }
            }
        }
        for key in keys {
            self.locks.insert(key.key.clone(), (key.lock_id, expires_at));
        }
        Ok((true, None))
    }

    fn is_locked(&self, keys: &[LockKey]) -> CoreResult<bool> {
        for key in keys {
            match self.locks.get(&key.key) {
                Some(entry) if Self::is_live(&entry.1) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn unlock(&self, keys: &[LockKey]) -> CoreResult<()> {
        for key in keys {
            self.locks.remove(&key.key);
        }
        Ok(())
    }

    fn get_owner(&self, key: &str, ttl: Duration) -> CoreResult<Option<Tid>> {
        if let Some(mut entry) = self.locks.get_mut(key) {
            if Self::is_live(&entry.1) {
                entry.1 = Instant::now() + ttl;
                return Ok(Some(entry.0));
            }
        }
        Ok(None)
    }

    fn dual_lock(&self, keys: &[String], ttl: Duration) -> CoreResult<bool> {
        let mut guard = self.dual_locks.lock();
        let now = Instant::now();
        if keys.iter().any(|k| guard.get(k).is_some_and(|exp| now < *exp)) {
            return Ok(false);
        }
        for key in keys {
            guard.insert(key.clone(), now + ttl);
        }
        Ok(true)
    }

    fn dual_unlock(&self, keys: &[String]) -> CoreResult<()> {
        let mut guard = self.dual_locks.lock();
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }

    fn is_restarted(&self) -> bool {
        self.restarted.load(Ordering::SeqCst)
    }

    fn set_item_lock(&self, key: &str, record: ItemLockRecord) -> CoreResult<bool> {
        use dashmap::mapref::entry::Entry;
        match self.item_locks.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    fn get_item_lock(&self, key: &str) -> CoreResult<Option<ItemLockRecord>> {
        Ok(self.item_locks.get(key).map(|r| *r))
    }

    fn delete_item_lock(&self, key: &str) -> CoreResult<()> {
        self.item_locks.remove(key);
        Ok(())
    }

    fn set_value(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()> {
        self.values
            .insert(key.to_string(), (bytes, ttl.map(|d| Instant::now() + d)));
        Ok(())
    }

    fn get_value(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        match self.values.get(key) {
            Some(entry) => match entry.1 {
                Some(expiry) if Instant::now() >= expiry => Ok(None),
                _ => Ok(Some(entry.0.clone())),
            },
            None => Ok(None),
        }
    }

    fn delete_value(&self, key: &str) -> CoreResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// In-memory L1 (process-local) MRU node cache with a logical→physical
/// secondary index.
#[derive(Debug, Default)]
pub struct InMemoryL1Cache {
    nodes: DashMap<PhysicalId, (Vec<u8>, u64)>,
    handles: DashMap<LogicalId, PhysicalId>,
}

impl InMemoryL1Cache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl L1Cache for InMemoryL1Cache {
    fn set_node(&self, id: PhysicalId, payload: Vec<u8>, version: u64) {
        self.nodes.insert(id, (payload, version));
    }

    fn get_node(&self, id: PhysicalId) -> Option<(Vec<u8>, u64)> {
        self.nodes.get(&id).map(|v| v.clone())
    }

    fn remove_node(&self, id: PhysicalId) {
        self.nodes.remove(&id);
    }

    fn set_handle(&self, logical_id: LogicalId, physical_id: PhysicalId) {
        self.handles.insert(logical_id, physical_id);
    }

    fn get_handle(&self, logical_id: LogicalId) -> Option<PhysicalId> {
        self.handles.get(&logical_id).map(|v| *v)
    }
}

/// In-memory per-store descriptor repository.
#[derive(Debug, Default)]
pub struct InMemoryStoreRepository {
    stores: DashMap<String, StoreInfo>,
    version: AtomicU64,
}

impl InMemoryStoreRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreRepository for InMemoryStoreRepository {
    fn get(&self, names: &[String]) -> CoreResult<Vec<Option<StoreInfo>>> {
        Ok(names.iter().map(|n| self.stores.get(n).map(|s| s.clone())).collect())
    }

    fn get_all(&self) -> CoreResult<Vec<StoreInfo>> {
        Ok(self.stores.iter().map(|e| e.value().clone()).collect())
    }

    fn add(&self, stores: Vec<StoreInfo>) -> CoreResult<()> {
        for store in stores {
            self.stores.insert(store.name.clone(), store);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, stores: Vec<StoreInfo>) -> CoreResult<()> {
        for store in stores {
            self.stores.insert(store.name.clone(), store);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, names: &[String]) -> CoreResult<()> {
        for name in names {
            self.stores.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_store_round_trips_and_forgets_on_remove() {
        let blobs = InMemoryBlobStore::new();
        let id = PhysicalId::new();
        blobs.add("orders", id, b"payload".to_vec()).unwrap();
        assert_eq!(blobs.get_one("orders", id).unwrap(), Some(b"payload".to_vec()));
        blobs.remove("orders", &[id]).unwrap();
        assert_eq!(blobs.get_one("orders", id).unwrap(), None);
    }

    #[test]
    fn registry_sector_fault_fires_exactly_once() {
        let registry = InMemoryRegistry::new();
        let id = LogicalId::new();
        let handle = Handle::new_staged(id, PhysicalId::new());
        registry.add("orders", vec![handle]).unwrap();

        registry.arm_sector_fault("orders", Tid::new());
        assert!(matches!(registry.update("orders", vec![]), Err(CoreError::SectorTimeout { .. })));
        assert!(registry.update("orders", vec![]).is_ok());
    }

    #[test]
    fn l2_cache_lock_is_exclusive_until_unlocked() {
        let cache = InMemoryL2Cache::new();
        let a = Tid::new();
        let b = Tid::new();
        let key = LockKey::new("L:node", a);

        let (ok, owner) = cache.lock(&[key.clone()], Duration::from_secs(5)).unwrap();
        assert!(ok);
        assert!(owner.is_none());

        let contender = LockKey::new("L:node", b);
        let (ok, owner) = cache.lock(&[contender], Duration::from_secs(5)).unwrap();
        assert!(!ok);
        assert_eq!(owner, Some(a));

        cache.unlock(&[key.clone()]).unwrap();
        assert!(!cache.is_locked(&[key]).unwrap());
    }

    #[test]
    fn l2_cache_item_lock_set_is_first_writer_wins() {
        let cache = InMemoryL2Cache::new();
        let record = ItemLockRecord { lock_id: Tid::new(), action: btx_core::ItemAction::Update };
        assert!(cache.set_item_lock("I:1", record).unwrap());
        assert!(!cache.set_item_lock("I:1", record).unwrap());
        cache.delete_item_lock("I:1").unwrap();
        assert!(cache.get_item_lock("I:1").unwrap().is_none());
    }

    #[test]
    fn l1_cache_tracks_both_the_node_payload_and_the_handle_index() {
        let l1 = InMemoryL1Cache::new();
        let logical = LogicalId::new();
        let physical = PhysicalId::new();
        l1.set_handle(logical, physical);
        l1.set_node(physical, b"bytes".to_vec(), 3);
        assert_eq!(l1.get_handle(logical), Some(physical));
        assert_eq!(l1.get_node(physical), Some((b"bytes".to_vec(), 3)));
        l1.remove_node(physical);
        assert_eq!(l1.get_node(physical), None);
    }

    #[test]
    fn store_repository_add_then_get_round_trips() {
        let repo = InMemoryStoreRepository::new();
        let info = StoreInfo::new("orders", LogicalId::new(), 64);
        repo.add(vec![info.clone()]).unwrap();
        let fetched = repo.get(&["orders".to_string()]).unwrap();
        assert_eq!(fetched, vec![Some(info)]);
    }
}
