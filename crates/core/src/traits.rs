//! Collaborator traits consumed by the coordinator.
//!
//! The B-tree algorithmic layer, the production blob store, the L1/L2
//! caches, and the registry/store-repository backends are explicitly out of
//! scope for this crate family — these traits are the *contract* the
//! coordinator relies on, not an implementation. `btx-storage` ships
//! in-memory reference implementations of each, used by the rest of the
//! workspace's tests.

use crate::error::CoreResult;
use crate::model::{Handle, StoreInfo};
use crate::types::{ItemLockRecord, LockKey, LogicalId, PhysicalId, Tid};
use std::time::Duration;

/// Content-addressed blob storage for node payloads and externalized item
/// values. Append-mostly; `remove` is idempotent (removing an absent id is
/// not an error).
pub trait BlobStore: Send + Sync {
    /// Fetch a blob, or `None` if it doesn't exist (or was already removed).
    fn get_one(&self, table: &str, id: PhysicalId) -> CoreResult<Option<Vec<u8>>>;
    /// Write a brand-new blob.
    fn add(&self, table: &str, id: PhysicalId, payload: Vec<u8>) -> CoreResult<()>;
    /// Overwrite an existing blob (used for actively-persisted item
    /// updates).
    fn update(&self, table: &str, id: PhysicalId, payload: Vec<u8>) -> CoreResult<()>;
    /// Remove a batch of blobs. Never errors on an id that is already gone.
    fn remove(&self, table: &str, ids: &[PhysicalId]) -> CoreResult<()>;
}

/// Logical-ID → physical-ID registry: the indirection layer backing every
/// `Handle`.
pub trait Registry: Send + Sync {
    /// Fetch handles by logical id. A `None` slot means no handle exists for
    /// that id yet.
    fn get(&self, table: &str, ids: &[LogicalId]) -> CoreResult<Vec<Option<Handle>>>;
    /// Insert brand-new handles (added nodes, new roots).
    fn add(&self, table: &str, handles: Vec<Handle>) -> CoreResult<()>;
    /// Write handles under sector-level locking. May fail with
    /// [`crate::error::CoreError::SectorTimeout`] carrying the contended
    /// [`LockKey`] when another session holds the sector.
    fn update(&self, table: &str, handles: Vec<Handle>) -> CoreResult<()>;
    /// Write handles without acquiring sector locks (the caller already
    /// holds the equivalent node locks). `all_or_nothing` requests the
    /// registry apply the whole batch atomically or not at all.
    fn update_no_locks(
        &self,
        table: &str,
        all_or_nothing: bool,
        handles: Vec<Handle>,
    ) -> CoreResult<()>;
    /// Remove handles outright (obsolete-entry cleanup).
    fn remove(&self, table: &str, ids: &[LogicalId]) -> CoreResult<()>;
    /// Best-effort replication fan-out; a no-op backend is a valid
    /// implementation.
    fn replicate(
        &self,
        _table: &str,
        _added: &[Handle],
        _updated: &[Handle],
        _removed: &[Handle],
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// Level-2 (distributed) cache: owner-stamped node/item locks, the item
/// lock-record store, and the externalized value cache.
pub trait L2Cache: Send + Sync {
    /// Attempt to acquire every key in `keys`. Returns `(true, _)` on full
    /// success. On failure, the second element names the current owner (if
    /// any) so the caller can tell a takeover-eligible self-owned lock from
    /// one held by a different live session.
    fn lock(&self, keys: &[LockKey], ttl: Duration) -> CoreResult<(bool, Option<Tid>)>;
    /// Re-confirm that every key in `keys` is currently held (by anyone).
    fn is_locked(&self, keys: &[LockKey]) -> CoreResult<bool>;
    /// Release every key in `keys`. Idempotent.
    fn unlock(&self, keys: &[LockKey]) -> CoreResult<()>;
    /// Read the current owner of a single key and refresh its TTL
    /// (`GetEx`), used by the takeover path in `AcquireLocks`.
    fn get_owner(&self, key: &str, ttl: Duration) -> CoreResult<Option<Tid>>;
    /// Acquire the named process-coordination locks (e.g. the single
    /// `DTrollbk` sector-timeout-handler lock).
    fn dual_lock(&self, keys: &[String], ttl: Duration) -> CoreResult<bool>;
    /// Release process-coordination locks acquired via `dual_lock`.
    fn dual_unlock(&self, keys: &[String]) -> CoreResult<()>;
    /// True if the cache has observed a restart (its `run_id` changed)
    /// since this handle last checked; drives the idle pass's ignore-age
    /// mode.
    fn is_restarted(&self) -> bool;
    /// Set-if-absent an item lock record. Returns `true` iff this call won
    /// the race and the record is now present with this value.
    fn set_item_lock(&self, key: &str, record: ItemLockRecord) -> CoreResult<bool>;
    /// Read an item lock record.
    fn get_item_lock(&self, key: &str) -> CoreResult<Option<ItemLockRecord>>;
    /// Delete an item lock record.
    fn delete_item_lock(&self, key: &str) -> CoreResult<()>;
    /// Populate the externalized value cache for an item id.
    fn set_value(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> CoreResult<()>;
    /// Read the externalized value cache.
    fn get_value(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    /// Invalidate a cached value.
    fn delete_value(&self, key: &str) -> CoreResult<()>;
}

/// Level-1 (in-process) most-recently-used node cache, warmed post-commit.
pub trait L1Cache: Send + Sync {
    /// Populate the MRU entry for a physical node.
    fn set_node(&self, id: PhysicalId, payload: Vec<u8>, version: u64);
    /// Read the MRU entry, if present.
    fn get_node(&self, id: PhysicalId) -> Option<(Vec<u8>, u64)>;
    /// Evict a node (e.g. once its physical id is no longer reachable).
    fn remove_node(&self, id: PhysicalId);
    /// Update the logical→physical secondary index used to resolve a
    /// `Handle` to its currently-cached physical node.
    fn set_handle(&self, logical_id: LogicalId, physical_id: PhysicalId);
    /// Resolve the secondary index.
    fn get_handle(&self, logical_id: LogicalId) -> Option<PhysicalId>;
}

/// CRUD over per-store descriptors.
pub trait StoreRepository: Send + Sync {
    /// Fetch stores by name; `None` slots mean no such store.
    fn get(&self, names: &[String]) -> CoreResult<Vec<Option<StoreInfo>>>;
    /// All known stores.
    fn get_all(&self) -> CoreResult<Vec<StoreInfo>>;
    /// Insert brand-new store descriptors.
    fn add(&self, stores: Vec<StoreInfo>) -> CoreResult<()>;
    /// Overwrite existing store descriptors (e.g. `commitStoreInfo`).
    fn update(&self, stores: Vec<StoreInfo>) -> CoreResult<()>;
    /// Remove store descriptors.
    fn remove(&self, names: &[String]) -> CoreResult<()>;
    /// Best-effort replication fan-out; a no-op backend is valid.
    fn replicate(&self, _stores: &[StoreInfo]) -> CoreResult<()> {
        Ok(())
    }
}
