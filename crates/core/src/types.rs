//! Identity and addressing types shared across the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit transaction identity.
///
/// Wraps a UUID so sort keys, lock ownership stamps, and log entries all
/// share one representation. Deadlock-avoidance ordering sorts lock
/// keys by the high/low 64-bit halves of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(Uuid);

impl Tid {
    /// Generate a fresh, random transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id, used as a sentinel for "no owner" in lock responses.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// True if this is the nil sentinel.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// High/low 64-bit halves, used for the global lock-ordering sort key.
    pub fn halves(&self) -> (u64, u64) {
        let bytes = self.0.as_bytes();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[0..8]);
        lo.copy_from_slice(&bytes[8..16]);
        (u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }
}

impl Default for Tid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical node/handle identity: stable across the physical rewrites a node
/// undergoes over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalId(Uuid);

impl LogicalId {
    /// Generate a fresh logical id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// High/low 64-bit halves, used for the global lock-ordering sort key.
    pub fn halves(&self) -> (u64, u64) {
        let bytes = self.0.as_bytes();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[0..8]);
        lo.copy_from_slice(&bytes[8..16]);
        (u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }
}

impl Default for LogicalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical blob/node identity: the actual address of a versioned payload in
/// the blob store. A [`LogicalId`] points at one or two of these through a
/// `Handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalId(Uuid);

impl PhysicalId {
    /// Generate a fresh physical id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PhysicalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-item external blob identity (an item's value lives out-of-band in the
/// blob store, keyed by one of these per version).
pub type ItemId = PhysicalId;

/// Opaque distributed lock key, owner-stamped by the session that attained
/// it.
///
/// `IsLockOwner` is only ever set by the session itself after a successful
/// acquire or takeover; it is never trusted from a remote read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockKey {
    /// Opaque key string, formatted by `FormatLockKey`.
    pub key: String,
    /// The transaction that owns (or is attempting to own) this key.
    pub lock_id: Tid,
    /// True once this session has confirmed ownership.
    pub is_lock_owner: bool,
}

impl LockKey {
    /// Construct a key not yet confirmed as owned.
    pub fn new(key: impl Into<String>, lock_id: Tid) -> Self {
        Self {
            key: key.into(),
            lock_id,
            is_lock_owner: false,
        }
    }
}

/// Format a logical id into the opaque lock-key string used by the cache.
pub fn format_lock_key(id: &LogicalId) -> String {
    format!("L:{}", id)
}

/// Format an item id into the opaque lock-key string used by the cache.
pub fn format_item_lock_key(id: &ItemId) -> String {
    format!("I:{}", id)
}

/// Build one [`LockKey`] per logical id, sorted by the UUID high/low halves
/// for deadlock-avoidant global ordering.
pub fn create_lock_keys(tid: Tid, ids: &[LogicalId]) -> Vec<LockKey> {
    let mut sorted: Vec<LogicalId> = ids.to_vec();
    sorted.sort_by_key(|id| id.halves());
    sorted
        .into_iter()
        .map(|id| LockKey::new(format_lock_key(&id), tid))
        .collect()
}

/// Execution mode a transaction is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Only `areFetchedItemsIntact` is checked at commit; no writes.
    ReadOnly,
    /// Phase 1 is a no-op; used for trusted bulk-load paths.
    NoCheck,
    /// Full two-phase commit.
    Writer,
}

/// Action recorded against a tracked item by the item-action tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemAction {
    /// The item was only read.
    Get,
    /// The item is newly created by this transaction.
    Add,
    /// The item's value was changed by this transaction.
    Update,
    /// The item is being deleted by this transaction.
    Remove,
}

/// Owner-stamped lock record written to the L2 cache for a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLockRecord {
    /// The transaction that holds this item lock.
    pub lock_id: Tid,
    /// What the holder intends to do with the item.
    pub action: ItemAction,
}

/// Coordinator state-machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionPhase {
    /// `Begin` has not been called.
    NotBegun,
    /// `Begin` succeeded; reads/writes may be tracked.
    Begun,
    /// Phase 1 completed; only `Phase2Commit`/`Rollback` are legal.
    Phase1Done,
    /// Phase 2 committed or the transaction rolled back.
    Done,
}
