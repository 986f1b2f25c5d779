//! Shared identity types, error kinds, data model, collaborator traits, and
//! clock abstraction for the two-phase-commit transaction coordinator.
//!
//! This crate has no knowledge of the B-tree algorithm, the wire format of
//! any backing store, or how the caches/registry are actually implemented —
//! it only defines the vocabulary the rest of the workspace shares.

pub mod clock;
pub mod error;
pub mod limits;
pub mod model;
pub mod traits;
pub mod types;

pub use clock::{Clock, SystemClock, TestClock};
pub use error::{CoreError, CoreResult};
pub use model::{Handle, StoreInfo};
pub use traits::{BlobStore, L1Cache, L2Cache, Registry, StoreRepository};
pub use types::{
    create_lock_keys, format_item_lock_key, format_lock_key, ItemAction, ItemId, ItemLockRecord,
    LockKey, LogicalId, PhysicalId, Tid, TransactionMode, TransactionPhase,
};
