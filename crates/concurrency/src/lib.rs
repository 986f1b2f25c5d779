//! The concurrency protocol: lock acquisition, the
//! transaction/session types, the 2PC coordinator, and idle reclamation.

pub mod coordinator;
pub mod idle;
pub mod lock;
pub mod payload;
pub mod tracker;
pub mod transaction;

pub use coordinator::Coordinator;
pub use idle::{CacheRestartHelper, IdleReclamation};
pub use lock::{acquire_locks, merge_ids, merge_node_keys, release_locks};
pub use tracker::ItemActionTracker;
pub use transaction::{StagedActivation, StagedHandle, StoreSession, Transaction};
