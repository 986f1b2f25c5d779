//! B-tree node/item data model and in-memory reference backends.
//!
//! The actual B-tree search/split/merge algorithm is out of scope — this
//! crate owns only the data shapes the coordinator classifies and commits
//! (`Node`, `Item`), the node-repository commit/rollback operations of
//! Phase 1/Phase 2, and in-memory implementations of the `btx-core`
//! collaborator traits used across the workspace's tests and the demo
//! engine.

pub mod backend;
pub mod model;
pub mod reference;

pub use backend::NodeRepositoryBackend;
pub use model::{Item, ItemActionRecord, Node, NodeAction};
pub use reference::{
    InMemoryBlobStore, InMemoryL1Cache, InMemoryL2Cache, InMemoryRegistry, InMemoryStoreRepository,
};
