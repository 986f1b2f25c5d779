//! The assembled transaction coordinator: wires `btx-core`'s collaborator
//! traits, `btx-storage`'s node repository, `btx-concurrency`'s 2PC
//! protocol, and `btx-durability`'s logs into the single `Database` entry
//! point client code opens transactions against.

pub mod background;
pub mod config;
pub mod database;

pub use background::BackgroundReclaimer;
pub use config::{CoordinatorConfig, StoreOptions};
pub use database::Database;
