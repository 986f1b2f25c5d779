//! Log-entry payload shapes. Each commit step logs enough of its own
//! working set here that `rollback`/crash recovery can replay it without a
//! live transaction's in-memory session state.

use btx_core::{ItemId, LogicalId};
use btx_durability::{FunctionCode, LogEntry};
use serde::{Deserialize, Serialize};

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).unwrap_or_default()
}

fn decode<T: Default + for<'de> Deserialize<'de>>(bytes: &[u8]) -> T {
    bincode::deserialize(bytes).unwrap_or_default()
}

/// Logical node ids touched by a `commitNewRootNodes`/`commitUpdatedNodes`/
/// `commitRemovedNodes`/`commitAddedNodes` step, for one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeIdsPayload {
    pub store: String,
    pub ids: Vec<LogicalId>,
}

impl NodeIdsPayload {
    pub fn new(store: impl Into<String>, nodes: &[btx_storage::Node]) -> Self {
        Self {
            store: store.into(),
            ids: nodes.iter().map(|n| n.logical_id).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }
}

/// Item ids externalized by `commitTrackedItemsValues`, for one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackedValueIdsPayload {
    pub store: String,
    pub ids: Vec<ItemId>,
}

impl TrackedValueIdsPayload {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }
}

/// The pre-delta `StoreInfo` snapshot logged by `commitStoreInfo`, so a
/// rollback can restore the count/delta bookkeeping a crash left bumped.
/// `info` is `None` only for a malformed/truncated entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreInfoPayload {
    pub info: Option<btx_core::StoreInfo>,
}

impl StoreInfoPayload {
    pub fn new(info: btx_core::StoreInfo) -> Self {
        Self { info: Some(info) }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }
}

/// A store's obsolete tracked-item-value ids, one entry of the compound
/// `finalizeCommit` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreItemIds {
    pub store: String,
    pub ids: Vec<ItemId>,
}

/// The compound `finalizeCommit` payload: the obsolete tracked-item values
/// superseded by this commit, across every attached store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizePayload {
    pub tracked_item_values: Vec<StoreItemIds>,
}

impl FinalizePayload {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }
}

/// A pre-commit `AddActivelyPersistedItem` record: the orphan blob to delete
/// if the owning transaction never reaches `finalizeCommit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivelyPersistedPayload {
    pub store: String,
    pub item_id: ItemId,
}

impl ActivelyPersistedPayload {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        decode(bytes)
    }
}

/// Every store name referenced by any payload in a transaction's logged
/// entries. Used by idle recovery to know which store sessions to attach
/// before replaying a crashed writer's rollback.
pub fn touched_stores(entries: &[LogEntry]) -> Vec<String> {
    let mut stores = Vec::new();
    let mut push = |name: String| {
        if !name.is_empty() && !stores.contains(&name) {
            stores.push(name);
        }
    };
    for entry in entries {
        match entry.code {
            FunctionCode::CommitNewRootNodes
            | FunctionCode::CommitUpdatedNodes
            | FunctionCode::CommitRemovedNodes
            | FunctionCode::CommitAddedNodes => {
                push(NodeIdsPayload::decode(&entry.payload).store);
            }
            FunctionCode::CommitTrackedItemsValues => {
                push(TrackedValueIdsPayload::decode(&entry.payload).store);
            }
            FunctionCode::CommitStoreInfo => {
                if let Some(info) = StoreInfoPayload::decode(&entry.payload).info {
                    push(info.name);
                }
            }
            FunctionCode::FinalizeCommit => {
                for group in FinalizePayload::decode(&entry.payload).tracked_item_values {
                    push(group.store);
                }
            }
            FunctionCode::AddActivelyPersistedItem => {
                push(ActivelyPersistedPayload::decode(&entry.payload).store);
            }
            _ => {}
        }
    }
    stores
}

/// The ids logged for `code` against `store`, from the most recent matching
/// entry (a retried commit step can log the same code more than once under
/// the same TID).
pub fn last_node_ids(entries: &[LogEntry], code: FunctionCode, store: &str) -> Vec<LogicalId> {
    entries
        .iter()
        .rev()
        .filter(|e| e.code == code)
        .map(|e| NodeIdsPayload::decode(&e.payload))
        .find(|p| p.store == store)
        .map(|p| p.ids)
        .unwrap_or_default()
}

/// The `StoreInfo` snapshot logged for `store` by `commitStoreInfo`, if any.
pub fn last_store_info(entries: &[LogEntry], store: &str) -> Option<btx_core::StoreInfo> {
    entries
        .iter()
        .rev()
        .filter(|e| e.code == FunctionCode::CommitStoreInfo)
        .filter_map(|e| StoreInfoPayload::decode(&e.payload).info)
        .find(|info| info.name == store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btx_core::PhysicalId;
    use btx_storage::Node;

    #[test]
    fn node_ids_payload_round_trips() {
        let node = Node::new_staged(LogicalId::new(), PhysicalId::new(), true);
        let payload = NodeIdsPayload::new("orders", std::slice::from_ref(&node));
        let decoded = NodeIdsPayload::decode(&payload.encode());
        assert_eq!(decoded.store, "orders");
        assert_eq!(decoded.ids, vec![node.logical_id]);
    }

    #[test]
    fn touched_stores_collects_every_payload_kind_without_duplicates() {
        let tid = btx_core::Tid::new();
        let node = Node::new_staged(LogicalId::new(), PhysicalId::new(), true);
        let entries = vec![
            LogEntry {
                tid,
                code: FunctionCode::CommitAddedNodes,
                payload: NodeIdsPayload::new("orders", std::slice::from_ref(&node)).encode(),
                hour: 0,
            },
            LogEntry {
                tid,
                code: FunctionCode::CommitStoreInfo,
                payload: StoreInfoPayload::new(btx_core::StoreInfo::new("orders", LogicalId::new(), 64)).encode(),
                hour: 0,
            },
        ];
        assert_eq!(touched_stores(&entries), vec!["orders".to_string()]);
    }

    #[test]
    fn last_node_ids_prefers_the_most_recent_matching_store() {
        let tid = btx_core::Tid::new();
        let first = LogicalId::new();
        let second = LogicalId::new();
        let entries = vec![
            LogEntry {
                tid,
                code: FunctionCode::CommitUpdatedNodes,
                payload: NodeIdsPayload { store: "orders".into(), ids: vec![first] }.encode(),
                hour: 0,
            },
            LogEntry {
                tid,
                code: FunctionCode::CommitUpdatedNodes,
                payload: NodeIdsPayload { store: "orders".into(), ids: vec![second] }.encode(),
                hour: 0,
            },
        ];
        assert_eq!(last_node_ids(&entries, FunctionCode::CommitUpdatedNodes, "orders"), vec![second]);
    }
}
