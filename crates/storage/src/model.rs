//! B-tree node and item shapes tracked by a session's local cache.

use btx_core::{CoreError, CoreResult, ItemAction, ItemId, LogicalId, PhysicalId, Tid};
use serde::{Deserialize, Serialize};

/// An ordered B-tree node: slots and child links. Identified by its
/// physical id; immutable once committed — a rewrite produces a new
/// physical id staged into the owning `Handle`'s inactive slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Logical identity (stable across rewrites).
    pub logical_id: LogicalId,
    /// Physical identity of this particular version's payload.
    pub physical_id: PhysicalId,
    /// Version read (or assigned) when this node entered the session's
    /// local cache; used for the optimistic version check at commit.
    pub version: u64,
    /// Ordered key/value slots.
    pub items: Vec<Item>,
    /// Logical ids of child nodes, empty for a leaf.
    pub children: Vec<LogicalId>,
    /// True if this node is the store's root.
    pub is_root: bool,
}

impl Node {
    /// A freshly-created node staged for `commitAddedNodes`/
    /// `commitNewRootNodes`, at version 0.
    pub fn new_staged(logical_id: LogicalId, physical_id: PhysicalId, is_root: bool) -> Self {
        Self {
            logical_id,
            physical_id,
            version: 0,
            items: Vec::new(),
            children: Vec::new(),
            is_root,
        }
    }

    /// The byte payload written to the blob store for this version of the
    /// node.
    pub fn payload(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::Backend(format!("encode node: {e}")))
    }
}

/// A key/value slot held by a node. The value may live inline or be
/// externalized to the blob store, in which case `value_needs_fetch` is set
/// and `item_id` names the out-of-band blob key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Ordering key.
    pub key: Vec<u8>,
    /// Inline value, present unless the value has been externalized.
    pub value: Option<Vec<u8>>,
    /// Out-of-band blob identity, present once the value has been
    /// externalized (store policy `value_in_node_segment = false`, or an
    /// actively-persisted item).
    pub item_id: Option<ItemId>,
    /// True when `value` must be fetched from the blob store via `item_id`
    /// before the item's content is usable.
    pub value_needs_fetch: bool,
}

impl Item {
    /// An inline item.
    pub fn inline(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
            item_id: None,
            value_needs_fetch: false,
        }
    }

    /// An item whose value lives out-of-band.
    pub fn externalized(key: Vec<u8>, item_id: ItemId) -> Self {
        Self {
            key,
            value: None,
            item_id: Some(item_id),
            value_needs_fetch: true,
        }
    }
}

/// Classification of a cached node within a session's local cache, per
/// `classifyModifiedNodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAction {
    /// Fetched but untouched; only its version needs to survive intactness
    /// checks.
    Default,
    /// Fetched and read (tracked for intactness, no write).
    Get,
    /// Newly created, not yet in the registry.
    Add,
    /// Rewritten; its prior version must still match at commit.
    Update,
    /// Marked for deletion.
    Remove,
}

/// A locally-cached node plus the action the session intends for it,
/// keyed by logical id in the session's `localCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemActionRecord {
    /// The node as last read or written by this session.
    pub node: Node,
    /// What this session intends to do with it.
    pub action: NodeAction,
    /// The transaction tracking this record, for item-lock bookkeeping.
    pub tid: Tid,
}

/// Record of an item-level intent, as distinct from a node-level one: the
/// item-action tracker tracks these independent of which node currently
/// holds the item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    /// The item's externalized blob identity, once known.
    pub item_id: ItemId,
    /// The intended action.
    pub action: ItemAction,
    /// Current (possibly staged) value, when known locally.
    pub value: Option<Vec<u8>>,
}
