//! Data-model entities referenced by the collaborator traits: the
//! logical/physical indirection layer (`Handle`) and the per-store
//! descriptor (`StoreInfo`). Both are pure data — behavior lives in
//! `btx-storage`.

use crate::types::{LogicalId, PhysicalId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical-ID to physical-ID indirection record.
///
/// Invariant: exactly one of `physical_a`/`physical_b` is *active* and
/// readable at any time, selected by `is_active_b`. The inactive slot is the
/// staging area for the next version; it only becomes readable once
/// `activate` flips `is_active_b` and bumps `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// Stable logical identity.
    pub logical_id: LogicalId,
    /// Physical slot A.
    pub physical_a: PhysicalId,
    /// Physical slot B. Populated once the handle has been updated at least
    /// once; `None` for a handle that has never been rewritten.
    pub physical_b: Option<PhysicalId>,
    /// Selects which of `physical_a`/`physical_b` is the active (readable)
    /// id.
    pub is_active_b: bool,
    /// Monotonic version counter for optimistic concurrency checks.
    pub version: u64,
    /// Non-zero (in practice: `Some`) while a physical rewrite is staged but
    /// not yet finalized. Cleared by `activate`/`touch`/rollback.
    pub work_in_progress: bool,
    /// True once the logical entity has been marked removed.
    pub is_deleted: bool,
}

impl Handle {
    /// Create a brand-new handle for a freshly added node, staged
    /// (`work_in_progress = true`) until Phase 2 finalizes it.
    pub fn new_staged(logical_id: LogicalId, physical: PhysicalId) -> Self {
        Self {
            logical_id,
            physical_a: physical,
            physical_b: None,
            is_active_b: false,
            version: 0,
            work_in_progress: true,
            is_deleted: false,
        }
    }

    /// The id currently readable by other sessions.
    pub fn active_id(&self) -> PhysicalId {
        if self.is_active_b {
            self.physical_b.expect("active_b set without physical_b")
        } else {
            self.physical_a
        }
    }

    /// The id currently staged (the slot a pending update writes into).
    pub fn inactive_id(&self) -> Option<PhysicalId> {
        if self.is_active_b {
            Some(self.physical_a)
        } else {
            self.physical_b
        }
    }

    /// Stage `new_physical` into the inactive slot ahead of an update.
    pub fn stage_update(&mut self, new_physical: PhysicalId) {
        if self.is_active_b {
            self.physical_a = new_physical;
        } else {
            self.physical_b = Some(new_physical);
        }
        self.work_in_progress = true;
    }

    /// Flip the active slot and bump the version: the staged update
    /// becomes the readable value. Phase 2 only.
    pub fn activate(&mut self) {
        self.is_active_b = !self.is_active_b;
        self.version += 1;
        self.work_in_progress = true;
    }

    /// Finalization companion to `activate`/removal marking: clears the
    /// work-in-progress flag once the registry write has durably landed.
    pub fn finalize(&mut self) {
        self.work_in_progress = false;
    }

    /// Bump the version and clear WIP for a removed handle (no active-slot
    /// flip — removal doesn't rewrite the payload).
    pub fn touch_removed(&mut self) {
        self.version += 1;
        self.work_in_progress = false;
    }

    /// Undo a staged removal (`rollbackRemovedNodes`): clear the deletion
    /// mark and the work-in-progress flag without touching the version.
    pub fn revert_removal(&mut self) {
        self.is_deleted = false;
        self.work_in_progress = false;
    }
}

/// Per-store cache policy and bookkeeping descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name, also used as the registry/blob table name.
    pub name: String,
    /// Max key+value slot length for a single B-tree node entry.
    pub slot_length: usize,
    /// Logical id of the root node.
    pub root_node_id: LogicalId,
    /// Live item count as of the last successful commit.
    pub count: i64,
    /// Staged delta from the in-flight transaction, folded into `count` at
    /// `commitStoreInfo`.
    pub count_delta: i64,
    /// Values are stored inline in the node's segment rather than
    /// externalized to the blob store.
    pub value_in_node_segment: bool,
    /// Values are persisted to the blob store as soon as they're added
    /// (rather than only when the tracker externalizes them at commit).
    pub value_actively_persisted: bool,
    /// Values are mirrored into the L2 (distributed) value cache.
    pub value_globally_cached: bool,
    /// TTL applied to cached values when `value_globally_cached` is set.
    pub value_cache_ttl: Option<Duration>,
}

impl StoreInfo {
    /// A new, empty store with default (in-node, uncached) value policy.
    pub fn new(name: impl Into<String>, root_node_id: LogicalId, slot_length: usize) -> Self {
        Self {
            name: name.into(),
            slot_length,
            root_node_id,
            count: 0,
            count_delta: 0,
            value_in_node_segment: true,
            value_actively_persisted: false,
            value_globally_cached: false,
            value_cache_ttl: None,
        }
    }

    /// Fold the staged delta into the live count and reset it, as done by
    /// `commitStoreInfo` in Phase 1 step 7.
    pub fn apply_count_delta(&mut self) {
        self.count += self.count_delta;
        self.count_delta = 0;
    }
}
