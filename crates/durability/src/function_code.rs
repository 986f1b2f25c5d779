//! The commit-progress ladder: a total order over the steps of
//! Phase 1/Phase 2, used both to record how far a transaction got and to
//! drive rollback/recovery playback in reverse.

use serde::{Deserialize, Serialize};

/// A step of the two-phase commit, in the exact order Phase 1/Phase 2
/// perform them. Declaration order is derive-Ord order — do not reorder
/// these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    /// No progress logged yet.
    Unknown,
    /// An actively-persisted item's value blob was written ahead of commit.
    AddActivelyPersistedItem,
    /// Item-level locks were acquired.
    LockTrackedItems,
    /// Tracked item values were committed (externalized writes landed).
    CommitTrackedItemsValues,
    /// Concurrently-raced new root nodes were merged or created.
    CommitNewRootNodes,
    /// Fetched nodes were confirmed unchanged since they were read.
    AreFetchedItemsIntact,
    /// Updated nodes were staged into their handles' inactive slot.
    CommitUpdatedNodes,
    /// Removed nodes were marked deleted.
    CommitRemovedNodes,
    /// Newly added (non-root) nodes were written.
    CommitAddedNodes,
    /// The store's count/delta bookkeeping was committed.
    CommitStoreInfo,
    /// Updated/removed handles were written to the priority log ahead of
    /// finalization.
    BeforeFinalize,
    /// Handle activation/removal finalization landed atomically.
    FinalizeCommit,
    /// Obsolete registry entries and unused node blobs were deleted.
    DeleteObsoleteEntries,
    /// Tracked item values superseded by the commit were deleted.
    DeleteTrackedItemsValues,
}

impl FunctionCode {
    /// The highest code reached across a set of log entries, or `Unknown`
    /// if the set is empty.
    pub fn highest(codes: impl IntoIterator<Item = FunctionCode>) -> FunctionCode {
        codes.into_iter().max().unwrap_or(FunctionCode::Unknown)
    }
}

impl Default for FunctionCode {
    fn default() -> Self {
        FunctionCode::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_totally_ordered_as_declared() {
        assert!(FunctionCode::Unknown < FunctionCode::AddActivelyPersistedItem);
        assert!(FunctionCode::AddActivelyPersistedItem < FunctionCode::LockTrackedItems);
        assert!(FunctionCode::CommitNewRootNodes < FunctionCode::AreFetchedItemsIntact);
        assert!(FunctionCode::CommitAddedNodes < FunctionCode::CommitStoreInfo);
        assert!(FunctionCode::BeforeFinalize < FunctionCode::FinalizeCommit);
        assert!(FunctionCode::DeleteObsoleteEntries < FunctionCode::DeleteTrackedItemsValues);
    }

    #[test]
    fn highest_picks_max_and_defaults_to_unknown() {
        assert_eq!(FunctionCode::highest([]), FunctionCode::Unknown);
        assert_eq!(
            FunctionCode::highest([FunctionCode::LockTrackedItems, FunctionCode::CommitAddedNodes]),
            FunctionCode::CommitAddedNodes
        );
    }
}
