//! Owner-stamped distributed lock acquisition.
//!
//! `acquire_locks` is the one place deadlock-avoidant ordering (locks are
//! always sorted by id before being acquired) and takeover detection live;
//! everything else just asks for a set of `LogicalId`s to be locked and gets
//! back `LockKey`s it owns, or an error.

use std::sync::Arc;
use std::time::Duration;

use btx_core::{create_lock_keys, CoreError, CoreResult, L2Cache, LockKey, LogicalId, Tid};

/// Acquire one lock per logical id, sorted for global ordering.
///
/// On a losing race where the cache reports this TID as the nominal owner
/// (a takeover candidate — e.g. this session previously owned the lock and
/// is retrying after a transient failure) every key's current owner is
/// re-confirmed via `get_owner`. If they all still belong to `tid`, the
/// locks are treated as already held. Any other outcome fails with
/// [`CoreError::SectorTimeout`] carrying the contended key, for the
/// sector-timeout handler to resolve.
pub fn acquire_locks(cache: &dyn L2Cache, tid: Tid, ids: &[LogicalId], ttl: Duration) -> CoreResult<Vec<LockKey>> {
    let mut keys = create_lock_keys(tid, ids);
    if keys.is_empty() {
        return Ok(keys);
    }

    let (ok, owner) = cache.lock(&keys, ttl)?;
    if ok {
        if !cache.is_locked(&keys)? {
            return Err(CoreError::Conflict(format!(
                "lock verification failed for tid {tid}"
            )));
        }
        for key in keys.iter_mut() {
            key.is_lock_owner = true;
        }
        return Ok(keys);
    }

    match owner {
        None => Err(CoreError::Conflict(format!("lock denied for tid {tid} with no owner reported"))),
        Some(owner) if owner == tid => {
            let mut all_owned = true;
            for key in &keys {
                match cache.get_owner(&key.key, ttl)? {
                    Some(o) if o == tid => {}
                    _ => {
                        all_owned = false;
                        break;
                    }
                }
            }
            if all_owned {
                for key in keys.iter_mut() {
                    key.is_lock_owner = true;
                }
                Ok(keys)
            } else {
                Err(CoreError::SectorTimeout { lock_key: keys.into_iter().next().unwrap() })
            }
        }
        Some(_other) => Err(CoreError::SectorTimeout { lock_key: keys.into_iter().next().unwrap() }),
    }
}

/// Release every key this session owns. Best-effort: callers that need to
/// know whether it actually succeeded should still check the error.
pub fn release_locks(cache: &dyn L2Cache, keys: &[LockKey]) -> CoreResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    cache.unlock(keys)
}

/// Merge two id batches into one deduped, sorted set, ahead of locking or
/// log-payload construction that needs a single ordered view over both.
pub fn merge_ids(a: &[LogicalId], b: &[LogicalId]) -> Vec<LogicalId> {
    let mut ids: Vec<LogicalId> = Vec::with_capacity(a.len() + b.len());
    ids.extend_from_slice(a);
    ids.extend_from_slice(b);
    ids.sort_by_key(|id| id.halves());
    ids.dedup();
    ids
}

/// Build the deterministically-ordered lock-key set for a batch of updated
/// and removed node ids.
pub fn merge_node_keys(tid: Tid, updated: &[LogicalId], removed: &[LogicalId]) -> Vec<LockKey> {
    create_lock_keys(tid, &merge_ids(updated, removed))
}

/// Process-coordination mutex helper over `dual_lock`/`dual_unlock`, used
/// by the sector-timeout handler's single `DTrollbk` lock and by the idle
/// passes' own mutual-exclusion keys.
pub struct ProcessLock<'a> {
    cache: &'a dyn L2Cache,
    key: String,
    held: bool,
}

impl<'a> ProcessLock<'a> {
    pub fn try_acquire(cache: &'a dyn L2Cache, key: impl Into<String>, ttl: Duration) -> CoreResult<Option<Self>> {
        let key = key.into();
        if cache.dual_lock(std::slice::from_ref(&key), ttl)? {
            Ok(Some(Self { cache, key, held: true }))
        } else {
            Ok(None)
        }
    }

    pub fn release(mut self) -> CoreResult<()> {
        self.held = false;
        self.cache.dual_unlock(std::slice::from_ref(&self.key))
    }
}

impl Drop for ProcessLock<'_> {
    fn drop(&mut self) {
        if self.held {
            let _ = self.cache.dual_unlock(std::slice::from_ref(&self.key));
        }
    }
}

/// The single process-coordination path that resolves a `SectorTimeout` by
/// taking over the contended lock via a priority rollback, so the caller's
/// retry can proceed.
///
/// The actual priority-rollback invocation is supplied by the caller (it
/// needs the coordinator's full collaborator set); this just owns the
/// `DTrollbk` mutex dance around it.
pub fn handle_registry_sector_lock_timeout(
    cache: &dyn L2Cache,
    ttl: Duration,
    contended: &LockKey,
    priority_rollback: impl FnOnce(Tid) -> CoreResult<()>,
) -> CoreResult<()> {
    let guard = ProcessLock::try_acquire(cache, "DTrollbk", ttl)?;
    let Some(guard) = guard else {
        return Err(CoreError::SectorTimeout { lock_key: contended.clone() });
    };
    let result = priority_rollback(contended.lock_id);
    guard.release()?;
    result
}

/// Shared handle to the cache used across a transaction's lifetime,
/// convenient for passing into free functions that only need the trait
/// object.
pub type SharedCache = Arc<dyn L2Cache>;

#[cfg(test)]
mod tests {
    use super::*;
    use btx_storage::InMemoryL2Cache;
    use std::time::Duration;

    #[test]
    fn acquire_locks_is_sorted_and_exclusive() {
        let cache = InMemoryL2Cache::new();
        let tid = Tid::new();
        let other = Tid::new();
        let ids = vec![LogicalId::new(), LogicalId::new()];

        let keys = acquire_locks(&cache, tid, &ids, Duration::from_secs(5)).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.is_lock_owner));

        let err = acquire_locks(&cache, other, &ids, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CoreError::SectorTimeout { .. }));

        release_locks(&cache, &keys).unwrap();
        let retried = acquire_locks(&cache, other, &ids, Duration::from_secs(5)).unwrap();
        assert_eq!(retried.len(), 2);
    }

    #[test]
    fn acquire_locks_treats_self_owned_resurrected_lock_as_a_takeover() {
        let cache = InMemoryL2Cache::new();
        let tid = Tid::new();
        let ids = vec![LogicalId::new()];

        acquire_locks(&cache, tid, &ids, Duration::from_secs(5)).unwrap();
        // A second call by the same tid (e.g. a retry after a transient
        // error) sees itself as the current owner and succeeds rather
        // than contending with itself.
        let keys = acquire_locks(&cache, tid, &ids, Duration::from_secs(5)).unwrap();
        assert!(keys.iter().all(|k| k.is_lock_owner));
    }

    #[test]
    fn merge_node_keys_dedupes_and_sorts() {
        let tid = Tid::new();
        let shared = LogicalId::new();
        let keys = merge_node_keys(tid, &[shared], &[shared]);
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn process_lock_releases_on_drop() {
        let cache = InMemoryL2Cache::new();
        {
            let _guard = ProcessLock::try_acquire(&cache, "DTrollbk", Duration::from_secs(5)).unwrap().unwrap();
            assert!(ProcessLock::try_acquire(&cache, "DTrollbk", Duration::from_secs(5)).unwrap().is_none());
        }
        assert!(ProcessLock::try_acquire(&cache, "DTrollbk", Duration::from_secs(5)).unwrap().is_some());
    }
}
