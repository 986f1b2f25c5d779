//! The `Database` facade: wires the durability, storage, and concurrency
//! crates together into the single entry point client code opens a
//! transaction against.
//!
//! Building an actual B-tree on top of the node repository (`OpenBtree`,
//! `NewBtree` in the collaborator's own vocabulary) is out of scope here —
//! `new_store` only provisions the `StoreInfo` descriptor and an empty root
//! handle, which is as far as this crate's contract reaches.

use std::sync::Arc;
use std::time::Duration;

use btx_concurrency::{Coordinator, IdleReclamation, ItemActionTracker, StoreSession, Transaction};
use btx_core::{
    BlobStore, Clock, CoreError, CoreResult, L1Cache, L2Cache, LogicalId, Registry, StoreInfo,
    StoreRepository, SystemClock, Tid, TransactionMode,
};
use btx_durability::{
    ExpiredLogSweeper, InMemoryPriorityLog, InMemoryTransactionLog, TransactionLog,
    TransactionPriorityLog,
};
use btx_storage::{
    InMemoryBlobStore, InMemoryL1Cache, InMemoryL2Cache, InMemoryRegistry, InMemoryStoreRepository,
    Node, NodeRepositoryBackend,
};

use crate::config::{CoordinatorConfig, StoreOptions};

/// Every collaborator the coordinator needs, plus the config that governs
/// how they're used. Each field is trait-object-erased so a deployment can
/// swap in real backends without touching `Database`'s API.
pub struct Database {
    cache: Arc<dyn L2Cache>,
    registry: Arc<dyn Registry>,
    blobs: Arc<dyn BlobStore>,
    l1: Arc<dyn L1Cache>,
    store_repo: Arc<dyn StoreRepository>,
    log: Arc<dyn TransactionLog>,
    priority_log: Arc<dyn TransactionPriorityLog>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    coordinator: Coordinator,
    idle: IdleReclamation,
}

impl Database {
    /// Wire a `Database` from explicit collaborators — the constructor a
    /// real deployment uses once it has its own registry/blob
    /// store/caches.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn L2Cache>,
        registry: Arc<dyn Registry>,
        blobs: Arc<dyn BlobStore>,
        l1: Arc<dyn L1Cache>,
        store_repo: Arc<dyn StoreRepository>,
        log: Arc<dyn TransactionLog>,
        priority_log: Arc<dyn TransactionPriorityLog>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let coordinator = Coordinator::new(
            Arc::clone(&store_repo),
            Arc::clone(&l1),
            Arc::clone(&log),
            Arc::clone(&priority_log),
            Arc::clone(&clock),
            Arc::clone(&registry),
            Arc::clone(&cache),
            config.sector_timeout_lock_ttl,
        );
        let sweeper = Arc::new(ExpiredLogSweeper::new(Arc::clone(&log)));
        let idle = IdleReclamation::new(
            Arc::clone(&priority_log),
            sweeper,
            Arc::clone(&cache),
            Arc::clone(&clock),
        );
        Self {
            cache,
            registry,
            blobs,
            l1,
            store_repo,
            log,
            priority_log,
            clock,
            config,
            coordinator,
            idle,
        }
    }

    /// A self-contained `Database` over the in-memory reference
    /// collaborators, for demos and tests — nothing here survives a
    /// process restart.
    pub fn open_in_memory() -> Self {
        let (db, _, _) = Self::open_in_memory_with_fault_handles();
        db
    }

    /// Like `open_in_memory`, but also returns the concrete registry and
    /// L2 cache handles so tests can arm a sector fault or simulate a
    /// cache restart — operations `Database`'s trait-object surface
    /// deliberately doesn't expose.
    pub fn open_in_memory_with_fault_handles() -> (Self, Arc<InMemoryRegistry>, Arc<InMemoryL2Cache>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = Arc::new(InMemoryL2Cache::new());
        let db = Self::new(
            Arc::clone(&cache) as Arc<dyn L2Cache>,
            Arc::clone(&registry) as Arc<dyn Registry>,
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryL1Cache::new()),
            Arc::new(InMemoryStoreRepository::new()),
            Arc::new(InMemoryTransactionLog::new()),
            Arc::new(InMemoryPriorityLog::new()),
            Arc::new(SystemClock),
            CoordinatorConfig::default(),
        );
        (db, registry, cache)
    }

    /// Provision a new store's descriptor and empty root handle. Fails if
    /// a store by this name already exists.
    pub fn new_store(&self, name: &str, options: StoreOptions) -> CoreResult<()> {
        if self.store_repo.get(std::slice::from_ref(&name.to_string()))?[0].is_some() {
            return Err(CoreError::Precondition(format!("store {name} already exists")));
        }

        let root_id = LogicalId::new();
        let root_physical = btx_core::PhysicalId::new();
        let root = Node::new_staged(root_id, root_physical, true);
        self.blobs.add(name, root_physical, root.payload()?)?;
        self.registry
            .add(name, vec![btx_core::Handle::new_staged(root_id, root_physical)])?;

        let mut info = StoreInfo::new(name, root_id, options.slot_length);
        info.value_in_node_segment = options.value_in_node_segment;
        info.value_actively_persisted = options.value_actively_persisted;
        info.value_globally_cached = options.value_globally_cached;
        info.value_cache_ttl = options.value_cache_ttl;
        self.store_repo.add(vec![info])
    }

    /// Fetch a previously provisioned store's descriptor.
    pub fn store_info(&self, name: &str) -> CoreResult<Option<StoreInfo>> {
        Ok(self.store_repo.get(std::slice::from_ref(&name.to_string()))?.into_iter().next().flatten())
    }

    /// Begin a transaction in the given mode, running any due idle
    /// reclamation passes first.
    pub fn begin(&self, mode: TransactionMode, max_duration: Option<Duration>) -> CoreResult<Transaction> {
        self.reap_idle_work()?;
        Ok(Transaction::begin(
            mode,
            max_duration.or(Some(self.config.default_max_duration)),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            Arc::clone(&self.blobs),
        ))
    }

    /// Attach a store session to an in-progress transaction, so its
    /// tracker/backend can accumulate intents against that store.
    pub fn attach_store(&self, tx: &mut Transaction, store_name: &str) -> CoreResult<()> {
        if tx.store_session(store_name).is_some() {
            return Ok(());
        }
        let backend = NodeRepositoryBackend::new(store_name, Arc::clone(&self.registry), Arc::clone(&self.blobs));
        let tracker = ItemActionTracker::new(
            store_name,
            tx.tid,
            Arc::clone(&self.blobs),
            Arc::clone(&self.cache),
            Arc::clone(&self.log),
            Arc::clone(&self.clock),
        );
        tx.add_store_session(StoreSession {
            store_name: store_name.to_string(),
            backend,
            tracker,
        });
        Ok(())
    }

    /// Run Phase 1 then Phase 2 to completion. On any error the
    /// transaction has already been rolled back by the coordinator.
    pub fn commit(&self, tx: &mut Transaction) -> CoreResult<()> {
        self.coordinator.phase1_commit(tx)?;
        if let Err(e) = self.coordinator.phase2_commit(tx) {
            return Err(e);
        }
        Ok(())
    }

    pub fn rollback(&self, tx: &mut Transaction) -> CoreResult<()> {
        self.coordinator.rollback(tx)
    }

    /// Run whichever idle passes are due. Exposed so a caller that isn't
    /// opening transactions on a regular cadence (e.g. a background
    /// thread) can still drive reclamation.
    pub fn reap_idle_work(&self) -> CoreResult<()> {
        let coordinator = &self.coordinator;
        self.idle.reap(
            |tid| coordinator.priority_rollback(tid),
            |tid| self.recover_abandoned(tid),
        )
    }

    /// Best-effort recovery for a transaction whose expired-log entry
    /// survived a crash: the log payloads name every store the write
    /// touched, so only those sessions are attached before replaying
    /// rollback. A transaction already past `FinalizeCommit` is left
    /// alone — rollback itself refuses to unwind a committed one.
    fn recover_abandoned(&self, tid: Tid) -> CoreResult<()> {
        let entries = self.log.entries(tid)?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = Transaction::begin(
            TransactionMode::Writer,
            None,
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            Arc::clone(&self.blobs),
        );
        tx.tid = tid;
        for name in btx_concurrency::payload::touched_stores(&entries) {
            self.attach_store(&mut tx, &name)?;
        }
        self.coordinator.rollback(&mut tx)
    }
}
