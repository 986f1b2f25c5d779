use std::sync::Arc;

use btx_core::{ItemId, PhysicalId, Registry, Tid, TransactionMode, TransactionPhase};
use btx_engine::{CoordinatorConfig, Database, StoreOptions};
use btx_storage::model::{ItemActionRecord, Node, NodeAction};

#[test]
fn commit_with_no_tracked_items_is_a_no_op_success() {
    let db = Database::open_in_memory();
    db.new_store("orders", StoreOptions::new(64)).unwrap();

    let mut tx = db.begin(TransactionMode::Writer, None).unwrap();
    db.attach_store(&mut tx, "orders").unwrap();

    db.commit(&mut tx).unwrap();
    assert_eq!(tx.phase, TransactionPhase::Done);
}

#[test]
fn item_add_survives_commit_in_an_in_node_store() {
    let db = Database::open_in_memory();
    db.new_store("orders", StoreOptions::new(64)).unwrap();

    let mut tx = db.begin(TransactionMode::Writer, None).unwrap();
    db.attach_store(&mut tx, "orders").unwrap();
    {
        let session = tx.store_session("orders").unwrap();
        session.tracker.add(ItemId::new(), b"hello".to_vec(), false, false, None).unwrap();
    }

    db.commit(&mut tx).unwrap();
    assert_eq!(tx.phase, TransactionPhase::Done);
}

#[test]
fn sector_lock_timeout_is_taken_over_and_the_retry_succeeds() {
    let (db, registry, _cache) = Database::open_in_memory_with_fault_handles();
    db.new_store("orders", StoreOptions::new(64)).unwrap();
    let info = db.store_info("orders").unwrap().unwrap();
    let root_id = info.root_node_id;

    let current = registry
        .get("orders", &[root_id])
        .unwrap()
        .into_iter()
        .next()
        .flatten()
        .expect("root handle provisioned by new_store");

    let mut tx = db.begin(TransactionMode::Writer, None).unwrap();
    db.attach_store(&mut tx, "orders").unwrap();
    {
        let session = tx.store_session("orders").unwrap();
        let mut updated = Node::new_staged(root_id, PhysicalId::new(), true);
        updated.version = current.version;
        session.backend.track(ItemActionRecord { node: updated, action: NodeAction::Update, tid: tx.tid });
    }

    // Arm a one-shot sector fault so the first commit_updated_nodes call
    // races a contended sector lock and has to go through the takeover
    // path before its retry lands.
    registry.arm_sector_fault("orders", Tid::new());

    db.commit(&mut tx).unwrap();
    assert_eq!(tx.phase, TransactionPhase::Done);

    let after = registry
        .get("orders", &[root_id])
        .unwrap()
        .into_iter()
        .next()
        .flatten()
        .unwrap();
    assert_eq!(after.version, current.version + 1);
}

#[test]
fn reader_intactness_check_fails_after_concurrent_removal() {
    let (db, registry, _cache) = Database::open_in_memory_with_fault_handles();
    db.new_store("orders", StoreOptions::new(64)).unwrap();
    let info = db.store_info("orders").unwrap().unwrap();
    let root_id = info.root_node_id;

    let mut reader = db.begin(TransactionMode::ReadOnly, None).unwrap();
    db.attach_store(&mut reader, "orders").unwrap();
    {
        let session = reader.store_session("orders").unwrap();
        let node = Node::new_staged(root_id, PhysicalId::new(), true);
        session.backend.track(ItemActionRecord { node, action: NodeAction::Get, tid: reader.tid });
    }

    // A second, independent writer removes the root handle entirely
    // before the reader commits.
    registry.remove("orders", &[root_id]).unwrap();

    let err = db.commit(&mut reader).unwrap_err();
    assert!(matches!(err, btx_core::CoreError::Conflict(_)));
}

#[test]
fn coordinator_config_clamps_default_duration() {
    let cfg = CoordinatorConfig::new(None);
    assert_eq!(cfg.default_max_duration, btx_core::limits::DEFAULT_MAX_DURATION);
}

#[test]
fn new_store_rejects_duplicate_name() {
    let db = Database::open_in_memory();
    db.new_store("orders", StoreOptions::new(64)).unwrap();
    let err = db.new_store("orders", StoreOptions::new(64)).unwrap_err();
    assert!(matches!(err, btx_core::CoreError::Precondition(_)));
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn database_handle_is_shareable_across_threads() {
    assert_send_sync::<Arc<Database>>();
}
