//! Collection state engine: sync protocol, events, truncate, indexes.

use std::cell::RefCell;
use std::rc::Rc;

use rill::collection::RowUpdateMode;
use rill::expr::dsl::col;
use rill::expr::CompareOptions;
use rill::index::{IndexOp, IndexReader};
use rill::transactions::{Transaction, TransactionConfig};
use rill::{
    object, ChangeEvent, Collection, CollectionConfig, CollectionStatus, EventKind, SubscribeOptions,
    SyncConfig, SyncContext, SyncHandle, SyncWrite, Value,
};

type SyncSlot = Rc<RefCell<Option<SyncContext>>>;

fn synced_collection(id: &str) -> (Collection, SyncSlot) {
    synced_collection_with(id, RowUpdateMode::Partial)
}

fn synced_collection_with(id: &str, mode: RowUpdateMode) -> (Collection, SyncSlot) {
    let slot: SyncSlot = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&slot);
    let mut sync = SyncConfig::new(move |ctx| {
        *captured.borrow_mut() = Some(ctx);
        Ok(SyncHandle::default())
    });
    sync.row_update_mode = mode;
    let mut config = CollectionConfig::new(|row| row.field("id").clone(), sync);
    config.id = Some(id.to_string());
    config.start_sync = true;
    let collection = Collection::new(config).unwrap();
    (collection, slot)
}

fn ctx(slot: &SyncSlot) -> SyncContext {
    slot.borrow().as_ref().unwrap().clone()
}

fn noop_tx() -> Transaction {
    Transaction::new(TransactionConfig { mutation_fn: Rc::new(|_| Ok(())), auto_commit: false })
}

#[test]
fn sync_commit_round_trip() {
    let (users, slot) = synced_collection("sync-round-trip");
    assert_eq!(users.status(), CollectionStatus::Loading);

    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 1), ("v", 1)])).unwrap();
    ctx.write(SyncWrite::insert(object![("id", 2), ("v", 2)])).unwrap();
    ctx.commit().unwrap();
    ctx.mark_ready();

    assert_eq!(users.status(), CollectionStatus::Ready);
    assert_eq!(users.size(), 2);
    assert_eq!(users.get(&Value::Int(1)), Some(object![("id", 1), ("v", 1)]));

    // Partial update mode merges into the existing row.
    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 1), ("w", 9)])).unwrap();
    ctx.commit().unwrap();
    assert_eq!(users.get(&Value::Int(1)), Some(object![("id", 1), ("v", 1), ("w", 9)]));

    ctx.begin();
    ctx.write(SyncWrite::delete(object![("id", 2)])).unwrap();
    ctx.commit().unwrap();
    assert_eq!(users.size(), 1);
    assert!(!users.has(&Value::Int(2)));
}

#[test]
fn full_update_mode_replaces_rows() {
    let (users, slot) = synced_collection_with("sync-full-mode", RowUpdateMode::Full);
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 1), ("v", 1), ("w", 2)])).unwrap();
    ctx.commit().unwrap();

    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 1), ("v", 5)])).unwrap();
    ctx.commit().unwrap();
    assert_eq!(users.get(&Value::Int(1)), Some(object![("id", 1), ("v", 5)]));
}

#[test]
fn event_stream_shapes() {
    let (users, slot) = synced_collection("sync-event-shapes");
    let log: Rc<RefCell<Vec<ChangeEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let captured = Rc::clone(&log);
    let _sub = users
        .subscribe_changes(SubscribeOptions::new(move |events: &[ChangeEvent]| {
            captured.borrow_mut().extend(events.to_vec());
        }))
        .unwrap();

    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 1), ("v", 1)])).unwrap();
    ctx.commit().unwrap();
    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 1), ("v", 2)])).unwrap();
    ctx.commit().unwrap();
    ctx.begin();
    ctx.write(SyncWrite::delete(object![("id", 1)])).unwrap();
    ctx.commit().unwrap();

    let events = log.borrow();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].kind, EventKind::Insert);
    assert!(events[0].previous.is_none());
    assert_eq!(events[1].kind, EventKind::Update);
    assert_eq!(events[1].previous, Some(object![("id", 1), ("v", 1)]));
    assert_eq!(events[1].value, object![("id", 1), ("v", 2)]);
    assert_eq!(events[2].kind, EventKind::Delete);
    assert_eq!(events[2].value, object![("id", 1), ("v", 2)]);
}

#[test]
fn unchanged_sync_update_emits_nothing() {
    let (users, slot) = synced_collection("sync-no-echo");
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 1), ("v", 1)])).unwrap();
    ctx.commit().unwrap();

    let log: Rc<RefCell<Vec<ChangeEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let captured = Rc::clone(&log);
    let _sub = users
        .subscribe_changes(SubscribeOptions::new(move |events: &[ChangeEvent]| {
            captured.borrow_mut().extend(events.to_vec());
        }))
        .unwrap();

    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 1), ("v", 1)])).unwrap();
    ctx.commit().unwrap();
    assert!(log.borrow().is_empty());
}

#[test]
fn sync_protocol_misuse_is_structured() {
    let (_users, slot) = synced_collection("sync-misuse");
    let ctx = ctx(&slot);

    let err = ctx.write(SyncWrite::insert(object![("id", 1)])).unwrap_err();
    assert_eq!(err.name(), "NoPendingSyncTransactionWriteError");

    let err = ctx.commit().unwrap_err();
    assert_eq!(err.name(), "NoPendingSyncTransactionCommitError");

    ctx.begin();
    ctx.commit().unwrap();
    let err = ctx.write(SyncWrite::insert(object![("id", 1)])).unwrap_err();
    assert_eq!(err.name(), "SyncTransactionAlreadyCommittedError");
}

#[test]
fn truncate_restores_optimistic_overlay() {
    let (users, slot) = synced_collection("sync-truncate");
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", "A"), ("v", 1)])).unwrap();
    ctx.write(SyncWrite::insert(object![("id", "B"), ("v", 1)])).unwrap();
    ctx.commit().unwrap();
    ctx.mark_ready();

    // Optimistic overlay: add C, remove A; the transaction stays open.
    let tx = noop_tx();
    let users_in_tx = users.clone();
    tx.mutate(|| {
        users_in_tx.insert(object![("id", "C"), ("v", 3)])?;
        users_in_tx.delete(&Value::from("A"))?;
        Ok(())
    })
    .unwrap();

    let log: Rc<RefCell<Vec<ChangeEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let captured = Rc::clone(&log);
    let _sub = users
        .subscribe_changes(SubscribeOptions {
            on_events: Box::new(move |events: &[ChangeEvent]| {
                captured.borrow_mut().extend(events.to_vec());
            }),
            where_expr: None,
            include_initial: true,
            ordered: None,
        })
        .unwrap();
    log.borrow_mut().clear();

    // Authoritative reset replacing B.
    ctx.begin();
    ctx.truncate().unwrap();
    ctx.write(SyncWrite::insert(object![("id", "B"), ("v", 2)])).unwrap();
    ctx.commit().unwrap();

    assert_eq!(users.get(&Value::from("A")), None);
    assert_eq!(users.get(&Value::from("B")), Some(object![("id", "B"), ("v", 2)]));
    assert_eq!(users.get(&Value::from("C")), Some(object![("id", "C"), ("v", 3)]));
    assert_eq!(users.size(), 2);

    let events = log.borrow();
    // One event reflecting B's final value, and C's re-assertion.
    let b_events: Vec<_> =
        events.iter().filter(|e| e.key == Value::from("B")).collect();
    assert_eq!(b_events.len(), 1);
    assert_eq!(b_events[0].kind, EventKind::Update);
    assert_eq!(b_events[0].value, object![("id", "B"), ("v", 2)]);
    let c_events: Vec<_> =
        events.iter().filter(|e| e.key == Value::from("C")).collect();
    assert_eq!(c_events.len(), 1);
    assert_eq!(c_events[0].kind, EventKind::Insert);
    assert!(events.iter().all(|e| e.key != Value::from("A")));
}

#[test]
fn size_matches_entries_under_overlay() {
    let (users, slot) = synced_collection("sync-size-invariant");
    let ctx = ctx(&slot);
    ctx.begin();
    for i in 0..10i64 {
        ctx.write(SyncWrite::insert(object![("id", i), ("v", i)])).unwrap();
    }
    ctx.commit().unwrap();

    let tx = noop_tx();
    let users_in_tx = users.clone();
    tx.mutate(|| {
        users_in_tx.insert(object![("id", 100), ("v", 0)])?;
        users_in_tx.delete(&Value::Int(3))?;
        users_in_tx.update(&Value::Int(4), |draft| draft.set(&["v"], 40))?;
        Ok(())
    })
    .unwrap();

    assert_eq!(users.size(), users.entries().len());
    assert_eq!(users.size(), 10);
    assert_eq!(users.get(&Value::Int(4)), Some(object![("id", 4), ("v", 40)]));
}

#[test]
fn cleanup_and_restart() {
    let (users, slot) = synced_collection("sync-cleanup");
    let sync_ctx = ctx(&slot);
    sync_ctx.begin();
    sync_ctx.write(SyncWrite::insert(object![("id", 1)])).unwrap();
    sync_ctx.commit().unwrap();
    assert_eq!(users.status(), CollectionStatus::Ready);

    users.cleanup().unwrap();
    assert_eq!(users.status(), CollectionStatus::CleanedUp);
    assert_eq!(users.size(), 0);

    users.start_sync().unwrap();
    assert_eq!(users.status(), CollectionStatus::Loading);
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 2)])).unwrap();
    ctx.commit().unwrap();
    assert_eq!(users.status(), CollectionStatus::Ready);
    assert!(users.has(&Value::Int(2)));
}

#[test]
fn index_stays_consistent_with_visible_state() {
    let (users, slot) = synced_collection("sync-index-consistency");
    let index_id = users.ensure_index(col("v"), CompareOptions::default()).unwrap();

    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 1), ("v", 10)])).unwrap();
    ctx.write(SyncWrite::insert(object![("id", 2), ("v", 20)])).unwrap();
    ctx.write(SyncWrite::insert(object![("id", 3), ("v", 10)])).unwrap();
    ctx.commit().unwrap();

    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 3), ("v", 30)])).unwrap();
    ctx.write(SyncWrite::delete(object![("id", 2)])).unwrap();
    ctx.commit().unwrap();

    let found = users
        .with_index(index_id, |index| index.lookup(IndexOp::Eq, &Value::Int(10)))
        .unwrap();
    let expected: std::collections::BTreeSet<Value> = users
        .entries()
        .into_iter()
        .filter(|(_, row)| row.field("v") == &Value::Int(10))
        .map(|(key, _)| key)
        .collect();
    assert_eq!(found, expected);
    let moved = users
        .with_index(index_id, |index| index.lookup(IndexOp::Eq, &Value::Int(30)))
        .unwrap();
    assert_eq!(moved.len(), 1);
}
