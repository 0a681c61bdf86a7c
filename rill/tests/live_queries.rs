//! Live queries end to end: filters, joins, aggregates, ordered windows.

use std::cell::RefCell;
use std::rc::Rc;

use rill::collection::LoadSubsetOptions;
use rill::expr::dsl::*;
use rill::expr::{
    AggregateFunction, CompareOptions, Expr, JoinClause, JoinType, OrderByClause, Query,
};
use rill::live::{live_query, LiveQuery};
use rill::transactions::{Transaction, TransactionConfig};
use rill::{
    object, Collection, CollectionConfig, CollectionStatus, SyncConfig, SyncContext, SyncHandle,
    SyncWrite, Value,
};

type SyncSlot = Rc<RefCell<Option<SyncContext>>>;
type LoadLog = Rc<RefCell<Vec<LoadSubsetOptions>>>;

fn source(id: &str) -> (Collection, SyncSlot, LoadLog) {
    let slot: SyncSlot = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&slot);
    let loads: LoadLog = Rc::new(RefCell::new(Vec::new()));
    let load_log = Rc::clone(&loads);
    let sync = SyncConfig::new(move |ctx| {
        *captured.borrow_mut() = Some(ctx);
        let load_log = Rc::clone(&load_log);
        Ok(SyncHandle {
            cleanup: None,
            load_subset: Some(Rc::new(move |options: &LoadSubsetOptions| {
                load_log.borrow_mut().push(options.clone());
            })),
        })
    });
    let mut config = CollectionConfig::new(|row| row.field("id").clone(), sync);
    config.id = Some(id.to_string());
    config.start_sync = true;
    let collection = Collection::new(config).unwrap();
    (collection, slot, loads)
}

fn ctx(slot: &SyncSlot) -> SyncContext {
    slot.borrow().as_ref().unwrap().clone()
}

fn push_rows(slot: &SyncSlot, rows: Vec<Value>) {
    let ctx = ctx(slot);
    ctx.begin();
    for row in rows {
        ctx.write(SyncWrite::insert(row)).unwrap();
    }
    ctx.commit().unwrap();
    ctx.mark_ready();
}

fn tx() -> Transaction {
    Transaction::new(TransactionConfig { mutation_fn: Rc::new(|_| Ok(())), auto_commit: false })
}

#[test]
fn filter_query_tracks_source_changes() {
    let (users, slot, _) = source("lq-filter-users");
    let adults = live_query(&Query {
        from: Some(users.as_source("u")),
        where_clauses: vec![gte(col("u.age"), Expr::val(18))],
        ..Query::default()
    })
    .unwrap();
    adults.preload().unwrap();

    push_rows(
        &slot,
        vec![
            object![("id", 1), ("age", 30)],
            object![("id", 2), ("age", 12)],
            object![("id", 3), ("age", 19)],
        ],
    );
    assert_eq!(adults.collection().status(), CollectionStatus::Ready);
    let rows = adults.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.field("age").as_number().unwrap() >= 18.0));

    // An optimistic insert flows through the same pipeline.
    let t = tx();
    let users_in_tx = users.clone();
    t.mutate(|| {
        users_in_tx.insert(object![("id", 4), ("age", 44)])?;
        Ok(())
    })
    .unwrap();
    assert_eq!(adults.rows().len(), 3);

    // Rolling the transaction back retracts the derived row.
    t.rollback().unwrap();
    assert_eq!(adults.rows().len(), 2);
}

#[test]
fn left_join_filters_and_pads() {
    let (users, users_slot, _) = source("lq-join-users");
    let (orders, orders_slot, _) = source("lq-join-orders");

    let joined = live_query(&Query {
        from: Some(users.as_source("u")),
        join: vec![JoinClause {
            from: orders.as_source("o"),
            join_type: JoinType::Left,
            on: eq(col("u.id"), col("o.uid")),
        }],
        where_clauses: vec![gt(col("u.age"), Expr::val(18))],
        ..Query::default()
    })
    .unwrap();
    joined.preload().unwrap();

    push_rows(
        &users_slot,
        vec![
            object![("id", 1), ("age", 30)],
            object![("id", 2), ("age", 10)],
            object![("id", 3), ("age", 40)],
        ],
    );
    push_rows(
        &orders_slot,
        vec![
            object![("id", 100), ("uid", 1), ("total", 5)],
            object![("id", 101), ("uid", 2), ("total", 7)],
        ],
    );

    let rows = joined.rows();
    // Adults only: user 1 matched with an order, user 3 left-padded; the
    // minor is excluded even though an order references it.
    assert_eq!(rows.len(), 2);
    let matched = rows
        .iter()
        .find(|row| row.get_path(&["u", "id"]) == &Value::Int(1))
        .expect("user 1 joined");
    assert_eq!(matched.get_path(&["o", "total"]), &Value::Int(5));
    let padded = rows
        .iter()
        .find(|row| row.get_path(&["u", "id"]) == &Value::Int(3))
        .expect("user 3 present");
    assert_eq!(padded.field("o"), &Value::Undefined);
    assert!(rows.iter().all(|row| row.get_path(&["u", "id"]) != &Value::Int(2)));

    // A late order for the padded user replaces the null-padded row.
    let ctx = ctx(&orders_slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 102), ("uid", 3), ("total", 9)])).unwrap();
    ctx.commit().unwrap();
    let rows = joined.rows();
    assert_eq!(rows.len(), 2);
    let filled = rows
        .iter()
        .find(|row| row.get_path(&["u", "id"]) == &Value::Int(3))
        .expect("user 3 present");
    assert_eq!(filled.get_path(&["o", "total"]), &Value::Int(9));
}

#[test]
fn select_projects_and_nests() {
    let (users, slot, _) = source("lq-select-users");
    let projected = live_query(&Query {
        from: Some(users.as_source("u")),
        select: Some(vec![
            ("id".to_string(), col("u.id")),
            ("profile.age".to_string(), col("u.age")),
        ]),
        ..Query::default()
    })
    .unwrap();
    projected.preload().unwrap();
    push_rows(&slot, vec![object![("id", 1), ("age", 30), ("noise", true)]]);

    let rows = projected.rows();
    assert_eq!(rows, vec![object![("id", 1), ("profile", object![("age", 30)])]]);
}

#[test]
fn group_by_maintains_aggregates() {
    let (orders, slot, _) = source("lq-group-orders");
    let totals = live_query(&Query {
        from: Some(orders.as_source("o")),
        group_by: vec![col("o.city")],
        select: Some(vec![
            ("city".to_string(), col("o.city")),
            (
                "total".to_string(),
                Expr::aggregate(AggregateFunction::Sum, vec![col("o.amount")]),
            ),
            (
                "n".to_string(),
                Expr::aggregate(AggregateFunction::Count, vec![col("o.amount")]),
            ),
        ]),
        having: vec![gt(
            Expr::aggregate(AggregateFunction::Sum, vec![col("o.amount")]),
            Expr::val(10),
        )],
        ..Query::default()
    })
    .unwrap();
    totals.preload().unwrap();

    push_rows(
        &slot,
        vec![
            object![("id", 1), ("city", "berlin"), ("amount", 8)],
            object![("id", 2), ("city", "berlin"), ("amount", 6)],
            object![("id", 3), ("city", "lyon"), ("amount", 3)],
        ],
    );

    // Only berlin clears the having threshold.
    let rows = totals.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field("city"), &Value::from("berlin"));
    assert_eq!(rows[0].field("total"), &Value::Int(14));
    assert_eq!(rows[0].field("n"), &Value::Int(2));

    // Lyon crosses the threshold incrementally.
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::insert(object![("id", 4), ("city", "lyon"), ("amount", 9)]))
        .unwrap();
    ctx.commit().unwrap();
    let rows = totals.rows();
    assert_eq!(rows.len(), 2);
    let lyon = rows
        .iter()
        .find(|row| row.field("city") == &Value::from("lyon"))
        .expect("lyon grouped");
    assert_eq!(lyon.field("total"), &Value::Int(12));
}

#[test]
fn ordered_window_moves() {
    let (events, slot, loads) = source("lq-window-events");
    let windowed = live_query(&Query {
        from: Some(events.as_source("e")),
        order_by: vec![OrderByClause { expr: col("e.t"), compare: CompareOptions::default() }],
        limit: Some(10),
        offset: Some(0),
        ..Query::default()
    })
    .unwrap();
    windowed.preload().unwrap();

    let rows: Vec<Value> =
        (0..100i64).map(|i| object![("id", i), ("t", i)]).collect();
    push_rows(&slot, rows);

    let first: Vec<f64> = windowed
        .rows()
        .iter()
        .map(|row| row.field("t").as_number().unwrap())
        .collect();
    assert_eq!(first, (0..10).map(|i| i as f64).collect::<Vec<_>>());

    windowed.set_window(10, Some(10)).unwrap();
    let second: Vec<f64> = windowed
        .rows()
        .iter()
        .map(|row| row.field("t").as_number().unwrap())
        .collect();
    assert_eq!(second, (10..20).map(|i| i as f64).collect::<Vec<_>>());

    // The window move asked the source adapter for the new range.
    let requested = loads.borrow();
    assert!(requested.iter().any(|load| load.offset == Some(10) && load.limit == Some(10)));
}

#[test]
fn live_queries_compose() {
    let (users, slot, _) = source("lq-compose-users");
    let adults = live_query(&Query {
        from: Some(users.as_source("u")),
        where_clauses: vec![gte(col("u.age"), Expr::val(18))],
        ..Query::default()
    })
    .unwrap();
    adults.preload().unwrap();

    let younger_adults: LiveQuery = live_query(&Query {
        from: Some(adults.collection().as_source("a")),
        where_clauses: vec![lt(col("a.age"), Expr::val(40))],
        ..Query::default()
    })
    .unwrap();
    younger_adults.preload().unwrap();

    push_rows(
        &slot,
        vec![
            object![("id", 1), ("age", 30)],
            object![("id", 2), ("age", 50)],
            object![("id", 3), ("age", 12)],
        ],
    );

    assert_eq!(adults.rows().len(), 2);
    let rows = younger_adults.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field("id"), &Value::Int(1));
    assert_eq!(younger_adults.collection().status(), CollectionStatus::Ready);

    // Changes ripple through both layers.
    let ctx = ctx(&slot);
    ctx.begin();
    ctx.write(SyncWrite::update(object![("id", 2), ("age", 35)])).unwrap();
    ctx.commit().unwrap();
    assert_eq!(younger_adults.rows().len(), 2);
}

#[test]
fn distinct_collapses_duplicate_projections() {
    let (users, slot, _) = source("lq-distinct-users");
    let cities = live_query(&Query {
        from: Some(users.as_source("u")),
        select: Some(vec![("city".to_string(), col("u.city"))]),
        distinct: true,
        ..Query::default()
    })
    .unwrap();
    cities.preload().unwrap();

    push_rows(
        &slot,
        vec![
            object![("id", 1), ("city", "berlin")],
            object![("id", 2), ("city", "berlin")],
            object![("id", 3), ("city", "lyon")],
        ],
    );
    assert_eq!(cities.rows().len(), 2);
}

#[test]
fn compiler_rejects_malformed_queries() {
    let (users, _slot, _) = source("lq-malformed-users");
    let no_from = live_query(&Query::default()).unwrap_err();
    assert_eq!(no_from.name(), "QueryMustHaveFromError");

    let unordered_limit = live_query(&Query {
        from: Some(users.as_source("u")),
        limit: Some(5),
        ..Query::default()
    })
    .unwrap_err();
    assert_eq!(unordered_limit.name(), "LimitOffsetRequireOrderByError");

    let distinct_without_select = live_query(&Query {
        from: Some(users.as_source("u")),
        distinct: true,
        ..Query::default()
    })
    .unwrap_err();
    assert_eq!(distinct_without_select.name(), "DistinctRequiresSelectError");

    let non_equality = live_query(&Query {
        from: Some(users.as_source("u")),
        join: vec![JoinClause {
            from: users.as_source("v"),
            join_type: JoinType::Inner,
            on: gt(col("u.id"), col("v.id")),
        }],
        ..Query::default()
    })
    .unwrap_err();
    assert_eq!(non_equality.name(), "JoinConditionMustBeEqualityError");
}
