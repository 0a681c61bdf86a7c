//! Live queries: collections maintained by a compiled dataflow graph.
//!
//! A live query subscribes to each source collection (with the optimizer's
//! pushed-down filters), forwards their change streams into the compiled
//! graph as signed multisets, and writes the graph's output back into a
//! fresh collection through the ordinary sync protocol. The graph run is
//! scheduled through the transaction scheduler with the source collections
//! as dependencies, so chains of live queries settle parents-first and at
//! most once per transaction context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::collection::{
    resolve_collection, ChangeEvent, Collection, CollectionConfig, CollectionStatus, EventKind,
    LoadSubsetOptions, RowUpdateMode, SyncConfig, SyncContext, SyncHandle, SyncMode, SyncWrite,
};
use crate::compile::{compile_query, CompiledQuery, OrderedSpec};
use crate::dataflow::{Graph, GraphBuilder, InputHandle, WindowHandle};
use crate::errors::{Error, Result};
use crate::expr::{dsl, Expr, Query};
use crate::multiset::MultiSet;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::transactions::{ambient_transaction, scheduler};
use crate::value::{Key, Value};

thread_local! {
    static LIVE_QUERY_COUNTER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Options for building a live query.
pub struct LiveQueryOptions {
    /// Identity of the result collection; autogenerated when `None`.
    pub id: Option<String>,
    /// Idle time before the host may collect the result collection.
    pub gc_time_ms: u64,
}

impl Default for LiveQueryOptions {
    fn default() -> Self {
        LiveQueryOptions { id: None, gc_time_ms: 300_000 }
    }
}

struct LiveState {
    graph: Graph,
    inputs: HashMap<String, InputHandle>,
    subscriptions: HashMap<String, Subscription>,
    window: Option<WindowHandle>,
    ordered: Option<OrderedSpec>,
    /// Fractional tokens per result key; drives the result ordering.
    tokens: Rc<RefCell<HashMap<Key, String>>>,
    /// Output updates accumulated by the sink between flushes.
    buffer: Rc<RefCell<Vec<((Value, Value), isize)>>>,
    sync: Option<SyncContext>,
}

/// A query result maintained incrementally as its sources change.
///
/// The result is itself a [`Collection`]: it can be subscribed to, indexed,
/// and used as the source of further live queries.
#[derive(Clone)]
pub struct LiveQuery {
    collection: Collection,
    state: Rc<RefCell<LiveState>>,
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery").finish_non_exhaustive()
    }
}

/// Build a live query over `query` with default options.
pub fn live_query(query: &Query) -> Result<LiveQuery> {
    live_query_with(query, LiveQueryOptions::default())
}

/// Build a live query over `query`.
pub fn live_query_with(query: &Query, options: LiveQueryOptions) -> Result<LiveQuery> {
    let builder = GraphBuilder::new();
    let compiled = compile_query(query, &builder)?;
    let graph = builder.finish();

    let id = options.id.unwrap_or_else(|| {
        LIVE_QUERY_COUNTER.with(|counter| {
            let n = counter.get();
            counter.set(n + 1);
            format!("live-query-{n}")
        })
    });

    // Resolve every source eagerly so a dangling reference fails the build
    // rather than the first sync.
    for (input_key, collection_id) in &compiled.alias_to_collection_id {
        if resolve_collection(collection_id).is_none() {
            return Err(Error::CollectionInputNotFound(input_key.clone()));
        }
    }

    let buffer: Rc<RefCell<Vec<((Value, Value), isize)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&buffer);
    compiled.stream.output(move |batch| sink.borrow_mut().extend(batch.into_updates()));

    let CompiledQuery {
        collection_id: _,
        stream: _,
        inputs,
        alias_to_collection_id,
        alias_remapping: _,
        source_where_clauses,
        window,
        ordered,
        lazy_loader,
    } = compiled;

    let tokens: Rc<RefCell<HashMap<Key, String>>> = Rc::new(RefCell::new(HashMap::new()));
    let state = Rc::new(RefCell::new(LiveState {
        graph,
        inputs,
        subscriptions: HashMap::new(),
        window,
        ordered,
        tokens: Rc::clone(&tokens),
        buffer,
        sync: None,
    }));

    let sync_state = Rc::clone(&state);
    let sources = alias_to_collection_id.clone();
    let filters = source_where_clauses.clone();
    let live_id = id.clone();
    let sync_config = SyncConfig {
        sync: Rc::new(move |ctx: SyncContext| {
            start_live_sync(&live_id, &sync_state, &sources, &filters, ctx)
        }),
        get_sync_metadata: None,
        // The graph's output rows are authoritative; replace wholesale.
        row_update_mode: RowUpdateMode::Full,
    };

    let mut config = CollectionConfig::new(
        // Result rows are keyed explicitly by the pipeline; the extractor
        // never resolves a key on its own.
        |_row| Value::Undefined,
        sync_config,
    );
    config.id = Some(id);
    config.gc_time_ms = options.gc_time_ms;
    config.sync_mode = SyncMode::Eager;

    let collection = Collection::new(config)?;
    let live = LiveQuery { collection, state };
    install_lazy_loader(&live, &lazy_loader, &alias_to_collection_id);
    Ok(live)
}

fn install_lazy_loader(
    live: &LiveQuery,
    slot: &crate::compile::LazyLoader,
    sources: &HashMap<String, String>,
) {
    let state = Rc::clone(&live.state);
    let sources = sources.clone();
    *slot.borrow_mut() = Some(Rc::new(move |input_key: &str, field: &Expr, keys: &[Value]| {
        let Some(collection_id) = sources.get(input_key) else {
            return;
        };
        let Some(collection) = resolve_collection(collection_id) else {
            return;
        };
        // Only on-demand sources load lazily; eager ones already hold
        // their rows.
        if collection.state().borrow().config.sync_mode != SyncMode::OnDemand {
            return;
        }
        let subscription = state.borrow().subscriptions.get(input_key).cloned();
        if let Some(subscription) = subscription {
            let wanted = dsl::is_in(
                field.clone(),
                Expr::Value(Value::Array(keys.to_vec())),
            );
            subscription.load_more(&LoadSubsetOptions {
                where_expr: Some(wanted),
                ..LoadSubsetOptions::default()
            });
        }
    }));
}

/// The live collection's sync function: subscribe to every source, forward
/// changes into the graph, and deliver graph output as synced writes.
fn start_live_sync(
    live_id: &str,
    state: &Rc<RefCell<LiveState>>,
    sources: &HashMap<String, String>,
    filters: &crate::optimize::SourceFilters,
    ctx: SyncContext,
) -> Result<SyncHandle> {
    debug!(id = live_id, sources = sources.len(), "live query sync starting");
    state.borrow_mut().sync = Some(ctx.clone());

    let total_sources = sources.len();
    let ready_count = Rc::new(std::cell::Cell::new(0usize));

    for (input_key, collection_id) in sources {
        let collection = resolve_collection(collection_id)
            .ok_or_else(|| Error::CollectionInputNotFound(input_key.clone()))?;

        let input = state
            .borrow()
            .inputs
            .get(input_key)
            .cloned()
            .ok_or_else(|| Error::SubscriptionNotFound(input_key.clone()))?;

        // Forward filtered source changes into this alias's graph input and
        // schedule a run under the current transaction context.
        let forward_state = Rc::clone(state);
        let forward_ctx = ctx.clone();
        let job_id = live_id.to_string();
        let deps: Vec<String> = sources.values().cloned().collect();
        let on_events = move |events: &[ChangeEvent]| {
            let mut batch = MultiSet::new();
            for event in events {
                match event.kind {
                    EventKind::Insert => batch.push((event.key.clone(), event.value.clone()), 1),
                    EventKind::Update => {
                        if let Some(previous) = &event.previous {
                            batch.push((event.key.clone(), previous.clone()), -1);
                        }
                        batch.push((event.key.clone(), event.value.clone()), 1);
                    }
                    EventKind::Delete => {
                        batch.push((event.key.clone(), event.value.clone()), -1)
                    }
                }
            }
            if batch.is_empty() {
                return;
            }
            input.send(batch);
            schedule_run(&forward_state, &forward_ctx, &job_id, deps.clone());
        };

        let subscription = collection.subscribe_changes(SubscribeOptions {
            on_events: Box::new(on_events),
            where_expr: filters.get(input_key).cloned(),
            include_initial: true,
            ordered: None,
        })?;
        state.borrow_mut().subscriptions.insert(input_key.clone(), subscription);

        // Status propagation: a broken source breaks the live query; all
        // sources ready makes it ready.
        let weak_live = ctx.collection().downgrade();
        collection.on_status(move |_, to| {
            if matches!(to, CollectionStatus::Error | CollectionStatus::CleanedUp) {
                if let Some(live) = weak_live.upgrade() {
                    let _ = live.set_status(CollectionStatus::Error);
                }
            }
        });
        let counter = Rc::clone(&ready_count);
        let ready_ctx = ctx.clone();
        collection.on_first_ready(move || {
            counter.set(counter.get() + 1);
            if counter.get() == total_sources {
                ready_ctx.mark_ready();
            }
        });
    }

    // Initial snapshots are already queued on the inputs; run the graph
    // for them now (or at transaction exit when one is active).
    schedule_run(state, &ctx, live_id, sources.values().cloned().collect());
    if ambient_transaction().is_none() {
        scheduler::flush(0)?;
    }

    let teardown_state = Rc::clone(state);
    Ok(SyncHandle {
        cleanup: Some(Box::new(move || {
            let subscriptions =
                std::mem::take(&mut teardown_state.borrow_mut().subscriptions);
            for (_, subscription) in subscriptions {
                subscription.unsubscribe()?;
            }
            Ok(())
        })),
        load_subset: None,
    })
}

/// Enqueue one graph run for this live query in the ambient transaction's
/// context (context 0 outside transactions), parents first.
fn schedule_run(
    state: &Rc<RefCell<LiveState>>,
    ctx: &SyncContext,
    job_id: &str,
    deps: Vec<String>,
) {
    let context = ambient_transaction().map(|tx| tx.id()).unwrap_or(0);
    let run_state = Rc::clone(state);
    let run_ctx = ctx.clone();
    scheduler::schedule(context, job_id, deps, move || {
        run_graph(&run_state, &run_ctx);
    });
    // Outside a transaction there is no later flush point; nested flushes
    // fold into any outer one already draining context 0.
    if context == 0 {
        if let Err(error) = scheduler::flush(0) {
            warn!(%error, "live query flush failed");
        }
    }
}

/// Drain the graph and apply its accumulated output to the live collection
/// as one committed sync batch.
fn run_graph(state: &Rc<RefCell<LiveState>>, ctx: &SyncContext) {
    let graph = state.borrow().graph.clone();
    while graph.pending_work() {
        graph.run();
    }

    let updates = {
        let state = state.borrow();
        let updates = std::mem::take(&mut *state.buffer.borrow_mut());
        updates
    };
    if updates.is_empty() {
        return;
    }

    // Net effect per key: any assertion wins over retractions, the last
    // asserted payload being authoritative for the key.
    let mut net: Vec<(Key, Option<Value>)> = Vec::new();
    let mut index: HashMap<Key, usize> = HashMap::new();
    for ((key, payload), delta) in updates {
        let slot = match index.get(&key) {
            Some(slot) => *slot,
            None => {
                index.insert(key.clone(), net.len());
                net.push((key.clone(), None));
                net.len() - 1
            }
        };
        if delta > 0 {
            net[slot].1 = Some(payload);
        } else if net[slot].1.as_ref() == Some(&payload) {
            net[slot].1 = None;
        }
    }

    let live = ctx.collection().clone();
    let ordered = state.borrow().ordered.is_some();
    let tokens = Rc::clone(&state.borrow().tokens);

    ctx.begin();
    for (key, outcome) in net {
        match outcome {
            Some(payload) => {
                let (row, token) = if ordered {
                    match payload {
                        Value::Array(mut items) if items.len() == 2 => {
                            let token = match items.pop() {
                                Some(Value::String(token)) => Some(token),
                                _ => None,
                            };
                            (items.pop().unwrap_or(Value::Null), token)
                        }
                        other => (other, None),
                    }
                } else {
                    (payload, None)
                };
                if let Some(token) = token {
                    tokens.borrow_mut().insert(key.clone(), token);
                }
                let kind = if live.has(&key) {
                    crate::transactions::MutationType::Update
                } else {
                    crate::transactions::MutationType::Insert
                };
                let write = SyncWrite { kind, value: row, metadata: None, key: Some(key) };
                if let Err(error) = ctx.write(write) {
                    warn!(%error, "live query write failed");
                }
            }
            None => {
                tokens.borrow_mut().remove(&key);
                if live.has(&key) {
                    let value = live.get(&key).unwrap_or(Value::Null);
                    let write = SyncWrite {
                        kind: crate::transactions::MutationType::Delete,
                        value,
                        metadata: None,
                        key: Some(key),
                    };
                    if let Err(error) = ctx.write(write) {
                        warn!(%error, "live query delete failed");
                    }
                }
            }
        }
    }
    if let Err(error) = ctx.commit() {
        warn!(%error, "live query commit failed");
    }
}

impl LiveQuery {
    /// The result collection.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Start the query without subscribing; the result fills as sources
    /// sync.
    pub fn preload(&self) -> Result<()> {
        self.collection.start_sync()
    }

    /// Result rows in query order: ordered queries sort by their
    /// fractional tokens, everything else by result key.
    pub fn rows(&self) -> Vec<Value> {
        let mut entries = self.collection.entries();
        let state = self.state.borrow();
        let tokens = state.tokens.borrow();
        entries.sort_by(|a, b| match (tokens.get(&a.0), tokens.get(&b.0)) {
            (Some(ta), Some(tb)) => ta.cmp(tb),
            _ => a.0.cmp(&b.0),
        });
        entries.into_iter().map(|(_, row)| row).collect()
    }

    /// Move the ordered window to `(offset, limit)` and re-run the graph;
    /// subset loading for the new range happens before this returns.
    pub fn set_window(&self, offset: usize, limit: Option<usize>) -> Result<()> {
        let (window, ordered) = {
            let state = self.state.borrow();
            (state.window.clone(), state.ordered.clone())
        };
        let window = window.ok_or(Error::SetWindowRequiresOrderBy)?;
        let ordered = ordered.ok_or(Error::SetWindowRequiresOrderBy)?;
        window.set_window(offset, limit);

        // Ask the sources for the rows the new window may need.
        let subscriptions: Vec<Subscription> =
            self.state.borrow().subscriptions.values().cloned().collect();
        for subscription in subscriptions {
            subscription.load_more(&LoadSubsetOptions {
                where_expr: None,
                order_by: Some(ordered.clauses.clone()),
                limit,
                offset: Some(offset),
                cursor: None,
            });
        }

        let ctx = self
            .state
            .borrow()
            .sync
            .clone()
            .ok_or_else(|| Error::CollectionInErrorState(self.collection.id()))?;
        schedule_run(&self.state, &ctx, &self.collection.id(), Vec::new());
        Ok(())
    }
}
