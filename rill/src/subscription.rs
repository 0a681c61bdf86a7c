//! Per-subscriber change delivery.
//!
//! A subscription tracks which keys its subscriber has seen and rewrites
//! the collection's change stream accordingly: updates to unseen keys
//! become inserts, deletes of unseen keys are dropped, and rows crossing
//! the subscription's filter translate between inserts and deletes. Initial
//! state arrives through snapshots, either whole, filtered through an
//! index, or as an ordered window that pages through an order-by index and
//! asks the sync adapter for the matching range.

use std::cell::RefCell;
use std::rc::Rc;

use fnv::FnvHashSet;
use tracing::trace;

use crate::collection::{ChangeEvent, Collection, EventKind, LoadSubsetOptions, WeakCollection};
use crate::errors::{Error, Result};
use crate::expr::eval::{self, CompiledPredicate};
use crate::expr::{CompareOptions, Expr, Function, OrderByClause};
use crate::index::IndexReader;
use crate::value::{Key, Value};

/// Whether the subscription is serving live changes or waiting on a subset
/// load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Serving live changes.
    Ready,
    /// One or more subset loads are in flight.
    LoadingSubset,
}

/// Options for subscribing to a collection.
pub struct SubscribeOptions {
    /// Receives each filtered change batch.
    pub on_events: Box<dyn FnMut(&[ChangeEvent])>,
    /// Restrict the stream to rows matching this single-row predicate.
    pub where_expr: Option<Expr>,
    /// Deliver the current matching state as an initial insert batch.
    pub include_initial: bool,
    /// Maintain an ordered window instead of the whole matching set.
    pub ordered: Option<OrderedOptions>,
}

impl SubscribeOptions {
    /// Subscribe with just a callback.
    pub fn new(on_events: impl FnMut(&[ChangeEvent]) + 'static) -> Self {
        SubscribeOptions {
            on_events: Box::new(on_events),
            where_expr: None,
            include_initial: false,
            ordered: None,
        }
    }
}

/// An ordered initial-window configuration.
#[derive(Clone)]
pub struct OrderedOptions {
    /// The sort expression (single-row).
    pub expr: Expr,
    /// Comparator options; decides index compatibility.
    pub compare: CompareOptions,
    /// How many rows the window wants.
    pub limit: usize,
}

pub(crate) struct SubscriptionState {
    pub(crate) id: u64,
    pub(crate) collection: WeakCollection,
    pub(crate) callback: Box<dyn FnMut(&[ChangeEvent])>,
    pub(crate) where_expr: Option<Expr>,
    pub(crate) predicate: Option<CompiledPredicate>,
    pub(crate) order_by_index: Option<usize>,
    pub(crate) ordered: Option<OrderedOptions>,
    pub(crate) sent_keys: FnvHashSet<Key>,
    pub(crate) status: SubscriptionStatus,
    pub(crate) loading_count: usize,
    pub(crate) loading_listeners: Vec<Rc<dyn Fn(bool)>>,
    /// True while the callback is running; re-entrant batches queue in
    /// `pending` instead of racing for the callback.
    pub(crate) delivering: bool,
    pub(crate) pending: Vec<ChangeEvent>,
}

/// A live subscription; unsubscribe releases it from its collection.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) state: Rc<RefCell<SubscriptionState>>,
}

/// Attach a new subscription to `collection`.
pub(crate) fn create(collection: &Collection, options: SubscribeOptions) -> Result<Subscription> {
    let predicate = options
        .where_expr
        .as_ref()
        .map(|expr| eval::compile_predicate(expr, true))
        .transpose()?;
    let order_by_index = options
        .ordered
        .as_ref()
        .map(|ordered| collection.ensure_index(ordered.expr.clone(), ordered.compare.clone()))
        .transpose()?;
    let state = Rc::new(RefCell::new(SubscriptionState {
        id: crate::transactions::next_tick(),
        collection: collection.downgrade(),
        callback: options.on_events,
        where_expr: options.where_expr,
        predicate,
        order_by_index,
        ordered: options.ordered,
        sent_keys: FnvHashSet::default(),
        status: SubscriptionStatus::Ready,
        loading_count: 0,
        loading_listeners: Vec::new(),
        delivering: false,
        pending: Vec::new(),
    }));
    collection.state().borrow_mut().subscriptions.push(Rc::clone(&state));
    let subscription = Subscription { state };
    if subscription.state.borrow().ordered.is_some() {
        subscription.load_initial_window()?;
    } else if options.include_initial {
        subscription.request_snapshot(None, false)?;
    }
    Ok(subscription)
}

/// Deliver a raw change batch through the subscription's filter.
pub(crate) fn deliver(sub: &Rc<RefCell<SubscriptionState>>, events: &[ChangeEvent]) {
    let (mut batch, mut callback) = {
        let mut state = sub.borrow_mut();
        let mut batch = Vec::with_capacity(events.len());
        for event in events {
            if let Some(filtered) = filter_event(&mut state, event) {
                batch.push(filtered);
            }
        }
        if batch.is_empty() {
            return;
        }
        if state.delivering {
            // A delivery is already on the stack; it drains this batch
            // after its callback returns.
            state.pending.extend(batch);
            return;
        }
        state.delivering = true;
        // The callback leaves the state while it runs so it may re-enter
        // the subscription (e.g. to request another snapshot).
        let callback = std::mem::replace(&mut state.callback, Box::new(|_| {}));
        (batch, callback)
    };
    loop {
        callback(&batch);
        let mut state = sub.borrow_mut();
        if state.pending.is_empty() {
            state.callback = callback;
            state.delivering = false;
            return;
        }
        batch = std::mem::take(&mut state.pending);
    }
}

fn filter_event(state: &mut SubscriptionState, event: &ChangeEvent) -> Option<ChangeEvent> {
    let passes = |row: &Value| state.predicate.as_ref().map(|p| p(row)).unwrap_or(true);
    let was_sent = state.sent_keys.contains(&event.key);
    match event.kind {
        EventKind::Insert => {
            if !passes(&event.value) {
                return None;
            }
            state.sent_keys.insert(event.key.clone());
            Some(event.clone())
        }
        EventKind::Update => {
            let now_passes = passes(&event.value);
            match (now_passes, was_sent) {
                (true, true) => Some(event.clone()),
                // The row just entered this subscriber's view.
                (true, false) => {
                    state.sent_keys.insert(event.key.clone());
                    Some(ChangeEvent::insert(event.key.clone(), event.value.clone()))
                }
                // The row left the view: the subscriber sees a delete of
                // the value it last observed.
                (false, true) => {
                    state.sent_keys.remove(&event.key);
                    let last = event.previous.clone().unwrap_or_else(|| event.value.clone());
                    Some(ChangeEvent::delete(event.key.clone(), last))
                }
                (false, false) => None,
            }
        }
        EventKind::Delete => {
            if !was_sent {
                return None;
            }
            state.sent_keys.remove(&event.key);
            Some(event.clone())
        }
    }
}

impl Subscription {
    /// The subscription's status.
    pub fn status(&self) -> SubscriptionStatus {
        self.state.borrow().status
    }

    /// Keys this subscriber has been shown and not yet seen deleted.
    pub fn sent_key_count(&self) -> usize {
        self.state.borrow().sent_keys.len()
    }

    /// Register a listener for subset-loading transitions (`true` when a
    /// load starts, `false` when the last in-flight load ends).
    pub fn on_loading_change(&self, listener: impl Fn(bool) + 'static) {
        self.state.borrow_mut().loading_listeners.push(Rc::new(listener));
    }

    /// Detach from the collection.
    pub fn unsubscribe(self) -> Result<()> {
        let (collection, id) = {
            let state = self.state.borrow();
            (state.collection.upgrade(), state.id)
        };
        match collection {
            Some(collection) => collection.release_subscription(id),
            None => Ok(()),
        }
    }

    /// Deliver the collection's current state (composed with the
    /// subscription filter and an optional extra filter) as inserts for
    /// keys not yet sent. With `optimized_only`, declines and returns
    /// `false` when no index can drive the filter.
    pub fn request_snapshot(&self, extra: Option<Expr>, optimized_only: bool) -> Result<bool> {
        let (collection, composed) = {
            let state = self.state.borrow();
            let collection = state
                .collection
                .upgrade()
                .ok_or_else(|| Error::CollectionInErrorState("<dropped>".into()))?;
            let composed = compose_filters(state.where_expr.clone(), extra);
            (collection, composed)
        };
        let Some(events) = collection.current_state_as_changes(composed.as_ref(), optimized_only)?
        else {
            return Ok(false);
        };
        let fresh: Vec<ChangeEvent> = {
            let state = self.state.borrow();
            events.into_iter().filter(|event| !state.sent_keys.contains(&event.key)).collect()
        };
        trace!(count = fresh.len(), "snapshot delivered");
        deliver(&self.state, &fresh);
        Ok(true)
    }

    /// Load the initial ordered window through the order-by index, then ask
    /// the sync adapter for the matching range.
    pub(crate) fn load_initial_window(&self) -> Result<bool> {
        let (collection, ordered, index_id) = {
            let state = self.state.borrow();
            let Some(ordered) = state.ordered.clone() else {
                return Err(Error::SetWindowRequiresOrderBy);
            };
            let Some(index_id) = state.order_by_index else {
                return Err(Error::SetWindowRequiresOrderBy);
            };
            let collection = state
                .collection
                .upgrade()
                .ok_or_else(|| Error::CollectionInErrorState("<dropped>".into()))?;
            (collection, ordered, index_id)
        };
        let predicate = self.state.borrow().predicate.clone();
        let keys = collection
            .with_index(index_id, |index| {
                let filter = |key: &Key| {
                    let Some(row) = collection.get(key) else { return false };
                    predicate.as_ref().map(|p| p(&row)).unwrap_or(true)
                };
                index.take(ordered.limit, None, Some(&filter))
            })
            .unwrap_or_default();
        let events: Vec<ChangeEvent> = keys
            .into_iter()
            .filter_map(|key| collection.get(&key).map(|row| ChangeEvent::insert(key, row)))
            .collect();
        deliver(&self.state, &events);

        // The local index only knows loaded rows; the adapter gets a
        // chance to fill the remainder of the range.
        self.begin_loading();
        let requested = collection.load_subset(&LoadSubsetOptions {
            where_expr: self.state.borrow().where_expr.clone(),
            order_by: Some(vec![OrderByClause {
                expr: ordered.expr.clone(),
                compare: ordered.compare.clone(),
            }]),
            limit: Some(ordered.limit),
            offset: None,
            cursor: None,
        });
        self.end_loading();
        Ok(requested)
    }

    /// Request more rows for a moved or depleted window.
    pub(crate) fn load_more(&self, options: &LoadSubsetOptions) -> bool {
        let collection = match self.state.borrow().collection.upgrade() {
            Some(collection) => collection,
            None => return false,
        };
        self.begin_loading();
        let requested = collection.load_subset(options);
        self.end_loading();
        requested
    }

    pub(crate) fn begin_loading(&self) {
        let listeners = {
            let mut state = self.state.borrow_mut();
            state.loading_count += 1;
            state.status = SubscriptionStatus::LoadingSubset;
            if state.loading_count == 1 {
                state.loading_listeners.clone()
            } else {
                Vec::new()
            }
        };
        for listener in listeners {
            listener(true);
        }
    }

    pub(crate) fn end_loading(&self) {
        let listeners = {
            let mut state = self.state.borrow_mut();
            state.loading_count = state.loading_count.saturating_sub(1);
            if state.loading_count == 0 {
                state.status = SubscriptionStatus::Ready;
                state.loading_listeners.clone()
            } else {
                Vec::new()
            }
        };
        for listener in listeners {
            listener(false);
        }
    }
}

/// `and` of both filters when both exist.
fn compose_filters(a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Expr::Func { name: Function::And, args: vec![a, b] }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
