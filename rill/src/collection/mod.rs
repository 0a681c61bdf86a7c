//! Collections: synced rows plus an optimistic overlay.
//!
//! A collection holds the authoritative rows delivered by its sync adapter
//! and the optimistic upserts and deletes contributed by in-flight
//! transactions. Every read resolves through the overlay first, so local
//! mutations are visible immediately; sync commits reconcile the overlay
//! against the new base and emit a minimal change stream that indexes and
//! subscriptions consume.

pub mod events;
pub mod sync;

pub use events::{ChangeEvent, EventKind};
pub use sync::{LoadSubsetOptions, RowUpdateMode, SyncConfig, SyncContext, SyncHandle, SyncWrite};

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use fnv::{FnvHashMap, FnvHashSet};
use tracing::{debug, trace, warn};

use crate::draft::ChangeDraft;
use crate::errors::{Error, Result};
use crate::expr::eval::{self, CompiledPredicate};
use crate::expr::{CompareOptions, Expr};
use crate::index::{self, BTreeIndex, IndexMatch, IndexReader};
use crate::subscription::{self, SubscribeOptions, Subscription, SubscriptionState};
use crate::transactions::{
    ambient_transaction, next_tick, Mutation, MutationType, Transaction, TransactionConfig,
};
use crate::tree::Tree;
use crate::value::{Key, Value};

thread_local! {
    static COLLECTION_REGISTRY: RefCell<HashMap<String, WeakCollection>> =
        RefCell::new(HashMap::new());
    static COLLECTION_COUNTER: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Resolve a registered collection by id, if it is still alive.
pub fn resolve_collection(id: &str) -> Option<Collection> {
    COLLECTION_REGISTRY.with(|registry| registry.borrow().get(id).and_then(WeakCollection::upgrade))
}

/// The lifecycle of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Created, sync not started.
    Idle,
    /// Sync started, first commit not seen.
    Loading,
    /// Serving synced data.
    Ready,
    /// A sync failure; operations are rejected until restarted.
    Error,
    /// Resources released; restartable.
    CleanedUp,
}

impl CollectionStatus {
    /// Display name for errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Loading => "loading",
            CollectionStatus::Ready => "ready",
            CollectionStatus::Error => "error",
            CollectionStatus::CleanedUp => "cleaned-up",
        }
    }

    fn permits(self, to: CollectionStatus) -> bool {
        use CollectionStatus::*;
        matches!(
            (self, to),
            (Idle, Loading)
                | (Idle, Error)
                | (Idle, CleanedUp)
                | (Loading, Ready)
                | (Loading, Error)
                | (Loading, CleanedUp)
                | (Ready, Error)
                | (Ready, CleanedUp)
                | (Error, Idle)
                | (Error, CleanedUp)
                | (CleanedUp, Loading)
                | (CleanedUp, Error)
        )
    }
}

/// How the collection starts syncing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sync everything up front.
    #[default]
    Eager,
    /// Load subsets on demand; requires the sync adapter to provide a
    /// subset loader.
    OnDemand,
}

/// Whether single-field predicates create indexes automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AutoIndexMode {
    /// Create a B+ index for each indexable predicate field.
    #[default]
    Eager,
    /// Never create indexes automatically.
    Off,
}

/// Extracts a row's primary key.
pub type KeyFn = Rc<dyn Fn(&Value) -> Value>;

/// Validates a row, returning the (possibly normalized) row to store.
pub type SchemaFn = Rc<dyn Fn(&Value) -> Result<Value>>;

/// Persists one direct mutation kind.
pub type MutationHandler = Rc<dyn Fn(&Transaction) -> Result<()>>;

/// Collection configuration.
#[derive(Clone)]
pub struct CollectionConfig {
    /// Stable identity; autogenerated when `None`.
    pub id: Option<String>,
    /// Key extractor; must be stable per row.
    pub get_key: KeyFn,
    /// Optional synchronous schema validator.
    pub schema: Option<SchemaFn>,
    /// The sync adapter.
    pub sync: SyncConfig,
    /// Eager or on-demand syncing.
    pub sync_mode: SyncMode,
    /// Handler for direct inserts outside a transaction.
    pub on_insert: Option<MutationHandler>,
    /// Handler for direct updates outside a transaction.
    pub on_update: Option<MutationHandler>,
    /// Handler for direct deletes outside a transaction.
    pub on_delete: Option<MutationHandler>,
    /// Index-creation policy.
    pub auto_index: AutoIndexMode,
    /// Idle milliseconds before the host may clean the collection up.
    pub gc_time_ms: u64,
    /// Start syncing at construction instead of first subscription.
    pub start_sync: bool,
    /// Comparator for the synced store's iteration order.
    pub compare: Option<Rc<dyn Fn(&Value, &Value) -> Ordering>>,
}

impl CollectionConfig {
    /// A configuration with defaults for everything optional.
    pub fn new(get_key: impl Fn(&Value) -> Value + 'static, sync: SyncConfig) -> Self {
        CollectionConfig {
            id: None,
            get_key: Rc::new(get_key),
            schema: None,
            sync,
            sync_mode: SyncMode::default(),
            on_insert: None,
            on_update: None,
            on_delete: None,
            auto_index: AutoIndexMode::default(),
            gc_time_ms: 300_000,
            start_sync: false,
            compare: None,
        }
    }
}

pub(crate) struct CollectionState {
    pub(crate) id: String,
    pub(crate) config: CollectionConfig,
    pub(crate) status: CollectionStatus,
    /// The authoritative key -> row map, ordered by the configured
    /// comparator.
    pub(crate) synced: Tree<Key, Value>,
    pub(crate) synced_metadata: FnvHashMap<Key, Value>,
    /// Optimistic overlay.
    pub(crate) upserts: FnvHashMap<Key, Value>,
    pub(crate) deletes: FnvHashSet<Key>,
    pub(crate) size: usize,
    pub(crate) pending_sync: VecDeque<sync::PendingSyncTx>,
    /// Keys touched by the last sync commit; suppresses echoing recomputes.
    pub(crate) recently_synced: FnvHashSet<Key>,
    /// Key -> modified row of mutations whose transaction just completed;
    /// used to drop sync events that merely confirm them.
    pub(crate) recently_completed: FnvHashMap<Key, Value>,
    pub(crate) committing_sync: bool,
    /// Pre-sync visible state captured while sync transactions queue, so
    /// commit-time events diff against the state subscribers last saw.
    pub(crate) pre_sync_visible: FnvHashMap<Key, Option<Value>>,
    /// Pre-mutation visible state captured while an ambient `mutate` body
    /// runs; its events coalesce into one batch at the top-level exit.
    pub(crate) batched_optimistic: FnvHashMap<Key, Option<Value>>,
    pub(crate) received_first_commit: bool,
    pub(crate) indexes: Vec<BTreeIndex>,
    pub(crate) next_index_id: usize,
    pub(crate) subscriptions: Vec<Rc<RefCell<SubscriptionState>>>,
    pub(crate) active_subscribers: isize,
    /// In-flight transactions that have mutated this collection.
    pub(crate) transactions: Vec<Transaction>,
    pub(crate) status_listeners: Vec<Rc<dyn Fn(CollectionStatus, CollectionStatus)>>,
    pub(crate) first_ready_callbacks: Vec<Box<dyn FnOnce()>>,
    pub(crate) sync_cleanup: Option<Box<dyn FnOnce() -> Result<()>>>,
    pub(crate) load_subset: Option<Rc<dyn Fn(&LoadSubsetOptions)>>,
}

impl CollectionState {
    /// The visible row under `key`: overlay deletes hide, overlay upserts
    /// override, the synced base answers otherwise.
    pub(crate) fn visible_get(&self, key: &Key) -> Option<Value> {
        if self.deletes.contains(key) {
            return None;
        }
        if let Some(row) = self.upserts.get(key) {
            return Some(row.clone());
        }
        self.synced.get(key).cloned()
    }

    pub(crate) fn recompute_size(&mut self) {
        let deleted_synced = self
            .deletes
            .iter()
            .filter(|key| self.synced.contains(key) && !self.upserts.contains_key(*key))
            .count();
        let added = self.upserts.keys().filter(|key| !self.synced.contains(key)).count();
        self.size = self.synced.len() - deleted_synced + added;
    }

    /// Visible keys in synced-store order, overlay-only keys appended in
    /// comparator order.
    pub(crate) fn visible_entries(&self) -> Vec<(Key, Value)> {
        let mut entries: Vec<(Key, Value)> = Vec::with_capacity(self.size);
        self.synced.scan(None, None, true, |key, row, _| {
            if !self.deletes.contains(key) {
                match self.upserts.get(key) {
                    Some(overlaid) => entries.push((key.clone(), overlaid.clone())),
                    None => entries.push((key.clone(), row.clone())),
                }
            }
            false
        });
        let mut fresh: Vec<(Key, Value)> = self
            .upserts
            .iter()
            .filter(|(key, _)| !self.synced.contains(key) && !self.deletes.contains(*key))
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();
        let cmp = self.config.compare.clone();
        fresh.sort_by(|a, b| match &cmp {
            Some(cmp) => cmp(&a.0, &b.0),
            None => a.0.cmp(&b.0),
        });
        entries.extend(fresh);
        entries
    }

    /// Rebuild the overlay from every non-terminal transaction, in
    /// transaction order.
    pub(crate) fn rebuild_overlay(&mut self) {
        self.upserts.clear();
        self.deletes.clear();
        self.apply_active_transactions();
    }

    /// Lay the mutations of every non-terminal transaction over the
    /// current overlay, in transaction order.
    pub(crate) fn apply_active_transactions(&mut self) {
        let mut active: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| !tx.status().is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(Transaction::order_key);
        for tx in active {
            for mutation in tx.mutations() {
                let Some(collection) = mutation.collection.upgrade() else {
                    continue;
                };
                if collection.id() != self.id {
                    continue;
                }
                match mutation.kind {
                    MutationType::Insert | MutationType::Update => {
                        self.deletes.remove(&mutation.key);
                        self.upserts.insert(mutation.key.clone(), mutation.modified.clone());
                    }
                    MutationType::Delete => {
                        self.upserts.remove(&mutation.key);
                        self.deletes.insert(mutation.key.clone());
                    }
                }
            }
        }
    }

    pub(crate) fn update_indexes(&mut self, batch: &[ChangeEvent]) {
        for index in &mut self.indexes {
            for event in batch {
                match event.kind {
                    EventKind::Insert => index.add_row(&event.key, &event.value),
                    EventKind::Update => {
                        let previous =
                            event.previous.as_ref().expect("updates carry a previous row");
                        index.update_row(&event.key, previous, &event.value);
                    }
                    EventKind::Delete => index.remove_row(&event.key, &event.value),
                }
            }
        }
    }
}

/// A weak handle to a collection; breaks reference cycles from mutations
/// and builder registries back to their collection.
#[derive(Clone, Default)]
pub struct WeakCollection(Weak<RefCell<CollectionState>>);

impl WeakCollection {
    /// A weak handle that upgrades to nothing; placeholder for tests and
    /// detached mutations.
    pub fn dangling() -> Self {
        WeakCollection(Weak::new())
    }

    /// Upgrade to a strong handle while the collection is alive.
    pub fn upgrade(&self) -> Option<Collection> {
        self.0.upgrade().map(|inner| Collection { inner })
    }
}

/// A keyed, reactive set of rows. Clones share the collection.
#[derive(Clone)]
pub struct Collection {
    inner: Rc<RefCell<CollectionState>>,
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Collection")
            .field("id", &state.id)
            .field("status", &state.status.as_str())
            .field("size", &state.size)
            .finish()
    }
}

impl Collection {
    /// Create a collection and register it for query resolution.
    pub fn new(config: CollectionConfig) -> Result<Collection> {
        let id = match &config.id {
            Some(id) if !id.is_empty() => id.clone(),
            Some(_) => return Err(Error::InvalidConfig("collection id may not be empty".into())),
            None => COLLECTION_COUNTER.with(|counter| {
                let n = counter.get();
                counter.set(n + 1);
                format!("collection-{n}")
            }),
        };
        let comparator: Rc<dyn Fn(&Value, &Value) -> Ordering> = match &config.compare {
            Some(cmp) => Rc::clone(cmp),
            None => Rc::new(|a: &Value, b: &Value| a.cmp(b)),
        };
        let start = config.start_sync;
        let state = CollectionState {
            id: id.clone(),
            config,
            status: CollectionStatus::Idle,
            synced: Tree::new(comparator),
            synced_metadata: FnvHashMap::default(),
            upserts: FnvHashMap::default(),
            deletes: FnvHashSet::default(),
            size: 0,
            pending_sync: VecDeque::new(),
            recently_synced: FnvHashSet::default(),
            recently_completed: FnvHashMap::default(),
            committing_sync: false,
            pre_sync_visible: FnvHashMap::default(),
            batched_optimistic: FnvHashMap::default(),
            received_first_commit: false,
            indexes: Vec::new(),
            next_index_id: 0,
            subscriptions: Vec::new(),
            active_subscribers: 0,
            transactions: Vec::new(),
            status_listeners: Vec::new(),
            first_ready_callbacks: Vec::new(),
            sync_cleanup: None,
            load_subset: None,
        };
        let collection = Collection { inner: Rc::new(RefCell::new(state)) };
        COLLECTION_REGISTRY.with(|registry| {
            registry.borrow_mut().insert(id, collection.downgrade());
        });
        if start {
            collection.start_sync()?;
        }
        Ok(collection)
    }

    /// A weak handle to this collection.
    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection(Rc::downgrade(&self.inner))
    }

    pub(crate) fn state(&self) -> &Rc<RefCell<CollectionState>> {
        &self.inner
    }

    /// The collection's stable identity.
    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    /// The current lifecycle status.
    pub fn status(&self) -> CollectionStatus {
        self.inner.borrow().status
    }

    /// True once the collection has seen its first sync commit.
    pub fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    /// The number of visible rows.
    pub fn size(&self) -> usize {
        self.inner.borrow().size
    }

    /// The visible row under `key`.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.borrow().visible_get(key)
    }

    /// True when a visible row exists under `key`.
    pub fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Visible keys in store order.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.borrow().visible_entries().into_iter().map(|(key, _)| key).collect()
    }

    /// Visible rows in store order.
    pub fn values(&self) -> Vec<Value> {
        self.inner.borrow().visible_entries().into_iter().map(|(_, row)| row).collect()
    }

    /// Visible `(key, row)` pairs in store order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.inner.borrow().visible_entries()
    }

    /// A source expression addressing this collection under `alias`.
    pub fn as_source(&self, alias: &str) -> Expr {
        Expr::CollectionRef { id: self.id(), alias: alias.to_string() }
    }

    /// The synced metadata recorded for `key`, if any.
    pub fn sync_metadata(&self, key: &Key) -> Option<Value> {
        self.inner.borrow().synced_metadata.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Lifecycle.

    /// Register a status listener.
    pub fn on_status(&self, listener: impl Fn(CollectionStatus, CollectionStatus) + 'static) {
        self.inner.borrow_mut().status_listeners.push(Rc::new(listener));
    }

    /// Run `callback` once the collection first reaches `Ready`
    /// (immediately when it already is).
    pub fn on_first_ready(&self, callback: impl FnOnce() + 'static) {
        if self.is_ready() {
            callback();
            return;
        }
        self.inner.borrow_mut().first_ready_callbacks.push(Box::new(callback));
    }

    pub(crate) fn set_status(&self, to: CollectionStatus) -> Result<()> {
        let (from, listeners) = {
            let mut state = self.inner.borrow_mut();
            let from = state.status;
            if from == to {
                return Ok(());
            }
            if !from.permits(to) {
                return Err(Error::InvalidStatusTransition {
                    id: state.id.clone(),
                    from: from.as_str(),
                    to: to.as_str(),
                });
            }
            state.status = to;
            (from, state.status_listeners.clone())
        };
        trace!(id = %self.id(), from = from.as_str(), to = to.as_str(), "collection status");
        for listener in listeners {
            listener(from, to);
        }
        if to == CollectionStatus::Ready {
            let callbacks = std::mem::take(&mut self.inner.borrow_mut().first_ready_callbacks);
            for callback in callbacks {
                callback();
            }
        }
        Ok(())
    }

    /// Start the sync adapter. Safe to call when already started.
    pub fn start_sync(&self) -> Result<()> {
        match self.status() {
            CollectionStatus::Loading | CollectionStatus::Ready => return Ok(()),
            CollectionStatus::Error => {
                self.set_status(CollectionStatus::Idle)?;
                self.set_status(CollectionStatus::Loading)?;
            }
            CollectionStatus::Idle | CollectionStatus::CleanedUp => {
                self.set_status(CollectionStatus::Loading)?;
            }
        }
        debug!(id = %self.id(), "starting sync");
        let sync_fn = self.inner.borrow().config.sync.sync.clone();
        match sync_fn(SyncContext::new(self.clone())) {
            Ok(handle) => {
                let mut state = self.inner.borrow_mut();
                if state.config.sync_mode == SyncMode::OnDemand && handle.load_subset.is_none() {
                    drop(state);
                    self.set_status(CollectionStatus::Error)?;
                    return Err(Error::InvalidSyncConfig(
                        "on-demand sync requires a loadSubset handler".into(),
                    ));
                }
                state.sync_cleanup = handle.cleanup;
                state.load_subset = handle.load_subset;
                Ok(())
            }
            Err(error) => {
                warn!(id = %self.id(), %error, "sync start failed");
                self.set_status(CollectionStatus::Error)?;
                Err(error)
            }
        }
    }

    /// Release sync, overlay, and index state. The collection restarts on
    /// the next `start_sync`.
    pub fn cleanup(&self) -> Result<()> {
        let cleanup = self.inner.borrow_mut().sync_cleanup.take();
        if let Some(cleanup) = cleanup {
            if let Err(error) = cleanup() {
                // Cleanup failures must not mask the lifecycle transition.
                warn!(id = %self.id(), %error, "sync cleanup failed");
            }
        }
        self.set_status(CollectionStatus::CleanedUp)?;
        let mut state = self.inner.borrow_mut();
        state.synced.clear();
        state.synced_metadata.clear();
        state.upserts.clear();
        state.deletes.clear();
        state.pending_sync.clear();
        state.indexes.clear();
        state.recently_synced.clear();
        state.recently_completed.clear();
        state.pre_sync_visible.clear();
        state.received_first_commit = false;
        state.size = 0;
        state.load_subset = None;
        Ok(())
    }

    /// The configured idle time before the host should collect this
    /// collection.
    pub fn gc_time_ms(&self) -> u64 {
        self.inner.borrow().config.gc_time_ms
    }

    /// The number of active subscriptions.
    pub fn active_subscribers(&self) -> isize {
        self.inner.borrow().active_subscribers
    }

    // ------------------------------------------------------------------
    // Mutations.

    fn ensure_writable(&self) -> Result<()> {
        match self.status() {
            CollectionStatus::Error => Err(Error::CollectionInErrorState(self.id())),
            CollectionStatus::CleanedUp => self.start_sync(),
            _ => Ok(()),
        }
    }

    fn key_of(&self, row: &Value) -> Result<Key> {
        let key = (self.inner.borrow().config.get_key)(row);
        if matches!(key, Value::Undefined) {
            return Err(Error::UndefinedKey);
        }
        Ok(key)
    }

    fn validate(&self, row: &Value) -> Result<Value> {
        let schema = self.inner.borrow().config.schema.clone();
        match schema {
            Some(schema) => schema(row),
            None => Ok(row.clone()),
        }
    }

    fn sync_metadata_for_new_mutation(&self) -> Value {
        let getter = self.inner.borrow().config.sync.get_sync_metadata.clone();
        getter.map(|get| get()).unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Insert a row optimistically. Joins the ambient transaction when one
    /// is active; otherwise requires an `on_insert` handler and commits
    /// immediately.
    pub fn insert(&self, row: Value) -> Result<Transaction> {
        self.ensure_writable()?;
        let row = self.validate(&row)?;
        let key = self.key_of(&row)?;
        if self.has(&key) {
            return Err(Error::DuplicateKey(key));
        }
        let mutation = self.build_mutation(
            MutationType::Insert,
            key,
            Value::Object(Default::default()),
            row.clone(),
            row,
        );
        self.run_mutations(vec![mutation], "insert")
    }

    /// Update the row under `key` through a draft; only actual changes
    /// produce a mutation.
    pub fn update(
        &self,
        key: &Key,
        edit: impl FnOnce(&mut ChangeDraft),
    ) -> Result<Option<Transaction>> {
        self.ensure_writable()?;
        let current = self.get(key).ok_or_else(|| Error::MissingKey(key.clone()))?;
        let mut draft = ChangeDraft::new(current.clone());
        edit(&mut draft);
        if !draft.is_modified() {
            return Ok(None);
        }
        let (modified, changes) = draft.finish();
        let modified = self.validate(&modified)?;
        let new_key = self.key_of(&modified)?;
        if new_key != *key {
            return Err(Error::KeyChangeNotAllowed { from: key.clone(), to: new_key });
        }
        let changes = changes.unwrap_or_else(|| modified.clone());
        let mutation =
            self.build_mutation(MutationType::Update, key.clone(), current, modified, changes);
        self.run_mutations(vec![mutation], "update").map(Some)
    }

    /// Delete the row under `key`.
    pub fn delete(&self, key: &Key) -> Result<Transaction> {
        self.ensure_writable()?;
        let current = self.get(key).ok_or_else(|| Error::MissingKey(key.clone()))?;
        let mutation = self.build_mutation(
            MutationType::Delete,
            key.clone(),
            current.clone(),
            current,
            Value::Null,
        );
        self.run_mutations(vec![mutation], "delete")
    }

    fn build_mutation(
        &self,
        kind: MutationType,
        key: Key,
        original: Value,
        modified: Value,
        changes: Value,
    ) -> Mutation {
        let now = next_tick();
        Mutation {
            mutation_id: next_tick(),
            global_key: format!("{}/{}", self.id(), key),
            key,
            kind,
            original,
            modified,
            changes,
            metadata: None,
            sync_metadata: self.sync_metadata_for_new_mutation(),
            optimistic: true,
            created_at: now,
            updated_at: now,
            collection: self.downgrade(),
        }
    }

    fn run_mutations(&self, mutations: Vec<Mutation>, op: &'static str) -> Result<Transaction> {
        if let Some(tx) = ambient_transaction() {
            tx.apply_mutations(mutations);
            return Ok(tx);
        }
        let handler = {
            let state = self.inner.borrow();
            match op {
                "insert" => state.config.on_insert.clone(),
                "update" => state.config.on_update.clone(),
                _ => state.config.on_delete.clone(),
            }
        };
        let handler = handler.ok_or(Error::MissingMutationHandler(op))?;
        let tx = Transaction::new(TransactionConfig {
            mutation_fn: Rc::new(move |tx| handler(tx)),
            auto_commit: true,
        });
        tx.apply_mutations(mutations);
        tx.commit()?;
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Transaction bookkeeping.

    pub(crate) fn track_transaction(&self, tx: &Transaction) {
        let mut state = self.inner.borrow_mut();
        if !state.transactions.iter().any(|known| known == tx) {
            state.transactions.push(tx.clone());
        }
    }

    pub(crate) fn forget_transaction(&self, id: u64) {
        self.inner.borrow_mut().transactions.retain(|tx| tx.id() != id);
    }

    pub(crate) fn record_recently_completed(&self, mutations: &[Mutation]) {
        let mut state = self.inner.borrow_mut();
        let id = state.id.clone();
        for mutation in mutations {
            let belongs = mutation
                .collection
                .upgrade()
                .map(|collection| collection.id() == id)
                .unwrap_or(false);
            if belongs {
                state.recently_completed.insert(mutation.key.clone(), mutation.modified.clone());
            }
        }
    }

    /// Recompute the optimistic overlay after a transaction's mutations or
    /// state changed, emitting the overlay difference as events.
    pub(crate) fn on_transaction_state_change(&self, user_action: bool) {
        let events = {
            let mut state = self.inner.borrow_mut();
            if state.committing_sync && !user_action {
                return;
            }
            if user_action {
                state.recently_synced.clear();
            }

            let prev_upserts = state.upserts.clone();
            let prev_deletes = state.deletes.clone();
            state.rebuild_overlay();
            state.recompute_size();

            let mut affected: FnvHashSet<Key> = FnvHashSet::default();
            affected.extend(prev_upserts.keys().cloned());
            affected.extend(prev_deletes.iter().cloned());
            affected.extend(state.upserts.keys().cloned());
            affected.extend(state.deletes.iter().cloned());

            let mut events = Vec::new();
            for key in affected {
                let pre = visible_with(&state, &prev_upserts, &prev_deletes, &key);
                let post = state.visible_get(&key);
                let Some(event) = ChangeEvent::diff(&key, pre.as_ref(), post.as_ref()) else {
                    continue;
                };
                if !user_action && state.recently_synced.contains(&key) {
                    continue;
                }
                // A delete that only reflects handing the key over to a
                // queued sync write is noise: the sync commit will settle it.
                if event.kind == EventKind::Delete
                    && state.pending_sync.iter().any(|tx| tx.writes_key(&key))
                    && !state
                        .transactions
                        .iter()
                        .any(|tx| !tx.status().is_terminal() && tx.touches_key(&state.id, &key))
                {
                    continue;
                }
                events.push(event);
            }

            if !state.pending_sync.is_empty() {
                // Sync data is queued: hold events and remember what the
                // subscribers last saw so the commit can diff against it.
                for event in events {
                    let pre = match &event.kind {
                        EventKind::Insert => None,
                        _ => event.previous.clone(),
                    };
                    state.pre_sync_visible.entry(event.key.clone()).or_insert(pre);
                }
                return;
            }
            if ambient_transaction().is_some() {
                // Inside a mutate body: merged operations on one key must
                // reach subscribers as a single event, so hold the batch
                // until the top-level exit.
                for event in events {
                    let pre = match &event.kind {
                        EventKind::Insert => None,
                        _ => event.previous.clone(),
                    };
                    state.batched_optimistic.entry(event.key.clone()).or_insert(pre);
                }
                return;
            }
            events
        };
        self.emit_events(events);
    }

    /// Flush events batched during an ambient `mutate` body, coalesced to
    /// one event per key against the pre-mutation state.
    pub(crate) fn flush_optimistic_events(&self) {
        let events = {
            let mut state = self.inner.borrow_mut();
            let batched = std::mem::take(&mut state.batched_optimistic);
            let mut events = Vec::new();
            for (key, pre) in batched {
                let post = state.visible_get(&key);
                if let Some(event) = ChangeEvent::diff(&key, pre.as_ref(), post.as_ref()) {
                    events.push(event);
                }
            }
            events
        };
        self.emit_events(events);
    }

    /// Apply a finished event batch: indexes first, then subscribers.
    pub(crate) fn emit_events(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let subscriptions = {
            let mut state = self.inner.borrow_mut();
            state.update_indexes(&events);
            state.subscriptions.clone()
        };
        for sub in subscriptions {
            subscription::deliver(&sub, &events);
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions and snapshots.

    /// Subscribe to the collection's change stream.
    pub fn subscribe_changes(&self, options: SubscribeOptions) -> Result<Subscription> {
        if self.status() == CollectionStatus::Error {
            return Err(Error::CollectionInErrorState(self.id()));
        }
        self.start_sync()?;
        if let Some(where_expr) = &options.where_expr {
            self.ensure_auto_indexes(where_expr)?;
        }
        let subscription = subscription::create(self, options)?;
        {
            let mut state = self.inner.borrow_mut();
            state.active_subscribers += 1;
        }
        Ok(subscription)
    }

    pub(crate) fn release_subscription(&self, id: u64) -> Result<()> {
        let mut state = self.inner.borrow_mut();
        state.subscriptions.retain(|sub| sub.borrow().id != id);
        state.active_subscribers -= 1;
        if state.active_subscribers < 0 {
            return Err(Error::NegativeSubscriberCount(state.id.clone()));
        }
        Ok(())
    }

    /// Create any missing eager auto-indexes for the single-field
    /// predicates of `where_expr`.
    pub(crate) fn ensure_auto_indexes(&self, where_expr: &Expr) -> Result<()> {
        if self.inner.borrow().config.auto_index == AutoIndexMode::Off {
            return Ok(());
        }
        let mut candidates = Vec::new();
        index::index_candidates(where_expr, &mut candidates);
        for candidate in candidates {
            self.ensure_index(candidate.field, CompareOptions::default())?;
        }
        Ok(())
    }

    /// Create an index over `expr` unless an equivalent one exists; returns
    /// the index id.
    pub fn ensure_index(&self, expr: Expr, compare: CompareOptions) -> Result<usize> {
        let mut state = self.inner.borrow_mut();
        if let Some(existing) = state
            .indexes
            .iter()
            .find(|index| index.expr == expr && index.matches(&compare) != IndexMatch::No)
        {
            return Ok(existing.id);
        }
        let id = state.next_index_id;
        state.next_index_id += 1;
        let mut index = BTreeIndex::new(id, expr, compare)?;
        for (key, row) in state.visible_entries() {
            index.add_row(&key, &row);
        }
        debug!(id = %state.id, index = index.id, "created index");
        state.indexes.push(index);
        Ok(id)
    }

    /// Run `read` against the index with id `index_id`.
    pub fn with_index<R>(&self, index_id: usize, read: impl FnOnce(&BTreeIndex) -> R) -> Option<R> {
        let state = self.inner.borrow();
        state.indexes.iter().find(|index| index.id == index_id).map(read)
    }

    /// Find an index over `expr` compatible with `compare`.
    pub fn find_index(&self, expr: &Expr, compare: &CompareOptions) -> Option<(usize, IndexMatch)> {
        let state = self.inner.borrow();
        state
            .indexes
            .iter()
            .filter(|index| index.expr == *expr)
            .find_map(|index| match index.matches(compare) {
                IndexMatch::No => None,
                matched => Some((index.id, matched)),
            })
    }

    /// The current visible state as insert events, optionally restricted by
    /// a single-row predicate. With `optimized_only`, returns `None` unless
    /// an index can drive the filter.
    pub fn current_state_as_changes(
        &self,
        filter: Option<&Expr>,
        optimized_only: bool,
    ) -> Result<Option<Vec<ChangeEvent>>> {
        let state = self.inner.borrow();
        let Some(filter) = filter else {
            let events = state
                .visible_entries()
                .into_iter()
                .map(|(key, row)| ChangeEvent::insert(key, row))
                .collect();
            return Ok(Some(events));
        };
        let predicate: CompiledPredicate = eval::compile_predicate(filter, true)?;

        // An index probe serves the candidate keys; the predicate still
        // re-checks each row, since the index reflects the last event batch.
        if let Some((field, op, value)) = index::as_index_probe(filter) {
            let index = state
                .indexes
                .iter()
                .find(|index| index.expr == field && index.matches(&CompareOptions::default()) != IndexMatch::No);
            if let Some(index) = index {
                let keys = index.lookup(op, &value);
                let events = keys
                    .into_iter()
                    .filter_map(|key| {
                        let row = state.visible_get(&key)?;
                        predicate(&row).then(|| ChangeEvent::insert(key, row))
                    })
                    .collect();
                return Ok(Some(events));
            }
        }
        if optimized_only {
            return Ok(None);
        }
        let events = state
            .visible_entries()
            .into_iter()
            .filter(|(_, row)| predicate(row))
            .map(|(key, row)| ChangeEvent::insert(key, row))
            .collect();
        Ok(Some(events))
    }

    /// Ask the sync adapter to load a subset of rows; used by on-demand
    /// collections and windowed subscriptions.
    pub fn load_subset(&self, options: &LoadSubsetOptions) -> bool {
        let loader = self.inner.borrow().load_subset.clone();
        match loader {
            Some(loader) => {
                loader(options);
                true
            }
            None => false,
        }
    }
}

/// Visibility under an arbitrary overlay snapshot.
fn visible_with(
    state: &CollectionState,
    upserts: &FnvHashMap<Key, Value>,
    deletes: &FnvHashSet<Key>,
    key: &Key,
) -> Option<Value> {
    if deletes.contains(key) {
        return None;
    }
    if let Some(row) = upserts.get(key) {
        return Some(row.clone());
    }
    state.synced.get(key).cloned()
}
