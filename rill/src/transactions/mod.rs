//! Transactions group optimistic mutations and coordinate their commit.
//!
//! A transaction collects mutations against any number of collections,
//! merging operations that target the same global key, and makes them
//! visible immediately through each collection's optimistic overlay. Commit
//! hands the mutations to the host's persistence function; success completes
//! the transaction and failure rolls it back, cascading to every other
//! in-flight transaction that touched an overlapping key.
//!
//! Collection mutations find their transaction through an ambient stack:
//! `mutate` pushes the transaction for the duration of its closure, so call
//! sites never thread the transaction explicitly. The stack is thread-local,
//! matching the engine's single-threaded dispatch model.

pub mod scheduler;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::Serialize;
use tracing::{debug, trace};

use crate::collection::WeakCollection;
use crate::errors::{Error, Result};
use crate::value::{Key, Value};

thread_local! {
    static AMBIENT: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
    static REGISTRY: RefCell<Vec<Weak<RefCell<TransactionState>>>> =
        const { RefCell::new(Vec::new()) };
    static CLOCK: Cell<u64> = const { Cell::new(1) };
}

/// The next value of the process-wide logical clock; orders transactions
/// and stamps mutations.
pub(crate) fn next_tick() -> u64 {
    CLOCK.with(|clock| {
        let tick = clock.get();
        clock.set(tick + 1);
        tick
    })
}

/// The transaction currently joined by collection mutations, if any.
pub fn ambient_transaction() -> Option<Transaction> {
    AMBIENT.with(|stack| stack.borrow().last().cloned())
}

/// Every live, non-terminal transaction; used by the rollback cascade.
fn active_transactions() -> Vec<Transaction> {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        registry.retain(|weak| weak.strong_count() > 0);
        registry
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Transaction { inner })
            .collect()
    })
}

/// What a mutation does to its row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    /// Create a row.
    Insert,
    /// Change fields of an existing row.
    Update,
    /// Remove a row.
    Delete,
}

/// One recorded change to one row of one collection.
#[derive(Clone)]
pub struct Mutation {
    /// Unique id of the mutation.
    pub mutation_id: u64,
    /// `collection id + "/" + key`, the merge identity across collections.
    pub global_key: String,
    /// The row key within its collection.
    pub key: Key,
    /// What the mutation does.
    pub kind: MutationType,
    /// The row before the transaction touched it; empty object for inserts.
    pub original: Value,
    /// The full row after the mutation.
    pub modified: Value,
    /// The user-visible delta only.
    pub changes: Value,
    /// Host-supplied metadata.
    pub metadata: Option<Value>,
    /// Metadata captured from the sync adapter configuration.
    pub sync_metadata: Value,
    /// Whether the mutation is visible optimistically before persistence.
    pub optimistic: bool,
    /// Logical creation time.
    pub created_at: u64,
    /// Logical time of the last merge into this mutation.
    pub updated_at: u64,
    /// The collection the mutation belongs to.
    pub collection: WeakCollection,
}

/// The lifecycle of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting mutations.
    Pending,
    /// The persistence function is running.
    Persisting,
    /// Persisted successfully.
    Completed,
    /// Rolled back or failed to persist.
    Failed,
}

impl TransactionStatus {
    /// Display name for errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Persisting => "persisting",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    /// True for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }
}

/// The host function that persists a transaction's mutations.
pub type MutationFn = Rc<dyn Fn(&Transaction) -> Result<()>>;

/// Options for creating a transaction.
#[derive(Clone)]
pub struct TransactionConfig {
    /// Persists the mutations; required.
    pub mutation_fn: MutationFn,
    /// Commit automatically when the top-level `mutate` closure exits.
    pub auto_commit: bool,
}

/// Settles exactly once with the outcome of persistence.
#[derive(Clone, Default)]
pub struct Persisted {
    state: Rc<RefCell<PersistedState>>,
}

#[derive(Default)]
struct PersistedState {
    outcome: Option<Result<()>>,
    waiters: Vec<Box<dyn FnOnce(&Result<()>)>>,
}

impl Persisted {
    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Result<()>> {
        self.state.borrow().outcome.clone()
    }

    /// Run `waiter` when the outcome settles (immediately if it already
    /// has).
    pub fn on_settled(&self, waiter: impl FnOnce(&Result<()>) + 'static) {
        let settled = self.state.borrow().outcome.clone();
        match settled {
            Some(outcome) => waiter(&outcome),
            None => self.state.borrow_mut().waiters.push(Box::new(waiter)),
        }
    }

    fn settle(&self, outcome: Result<()>) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(&outcome);
        }
    }
}

struct TransactionState {
    id: u64,
    status: TransactionStatus,
    mutations: Vec<Mutation>,
    created_at: u64,
    sequence_number: u64,
    auto_commit: bool,
    mutation_fn: MutationFn,
    persisted: Persisted,
    error: Option<Error>,
}

/// A handle to a transaction; clones share state.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<RefCell<TransactionState>>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("mutations", &self.inner.borrow().mutations.len())
            .finish()
    }
}

impl Transaction {
    /// Create a transaction.
    pub fn new(config: TransactionConfig) -> Transaction {
        let id = next_tick();
        let created_at = next_tick();
        let sequence_number = next_tick();
        let inner = Rc::new(RefCell::new(TransactionState {
            id,
            status: TransactionStatus::Pending,
            mutations: Vec::new(),
            created_at,
            sequence_number,
            auto_commit: config.auto_commit,
            mutation_fn: config.mutation_fn,
            persisted: Persisted::default(),
            error: None,
        }));
        REGISTRY.with(|registry| registry.borrow_mut().push(Rc::downgrade(&inner)));
        Transaction { inner }
    }

    /// The transaction's identity.
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// The current lifecycle state.
    pub fn status(&self) -> TransactionStatus {
        self.inner.borrow().status
    }

    /// The ordering key across transactions.
    pub fn order_key(&self) -> (u64, u64) {
        let state = self.inner.borrow();
        (state.created_at, state.sequence_number)
    }

    /// The error captured by a failed persistence, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.borrow().error.clone()
    }

    /// A snapshot of the transaction's mutations in application order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.borrow().mutations.clone()
    }

    /// The persistence outcome handle.
    pub fn is_persisted(&self) -> Persisted {
        self.inner.borrow().persisted.clone()
    }

    /// True when any mutation targets `global_key`.
    pub fn touches(&self, global_key: &str) -> bool {
        self.inner.borrow().mutations.iter().any(|m| m.global_key == global_key)
    }

    /// True when any mutation targets `key` within the collection named by
    /// `collection_id`.
    pub fn touches_key(&self, collection_id: &str, key: &Key) -> bool {
        let global_key = format!("{collection_id}/{key}");
        self.touches(&global_key)
    }

    /// The distinct collections this transaction has mutated.
    pub fn touched_collections(&self) -> Vec<crate::collection::Collection> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for mutation in self.inner.borrow().mutations.iter() {
            if let Some(collection) = mutation.collection.upgrade() {
                if !seen.contains(&collection.id().to_string()) {
                    seen.push(collection.id().to_string());
                    out.push(collection);
                }
            }
        }
        out
    }

    /// Run `body` with this transaction as the ambient target of collection
    /// mutations, then auto-commit if configured.
    pub fn mutate<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        if self.status() != TransactionStatus::Pending {
            return Err(Error::TransactionWrongState {
                action: "mutate",
                state: self.status().as_str(),
            });
        }
        AMBIENT.with(|stack| stack.borrow_mut().push(self.clone()));
        let outcome = body();
        let top_level = AMBIENT.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.pop();
            stack.is_empty()
        });
        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                self.rollback().ok();
                return Err(error);
            }
        };
        if top_level {
            // Mutations merged inside the body surface as one coalesced
            // event batch per collection.
            for collection in self.touched_collections() {
                collection.flush_optimistic_events();
            }
        }
        if self.inner.borrow().auto_commit {
            self.commit()?;
        }
        if top_level {
            // Work deferred by live queries under this transaction's
            // context runs once the stack unwinds.
            scheduler::flush(self.id())?;
        }
        Ok(value)
    }

    /// Merge `incoming` mutations into the transaction and refresh the
    /// optimistic overlay of every collection they touch.
    pub(crate) fn apply_mutations(&self, incoming: Vec<Mutation>) {
        {
            let mut state = self.inner.borrow_mut();
            for mutation in incoming {
                merge_mutation(&mut state.mutations, mutation);
            }
        }
        for collection in self.touched_collections() {
            collection.track_transaction(self);
            collection.on_transaction_state_change(true);
        }
    }

    /// Persist the transaction. A no-op unless the transaction is pending.
    pub fn commit(&self) -> Result<()> {
        if self.status() != TransactionStatus::Pending {
            return Ok(());
        }
        if self.inner.borrow().mutations.is_empty() {
            self.finish(TransactionStatus::Completed);
            self.is_persisted().settle(Ok(()));
            return Ok(());
        }
        let collections = self.touched_collections();

        debug!(id = self.id(), "transaction persisting");
        self.set_status(TransactionStatus::Persisting);
        // Entering persistence is a commit point for queued sync data: give
        // each touched collection the chance to flush first.
        for collection in &collections {
            collection.on_transaction_state_change(false);
            collection.commit_pending_sync();
        }

        let mutation_fn = self.inner.borrow().mutation_fn.clone();
        match mutation_fn(self) {
            Ok(()) => {
                for collection in &collections {
                    collection.record_recently_completed(&self.mutations());
                }
                self.finish(TransactionStatus::Completed);
                self.is_persisted().settle(Ok(()));
                for collection in &collections {
                    collection.forget_transaction(self.id());
                    collection.commit_pending_sync();
                    collection.on_transaction_state_change(false);
                }
                debug!(id = self.id(), "transaction completed");
                Ok(())
            }
            Err(error) => {
                self.inner.borrow_mut().error = Some(error.clone());
                self.rollback().ok();
                Err(error)
            }
        }
    }

    /// Roll the transaction back, cascading to overlapping transactions.
    pub fn rollback(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Completed => Err(Error::TransactionWrongState {
                action: "rollback",
                state: "completed",
            }),
            TransactionStatus::Failed => Ok(()),
            _ => {
                self.rollback_inner(true);
                Ok(())
            }
        }
    }

    fn rollback_inner(&self, cascade: bool) {
        debug!(id = self.id(), cascade, "transaction rollback");
        let global_keys: Vec<String> = {
            let state = self.inner.borrow();
            state.mutations.iter().map(|m| m.global_key.clone()).collect()
        };
        self.finish(TransactionStatus::Failed);
        let error = self.inner.borrow().error.clone().unwrap_or(Error::TransactionRolledBack);
        self.is_persisted().settle(Err(error));
        scheduler::clear(self.id());

        if cascade {
            // Any other live transaction that touched one of our keys was
            // built on state this rollback is about to revert.
            for other in active_transactions() {
                if other == *self || other.status().is_terminal() {
                    continue;
                }
                if global_keys.iter().any(|key| other.touches(key)) {
                    other.rollback_inner(false);
                }
            }
        }

        for collection in self.touched_collections() {
            collection.forget_transaction(self.id());
            collection.on_transaction_state_change(true);
        }
    }

    fn finish(&self, status: TransactionStatus) {
        self.set_status(status);
    }

    fn set_status(&self, status: TransactionStatus) {
        trace!(id = self.id(), status = status.as_str(), "transaction state");
        self.inner.borrow_mut().status = status;
    }
}

/// Apply the mutation-merge table: an incoming mutation against an existing
/// one on the same global key either replaces it, merges into it, or
/// removes the pair.
fn merge_mutation(mutations: &mut Vec<Mutation>, incoming: Mutation) {
    let Some(position) =
        mutations.iter().position(|existing| existing.global_key == incoming.global_key)
    else {
        mutations.push(incoming);
        return;
    };
    let existing = &mutations[position];
    match (existing.kind, incoming.kind) {
        // insert then update: still an insert of the merged row.
        (MutationType::Insert, MutationType::Update) => {
            let mut merged = incoming;
            merged.kind = MutationType::Insert;
            merged.original = Value::Object(Default::default());
            let mut changes = existing.changes.clone();
            changes.merge(&merged.changes);
            merged.changes = changes;
            merged.created_at = existing.created_at;
            mutations[position] = merged;
        }
        // insert then delete: the row never existed.
        (MutationType::Insert, MutationType::Delete) => {
            mutations.remove(position);
        }
        // update then update: one update with accumulated changes.
        (MutationType::Update, MutationType::Update) => {
            let mut merged = incoming;
            merged.original = existing.original.clone();
            let mut changes = existing.changes.clone();
            changes.merge(&merged.changes);
            merged.changes = changes;
            merged.created_at = existing.created_at;
            mutations[position] = merged;
        }
        // update then delete: a delete of the original row.
        (MutationType::Update, MutationType::Delete) => {
            let mut merged = incoming;
            merged.original = existing.original.clone();
            merged.created_at = existing.created_at;
            mutations[position] = merged;
        }
        // Everything else replaces the existing mutation wholesale.
        _ => {
            mutations[position] = incoming;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;

    fn mutation(kind: MutationType, key: i64, modified: Value, changes: Value) -> Mutation {
        Mutation {
            mutation_id: next_tick(),
            global_key: format!("c/{key}"),
            key: Value::Int(key),
            kind,
            original: Value::Object(Default::default()),
            modified,
            changes,
            metadata: None,
            sync_metadata: Value::Object(Default::default()),
            optimistic: true,
            created_at: next_tick(),
            updated_at: next_tick(),
            collection: WeakCollection::dangling(),
        }
    }

    #[test]
    fn insert_then_update_merges_into_insert() {
        let mut mutations = Vec::new();
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Insert, 1, object![("v", 1)], object![("v", 1)]),
        );
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Update, 1, object![("v", 2)], object![("v", 2)]),
        );
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].kind, MutationType::Insert);
        assert_eq!(mutations[0].modified, object![("v", 2)]);
        assert_eq!(mutations[0].original, Value::Object(Default::default()));
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut mutations = Vec::new();
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Insert, 1, object![("v", 1)], object![("v", 1)]),
        );
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Delete, 1, Value::Null, Value::Null),
        );
        assert!(mutations.is_empty());
    }

    #[test]
    fn update_then_update_accumulates_changes() {
        let mut mutations = Vec::new();
        let mut first = mutation(MutationType::Update, 1, object![("a", 1)], object![("a", 1)]);
        first.original = object![("a", 0), ("b", 0)];
        merge_mutation(&mut mutations, first);
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Update, 1, object![("b", 2)], object![("b", 2)]),
        );
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].changes, object![("a", 1), ("b", 2)]);
        assert_eq!(mutations[0].original, object![("a", 0), ("b", 0)]);
    }

    #[test]
    fn delete_then_insert_replaces() {
        let mut mutations = Vec::new();
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Delete, 1, Value::Null, Value::Null),
        );
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Insert, 1, object![("v", 3)], object![("v", 3)]),
        );
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].kind, MutationType::Insert);
    }

    #[test]
    fn different_keys_do_not_merge() {
        let mut mutations = Vec::new();
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Insert, 1, object![("v", 1)], object![("v", 1)]),
        );
        merge_mutation(
            &mut mutations,
            mutation(MutationType::Insert, 2, object![("v", 2)], object![("v", 2)]),
        );
        assert_eq!(mutations.len(), 2);
    }
}
