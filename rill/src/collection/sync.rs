//! The sync adapter protocol and the sync-commit critical section.
//!
//! An adapter feeds authoritative data through begin/write/commit sessions;
//! a session marked truncate resets the synced base wholesale, capturing
//! the optimistic overlay so local work survives the reset. Committed
//! sessions apply in FIFO order, deferred while a host transaction is
//! persisting (truncates excepted), and each applied batch emits at most
//! one event per key, diffed against the state subscribers last observed.

use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};
use tracing::{debug, trace};

use crate::collection::events::{ChangeEvent, EventKind};
use crate::collection::{Collection, CollectionStatus};
use crate::errors::{Error, Result};
use crate::expr::{Expr, OrderByClause};
use crate::transactions::{MutationType, TransactionStatus};
use crate::value::{Key, Value};

/// How sync updates combine with existing rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RowUpdateMode {
    /// Merge update payloads into the existing row.
    #[default]
    Partial,
    /// Replace the row wholesale.
    Full,
}

/// The sync adapter half of a collection's configuration.
#[derive(Clone)]
pub struct SyncConfig {
    /// Starts the adapter; receives the session surface.
    pub sync: Rc<dyn Fn(SyncContext) -> Result<SyncHandle>>,
    /// Produces per-mutation sync metadata.
    pub get_sync_metadata: Option<Rc<dyn Fn() -> Value>>,
    /// How update operations combine with existing rows.
    pub row_update_mode: RowUpdateMode,
}

impl SyncConfig {
    /// A config around a sync start function.
    pub fn new(sync: impl Fn(SyncContext) -> Result<SyncHandle> + 'static) -> Self {
        SyncConfig { sync: Rc::new(sync), get_sync_metadata: None, row_update_mode: RowUpdateMode::default() }
    }
}

/// What a sync adapter returns from its start function.
#[derive(Default)]
pub struct SyncHandle {
    /// Tear down the adapter; failures are logged, never masking the
    /// lifecycle transition.
    pub cleanup: Option<Box<dyn FnOnce() -> Result<()>>>,
    /// Loads a subset of rows on request; required for on-demand sync.
    pub load_subset: Option<Rc<dyn Fn(&LoadSubsetOptions)>>,
}

/// A request for more rows from the sync adapter.
#[derive(Clone, Debug, Default)]
pub struct LoadSubsetOptions {
    /// Restrict to rows matching this single-row predicate.
    pub where_expr: Option<Expr>,
    /// Requested ordering.
    pub order_by: Option<Vec<OrderByClause>>,
    /// Row limit.
    pub limit: Option<usize>,
    /// Row offset.
    pub offset: Option<usize>,
    /// Resume after this sort value.
    pub cursor: Option<Value>,
}

/// One operation written into a sync session.
#[derive(Clone, Debug)]
pub(crate) struct SyncOperation {
    pub kind: MutationType,
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Value>,
}

/// A buffered sync session.
#[derive(Default)]
pub(crate) struct PendingSyncTx {
    pub committed: bool,
    pub truncate: bool,
    pub operations: Vec<SyncOperation>,
    pub deleted_keys: FnvHashSet<Key>,
    /// The optimistic overlay as it stood when truncate was called.
    pub optimistic_snapshot: Option<(FnvHashMap<Key, Value>, FnvHashSet<Key>)>,
}

impl PendingSyncTx {
    pub(crate) fn writes_key(&self, key: &Key) -> bool {
        self.operations.iter().any(|op| op.key == *key)
    }
}

/// The session surface handed to a sync adapter.
#[derive(Clone)]
pub struct SyncContext {
    collection: Collection,
}

impl SyncContext {
    pub(crate) fn new(collection: Collection) -> Self {
        SyncContext { collection }
    }

    /// The collection being synced.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Open a new sync session.
    pub fn begin(&self) {
        let state = self.collection.state();
        state.borrow_mut().pending_sync.push_back(PendingSyncTx::default());
        trace!(id = %self.collection.id(), "sync begin");
    }

    /// Append an operation to the open session.
    pub fn write(&self, write: SyncWrite) -> Result<()> {
        let key = match &write.key {
            Some(key) => key.clone(),
            None => {
                let state = self.collection.state().borrow();
                (state.config.get_key)(&write.value)
            }
        };
        if matches!(key, Value::Undefined) {
            return Err(Error::UndefinedKey);
        }
        let state = self.collection.state();
        let mut state = state.borrow_mut();
        let Some(pending) = state.pending_sync.back_mut() else {
            return Err(Error::NoPendingSyncTransactionWrite);
        };
        if pending.committed {
            return Err(Error::SyncTransactionAlreadyCommitted("write"));
        }
        if write.kind == MutationType::Delete {
            pending.deleted_keys.insert(key.clone());
        }
        pending.operations.push(SyncOperation {
            kind: write.kind,
            key,
            value: write.value,
            metadata: write.metadata,
        });
        Ok(())
    }

    /// Turn the open session into a full reset: the synced base clears on
    /// commit and the optimistic overlay, captured now, is restored over
    /// the fresh base.
    pub fn truncate(&self) -> Result<()> {
        let state = self.collection.state();
        let mut state = state.borrow_mut();
        let snapshot = (state.upserts.clone(), state.deletes.clone());
        let Some(pending) = state.pending_sync.back_mut() else {
            return Err(Error::NoPendingSyncTransactionWrite);
        };
        if pending.committed {
            return Err(Error::SyncTransactionAlreadyCommitted("truncate"));
        }
        pending.truncate = true;
        pending.operations.clear();
        pending.deleted_keys.clear();
        pending.optimistic_snapshot = Some(snapshot);
        debug!(id = %self.collection.id(), "sync truncate");
        Ok(())
    }

    /// Commit the open session and process every committed session.
    pub fn commit(&self) -> Result<()> {
        {
            let state = self.collection.state();
            let mut state = state.borrow_mut();
            let Some(pending) = state.pending_sync.iter_mut().rev().find(|tx| !tx.committed)
            else {
                return Err(Error::NoPendingSyncTransactionCommit);
            };
            pending.committed = true;
        }
        self.collection.commit_pending_sync();
        Ok(())
    }

    /// Declare the collection ready; the only path to `Ready`.
    pub fn mark_ready(&self) {
        self.collection.mark_ready();
    }
}

/// One buffered write from the adapter.
#[derive(Clone, Debug)]
pub struct SyncWrite {
    /// Insert, update, or delete.
    pub kind: MutationType,
    /// The row (full for inserts, possibly partial for updates, enough to
    /// key for deletes).
    pub value: Value,
    /// Adapter-supplied metadata stored alongside the row.
    pub metadata: Option<Value>,
    /// Explicit key; rows with derived identity (live query output) carry
    /// it here instead of through the key extractor.
    pub key: Option<Key>,
}

impl SyncWrite {
    /// An insert write.
    pub fn insert(value: Value) -> Self {
        SyncWrite { kind: MutationType::Insert, value, metadata: None, key: None }
    }

    /// An update write.
    pub fn update(value: Value) -> Self {
        SyncWrite { kind: MutationType::Update, value, metadata: None, key: None }
    }

    /// A delete write.
    pub fn delete(value: Value) -> Self {
        SyncWrite { kind: MutationType::Delete, value, metadata: None, key: None }
    }

    /// Attach an explicit key.
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }
}

impl Collection {
    /// Mark the collection ready on the sync adapter's say-so.
    pub(crate) fn mark_ready(&self) {
        match self.status() {
            CollectionStatus::Ready => {}
            CollectionStatus::Idle => {
                let _ = self.set_status(CollectionStatus::Loading);
                let _ = self.set_status(CollectionStatus::Ready);
            }
            _ => {
                let _ = self.set_status(CollectionStatus::Ready);
            }
        }
    }

    /// Apply every committed sync session: the critical section.
    ///
    /// Commits hold while a host transaction is persisting, unless a
    /// truncate demands immediate processing. Each pass applies the
    /// committed sessions to the synced base, rebuilds the optimistic
    /// overlay, and emits per-key events diffed against the visible state
    /// captured before sync began queueing.
    pub(crate) fn commit_pending_sync(&self) {
        let (events, mark_ready) = {
            let state = self.state();
            let mut state = state.borrow_mut();
            if state.pending_sync.is_empty() && state.pre_sync_visible.is_empty() {
                return;
            }
            let has_truncate =
                state.pending_sync.iter().any(|tx| tx.committed && tx.truncate);
            let persisting = state
                .transactions
                .iter()
                .any(|tx| tx.status() == TransactionStatus::Persisting);
            if persisting && !has_truncate {
                trace!(id = %state.id, "sync commit deferred behind persisting transaction");
                return;
            }

            let drained: Vec<PendingSyncTx> = state.pending_sync.drain(..).collect();
            let mut committed = Vec::new();
            for tx in drained {
                if tx.committed {
                    committed.push(tx);
                } else {
                    state.pending_sync.push_back(tx);
                }
            }
            if committed.is_empty() && state.pre_sync_visible.is_empty() {
                return;
            }

            state.committing_sync = true;
            state.recently_synced.clear();

            let truncating = committed.iter().any(|tx| tx.truncate);
            let mut changed: Vec<Key> = Vec::new();
            let mut seen: FnvHashSet<Key> = FnvHashSet::default();
            let mut note = |key: &Key, changed: &mut Vec<Key>, seen: &mut FnvHashSet<Key>| {
                if seen.insert(key.clone()) {
                    changed.push(key.clone());
                }
            };
            for tx in &committed {
                for op in &tx.operations {
                    note(&op.key, &mut changed, &mut seen);
                }
            }
            for key in state.pre_sync_visible.keys() {
                note(key, &mut changed, &mut seen);
            }

            // Explicit pre-state capture: what subscribers last observed.
            // Keys already captured while sync was queueing keep their
            // earlier snapshot.
            let mut pre_map = std::mem::take(&mut state.pre_sync_visible);
            if truncating {
                for (key, row) in state.visible_entries() {
                    note(&key, &mut changed, &mut seen);
                    pre_map.entry(key).or_insert(Some(row));
                }
            }
            for key in &changed {
                if !pre_map.contains_key(key) {
                    let pre = state.visible_get(key);
                    pre_map.insert(key.clone(), pre);
                }
            }

            // Apply the committed sessions to the synced base.
            let row_update_mode = state.config.sync.row_update_mode;
            let mut truncate_snapshot = None;
            let mut reasserted_by_sync: FnvHashSet<Key> = FnvHashSet::default();
            for tx in committed {
                if tx.truncate {
                    state.synced.clear();
                    state.synced_metadata.clear();
                    truncate_snapshot = tx.optimistic_snapshot;
                }
                let after_truncate = truncate_snapshot.is_some();
                for op in tx.operations {
                    if after_truncate {
                        reasserted_by_sync.insert(op.key.clone());
                    }
                    match op.kind {
                        MutationType::Insert => {
                            state.synced.set(op.key.clone(), op.value, true);
                            if let Some(metadata) = op.metadata {
                                state.synced_metadata.insert(op.key, metadata);
                            }
                        }
                        MutationType::Update => {
                            let next = match (row_update_mode, state.synced.get(&op.key)) {
                                (RowUpdateMode::Partial, Some(existing)) => {
                                    let mut merged = existing.clone();
                                    merged.merge(&op.value);
                                    merged
                                }
                                _ => op.value,
                            };
                            state.synced.set(op.key.clone(), next, true);
                            if let Some(metadata) = op.metadata {
                                state.synced_metadata.insert(op.key, metadata);
                            }
                        }
                        MutationType::Delete => {
                            state.synced.delete(&op.key);
                            state.synced_metadata.remove(&op.key);
                        }
                    }
                }
            }

            // Rebuild the overlay: restore the truncate snapshot when there
            // is one, then lay active transactions over it.
            if let Some((upserts, deletes)) = truncate_snapshot {
                state.upserts = upserts;
                state.deletes = deletes;
            } else {
                state.upserts.clear();
                state.deletes.clear();
            }
            state.apply_active_transactions();
            state.recompute_size();
            if truncating {
                let overlay_keys: Vec<Key> = state.upserts.keys().cloned().collect();
                for key in overlay_keys {
                    note(&key, &mut changed, &mut seen);
                }
            }

            // Per-key event emission against the captured pre-state.
            let mut events = Vec::new();
            for key in &changed {
                let pre = pre_map.get(key).cloned().flatten();
                let post = state.visible_get(key);
                let mut event = ChangeEvent::diff(key, pre.as_ref(), post.as_ref());
                if truncating
                    && state.upserts.contains_key(key)
                    && !state.deletes.contains(key)
                    && !reasserted_by_sync.contains(key)
                {
                    // The truncate wiped this key's base; its survival is
                    // the overlay's doing and is re-announced as an insert.
                    if let Some(post) = &post {
                        event = Some(ChangeEvent::insert(key.clone(), post.clone()));
                    }
                }
                let Some(event) = event else { continue };
                // A sync write that merely confirms a just-completed
                // optimistic mutation is redundant.
                if matches!(event.kind, EventKind::Insert | EventKind::Update)
                    && state.recently_completed.get(key) == Some(&event.value)
                {
                    state.recently_synced.insert(key.clone());
                    continue;
                }
                state.recently_synced.insert(key.clone());
                events.push(event);
            }

            let mark_ready = !state.received_first_commit;
            state.received_first_commit = true;
            state.recently_completed.clear();
            state.committing_sync = false;
            debug!(id = %state.id, events = events.len(), "sync commit applied");
            (events, mark_ready)
        };

        self.emit_events(events);
        if mark_ready && self.status() == CollectionStatus::Loading {
            let _ = self.set_status(CollectionStatus::Ready);
        }
    }
}
