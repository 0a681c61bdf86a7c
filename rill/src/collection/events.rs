//! Change events delivered to subscribers.

use crate::value::{Key, Value};

/// What happened to a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// The row became visible.
    Insert,
    /// The visible row changed value.
    Update,
    /// The row stopped being visible.
    Delete,
}

/// One entry of a change batch.
///
/// Invariants: an insert never carries a previous value, an update always
/// carries both, and a delete carries the last visible value.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: EventKind,
    /// The row key.
    pub key: Key,
    /// The row after the change; for deletes, the last visible row.
    pub value: Value,
    /// The row before the change, when there was one.
    pub previous: Option<Value>,
}

impl ChangeEvent {
    /// An insert event.
    pub fn insert(key: Key, value: Value) -> Self {
        ChangeEvent { kind: EventKind::Insert, key, value, previous: None }
    }

    /// An update event.
    pub fn update(key: Key, value: Value, previous: Value) -> Self {
        ChangeEvent { kind: EventKind::Update, key, value, previous: Some(previous) }
    }

    /// A delete event carrying the last visible row.
    pub fn delete(key: Key, last: Value) -> Self {
        ChangeEvent { kind: EventKind::Delete, key, value: last.clone(), previous: Some(last) }
    }

    /// The minimal event taking a row from `pre` to `post`, or `None` when
    /// nothing observable changed.
    pub fn diff(key: &Key, pre: Option<&Value>, post: Option<&Value>) -> Option<ChangeEvent> {
        match (pre, post) {
            (None, Some(value)) => Some(ChangeEvent::insert(key.clone(), value.clone())),
            (Some(previous), None) => Some(ChangeEvent::delete(key.clone(), previous.clone())),
            (Some(previous), Some(value)) if previous != value => {
                Some(ChangeEvent::update(key.clone(), value.clone(), previous.clone()))
            }
            _ => None,
        }
    }
}
