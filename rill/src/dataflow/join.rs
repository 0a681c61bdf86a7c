//! Match pairs of records based on a key.
//!
//! The hash join keeps a multiset of payloads per join key on each side.
//! For every key disturbed by a batch it recomputes that key's output
//! multiset before and after the state change and emits the difference, so
//! consumers only ever see a consistent view: matched pairs, plus
//! null-padded rows for the outer sides whose opposite multiset is empty.

use fnv::{FnvHashMap, FnvHashSet};

use crate::dataflow::{drain, KeyedRow, Operator, Port, Stream, Tee};
use crate::expr::JoinType;
use crate::multiset::{Delta, MultiSet};
use crate::value::Value;

/// Join methods on keyed streams.
pub trait JoinExt {
    /// Hash-join with `other` on the record key. Emits
    /// `(key, [left?, right?])` records with `Null` padding per the join
    /// type.
    fn join(&self, other: &Stream, join_type: JoinType) -> Stream;
}

impl JoinExt for Stream {
    fn join(&self, other: &Stream, join_type: JoinType) -> Stream {
        let left = self.connect();
        let right = other.connect();
        let (output, stream) = self.derived();
        self.builder().add_operator(Box::new(JoinOperator {
            left,
            right,
            output,
            join_type,
            left_state: FnvHashMap::default(),
            right_state: FnvHashMap::default(),
        }));
        stream
    }
}

type SideState = FnvHashMap<Value, FnvHashMap<Value, Delta>>;

struct JoinOperator {
    left: Port,
    right: Port,
    output: Tee,
    join_type: JoinType,
    left_state: SideState,
    right_state: SideState,
}

impl Operator for JoinOperator {
    fn pending_work(&self) -> bool {
        !self.left.borrow().is_empty() || !self.right.borrow().is_empty()
    }

    fn run(&mut self) {
        let mut left_deltas: Vec<(Value, Value, Delta)> = Vec::new();
        let mut right_deltas: Vec<(Value, Value, Delta)> = Vec::new();
        for batch in drain(&self.left) {
            for ((key, payload), delta) in batch {
                left_deltas.push((key, payload, delta));
            }
        }
        for batch in drain(&self.right) {
            for ((key, payload), delta) in batch {
                right_deltas.push((key, payload, delta));
            }
        }
        if left_deltas.is_empty() && right_deltas.is_empty() {
            return;
        }

        let mut touched: FnvHashSet<Value> = FnvHashSet::default();
        for (key, _, _) in left_deltas.iter().chain(right_deltas.iter()) {
            touched.insert(key.clone());
        }

        // Output difference per key: retract the key's old view, assert the
        // new one, and let consolidation cancel the overlap.
        let mut result = MultiSet::new();
        for key in &touched {
            for (record, delta) in self.key_output(key) {
                result.push(record, -delta);
            }
        }
        for (key, payload, delta) in left_deltas {
            apply_delta(&mut self.left_state, key, payload, delta);
        }
        for (key, payload, delta) in right_deltas {
            apply_delta(&mut self.right_state, key, payload, delta);
        }
        for key in &touched {
            for (record, delta) in self.key_output(key) {
                result.push(record, delta);
            }
        }
        self.output.send(result.consolidated());
    }
}

impl JoinOperator {
    /// The full output multiset for one join key under the current state.
    fn key_output(&self, key: &Value) -> Vec<(KeyedRow, Delta)> {
        let empty = FnvHashMap::default();
        let left = self.left_state.get(key).unwrap_or(&empty);
        let right = self.right_state.get(key).unwrap_or(&empty);
        let mut out = Vec::new();

        for (left_row, left_delta) in left {
            for (right_row, right_delta) in right {
                out.push((
                    (key.clone(), pair(left_row.clone(), right_row.clone())),
                    left_delta * right_delta,
                ));
            }
        }
        let pad_left = matches!(self.join_type, JoinType::Left | JoinType::Full);
        let pad_right = matches!(self.join_type, JoinType::Right | JoinType::Full);
        if pad_left && right.is_empty() {
            for (left_row, left_delta) in left {
                out.push(((key.clone(), pair(left_row.clone(), Value::Null)), *left_delta));
            }
        }
        if pad_right && left.is_empty() {
            for (right_row, right_delta) in right {
                out.push(((key.clone(), pair(Value::Null, right_row.clone())), *right_delta));
            }
        }
        out
    }
}

fn pair(left: Value, right: Value) -> Value {
    Value::Array(vec![left, right])
}

fn apply_delta(state: &mut SideState, key: Value, payload: Value, delta: Delta) {
    let rows = state.entry(key.clone()).or_default();
    let slot = rows.entry(payload).or_insert(0);
    *slot += delta;
    if *slot == 0 {
        let stale: Vec<Value> =
            rows.iter().filter(|(_, d)| **d == 0).map(|(v, _)| v.clone()).collect();
        for value in stale {
            rows.remove(&value);
        }
        if rows.is_empty() {
            state.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::GraphBuilder;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_join(
        join_type: JoinType,
        left: Vec<(i64, &str, isize)>,
        right: Vec<(i64, &str, isize)>,
    ) -> Vec<(KeyedRow, isize)> {
        let builder = GraphBuilder::new();
        let (left_in, left_stream) = builder.input();
        let (right_in, right_stream) = builder.input();
        let sink: Rc<RefCell<Vec<(KeyedRow, isize)>>> = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&sink);
        left_stream
            .join(&right_stream, join_type)
            .output(move |batch| captured.borrow_mut().extend(batch.into_updates()));
        let graph = builder.finish();

        for (key, row, delta) in left {
            left_in.update(Value::Int(key), Value::from(row), delta);
        }
        for (key, row, delta) in right {
            right_in.update(Value::Int(key), Value::from(row), delta);
        }
        graph.run();
        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        updates
    }

    fn matched(key: i64, left: &str, right: &str) -> KeyedRow {
        (Value::Int(key), pair(Value::from(left), Value::from(right)))
    }

    #[test]
    fn inner_join_matches_keys() {
        let got = run_join(
            JoinType::Inner,
            vec![(1, "l1", 1), (2, "l2", 1)],
            vec![(1, "r1", 1), (3, "r3", 1)],
        );
        assert_eq!(got, vec![(matched(1, "l1", "r1"), 1)]);
    }

    #[test]
    fn left_join_pads_and_retracts() {
        // Left row arrives first: padded output. The matching right row
        // then replaces the padded form.
        let got = run_join(JoinType::Left, vec![(1, "l1", 1)], vec![(1, "r1", 1)]);
        assert_eq!(got, vec![(matched(1, "l1", "r1"), 1)]);

        let got = run_join(JoinType::Left, vec![(1, "l1", 1), (2, "l2", 1)], vec![(1, "r1", 1)]);
        assert_eq!(
            got,
            vec![
                (matched(1, "l1", "r1"), 1),
                ((Value::Int(2), pair(Value::from("l2"), Value::Null)), 1),
            ]
        );
    }

    #[test]
    fn full_join_pads_both_sides() {
        let got = run_join(JoinType::Full, vec![(1, "l1", 1)], vec![(2, "r2", 1)]);
        assert_eq!(
            got,
            vec![
                ((Value::Int(1), pair(Value::from("l1"), Value::Null)), 1),
                ((Value::Int(2), pair(Value::Null, Value::from("r2"))), 1),
            ]
        );
    }

    #[test]
    fn retraction_restores_padding() {
        let got = run_join(
            JoinType::Left,
            vec![(1, "l1", 1)],
            vec![(1, "r1", 1), (1, "r1", -1)],
        );
        assert_eq!(
            got,
            vec![((Value::Int(1), pair(Value::from("l1"), Value::Null)), 1)]
        );
    }

    #[test]
    fn right_join_mirrors_left() {
        let got = run_join(JoinType::Right, vec![(1, "l1", 1)], vec![(2, "r2", 1)]);
        assert_eq!(
            got,
            vec![((Value::Int(2), pair(Value::Null, Value::from("r2"))), 1)]
        );
    }
}
