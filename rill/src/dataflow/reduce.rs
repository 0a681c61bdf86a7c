//! Group records by key and maintain aggregate rows incrementally.
//!
//! The operator buckets payloads by record key and emits one derived row per
//! non-empty bucket. `sum`, `count`, and `avg` are maintained as running
//! `(sum, count)` pairs updated in place by each delta; `min` and `max` are
//! recomputed from the bucket's stored multiset when it is disturbed, since
//! a retraction can expose a new extreme.

use std::collections::BTreeMap;
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::dataflow::{drain, Operator, Port, Stream, Tee};
use crate::difference::{DiffPair, Semigroup};
use crate::expr::AggregateFunction;
use crate::multiset::{Delta, MultiSet};
use crate::value::Value;

/// One aggregate column: its output name, the function, and the extractor
/// producing the aggregated value from a payload row.
#[derive(Clone)]
pub struct AggregateSpec {
    /// Output field name.
    pub name: String,
    /// Which aggregate.
    pub function: AggregateFunction,
    /// Evaluates the aggregated expression against a payload row.
    pub extract: Rc<dyn Fn(&Value) -> Value>,
}

/// Builds the emitted row for a group from a representative payload and the
/// computed aggregate values.
pub type RowBuilder = Rc<dyn Fn(&Value, &BTreeMap<String, Value>) -> Value>;

/// The group-by method on keyed streams.
pub trait ReduceExt {
    /// Group by the record key, maintaining `aggregates` per group. For
    /// each non-empty group, `build_row` shapes the emitted payload from
    /// the group's smallest payload (a deterministic representative) and
    /// the aggregate values.
    fn reduce(&self, aggregates: Vec<AggregateSpec>, build_row: RowBuilder) -> Stream;
}

impl ReduceExt for Stream {
    fn reduce(&self, aggregates: Vec<AggregateSpec>, build_row: RowBuilder) -> Stream {
        let input = self.connect();
        let (output, stream) = self.derived();
        self.builder().add_operator(Box::new(ReduceOperator {
            input,
            output,
            aggregates,
            build_row,
            groups: FnvHashMap::default(),
            emitted: FnvHashMap::default(),
        }));
        stream
    }
}

#[derive(Default)]
struct GroupState {
    /// Multiset of payload rows in the group.
    rows: BTreeMap<Value, Delta>,
    /// Running `(sum, count)` per sum/count/avg aggregate, by index.
    running: Vec<DiffPair<f64, i64>>,
}

struct ReduceOperator {
    input: Port,
    output: Tee,
    aggregates: Vec<AggregateSpec>,
    build_row: RowBuilder,
    groups: FnvHashMap<Value, GroupState>,
    emitted: FnvHashMap<Value, Value>,
}

impl Operator for ReduceOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        let mut touched: FnvHashSet<Value> = FnvHashSet::default();
        for batch in drain(&self.input) {
            for ((key, payload), delta) in batch {
                touched.insert(key.clone());
                let group = self.groups.entry(key).or_insert_with(|| GroupState {
                    rows: BTreeMap::new(),
                    running: vec![DiffPair::new(0.0, 0); self.aggregates.len()],
                });
                for (index, spec) in self.aggregates.iter().enumerate() {
                    if matches!(
                        spec.function,
                        AggregateFunction::Sum | AggregateFunction::Count | AggregateFunction::Avg
                    ) {
                        let value =
                            (spec.extract)(&payload).as_number().unwrap_or(0.0);
                        group.running[index].plus_equals(&DiffPair::new(
                            value * delta as f64,
                            delta as i64,
                        ));
                    }
                }
                let slot = group.rows.entry(payload).or_insert(0);
                *slot += delta;
                if *slot == 0 {
                    let empty: Vec<Value> = group
                        .rows
                        .iter()
                        .filter(|(_, d)| **d == 0)
                        .map(|(v, _)| v.clone())
                        .collect();
                    for value in empty {
                        group.rows.remove(&value);
                    }
                }
            }
        }

        let mut result = MultiSet::new();
        for key in touched {
            let previous = self.emitted.get(&key).cloned();
            let next = self.group_row(&key);
            if previous == next {
                continue;
            }
            if let Some(previous) = previous {
                result.push((key.clone(), previous), -1);
            }
            match next {
                Some(next) => {
                    self.emitted.insert(key.clone(), next.clone());
                    result.push((key, next), 1);
                }
                None => {
                    self.emitted.remove(&key);
                    self.groups.remove(&key);
                }
            }
        }
        self.output.send(result.consolidated());
    }
}

impl ReduceOperator {
    /// The emitted payload for a group, or `None` for an empty group.
    fn group_row(&self, key: &Value) -> Option<Value> {
        let group = self.groups.get(key)?;
        let representative = group.rows.iter().find(|(_, d)| **d > 0).map(|(v, _)| v)?;
        let mut values = BTreeMap::new();
        for (index, spec) in self.aggregates.iter().enumerate() {
            let value = match spec.function {
                AggregateFunction::Count => Value::Int(group.running[index].element2),
                AggregateFunction::Sum => float_value(group.running[index].element1),
                AggregateFunction::Avg => {
                    let count = group.running[index].element2;
                    if count == 0 {
                        Value::Null
                    } else {
                        Value::Float(group.running[index].element1 / count as f64)
                    }
                }
                AggregateFunction::Min => self.extreme(group, spec, true),
                AggregateFunction::Max => self.extreme(group, spec, false),
            };
            values.insert(spec.name.clone(), value);
        }
        Some((self.build_row)(representative, &values))
    }

    fn extreme(&self, group: &GroupState, spec: &AggregateSpec, min: bool) -> Value {
        let mut best: Option<Value> = None;
        for (row, delta) in &group.rows {
            if *delta <= 0 {
                continue;
            }
            let value = (spec.extract)(row);
            if value.is_nullish() {
                continue;
            }
            best = match best {
                None => Some(value),
                Some(current) => {
                    let replace = if min { value < current } else { value > current };
                    Some(if replace { value } else { current })
                }
            };
        }
        best.unwrap_or(Value::Null)
    }
}

/// Sums over integers stay integral when nothing fractional contributed.
fn float_value(sum: f64) -> Value {
    if sum.fract() == 0.0 && sum.abs() < (i64::MAX as f64) {
        Value::Int(sum as i64)
    } else {
        Value::Float(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::{GraphBuilder, KeyedRow};
    use crate::expr::dsl::col;
    use crate::expr::eval;
    use crate::object;
    use std::cell::RefCell;

    fn spec(name: &str, function: AggregateFunction, field: &str) -> AggregateSpec {
        let compiled = eval::compile_single_row(&col(field)).unwrap();
        AggregateSpec {
            name: name.to_string(),
            function,
            extract: Rc::new(move |row| compiled(row)),
        }
    }

    fn agg_row_builder() -> RowBuilder {
        Rc::new(|_, values| Value::Object(values.clone()))
    }

    fn harness(
        aggregates: Vec<AggregateSpec>,
    ) -> (crate::dataflow::InputHandle, crate::dataflow::Graph, Rc<RefCell<Vec<(KeyedRow, isize)>>>)
    {
        let builder = GraphBuilder::new();
        let (input, stream) = builder.input();
        let sink: Rc<RefCell<Vec<(KeyedRow, isize)>>> = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&sink);
        stream
            .reduce(aggregates, agg_row_builder())
            .output(move |batch| captured.borrow_mut().extend(batch.into_updates()));
        (input, builder.finish(), sink)
    }

    #[test]
    fn sums_and_counts_accumulate() {
        let (input, graph, sink) = harness(vec![
            spec("total", AggregateFunction::Sum, "v"),
            spec("n", AggregateFunction::Count, "v"),
        ]);
        input.update(Value::from("g"), object![("v", 2)], 1);
        input.update(Value::from("g"), object![("v", 3)], 1);
        graph.run();
        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        assert_eq!(
            updates,
            vec![((Value::from("g"), object![("n", 2), ("total", 5)]), 1)]
        );
    }

    #[test]
    fn retraction_updates_extremes() {
        let (input, graph, sink) = harness(vec![spec("best", AggregateFunction::Max, "v")]);
        input.update(Value::from("g"), object![("v", 9)], 1);
        input.update(Value::from("g"), object![("v", 4)], 1);
        graph.run();
        input.update(Value::from("g"), object![("v", 9)], -1);
        graph.run();

        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        assert_eq!(
            updates,
            vec![((Value::from("g"), object![("best", 4)]), 1)]
        );
    }

    #[test]
    fn empty_group_retracts_output() {
        let (input, graph, sink) = harness(vec![spec("n", AggregateFunction::Count, "v")]);
        input.update(Value::from("g"), object![("v", 1)], 1);
        graph.run();
        input.update(Value::from("g"), object![("v", 1)], -1);
        graph.run();

        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        assert!(updates.is_empty());
    }

    #[test]
    fn average_ignores_group_shrink() {
        let (input, graph, sink) = harness(vec![spec("mean", AggregateFunction::Avg, "v")]);
        input.update(Value::from("g"), object![("v", 1)], 1);
        input.update(Value::from("g"), object![("v", 3)], 1);
        graph.run();
        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        assert_eq!(
            updates,
            vec![((Value::from("g"), object![("mean", 2.0)]), 1)]
        );
    }
}
