//! Collapse record multiplicities to zero or one.

use fnv::FnvHashMap;

use crate::dataflow::{drain, KeyedRow, Operator, Port, Stream, Tee};
use crate::multiset::{Delta, MultiSet};

/// The distinct method on keyed streams.
pub trait DistinctExt {
    /// Emit each record at most once regardless of its input multiplicity;
    /// a record whose accumulated multiplicity returns to zero is retracted.
    fn distinct(&self) -> Stream;
}

impl DistinctExt for Stream {
    fn distinct(&self) -> Stream {
        let input = self.connect();
        let (output, stream) = self.derived();
        self.builder().add_operator(Box::new(DistinctOperator {
            input,
            output,
            state: FnvHashMap::default(),
        }));
        stream
    }
}

struct DistinctOperator {
    input: Port,
    output: Tee,
    state: FnvHashMap<KeyedRow, Delta>,
}

impl Operator for DistinctOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        let mut result = MultiSet::new();
        for batch in drain(&self.input) {
            for (record, delta) in batch {
                let slot = self.state.entry(record.clone()).or_insert(0);
                let before = (*slot > 0) as Delta;
                *slot += delta;
                let after = (*slot > 0) as Delta;
                if *slot == 0 {
                    self.state.remove(&record);
                }
                if after != before {
                    result.push(record, after - before);
                }
            }
        }
        self.output.send(result.consolidated());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::GraphBuilder;
    use crate::value::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn multiplicities_collapse() {
        let builder = GraphBuilder::new();
        let (input, stream) = builder.input();
        let sink: Rc<RefCell<Vec<(KeyedRow, isize)>>> = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&sink);
        stream
            .distinct()
            .output(move |batch| captured.borrow_mut().extend(batch.into_updates()));
        let graph = builder.finish();

        input.update(Value::Int(1), Value::from("a"), 3);
        input.update(Value::Int(2), Value::from("b"), 1);
        graph.run();
        input.update(Value::Int(1), Value::from("a"), -3);
        graph.run();

        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        assert_eq!(updates, vec![((Value::Int(2), Value::from("b")), 1)]);
    }
}
