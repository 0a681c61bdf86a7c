//! A push-driven incremental dataflow graph over keyed multisets.
//!
//! The graph is single-threaded and cooperative: inputs enqueue batches of
//! weighted `(key, payload)` updates, operators drain their queues when the
//! graph runs, and `run` loops until no operator has pending work. Operators
//! are written in a collection-oriented style: each consumes update batches
//! and emits update batches whose multiplicities describe insertions and
//! retractions of derived records.

pub mod distinct;
pub mod join;
pub mod orderby;
pub mod reduce;

pub use distinct::DistinctExt;
pub use join::JoinExt;
pub use orderby::{OrderByExt, OrderByOptions, WindowHandle};
pub use reduce::{AggregateSpec, ReduceExt};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::multiset::MultiSet;
use crate::value::Value;

/// The record type every edge carries: `(key, payload)`.
pub type KeyedRow = (Value, Value);

/// A batch queue between an upstream tee and a downstream operator.
pub type Port = Rc<RefCell<VecDeque<MultiSet<KeyedRow>>>>;

/// The fan-out point of an operator or input: batches pushed here are
/// cloned into every connected port.
#[derive(Clone, Default)]
pub struct Tee {
    ports: Rc<RefCell<Vec<Port>>>,
}

impl Tee {
    /// A new tee with no subscribers.
    pub fn new() -> Self {
        Tee::default()
    }

    /// Attach and return a fresh downstream port.
    pub fn connect(&self) -> Port {
        let port: Port = Rc::new(RefCell::new(VecDeque::new()));
        self.ports.borrow_mut().push(Rc::clone(&port));
        port
    }

    /// Deliver a batch to every subscriber.
    pub fn send(&self, batch: MultiSet<KeyedRow>) {
        if batch.is_empty() {
            return;
        }
        let ports = self.ports.borrow();
        match ports.split_last() {
            Some((last, rest)) => {
                for port in rest {
                    port.borrow_mut().push_back(batch.clone());
                }
                last.borrow_mut().push_back(batch);
            }
            None => {}
        }
    }
}

/// A node in the graph.
pub trait Operator {
    /// True when the node has queued input or internal work.
    fn pending_work(&self) -> bool;
    /// Drain queued input, update state, emit derived batches.
    fn run(&mut self);
}

#[derive(Default)]
struct GraphState {
    operators: Vec<Box<dyn Operator>>,
}

/// Builds a dataflow graph; cheap to clone and hand to builder extensions.
#[derive(Clone, Default)]
pub struct GraphBuilder {
    state: Rc<RefCell<GraphState>>,
}

impl GraphBuilder {
    /// A fresh builder.
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    /// Register an operator node.
    pub fn add_operator(&self, operator: Box<dyn Operator>) {
        self.state.borrow_mut().operators.push(operator);
    }

    /// A new input: a handle to feed batches and the stream they appear on.
    pub fn input(&self) -> (InputHandle, Stream) {
        let tee = Tee::new();
        let handle = InputHandle { tee: tee.clone() };
        (handle, Stream { tee, builder: self.clone() })
    }

    /// Finalize into a runnable graph. The builder may keep wiring
    /// afterwards; the graph sees operators added later.
    pub fn finish(&self) -> Graph {
        Graph { state: Rc::clone(&self.state) }
    }
}

/// Feeds update batches into the graph.
#[derive(Clone)]
pub struct InputHandle {
    tee: Tee,
}

impl InputHandle {
    /// Send a batch of updates.
    pub fn send(&self, batch: MultiSet<KeyedRow>) {
        self.tee.send(batch);
    }

    /// Send a single update.
    pub fn update(&self, key: Value, payload: Value, delta: isize) {
        let mut batch = MultiSet::new();
        batch.push((key, payload), delta);
        self.tee.send(batch);
    }
}

/// A stream of update batches an operator can be attached to.
#[derive(Clone)]
pub struct Stream {
    pub(crate) tee: Tee,
    pub(crate) builder: GraphBuilder,
}

impl Stream {
    /// Attach a port receiving this stream's batches.
    pub fn connect(&self) -> Port {
        self.tee.connect()
    }

    /// The builder this stream belongs to.
    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    /// A derived stream fed by a new operator; wiring helper for the
    /// operator modules.
    pub fn derived(&self) -> (Tee, Stream) {
        let tee = Tee::new();
        (tee.clone(), Stream { tee, builder: self.builder.clone() })
    }

    /// Element-wise transform preserving multiplicities.
    pub fn map(&self, logic: impl FnMut(KeyedRow) -> KeyedRow + 'static) -> Stream {
        let input = self.connect();
        let (output, stream) = self.derived();
        self.builder.add_operator(Box::new(MapOperator { input, output, logic: Box::new(logic) }));
        stream
    }

    /// Element-wise filter preserving multiplicities.
    pub fn filter(&self, predicate: impl FnMut(&KeyedRow) -> bool + 'static) -> Stream {
        let input = self.connect();
        let (output, stream) = self.derived();
        self.builder.add_operator(Box::new(FilterOperator {
            input,
            output,
            predicate: Box::new(predicate),
        }));
        stream
    }

    /// Observe batches without disturbing them; the hook runs before the
    /// batch is forwarded.
    pub fn tap(&self, hook: impl FnMut(&MultiSet<KeyedRow>) + 'static) -> Stream {
        let input = self.connect();
        let (output, stream) = self.derived();
        self.builder.add_operator(Box::new(TapOperator { input, output, hook: Box::new(hook) }));
        stream
    }

    /// Terminal sink: the consumer receives each drained batch.
    pub fn output(&self, consumer: impl FnMut(MultiSet<KeyedRow>) + 'static) {
        let input = self.connect();
        self.builder.add_operator(Box::new(OutputOperator { input, consumer: Box::new(consumer) }));
    }
}

/// A runnable dataflow graph.
#[derive(Clone)]
pub struct Graph {
    state: Rc<RefCell<GraphState>>,
}

impl Graph {
    /// True when any operator has queued work.
    pub fn pending_work(&self) -> bool {
        self.state.borrow().operators.iter().any(|op| op.pending_work())
    }

    /// Fire all enqueued work until no operator reports more.
    ///
    /// Tap hooks may enqueue further input while the graph runs; the loop
    /// keeps draining until the graph is quiet.
    pub fn run(&self) {
        loop {
            let mut progressed = false;
            let mut state = self.state.borrow_mut();
            for operator in state.operators.iter_mut() {
                if operator.pending_work() {
                    operator.run();
                    progressed = true;
                }
            }
            drop(state);
            if !progressed {
                break;
            }
        }
    }
}

pub(crate) fn drain(port: &Port) -> Vec<MultiSet<KeyedRow>> {
    port.borrow_mut().drain(..).collect()
}

struct MapOperator {
    input: Port,
    output: Tee,
    logic: Box<dyn FnMut(KeyedRow) -> KeyedRow>,
}

impl Operator for MapOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        for batch in drain(&self.input) {
            self.output.send(batch.map(&mut self.logic));
        }
    }
}

struct FilterOperator {
    input: Port,
    output: Tee,
    predicate: Box<dyn FnMut(&KeyedRow) -> bool>,
}

impl Operator for FilterOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        for batch in drain(&self.input) {
            self.output.send(batch.filter(&mut self.predicate));
        }
    }
}

struct TapOperator {
    input: Port,
    output: Tee,
    hook: Box<dyn FnMut(&MultiSet<KeyedRow>)>,
}

impl Operator for TapOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        for batch in drain(&self.input) {
            (self.hook)(&batch);
            self.output.send(batch);
        }
    }
}

struct OutputOperator {
    input: Port,
    consumer: Box<dyn FnMut(MultiSet<KeyedRow>)>,
}

impl Operator for OutputOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty()
    }

    fn run(&mut self) {
        for batch in drain(&self.input) {
            (self.consumer)(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn collect(sink: &Rc<RefCell<Vec<(KeyedRow, isize)>>>) -> Vec<(KeyedRow, isize)> {
        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        updates
    }

    #[test]
    fn map_filter_output() {
        let builder = GraphBuilder::new();
        let (input, stream) = builder.input();
        let sink: Rc<RefCell<Vec<(KeyedRow, isize)>>> = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&sink);
        stream
            .map(|(key, payload)| {
                let doubled = match payload {
                    Value::Int(i) => Value::Int(i * 2),
                    other => other,
                };
                (key, doubled)
            })
            .filter(|(_, payload)| matches!(payload, Value::Int(i) if *i > 2))
            .output(move |batch| captured.borrow_mut().extend(batch.into_updates()));
        let graph = builder.finish();

        input.update(Value::Int(1), Value::Int(1), 1);
        input.update(Value::Int(2), Value::Int(2), 1);
        input.update(Value::Int(2), Value::Int(2), -1);
        input.update(Value::Int(3), Value::Int(3), 1);
        assert!(graph.pending_work());
        graph.run();
        assert!(!graph.pending_work());

        assert_eq!(
            collect(&sink),
            vec![((Value::Int(3), Value::Int(6)), 1)]
        );
    }

    #[test]
    fn tap_observes_batches() {
        let builder = GraphBuilder::new();
        let (input, stream) = builder.input();
        let seen = Rc::new(RefCell::new(0usize));
        let counter = Rc::clone(&seen);
        stream.tap(move |batch| *counter.borrow_mut() += batch.len()).output(|_| {});
        let graph = builder.finish();

        input.update(Value::Int(1), Value::Null, 1);
        input.update(Value::Int(2), Value::Null, 1);
        graph.run();
        assert_eq!(*seen.borrow(), 2);
    }
}
