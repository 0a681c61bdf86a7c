//! Maintain a sorted, windowed view with fractional ordering tokens.
//!
//! Rows are ordered by an extracted sort value (ties broken by row key) in a
//! B+ tree, and the window `[offset, offset+limit)` of that order is emitted
//! with a fractional index token per row. Tokens are assigned between the
//! tokens of retained neighbors, so an insertion in the middle of the window
//! disturbs only the inserted row. The window can be moved after the fact
//! through a handle; the next run re-emits the ordered difference without
//! rebuilding the graph.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use fnv::FnvHashMap;

use crate::dataflow::{drain, Operator, Port, Stream, Tee};
use crate::fractional::key_between;
use crate::multiset::MultiSet;
use crate::tree::Tree;
use crate::value::Value;

/// Options for an ordered window.
#[derive(Clone)]
pub struct OrderByOptions {
    /// Window length; `None` means unbounded.
    pub limit: Option<usize>,
    /// Rows skipped before the window starts.
    pub offset: usize,
    /// Comparator over extracted sort values.
    pub comparator: Rc<dyn Fn(&Value, &Value) -> Ordering>,
    /// Invoked with the emitted window size after every run, so a driver can
    /// notice an under-filled window and load more upstream data.
    pub size_callback: Option<Rc<dyn Fn(usize)>>,
}

/// Moves the window of a running ordered operator.
#[derive(Clone)]
pub struct WindowHandle {
    state: Rc<RefCell<WindowState>>,
}

impl WindowHandle {
    /// Request a new `(offset, limit)`; takes effect on the next graph run.
    pub fn set_window(&self, offset: usize, limit: Option<usize>) {
        let mut state = self.state.borrow_mut();
        state.offset = offset;
        state.limit = limit;
        state.moved = true;
    }

    /// The current `(offset, limit)`.
    pub fn window(&self) -> (usize, Option<usize>) {
        let state = self.state.borrow();
        (state.offset, state.limit)
    }
}

struct WindowState {
    offset: usize,
    limit: Option<usize>,
    moved: bool,
}

/// The ordered-window method on keyed streams.
pub trait OrderByExt {
    /// Order payloads by `extract`, emit the configured window as
    /// `(key, [payload, token])` records, and return a handle that can move
    /// the window later.
    fn order_by(&self, extract: Rc<dyn Fn(&Value) -> Value>, options: OrderByOptions)
        -> (Stream, WindowHandle);
}

impl OrderByExt for Stream {
    fn order_by(
        &self,
        extract: Rc<dyn Fn(&Value) -> Value>,
        options: OrderByOptions,
    ) -> (Stream, WindowHandle) {
        let input = self.connect();
        let (output, stream) = self.derived();
        let window = Rc::new(RefCell::new(WindowState {
            offset: options.offset,
            limit: options.limit,
            moved: false,
        }));
        let handle = WindowHandle { state: Rc::clone(&window) };

        let value_cmp = Rc::clone(&options.comparator);
        // Composite order: the extracted sort value first, the row key as a
        // deterministic tie-break.
        let composite_cmp: Rc<dyn Fn(&(Value, Value), &(Value, Value)) -> Ordering> =
            Rc::new(move |a, b| value_cmp(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));

        self.builder().add_operator(Box::new(OrderByOperator {
            input,
            output,
            extract,
            window,
            size_callback: options.size_callback,
            rows: FnvHashMap::default(),
            tree: Tree::new(composite_cmp),
            emitted: Vec::new(),
        }));
        (stream, handle)
    }
}

/// One currently emitted row.
#[derive(Clone)]
struct Emitted {
    sort: Value,
    key: Value,
    payload: Value,
    token: String,
}

struct OrderByOperator {
    input: Port,
    output: Tee,
    extract: Rc<dyn Fn(&Value) -> Value>,
    window: Rc<RefCell<WindowState>>,
    size_callback: Option<Rc<dyn Fn(usize)>>,
    /// Current payload and sort value per row key.
    rows: FnvHashMap<Value, (Value, Value)>,
    /// All rows in composite order.
    tree: Tree<(Value, Value), Value>,
    /// The window as last emitted, in composite order.
    emitted: Vec<Emitted>,
}

impl Operator for OrderByOperator {
    fn pending_work(&self) -> bool {
        !self.input.borrow().is_empty() || self.window.borrow().moved
    }

    fn run(&mut self) {
        for batch in drain(&self.input) {
            for ((key, payload), delta) in batch {
                if delta > 0 {
                    let sort = (self.extract)(&payload);
                    if let Some((old_sort, _)) = self.rows.remove(&key) {
                        self.tree.delete(&(old_sort, key.clone()));
                    }
                    self.tree.set((sort.clone(), key.clone()), payload.clone(), true);
                    self.rows.insert(key, (sort, payload));
                } else if delta < 0 {
                    if let Some((old_sort, old_payload)) = self.rows.get(&key) {
                        // Only retract the payload we actually hold; stale
                        // retractions for replaced rows are no-ops.
                        if *old_payload == payload {
                            let composite = (old_sort.clone(), key.clone());
                            self.tree.delete(&composite);
                            self.rows.remove(&key);
                        }
                    }
                }
            }
        }

        let (offset, limit) = {
            let mut window = self.window.borrow_mut();
            window.moved = false;
            (window.offset, window.limit)
        };

        // The target window, in composite order.
        let mut target: Vec<(Value, Value, Value)> = Vec::new();
        let end = limit.map(|l| offset.saturating_add(l));
        self.tree.scan(None, None, true, |composite, payload, count| {
            if count >= offset {
                target.push((composite.0.clone(), composite.1.clone(), payload.clone()));
            }
            match end {
                Some(end) => count + 1 >= end,
                None => false,
            }
        });

        let result = self.diff_window(target);
        self.output.send(result);
        if let Some(callback) = &self.size_callback {
            callback(self.emitted.len());
        }
    }
}

impl OrderByOperator {
    /// Reconcile the emitted window with `target`, assigning tokens to
    /// entrants between the tokens of retained neighbors.
    fn diff_window(&mut self, target: Vec<(Value, Value, Value)>) -> MultiSet<(Value, Value)> {
        let mut result = MultiSet::new();

        // Retained rows are identified by (sort, key); their relative order
        // never changes, so their tokens stay valid.
        let mut retained: FnvHashMap<(Value, Value), Emitted> = FnvHashMap::default();
        let target_identity: std::collections::HashSet<(Value, Value)> = target
            .iter()
            .map(|(sort, key, _)| (sort.clone(), key.clone()))
            .collect();
        for old in self.emitted.drain(..) {
            let identity = (old.sort.clone(), old.key.clone());
            if target_identity.contains(&identity) {
                retained.insert(identity, old);
            } else {
                result.push((old.key, ordered_payload(old.payload, &old.token)), -1);
            }
        }

        // Upper token bound for each position: the token of the nearest
        // retained row at or after it.
        let mut next_tokens: Vec<Option<String>> = vec![None; target.len()];
        let mut upcoming: Option<String> = None;
        for index in (0..target.len()).rev() {
            next_tokens[index] = upcoming.clone();
            let identity = (target[index].0.clone(), target[index].1.clone());
            if let Some(kept) = retained.get(&identity) {
                upcoming = Some(kept.token.clone());
            }
        }

        let mut previous_token: Option<String> = None;
        let mut emitted = Vec::with_capacity(target.len());
        for (index, (sort, key, payload)) in target.into_iter().enumerate() {
            let identity = (sort.clone(), key.clone());
            let token = match retained.remove(&identity) {
                Some(kept) => {
                    if kept.payload != payload {
                        result.push(
                            (key.clone(), ordered_payload(kept.payload, &kept.token)),
                            -1,
                        );
                        result.push((key.clone(), ordered_payload(payload.clone(), &kept.token)), 1);
                    }
                    kept.token
                }
                None => {
                    let next = next_tokens[index].as_deref();
                    let token = key_between(previous_token.as_deref(), next);
                    result.push((key.clone(), ordered_payload(payload.clone(), &token)), 1);
                    token
                }
            };
            previous_token = Some(token.clone());
            emitted.push(Emitted { sort, key, payload, token });
        }
        self.emitted = emitted;
        result.consolidated()
    }
}

/// The emitted payload shape: `[row, fractional-index]`.
fn ordered_payload(payload: Value, token: &str) -> Value {
    Value::Array(vec![payload, Value::String(token.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::{GraphBuilder, KeyedRow};
    use crate::object;
    use std::cell::RefCell;

    fn harness(
        offset: usize,
        limit: Option<usize>,
    ) -> (
        crate::dataflow::InputHandle,
        crate::dataflow::Graph,
        WindowHandle,
        Rc<RefCell<Vec<(KeyedRow, isize)>>>,
    ) {
        let builder = GraphBuilder::new();
        let (input, stream) = builder.input();
        let sink: Rc<RefCell<Vec<(KeyedRow, isize)>>> = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&sink);
        let extract: Rc<dyn Fn(&Value) -> Value> = Rc::new(|row| row.field("t").clone());
        let (ordered, window) = stream.order_by(
            extract,
            OrderByOptions {
                limit,
                offset,
                comparator: Rc::new(|a, b| a.cmp(b)),
                size_callback: None,
            },
        );
        ordered.output(move |batch| captured.borrow_mut().extend(batch.into_updates()));
        (input, builder.finish(), window, sink)
    }

    /// The currently asserted window: key -> (row, token), consolidated.
    fn visible(sink: &Rc<RefCell<Vec<(KeyedRow, isize)>>>) -> Vec<(Value, Value, String)> {
        let mut updates = sink.borrow().clone();
        crate::consolidation::consolidate(&mut updates);
        let mut rows: Vec<(Value, Value, String)> = updates
            .into_iter()
            .map(|((key, payload), delta)| {
                assert_eq!(delta, 1, "window rows are asserted at most once");
                let items = match payload {
                    Value::Array(items) => items,
                    other => panic!("unexpected payload {other:?}"),
                };
                let token = match &items[1] {
                    Value::String(token) => token.clone(),
                    other => panic!("unexpected token {other:?}"),
                };
                (key, items[0].clone(), token)
            })
            .collect();
        rows.sort_by(|a, b| a.2.cmp(&b.2));
        rows
    }

    #[test]
    fn window_emits_in_order() {
        let (input, graph, _, sink) = harness(0, Some(3));
        for (key, t) in [(1i64, 30i64), (2, 10), (3, 20), (4, 40)] {
            input.update(Value::Int(key), object![("t", t)], 1);
        }
        graph.run();
        let rows = visible(&sink);
        let keys: Vec<&Value> = rows.iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![&Value::Int(2), &Value::Int(3), &Value::Int(1)]);
    }

    #[test]
    fn mid_window_insert_touches_one_row() {
        let (input, graph, _, sink) = harness(0, Some(10));
        for (key, t) in [(1i64, 10i64), (2, 30)] {
            input.update(Value::Int(key), object![("t", t)], 1);
        }
        graph.run();
        sink.borrow_mut().clear();

        input.update(Value::Int(3), object![("t", 20)], 1);
        graph.run();
        // Only the inserted row is disturbed.
        assert_eq!(sink.borrow().len(), 1);
        let rows = visible(&sink);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, Value::Int(3));
    }

    #[test]
    fn window_move_re_emits_diffs() {
        let (input, graph, window, sink) = harness(0, Some(2));
        for key in 0..6i64 {
            input.update(Value::Int(key), object![("t", key * 10)], 1);
        }
        graph.run();
        let rows = visible(&sink);
        let keys: Vec<&Value> = rows.iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![&Value::Int(0), &Value::Int(1)]);

        window.set_window(2, Some(2));
        assert!(graph.pending_work());
        graph.run();
        let rows = visible(&sink);
        let keys: Vec<&Value> = rows.iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![&Value::Int(2), &Value::Int(3)]);
    }

    #[test]
    fn deletion_pulls_next_row_into_window() {
        let (input, graph, _, sink) = harness(0, Some(2));
        for key in 1..=3i64 {
            input.update(Value::Int(key), object![("t", key)], 1);
        }
        graph.run();
        input.update(Value::Int(1), object![("t", 1)], -1);
        graph.run();
        let rows = visible(&sink);
        let keys: Vec<&Value> = rows.iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![&Value::Int(2), &Value::Int(3)]);
    }
}
