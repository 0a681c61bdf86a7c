//! Lowering of optimized queries onto the change pipeline.
//!
//! Compilation turns a query node into a dataflow subgraph: one input per
//! source alias feeding namespaced rows, hash joins keyed by the equality
//! condition's sides, filters for the remaining where clauses, projection,
//! grouping, distinct, and finally an ordered window when the query sorts.
//! Subquery sources compile recursively (with their order-by tokens
//! stripped) and equivalent subqueries are reused through a cache keyed on
//! the query value.

pub mod group;
pub mod order;
pub mod select;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::Rc;

use fnv::FnvHashSet;
use tracing::debug;

use crate::collection::resolve_collection;
use crate::dataflow::{
    DistinctExt, GraphBuilder, InputHandle, JoinExt, OrderByExt, OrderByOptions, ReduceExt, Stream,
    WindowHandle,
};
use crate::dataflow::reduce::AggregateSpec;
use crate::errors::{Error, Result};
use crate::expr::eval;
use crate::expr::{Expr, Function, JoinType, OrderByClause, Query};
use crate::optimize::{self, SourceFilters};
use crate::value::Value;

/// Callback asked to lazily load join keys for an on-demand source:
/// `(input key, single-row field expression, new join keys)`.
pub type LazyLoadFn = Rc<dyn Fn(&str, &Expr, &[Value])>;

/// Shared slot the runtime fills with its lazy loader after compilation.
pub type LazyLoader = Rc<RefCell<Option<LazyLoadFn>>>;

/// The ordering contract of a compiled query's output.
#[derive(Clone)]
pub struct OrderedSpec {
    /// The order-by clauses as authored.
    pub clauses: Vec<OrderByClause>,
    /// Window length.
    pub limit: Option<usize>,
    /// Window start.
    pub offset: usize,
}

/// A query lowered onto a dataflow graph.
pub struct CompiledQuery {
    /// The main alias's backing collection, when the root source is a
    /// collection (possibly through flattened subqueries).
    pub collection_id: Option<String>,
    /// The final output stream: `(key, row)` pairs, or
    /// `(key, [row, fractional-index])` for ordered queries.
    pub stream: Stream,
    /// Per input key, the dataflow input to feed with source changes.
    pub inputs: HashMap<String, InputHandle>,
    /// Input key to backing collection id.
    pub alias_to_collection_id: HashMap<String, String>,
    /// Authored alias to the input key compilation chose for it.
    pub alias_remapping: HashMap<String, String>,
    /// Per input key, the predicate pushed down to the source subscription.
    pub source_where_clauses: SourceFilters,
    /// The window handle for ordered queries.
    pub window: Option<WindowHandle>,
    /// Ordering contract, when the query sorts.
    pub ordered: Option<OrderedSpec>,
    /// Slot for the runtime's lazy join loading callback.
    pub lazy_loader: LazyLoader,
}

/// Compile `query` into a dataflow subgraph on `builder`.
pub fn compile_query(query: &Query, builder: &GraphBuilder) -> Result<CompiledQuery> {
    let (optimized, filters) = optimize::optimize(query);
    let mut compiler = Compiler {
        builder: builder.clone(),
        inputs: HashMap::new(),
        alias_to_collection_id: HashMap::new(),
        alias_remapping: HashMap::new(),
        source_filters: SourceFilters::new(),
        subquery_cache: Vec::new(),
        lazy_loader: Rc::new(RefCell::new(None)),
    };
    let node = compiler.compile_node(&optimized, &filters)?;
    debug!(
        inputs = compiler.inputs.len(),
        ordered = node.ordered.is_some(),
        "query compiled"
    );
    Ok(CompiledQuery {
        collection_id: node.collection_id,
        stream: node.stream,
        inputs: compiler.inputs,
        alias_to_collection_id: compiler.alias_to_collection_id,
        alias_remapping: compiler.alias_remapping,
        source_where_clauses: compiler.source_filters,
        window: node.window,
        ordered: node.ordered,
        lazy_loader: compiler.lazy_loader,
    })
}

struct NodeOutput {
    stream: Stream,
    window: Option<WindowHandle>,
    ordered: Option<OrderedSpec>,
    main_alias: String,
    collection_id: Option<String>,
}

struct Compiler {
    builder: GraphBuilder,
    inputs: HashMap<String, InputHandle>,
    alias_to_collection_id: HashMap<String, String>,
    alias_remapping: HashMap<String, String>,
    source_filters: SourceFilters,
    subquery_cache: Vec<(Query, NodeHandle)>,
    lazy_loader: LazyLoader,
}

/// A cached subquery compilation: its output stream and main collection.
#[derive(Clone)]
struct NodeHandle {
    stream: Stream,
    collection_id: Option<String>,
    main_alias: String,
}

impl Compiler {
    fn compile_node(&mut self, query: &Query, filters: &SourceFilters) -> Result<NodeOutput> {
        let from = query.from.as_ref().ok_or(Error::QueryMustHaveFrom)?;
        let (main_alias, mut current, main_collection_id) =
            self.compile_source(from, filters)?;

        let mut available = vec![main_alias.clone()];
        for join in &query.join {
            current = self.compile_join(current, &available, join, filters)?;
            if let Some(alias) = join.from.source_alias() {
                available.push(alias.to_string());
            }
        }

        // Where clauses, residuals included, filter namespaced rows; host
        // row functions run after them.
        for clause in query.where_clauses.iter().chain(query.residual_where.iter()) {
            let predicate = eval::compile_predicate(clause, false)?;
            current = current.filter(move |(_, row)| predicate(row));
        }
        for row_fn in &query.fn_where {
            let row_fn = row_fn.clone();
            current = current.filter(move |(_, row)| row_fn.call(row).is_truthy());
        }

        if query.group_by.is_empty() && !query.having.is_empty() {
            return Err(Error::HavingRequiresGroupBy);
        }

        if !query.group_by.is_empty() {
            current = self.compile_group_by(current, query)?;
        } else if let Some(select_clause) = &query.select {
            let compiled = Rc::new(select::CompiledSelect::compile(select_clause, &[])?);
            current = current.map(move |(key, row)| (key, compiled.project(&row, None)));
        } else if query.join.is_empty() {
            // No projection over a single source: rows pass through
            // unwrapped rather than namespaced.
            let alias = main_alias.clone();
            current = current.map(move |(key, row)| {
                let unwrapped = row.field(&alias).clone();
                match unwrapped {
                    Value::Undefined => (key, row),
                    unwrapped => (key, unwrapped),
                }
            });
        }
        if let Some(fn_select) = &query.fn_select {
            let fn_select = fn_select.clone();
            current = current.map(move |(key, row)| (key, fn_select.call(&row)));
        }

        if query.distinct {
            if query.select.is_none() {
                return Err(Error::DistinctRequiresSelect);
            }
            // Distinct identity is the projected row itself.
            current = current.map(|(_, row)| (row.clone(), row)).distinct();
        }

        let mut window = None;
        let mut ordered = None;
        if query.order_by.is_empty() {
            if query.limit.is_some() || query.offset.is_some() {
                return Err(Error::LimitOffsetRequireOrderBy);
            }
        } else {
            let (extract, comparator) = order::compile_order(&query.order_by)?;
            let (stream, handle) = current.order_by(
                extract,
                OrderByOptions {
                    limit: query.limit,
                    offset: query.offset.unwrap_or(0),
                    comparator,
                    size_callback: None,
                },
            );
            current = stream;
            window = Some(handle);
            ordered = Some(OrderedSpec {
                clauses: query.order_by.clone(),
                limit: query.limit,
                offset: query.offset.unwrap_or(0),
            });
        }

        Ok(NodeOutput {
            stream: current,
            window,
            ordered,
            main_alias,
            collection_id: main_collection_id,
        })
    }

    /// Compile a source expression into `(alias, namespaced stream,
    /// backing collection id)`.
    fn compile_source(
        &mut self,
        source: &Expr,
        filters: &SourceFilters,
    ) -> Result<(String, Stream, Option<String>)> {
        match source {
            Expr::CollectionRef { id, alias } => {
                let input_key = self.register_input(alias, id);
                if let Some(filter) = filters.get(alias) {
                    self.source_filters.insert(input_key.clone(), filter.clone());
                }
                let (input, stream) = self.builder.input();
                self.inputs.insert(input_key, input);
                let alias = alias.clone();
                let namespaced = stream.map(move |(key, row)| {
                    let mut fields = BTreeMap::new();
                    fields.insert(alias.clone(), row);
                    (key, Value::Object(fields))
                });
                Ok((source.source_alias().unwrap_or_default().to_string(), namespaced, Some(id.clone())))
            }
            Expr::QueryRef { query, alias } => {
                let handle = self.compile_subquery(query)?;
                self.alias_remapping.insert(alias.clone(), handle.main_alias.clone());
                let alias_owned = alias.clone();
                let namespaced = handle.stream.map(move |(key, row)| {
                    let mut fields = BTreeMap::new();
                    fields.insert(alias_owned.clone(), row);
                    (key, Value::Object(fields))
                });
                Ok((alias.clone(), namespaced, handle.collection_id))
            }
            _ => Err(Error::UnsupportedFromType),
        }
    }

    /// Compile an inner query once per distinct shape, stripping ordered
    /// output down to plain rows.
    fn compile_subquery(&mut self, query: &Query) -> Result<NodeHandle> {
        if let Some((_, cached)) = self.subquery_cache.iter().find(|(known, _)| known == query) {
            return Ok(cached.clone());
        }
        if query.from.is_none() {
            return Err(Error::SubQueryMustHaveFrom);
        }
        let (inner, inner_filters) = optimize::optimize(query);
        let node = self.compile_node(&inner, &inner_filters)?;
        let stream = if node.ordered.is_some() {
            // Downstream consumers see rows, not ordering tokens.
            node.stream.map(|(key, payload)| match payload {
                Value::Array(mut items) if items.len() == 2 => (key, items.swap_remove(0)),
                other => (key, other),
            })
        } else {
            node.stream
        };
        let handle = NodeHandle {
            stream,
            collection_id: node.collection_id,
            main_alias: node.main_alias,
        };
        self.subquery_cache.push((query.clone(), handle.clone()));
        Ok(handle)
    }

    fn register_input(&mut self, alias: &str, collection_id: &str) -> String {
        let mut key = alias.to_string();
        let mut counter = 1;
        while self.inputs.contains_key(&key) {
            key = format!("{alias}#{counter}");
            counter += 1;
        }
        self.alias_to_collection_id.insert(key.clone(), collection_id.to_string());
        self.alias_remapping.insert(alias.to_string(), key.clone());
        key
    }

    fn compile_join(
        &mut self,
        current: Stream,
        available: &[String],
        join: &crate::expr::JoinClause,
        filters: &SourceFilters,
    ) -> Result<Stream> {
        let join_alias = join
            .from
            .source_alias()
            .ok_or(Error::UnsupportedJoinSource)?
            .to_string();
        let (_, right_stream, right_collection) = self.compile_source(&join.from, filters)?;

        // The join condition must be a single equality whose sides address
        // the two sides of the join.
        let Expr::Func { name: Function::Eq, args } = &join.on else {
            return Err(Error::JoinConditionMustBeEquality);
        };
        let (first, second) = match (args.first(), args.get(1)) {
            (Some(first), Some(second)) => (first, second),
            _ => return Err(Error::JoinConditionMustBeEquality),
        };
        let mut first_aliases = Vec::new();
        first.touched_aliases(&mut first_aliases);
        let mut second_aliases = Vec::new();
        second.touched_aliases(&mut second_aliases);
        if first_aliases.is_empty() || second_aliases.is_empty() {
            return Err(Error::JoinConditionSourceMismatch);
        }
        let first_is_new = first_aliases.contains(&join_alias);
        let second_is_new = second_aliases.contains(&join_alias);
        let (left_expr, right_expr) = match (first_is_new, second_is_new) {
            (true, true) => return Err(Error::JoinConditionSameSource),
            (false, true) => (first, second),
            (true, false) => (second, first),
            (false, false) => return Err(Error::JoinConditionSourceMismatch),
        };
        let mut left_aliases = Vec::new();
        left_expr.touched_aliases(&mut left_aliases);
        if left_aliases.iter().any(|alias| !available.contains(alias)) {
            return Err(Error::JoinSourceUnavailable("left"));
        }

        let left_key = eval::compile_namespaced(left_expr)?;
        let right_key = eval::compile_namespaced(right_expr)?;

        let left_keyed = current
            .map(move |(key, row)| (left_key(&row), Value::Array(vec![key, row])));
        let right_keyed = right_stream
            .map(move |(key, row)| (right_key(&row), Value::Array(vec![key, row])));

        // Lazy loading: the active side's join keys prompt snapshot loads
        // for the other side when that source is on-demand.
        let left_collection = self.collection_of(available.first().map(String::as_str));
        let (tap_left, tap_right) = match join.join_type {
            JoinType::Inner => {
                let left_size = left_collection
                    .as_deref()
                    .and_then(resolve_collection)
                    .map(|c| c.size())
                    .unwrap_or(usize::MAX);
                let right_size = right_collection
                    .as_deref()
                    .and_then(resolve_collection)
                    .map(|c| c.size())
                    .unwrap_or(usize::MAX);
                // The smaller side drives loading of the larger one.
                if left_size <= right_size {
                    (true, false)
                } else {
                    (false, true)
                }
            }
            JoinType::Left => (true, false),
            JoinType::Right => (false, true),
            JoinType::Full => (true, true),
        };
        let left_keyed = if tap_left {
            self.attach_lazy_tap(left_keyed, &join_alias, right_expr)
        } else {
            left_keyed
        };
        let right_keyed = if tap_right {
            let target = self
                .alias_remapping
                .get(available.first().map(String::as_str).unwrap_or_default())
                .cloned()
                .unwrap_or_else(|| available.first().cloned().unwrap_or_default());
            self.attach_lazy_tap_for(right_keyed, &target, left_expr)
        } else {
            right_keyed
        };

        let joined = left_keyed.join(&right_keyed, join.join_type);
        Ok(joined.map(|(_, pair)| {
            let (left, right) = match pair {
                Value::Array(mut items) if items.len() == 2 => {
                    let right = items.pop().expect("pair has two items");
                    let left = items.pop().expect("pair has two items");
                    (left, right)
                }
                other => (other, Value::Null),
            };
            let (left_key, left_ns) = split_keyed(left);
            let (right_key, right_ns) = split_keyed(right);
            let mut merged = BTreeMap::new();
            for side in [left_ns, right_ns].iter() {
                if let Some(fields) = side.as_object() {
                    for (name, value) in fields {
                        merged.insert(name.clone(), value.clone());
                    }
                }
            }
            (Value::Array(vec![left_key, right_key]), Value::Object(merged))
        }))
    }

    fn collection_of(&self, alias: Option<&str>) -> Option<String> {
        let alias = alias?;
        let key = self.alias_remapping.get(alias).map(String::as_str).unwrap_or(alias);
        self.alias_to_collection_id.get(key).cloned()
    }

    /// Tap a keyed stream, reporting newly seen join keys so the runtime
    /// can load matching rows into the lazy `target` alias.
    fn attach_lazy_tap(&self, stream: Stream, target_alias: &str, field: &Expr) -> Stream {
        let key = self
            .alias_remapping
            .get(target_alias)
            .cloned()
            .unwrap_or_else(|| target_alias.to_string());
        self.attach_lazy_tap_for(stream, &key, field)
    }

    fn attach_lazy_tap_for(&self, stream: Stream, target_key: &str, field: &Expr) -> Stream {
        let loader = Rc::clone(&self.lazy_loader);
        let target = target_key.to_string();
        let field = strip_leading_alias(field);
        let mut seen: FnvHashSet<Value> = FnvHashSet::default();
        stream.tap(move |batch| {
            let mut fresh = Vec::new();
            for ((join_key, _), delta) in batch.iter() {
                if *delta > 0 && seen.insert(join_key.clone()) {
                    fresh.push(join_key.clone());
                }
            }
            if fresh.is_empty() {
                return;
            }
            if let Some(callback) = loader.borrow().as_ref() {
                callback(&target, &field, &fresh);
            }
        })
    }

    fn compile_group_by(&mut self, current: Stream, query: &Query) -> Result<Stream> {
        let group_key = group::group_key_fn(&query.group_by)?;
        let keyed = current.map(move |(_, row)| (group_key(&row), row));

        let select_clause = query.select.clone().unwrap_or_default();
        let aggregates = group::aggregate_entries(&select_clause);
        let mut specs = Vec::new();
        for (name, expr) in &aggregates {
            let Expr::Aggregate { name: function, args } = expr else {
                continue;
            };
            let extract: Rc<dyn Fn(&Value) -> Value> = match args.first() {
                Some(arg) => {
                    let compiled = eval::compile_namespaced(arg)?;
                    Rc::new(move |row| compiled(row))
                }
                // A bare count aggregates the constant 1.
                None => Rc::new(|_| Value::Int(1)),
            };
            specs.push(AggregateSpec { name: name.clone(), function: *function, extract });
        }
        let skip: Vec<String> = aggregates.iter().map(|(name, _)| name.clone()).collect();
        let scalar = Rc::new(select::CompiledSelect::compile(&select_clause, &skip)?);
        let has_select = query.select.is_some();
        let build_row: crate::dataflow::reduce::RowBuilder = Rc::new(move |representative, aggs| {
            if has_select {
                scalar.project(representative, Some(aggs))
            } else {
                representative.clone()
            }
        });
        let mut reduced = keyed.reduce(specs, build_row);

        for clause in &query.having {
            let rewritten = group::rewrite_having(clause, &select_clause)?;
            let predicate = eval::compile_predicate(&rewritten, true)?;
            reduced = reduced.filter(move |(_, row)| predicate(row));
        }
        for row_fn in &query.fn_having {
            let row_fn = row_fn.clone();
            reduced = reduced.filter(move |(_, row)| row_fn.call(row).is_truthy());
        }
        Ok(reduced)
    }
}

fn split_keyed(value: Value) -> (Value, Value) {
    match value {
        Value::Array(mut items) if items.len() == 2 => {
            let ns = items.pop().expect("keyed pair has two items");
            let key = items.pop().expect("keyed pair has two items");
            (key, ns)
        }
        // A null-padded side has neither key nor namespaced row.
        _ => (Value::Null, Value::Null),
    }
}

/// Drop the leading alias segment so the expression evaluates against the
/// source's own rows.
fn strip_leading_alias(expr: &Expr) -> Expr {
    match expr {
        Expr::Ref(path) if path.len() > 1 => {
            Expr::Ref(path.iter().skip(1).cloned().collect())
        }
        Expr::Func { name, args } => Expr::Func {
            name: *name,
            args: args.iter().map(strip_leading_alias).collect(),
        },
        other => other.clone(),
    }
}
