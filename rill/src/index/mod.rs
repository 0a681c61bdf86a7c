//! Ordered inverted indexes over collection rows.
//!
//! An index evaluates one expression per row and keeps a B+ tree from the
//! evaluated value to the set of row keys holding it. Lookups serve the
//! comparison operators the optimizer can convert, range scans in either
//! direction, and cursor-style `take` used by ordered subscriptions.
//! Indexed values are normalized so dates participate by their epoch.

pub mod reverse;

pub use reverse::ReverseIndex;

use std::collections::BTreeSet;

use crate::errors::Result;
use crate::expr::eval::{self, CompiledExpr};
use crate::expr::{CompareOptions, Direction, Expr, Function};
use crate::tree::Tree;
use crate::value::{Key, Value};

/// The operators an index can answer directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOp {
    /// Exact match.
    Eq,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Gte,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Lte,
    /// Membership in an array of candidates.
    In,
}

impl IndexOp {
    /// The operator an index scanned in reverse answers with this one.
    pub fn reversed(self) -> IndexOp {
        match self {
            IndexOp::Gt => IndexOp::Lt,
            IndexOp::Gte => IndexOp::Lte,
            IndexOp::Lt => IndexOp::Gt,
            IndexOp::Lte => IndexOp::Gte,
            other => other,
        }
    }

    /// Parse from the function set, for clauses of shape `op(field, value)`.
    pub fn from_function(function: Function) -> Option<IndexOp> {
        match function {
            Function::Eq => Some(IndexOp::Eq),
            Function::Gt => Some(IndexOp::Gt),
            Function::Gte => Some(IndexOp::Gte),
            Function::Lt => Some(IndexOp::Lt),
            Function::Lte => Some(IndexOp::Lte),
            Function::In => Some(IndexOp::In),
            _ => None,
        }
    }
}

/// Bounds for a range scan; a missing bound leaves that end open.
#[derive(Clone, Debug, Default)]
pub struct RangeBounds {
    /// Lower bound on indexed values.
    pub from: Option<Value>,
    /// Upper bound on indexed values.
    pub to: Option<Value>,
    /// Whether `from` itself is admitted.
    pub from_inclusive: bool,
    /// Whether `to` itself is admitted.
    pub to_inclusive: bool,
}

/// Dates index and query by their epoch milliseconds.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Date(ms) => Value::Int(*ms),
        other => other.clone(),
    }
}

/// How an index relates to a requested comparator contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexMatch {
    /// Usable as stored.
    Exact,
    /// Usable through a `ReverseIndex` wrapper.
    Reversed,
    /// Not usable for this contract.
    No,
}

/// The read surface shared by a stored index and its reversed view.
pub trait IndexReader {
    /// Keys matching `op` against `value`.
    fn lookup(&self, op: IndexOp, value: &Value) -> BTreeSet<Key>;
    /// Keys with indexed values inside `bounds`, in index order.
    fn range_query(&self, bounds: &RangeBounds) -> Vec<Key>;
    /// Keys with indexed values inside `bounds`, in reverse index order.
    fn range_query_reversed(&self, bounds: &RangeBounds) -> Vec<Key>;
    /// Up to `n` keys starting strictly after the cursor value `from` (from
    /// the low extreme when `None`), skipping keys the filter rejects.
    fn take(&self, n: usize, from: Option<&Value>, filter: Option<&dyn Fn(&Key) -> bool>)
        -> Vec<Key>;
    /// The reverse-order counterpart of [`IndexReader::take`].
    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<&dyn Fn(&Key) -> bool>,
    ) -> Vec<Key>;
}

/// A B+-tree-backed inverted index for one expression.
pub struct BTreeIndex {
    /// Stable identity within the owning collection.
    pub id: usize,
    /// The indexed expression (evaluated single-row).
    pub expr: Expr,
    compiled: CompiledExpr,
    compare: CompareOptions,
    tree: Tree<Value, BTreeSet<Key>>,
    postings: usize,
}

impl BTreeIndex {
    /// Build an empty index for `expr` under the given comparator contract.
    /// Storage is always in ascending option order; descending requests are
    /// served through [`ReverseIndex`].
    pub fn new(id: usize, expr: Expr, compare: CompareOptions) -> Result<Self> {
        let compiled = eval::compile_single_row(&expr)?;
        let storage_options = CompareOptions { direction: Direction::Asc, ..compare.clone() };
        let cmp = eval::comparator(&storage_options);
        Ok(BTreeIndex {
            id,
            expr,
            compiled,
            compare,
            tree: Tree::new(cmp),
            postings: 0,
        })
    }

    /// The comparator contract the index was declared with.
    pub fn compare_options(&self) -> &CompareOptions {
        &self.compare
    }

    /// Whether the index can serve a scan under `wanted`.
    ///
    /// Everything but the direction must agree; a direction mismatch is
    /// served by the reversed view, which costs nothing per scanned row.
    pub fn matches(&self, wanted: &CompareOptions) -> IndexMatch {
        let same_modulo_direction = self.compare.nulls == wanted.nulls
            && self.compare.string_sort == wanted.string_sort
            && self.compare.locale == wanted.locale;
        if !same_modulo_direction {
            return IndexMatch::No;
        }
        if self.compare.direction == wanted.direction {
            IndexMatch::Exact
        } else {
            IndexMatch::Reversed
        }
    }

    /// The indexed value for `row`.
    pub fn value_for(&self, row: &Value) -> Value {
        normalize(&(self.compiled)(row))
    }

    /// Record `row` under `key`.
    pub fn add_row(&mut self, key: &Key, row: &Value) {
        let value = self.value_for(row);
        match self.tree.get(&value) {
            Some(existing) => {
                let mut keys = existing.clone();
                if keys.insert(key.clone()) {
                    self.postings += 1;
                }
                self.tree.set(value, keys, true);
            }
            None => {
                let mut keys = BTreeSet::new();
                keys.insert(key.clone());
                self.tree.set(value, keys, true);
                self.postings += 1;
            }
        }
    }

    /// Forget `row` under `key`.
    pub fn remove_row(&mut self, key: &Key, row: &Value) {
        let value = self.value_for(row);
        if let Some(existing) = self.tree.get(&value) {
            let mut keys = existing.clone();
            if keys.remove(key) {
                self.postings -= 1;
            }
            if keys.is_empty() {
                self.tree.delete(&value);
            } else {
                self.tree.set(value, keys, true);
            }
        }
    }

    /// Re-index a row whose value may have moved.
    pub fn update_row(&mut self, key: &Key, old_row: &Value, new_row: &Value) {
        self.remove_row(key, old_row);
        self.add_row(key, new_row);
    }

    /// The number of `(value, key)` postings currently stored.
    pub fn len(&self) -> usize {
        self.postings
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.postings == 0
    }

    fn collect_range(&self, bounds: &RangeBounds, reversed: bool) -> Vec<Key> {
        let from = bounds.from.as_ref().map(normalize);
        let to = bounds.to.as_ref().map(normalize);
        let mut out = Vec::new();
        let visit = |value: &Value, keys: &BTreeSet<Key>, _count: usize| {
            // The tree's low bound is always inclusive; exclusive `from`
            // drops the boundary value here.
            if !bounds.from_inclusive {
                if let Some(from) = &from {
                    if value == from {
                        return false;
                    }
                }
            }
            out.extend(keys.iter().cloned());
            false
        };
        if reversed {
            self.tree.scan_reversed(from.as_ref(), to.as_ref(), bounds.to_inclusive, visit);
        } else {
            self.tree.scan(from.as_ref(), to.as_ref(), bounds.to_inclusive, visit);
        }
        out
    }
}

impl IndexReader for BTreeIndex {
    fn lookup(&self, op: IndexOp, value: &Value) -> BTreeSet<Key> {
        let value = normalize(value);
        match op {
            IndexOp::Eq => self.tree.get(&value).cloned().unwrap_or_default(),
            IndexOp::In => match &value {
                Value::Array(candidates) => {
                    let mut out = BTreeSet::new();
                    for candidate in candidates {
                        if let Some(keys) = self.tree.get(&normalize(candidate)) {
                            out.extend(keys.iter().cloned());
                        }
                    }
                    out
                }
                _ => BTreeSet::new(),
            },
            IndexOp::Gt => self
                .collect_range(
                    &RangeBounds { from: Some(value), from_inclusive: false, ..Default::default() },
                    false,
                )
                .into_iter()
                .collect(),
            IndexOp::Gte => self
                .collect_range(
                    &RangeBounds { from: Some(value), from_inclusive: true, ..Default::default() },
                    false,
                )
                .into_iter()
                .collect(),
            IndexOp::Lt => self
                .collect_range(
                    &RangeBounds { to: Some(value), to_inclusive: false, ..Default::default() },
                    false,
                )
                .into_iter()
                .collect(),
            IndexOp::Lte => self
                .collect_range(
                    &RangeBounds { to: Some(value), to_inclusive: true, ..Default::default() },
                    false,
                )
                .into_iter()
                .collect(),
        }
    }

    fn range_query(&self, bounds: &RangeBounds) -> Vec<Key> {
        self.collect_range(bounds, false)
    }

    fn range_query_reversed(&self, bounds: &RangeBounds) -> Vec<Key> {
        self.collect_range(bounds, true)
    }

    fn take(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<&dyn Fn(&Key) -> bool>,
    ) -> Vec<Key> {
        let from = from.map(normalize);
        let mut out = Vec::new();
        self.tree.scan(from.as_ref(), None, true, |value, keys, _| {
            if let Some(from) = &from {
                if value == from {
                    // `take` starts strictly after its cursor.
                    return false;
                }
            }
            for key in keys {
                if filter.map(|f| f(key)).unwrap_or(true) {
                    out.push(key.clone());
                    if out.len() >= n {
                        return true;
                    }
                }
            }
            false
        });
        out
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<&dyn Fn(&Key) -> bool>,
    ) -> Vec<Key> {
        let from = from.map(normalize);
        let mut out = Vec::new();
        self.tree.scan_reversed(None, from.as_ref(), false, |value, keys, _| {
            let _ = value;
            for key in keys.iter().rev() {
                if filter.map(|f| f(key)).unwrap_or(true) {
                    out.push(key.clone());
                    if out.len() >= n {
                        return true;
                    }
                }
            }
            false
        });
        out
    }
}

/// A single-field predicate the eager auto-index policy reacts to.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexCandidate {
    /// The field reference to index.
    pub field: Expr,
    /// The operator that wanted it.
    pub op: IndexOp,
}

/// Collect indexable single-field predicates from an `and`-tree.
///
/// A clause of shape `op(ref, literal)` or `op(literal, ref)` with `op` in
/// the supported set nominates the referenced field. Disjunctions are
/// opaque to the policy.
pub fn index_candidates(expr: &Expr, into: &mut Vec<IndexCandidate>) {
    match expr {
        Expr::Func { name: Function::And, args } => {
            for arg in args {
                index_candidates(arg, into);
            }
        }
        Expr::Func { name, args } => {
            let Some(op) = IndexOp::from_function(*name) else {
                return;
            };
            let field = match (args.first(), args.get(1)) {
                (Some(field @ Expr::Ref(_)), Some(Expr::Value(_))) => field,
                (Some(Expr::Value(_)), Some(field @ Expr::Ref(_))) if op != IndexOp::In => field,
                _ => return,
            };
            let candidate = IndexCandidate { field: field.clone(), op };
            if !into.contains(&candidate) {
                into.push(candidate);
            }
        }
        _ => {}
    }
}

/// An expression-level probe an index can answer: `op(field, literal)` in
/// either argument order.
pub fn as_index_probe(expr: &Expr) -> Option<(Expr, IndexOp, Value)> {
    let Expr::Func { name, args } = expr else {
        return None;
    };
    let op = IndexOp::from_function(*name)?;
    match (args.first(), args.get(1)) {
        (Some(field @ Expr::Ref(_)), Some(Expr::Value(value))) => {
            Some((field.clone(), op, value.clone()))
        }
        (Some(Expr::Value(value)), Some(field @ Expr::Ref(_))) if op != IndexOp::In => {
            // Reversing argument order flips the relational sense.
            Some((field.clone(), op.reversed(), value.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::col;
    use crate::object;

    fn sample_index() -> BTreeIndex {
        let mut index = BTreeIndex::new(0, col("age"), CompareOptions::default()).unwrap();
        for (key, age) in [(1i64, 30i64), (2, 20), (3, 25), (4, 20)] {
            index.add_row(&Value::Int(key), &object![("age", age)]);
        }
        index
    }

    fn keys(values: &[i64]) -> BTreeSet<Key> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn point_and_range_lookups() {
        let index = sample_index();
        assert_eq!(index.lookup(IndexOp::Eq, &Value::Int(20)), keys(&[2, 4]));
        assert_eq!(index.lookup(IndexOp::Gt, &Value::Int(20)), keys(&[1, 3]));
        assert_eq!(index.lookup(IndexOp::Gte, &Value::Int(25)), keys(&[1, 3]));
        assert_eq!(index.lookup(IndexOp::Lt, &Value::Int(25)), keys(&[2, 4]));
        assert_eq!(
            index.lookup(IndexOp::In, &Value::from(vec![20i64, 30])),
            keys(&[1, 2, 4])
        );
    }

    #[test]
    fn range_query_inclusivity() {
        let index = sample_index();
        let bounds = RangeBounds {
            from: Some(Value::Int(20)),
            to: Some(Value::Int(25)),
            from_inclusive: false,
            to_inclusive: true,
        };
        assert_eq!(index.range_query(&bounds), vec![Value::Int(3)]);
        let bounds = RangeBounds { from_inclusive: true, ..bounds };
        assert_eq!(
            index.range_query(&bounds),
            vec![Value::Int(2), Value::Int(4), Value::Int(3)]
        );
    }

    #[test]
    fn take_pages_through_values() {
        let index = sample_index();
        let first = index.take(2, None, None);
        assert_eq!(first, vec![Value::Int(2), Value::Int(4)]);
        // The cursor is the indexed value of the last page's rows.
        let rest = index.take(10, Some(&Value::Int(20)), None);
        assert_eq!(rest, vec![Value::Int(3), Value::Int(1)]);

        let odd_only = |key: &Key| matches!(key, Value::Int(i) if i % 2 == 1);
        assert_eq!(
            index.take(10, None, Some(&odd_only)),
            vec![Value::Int(3), Value::Int(1)]
        );
    }

    #[test]
    fn updates_move_postings() {
        let mut index = sample_index();
        index.update_row(&Value::Int(2), &object![("age", 20)], &object![("age", 31)]);
        assert_eq!(index.lookup(IndexOp::Eq, &Value::Int(20)), keys(&[4]));
        assert_eq!(index.lookup(IndexOp::Gt, &Value::Int(30)), keys(&[2]));
        index.remove_row(&Value::Int(4), &object![("age", 20)]);
        assert!(index.lookup(IndexOp::Eq, &Value::Int(20)).is_empty());
    }

    #[test]
    fn dates_normalize_to_epoch() {
        let mut index = BTreeIndex::new(0, col("at"), CompareOptions::default()).unwrap();
        index.add_row(&Value::Int(1), &object![("at", Value::Date(100))]);
        assert_eq!(index.lookup(IndexOp::Eq, &Value::Int(100)), keys(&[1]));
        assert_eq!(index.lookup(IndexOp::Eq, &Value::Date(100)), keys(&[1]));
    }

    #[test]
    fn candidate_extraction() {
        use crate::expr::dsl::*;
        let clause = and(vec![
            gt(col("age"), Expr::val(18)),
            eq(Expr::val("x"), col("name")),
            or(vec![eq(col("a"), Expr::val(1))]),
        ]);
        let mut found = Vec::new();
        index_candidates(&clause, &mut found);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].field, col("age"));
        assert_eq!(found[1].field, col("name"));
    }
}
