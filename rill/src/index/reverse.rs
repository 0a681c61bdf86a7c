//! A descending view over a stored index.
//!
//! Ordered scans whose direction disagrees with the stored index are served
//! by swapping the operation senses rather than rebuilding anything: `gt`
//! becomes `lt`, range bounds trade places, and `take` walks from the other
//! end.

use std::collections::BTreeSet;

use crate::index::{BTreeIndex, IndexOp, IndexReader, RangeBounds};
use crate::value::{Key, Value};

/// A borrowed index with reversed operation senses.
pub struct ReverseIndex<'a> {
    inner: &'a BTreeIndex,
}

impl<'a> ReverseIndex<'a> {
    /// Wrap `inner`.
    pub fn new(inner: &'a BTreeIndex) -> Self {
        ReverseIndex { inner }
    }

    /// The wrapped index.
    pub fn inner(&self) -> &BTreeIndex {
        self.inner
    }
}

impl IndexReader for ReverseIndex<'_> {
    fn lookup(&self, op: IndexOp, value: &Value) -> BTreeSet<Key> {
        self.inner.lookup(op.reversed(), value)
    }

    fn range_query(&self, bounds: &RangeBounds) -> Vec<Key> {
        self.inner.range_query_reversed(&flip(bounds))
    }

    fn range_query_reversed(&self, bounds: &RangeBounds) -> Vec<Key> {
        self.inner.range_query(&flip(bounds))
    }

    fn take(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<&dyn Fn(&Key) -> bool>,
    ) -> Vec<Key> {
        self.inner.take_reversed(n, from, filter)
    }

    fn take_reversed(
        &self,
        n: usize,
        from: Option<&Value>,
        filter: Option<&dyn Fn(&Key) -> bool>,
    ) -> Vec<Key> {
        self.inner.take(n, from, filter)
    }
}

/// Under the reversed view "from" and "to" swap roles.
fn flip(bounds: &RangeBounds) -> RangeBounds {
    RangeBounds {
        from: bounds.to.clone(),
        to: bounds.from.clone(),
        from_inclusive: bounds.to_inclusive,
        to_inclusive: bounds.from_inclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::col;
    use crate::expr::CompareOptions;
    use crate::object;

    #[test]
    fn senses_swap() {
        let mut index = BTreeIndex::new(0, col("v"), CompareOptions::default()).unwrap();
        for (key, v) in [(1i64, 10i64), (2, 20), (3, 30)] {
            index.add_row(&Value::Int(key), &object![("v", v)]);
        }
        let reversed = ReverseIndex::new(&index);
        // "Greater" under the reversed order means smaller stored values.
        let low: BTreeSet<Key> = [Value::Int(1)].into_iter().collect();
        assert_eq!(reversed.lookup(IndexOp::Gt, &Value::Int(20)), low);
        // Equality is direction-free.
        let mid: BTreeSet<Key> = [Value::Int(2)].into_iter().collect();
        assert_eq!(reversed.lookup(IndexOp::Eq, &Value::Int(20)), mid);
        // take walks descending.
        assert_eq!(reversed.take(2, None, None), vec![Value::Int(3), Value::Int(2)]);
    }
}
