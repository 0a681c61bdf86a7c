//! Ordering lowering: multi-clause sort keys and composite comparators.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::errors::Result;
use crate::expr::eval;
use crate::expr::OrderByClause;
use crate::value::Value;

/// Compile `order_by` clauses into a sort-key extractor (a tuple of clause
/// values per row) and a comparator honoring each clause's options.
pub fn compile_order(
    clauses: &[OrderByClause],
) -> Result<(Rc<dyn Fn(&Value) -> Value>, Rc<dyn Fn(&Value, &Value) -> Ordering>)> {
    let extractors: Result<Vec<_>> =
        clauses.iter().map(|clause| eval::compile_namespaced(&clause.expr)).collect();
    let extractors = extractors?;
    let comparators: Vec<_> =
        clauses.iter().map(|clause| eval::comparator(&clause.compare)).collect();

    let extract: Rc<dyn Fn(&Value) -> Value> = Rc::new(move |row| {
        Value::Array(extractors.iter().map(|extract| extract(row)).collect())
    });
    let compare: Rc<dyn Fn(&Value, &Value) -> Ordering> = Rc::new(move |a, b| {
        let (Value::Array(a), Value::Array(b)) = (a, b) else {
            return Ordering::Equal;
        };
        for (index, comparator) in comparators.iter().enumerate() {
            let left = a.get(index).unwrap_or(&Value::Undefined);
            let right = b.get(index).unwrap_or(&Value::Undefined);
            let order = comparator(left, right);
            if order != Ordering::Equal {
                return order;
            }
        }
        Ordering::Equal
    });
    Ok((extract, compare))
}
