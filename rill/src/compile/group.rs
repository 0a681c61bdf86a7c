//! Group-by lowering: aggregate extraction and having rewrites.

use crate::errors::{Error, Result};
use crate::expr::eval;
use crate::expr::{Expr, RefPath};

/// The aggregate entries of a select clause: `(output name, aggregate)`.
pub fn aggregate_entries(select: &[(String, Expr)]) -> Vec<(String, Expr)> {
    select
        .iter()
        .filter(|(_, expr)| matches!(expr, Expr::Aggregate { .. }))
        .map(|(name, expr)| (name.clone(), expr.clone()))
        .collect()
}

/// Rewrite a having clause so the evaluator never sees aggregates: each
/// `Aggregate` subtree becomes a reference to the select entry that
/// computes it, and namespaced refs collapse to their select-output names.
pub fn rewrite_having(clause: &Expr, select: &[(String, Expr)]) -> Result<Expr> {
    match clause {
        Expr::Aggregate { .. } => {
            let name = select
                .iter()
                .find(|(_, expr)| expr == clause)
                .map(|(name, _)| name.clone())
                .ok_or(Error::AggregateNotInSelect)?;
            let mut path = RefPath::new();
            path.push(name);
            Ok(Expr::Ref(path))
        }
        Expr::Ref(path) => {
            // A ref that names a select entry directly keeps its name; a
            // namespaced ref whose expression was projected collapses to
            // the projecting entry's name.
            if let Some((name, _)) = select.iter().find(|(_, expr)| expr == clause) {
                let mut out = RefPath::new();
                out.push(name.clone());
                return Ok(Expr::Ref(out));
            }
            if path.len() > 1 {
                let mut out = RefPath::new();
                for segment in path.iter().skip(1) {
                    out.push(segment.clone());
                }
                return Ok(Expr::Ref(out));
            }
            Ok(clause.clone())
        }
        Expr::Func { name, args } => {
            let args: Result<Vec<Expr>> =
                args.iter().map(|arg| rewrite_having(arg, select)).collect();
            Ok(Expr::Func { name: *name, args: args? })
        }
        Expr::Value(_) => Ok(clause.clone()),
        _ => Err(Error::UnknownHavingExpression),
    }
}

/// Compile the group-key extractor: the tuple of group-by expressions
/// evaluated against a namespaced row.
pub fn group_key_fn(
    group_by: &[Expr],
) -> Result<std::rc::Rc<dyn Fn(&crate::value::Value) -> crate::value::Value>> {
    let compiled: Result<Vec<_>> = group_by.iter().map(eval::compile_namespaced).collect();
    let compiled = compiled?;
    Ok(std::rc::Rc::new(move |row| {
        crate::value::Value::Array(compiled.iter().map(|expr| expr(row)).collect())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::*;
    use crate::expr::AggregateFunction;

    #[test]
    fn having_aggregates_map_to_select_names() {
        let total = Expr::aggregate(AggregateFunction::Sum, vec![col("o.amount")]);
        let select = vec![("total".to_string(), total.clone()), ("city".to_string(), col("o.city"))];
        let clause = gt(total, Expr::val(100));
        let rewritten = rewrite_having(&clause, &select).unwrap();
        assert_eq!(rewritten, gt(col("total"), Expr::val(100)));
    }

    #[test]
    fn having_with_unselected_aggregate_fails() {
        let select = vec![("city".to_string(), col("o.city"))];
        let clause = gt(
            Expr::aggregate(AggregateFunction::Count, vec![]),
            Expr::val(1),
        );
        assert!(matches!(
            rewrite_having(&clause, &select),
            Err(Error::AggregateNotInSelect)
        ));
    }

    #[test]
    fn having_namespaced_refs_collapse() {
        let select = vec![("city".to_string(), col("o.city"))];
        let clause = eq(col("o.city"), Expr::val("berlin"));
        let rewritten = rewrite_having(&clause, &select).unwrap();
        assert_eq!(rewritten, eq(col("city"), Expr::val("berlin")));
    }
}
