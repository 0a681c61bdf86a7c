//! Compilation of expressions into row evaluators.
//!
//! Two addressing modes exist. Single-row evaluation walks a `Ref` path
//! through one row, short-circuiting to `Undefined` past a nullish step.
//! Namespaced evaluation is used downstream of joins, where the row is an
//! object keyed by source alias and the first path element picks the alias.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::errors::{Error, Result};
use crate::expr::functions;
use crate::expr::{CompareOptions, Direction, Expr, Function, NullsOrder, StringSort};
use crate::value::Value;

/// A compiled evaluator from a row to a value.
pub type CompiledExpr = Rc<dyn Fn(&Value) -> Value>;

/// A compiled boolean predicate over a row.
pub type CompiledPredicate = Rc<dyn Fn(&Value) -> bool>;

/// Compile for single-row evaluation.
pub fn compile_single_row(expr: &Expr) -> Result<CompiledExpr> {
    compile(expr, true)
}

/// Compile for namespaced evaluation over join output rows.
pub fn compile_namespaced(expr: &Expr) -> Result<CompiledExpr> {
    compile(expr, false)
}

/// Compile a predicate: the expression's truthiness decides membership.
pub fn compile_predicate(expr: &Expr, single_row: bool) -> Result<CompiledPredicate> {
    let compiled = compile(expr, single_row)?;
    Ok(Rc::new(move |row| compiled(row).is_truthy()))
}

fn compile(expr: &Expr, single_row: bool) -> Result<CompiledExpr> {
    match expr {
        Expr::Value(value) => {
            let value = value.clone();
            Ok(Rc::new(move |_| value.clone()))
        }
        Expr::Ref(path) => {
            if path.is_empty() {
                return Err(Error::EmptyReferencePath);
            }
            let path: Vec<String> = path.iter().cloned().collect();
            if single_row {
                Ok(Rc::new(move |row| row.get_path(&path).clone()))
            } else {
                // First element picks the alias; the rest walks into that
                // source's row.
                Ok(Rc::new(move |row| {
                    row.field(&path[0]).get_path(&path[1..]).clone()
                }))
            }
        }
        Expr::Func { name: Function::And, args } => {
            let args = compile_all(args, single_row)?;
            Ok(Rc::new(move |row| {
                for arg in &args {
                    if !arg(row).is_truthy() {
                        return Value::Bool(false);
                    }
                }
                Value::Bool(true)
            }))
        }
        Expr::Func { name: Function::Or, args } => {
            let args = compile_all(args, single_row)?;
            Ok(Rc::new(move |row| {
                for arg in &args {
                    if arg(row).is_truthy() {
                        return Value::Bool(true);
                    }
                }
                Value::Bool(false)
            }))
        }
        Expr::Func { name: Function::Not, args } => {
            let args = compile_all(args, single_row)?;
            Ok(Rc::new(move |row| {
                let value = args.first().map(|arg| arg(row)).unwrap_or(Value::Undefined);
                Value::Bool(!value.is_truthy())
            }))
        }
        Expr::Func { name, args } => {
            let name = *name;
            let args = compile_all(args, single_row)?;
            Ok(Rc::new(move |row| {
                let evaluated: Vec<Value> = args.iter().map(|arg| arg(row)).collect();
                functions::apply(name, &evaluated)
            }))
        }
        Expr::Aggregate { .. } => Err(Error::UnknownExpression("a scalar position")),
        Expr::CollectionRef { .. } | Expr::QueryRef { .. } => {
            Err(Error::UnknownExpression("a scalar position"))
        }
    }
}

fn compile_all(args: &[Expr], single_row: bool) -> Result<Vec<CompiledExpr>> {
    args.iter().map(|arg| compile(arg, single_row)).collect()
}

/// A comparator over evaluated sort keys honoring direction, null placement,
/// and string mode.
pub fn comparator(options: &CompareOptions) -> Rc<dyn Fn(&Value, &Value) -> Ordering> {
    let direction = options.direction;
    let nulls = options.nulls;
    let string_sort = options.string_sort;
    Rc::new(move |a: &Value, b: &Value| {
        // Null placement is absolute: it does not flip with direction.
        match (a.is_nullish(), b.is_nullish()) {
            (true, true) => return Ordering::Equal,
            (true, false) => {
                return match nulls {
                    NullsOrder::First => Ordering::Less,
                    NullsOrder::Last => Ordering::Greater,
                }
            }
            (false, true) => {
                return match nulls {
                    NullsOrder::First => Ordering::Greater,
                    NullsOrder::Last => Ordering::Less,
                }
            }
            (false, false) => {}
        }
        let base = match (a, b, string_sort) {
            (Value::String(a), Value::String(b), StringSort::Locale) => {
                // Case-insensitive primary strength, byte order as the
                // tie-break.
                a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
            }
            _ => a.cmp(b),
        };
        match direction {
            Direction::Asc => base,
            Direction::Desc => base.reverse(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::*;
    use crate::object;

    #[test]
    fn single_row_ref_walks_path() {
        let row = object![("a", object![("b", 7)])];
        let compiled = compile_single_row(&col("a.b")).unwrap();
        assert_eq!(compiled(&row), Value::Int(7));
        let missing = compile_single_row(&col("a.z.c")).unwrap();
        assert_eq!(missing(&row), Value::Undefined);
    }

    #[test]
    fn namespaced_ref_selects_alias() {
        let row = object![("u", object![("age", 21)]), ("o", object![("total", 5)])];
        let compiled = compile_namespaced(&col("u.age")).unwrap();
        assert_eq!(compiled(&row), Value::Int(21));
    }

    #[test]
    fn boolean_short_circuit() {
        // The second conjunct would divide by zero if evaluated strictly; a
        // false first conjunct must hide it.
        let pred = compile_predicate(
            &and(vec![Expr::val(false), gt(col("x"), Expr::val(1))]),
            true,
        )
        .unwrap();
        assert!(!pred(&object![("x", 5)]));

        let pred = compile_predicate(&or(vec![Expr::val(true), Expr::val(false)]), true).unwrap();
        assert!(pred(&Value::Null));
    }

    #[test]
    fn empty_ref_rejected() {
        let empty = Expr::Ref(Default::default());
        assert!(matches!(
            compile_single_row(&empty),
            Err(Error::EmptyReferencePath)
        ));
    }

    #[test]
    fn aggregates_rejected_in_scalar_position() {
        let agg = Expr::aggregate(crate::expr::AggregateFunction::Sum, vec![col("x")]);
        assert!(compile_single_row(&agg).is_err());
    }

    #[test]
    fn comparator_direction_and_nulls() {
        let desc = comparator(&CompareOptions {
            direction: Direction::Desc,
            ..Default::default()
        });
        assert_eq!(desc(&Value::Int(1), &Value::Int(2)), Ordering::Greater);
        // Nulls last stays last under descending order.
        assert_eq!(desc(&Value::Null, &Value::Int(2)), Ordering::Greater);

        let nulls_first = comparator(&CompareOptions {
            nulls: NullsOrder::First,
            ..Default::default()
        });
        assert_eq!(nulls_first(&Value::Null, &Value::Int(2)), Ordering::Less);
    }
}
