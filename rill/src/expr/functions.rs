//! Semantics of the scalar function set.
//!
//! `and`, `or`, and `not` are short-circuited by the compiler and never reach
//! `apply`; everything else is a strict function of its evaluated arguments.

use crate::expr::Function;
use crate::value::Value;

/// Apply a strict scalar function to evaluated arguments.
pub fn apply(function: Function, args: &[Value]) -> Value {
    match function {
        Function::Eq => Value::Bool(arg(args, 0).loose_eq(arg(args, 1))),
        Function::Gt => relational(args, |o| o == std::cmp::Ordering::Greater),
        Function::Gte => relational(args, |o| o != std::cmp::Ordering::Less),
        Function::Lt => relational(args, |o| o == std::cmp::Ordering::Less),
        Function::Lte => relational(args, |o| o != std::cmp::Ordering::Greater),
        Function::In => Value::Bool(match arg(args, 1) {
            Value::Array(items) => items.iter().any(|item| item.loose_eq(arg(args, 0))),
            _ => false,
        }),
        Function::Like => Value::Bool(like(arg(args, 0), arg(args, 1), false)),
        Function::Ilike => Value::Bool(like(arg(args, 0), arg(args, 1), true)),
        Function::Upper => match arg(args, 0) {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other.clone(),
        },
        Function::Lower => match arg(args, 0) {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other.clone(),
        },
        Function::Length => match arg(args, 0) {
            Value::String(s) => Value::Int(s.chars().count() as i64),
            Value::Array(items) => Value::Int(items.len() as i64),
            _ => Value::Int(0),
        },
        Function::Concat => {
            Value::String(args.iter().map(Value::coerce_string).collect::<String>())
        }
        Function::Coalesce => args
            .iter()
            .find(|value| !value.is_nullish())
            .cloned()
            .unwrap_or(Value::Null),
        Function::Add => arithmetic(args, |a, b| a + b, |a, b| a.checked_add(b)),
        Function::Subtract => arithmetic(args, |a, b| a - b, |a, b| a.checked_sub(b)),
        Function::Multiply => arithmetic(args, |a, b| a * b, |a, b| a.checked_mul(b)),
        Function::Divide => {
            let divisor = numeric_or_zero(arg(args, 1));
            if divisor == 0.0 {
                Value::Null
            } else {
                Value::Float(numeric_or_zero(arg(args, 0)) / divisor)
            }
        }
        Function::IsNull => Value::Bool(matches!(arg(args, 0), Value::Null)),
        Function::IsUndefined => Value::Bool(matches!(arg(args, 0), Value::Undefined)),
        Function::And | Function::Or | Function::Not => {
            unreachable!("boolean connectives are compiled with short-circuiting")
        }
    }
}

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&Value::Undefined)
}

/// Relational comparison without normalization beyond numeric variants
/// sharing a scale. Nullish or cross-type operands compare false.
fn relational(args: &[Value], accept: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let (left, right) = (arg(args, 0), arg(args, 1));
    if left.is_nullish() || right.is_nullish() {
        return Value::Bool(false);
    }
    let ordering = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    Value::Bool(ordering.map(&accept).unwrap_or(false))
}

fn numeric_or_zero(value: &Value) -> f64 {
    if value.is_nullish() {
        0.0
    } else {
        value.as_number().unwrap_or(f64::NAN)
    }
}

/// Arithmetic with null treated as zero; integer pairs stay integral unless
/// the operation overflows.
fn arithmetic(
    args: &[Value],
    float_op: impl Fn(f64, f64) -> f64,
    int_op: impl Fn(i64, i64) -> Option<i64>,
) -> Value {
    let (left, right) = (arg(args, 0), arg(args, 1));
    let int_left = match left {
        Value::Int(i) => Some(*i),
        Value::Null | Value::Undefined => Some(0),
        _ => None,
    };
    let int_right = match right {
        Value::Int(i) => Some(*i),
        Value::Null | Value::Undefined => Some(0),
        _ => None,
    };
    if let (Some(a), Some(b)) = (int_left, int_right) {
        if let Some(result) = int_op(a, b) {
            return Value::Int(result);
        }
    }
    Value::Float(float_op(numeric_or_zero(left), numeric_or_zero(right)))
}

/// SQL `LIKE`: `%` matches any run, `_` matches one character.
fn like(value: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let (Some(value), Some(pattern)) = (value.as_str(), pattern.as_str()) else {
        return false;
    };
    let (value, pattern) = if case_insensitive {
        (value.to_lowercase(), pattern.to_lowercase())
    } else {
        (value.to_string(), pattern.to_string())
    };
    like_match(
        &value.chars().collect::<Vec<_>>(),
        &pattern.chars().collect::<Vec<_>>(),
    )
}

fn like_match(value: &[char], pattern: &[char]) -> bool {
    // Iterative two-pointer match with backtracking to the last `%`.
    let (mut v, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == value[v]) {
            v += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}
