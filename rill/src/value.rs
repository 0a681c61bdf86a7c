//! Dynamic row and scalar values.
//!
//! Collections store rows whose shape is not known at compile time. `Value` is
//! the sum type those rows are made of: scalars, epoch-millisecond dates,
//! arrays, and string-keyed objects. The type carries a total order so that it
//! can serve as a key in ordered maps and as the subject of index comparators,
//! and a looser numeric equality used by the `eq` query function, which
//! normalizes dates to their epoch before comparing.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A key identifying a row within a collection.
pub type Key = Value;

/// A dynamically shaped value: scalar, date, array, or object.
///
/// The `Undefined` variant is distinct from `Null`: a path lookup that walks
/// off the edge of a row yields `Undefined`, while `Null` is a value a row can
/// actually hold. The distinction is observable through the `isNull` and
/// `isUndefined` query functions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// The absence of a value; produced by missing fields.
    Undefined,
    /// An explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// A point in time, in milliseconds since the Unix epoch.
    Date(i64),
    /// An ordered sequence of values.
    Array(Vec<Value>),
    /// A string-keyed record with deterministic field order.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// The type rank used to totally order values of different variants.
    ///
    /// Numeric variants (`Int`, `Float`, `Date`) share a rank and compare
    /// numerically among themselves, which is what index comparators need:
    /// dates participate in range scans by their epoch.
    fn rank(&self) -> u8 {
        match self {
            Value::Undefined => 0,
            Value::Null => 1,
            Value::Bool(_) => 2,
            Value::Int(_) | Value::Float(_) | Value::Date(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    /// A secondary rank separating the numeric variants, so that `Ord` stays
    /// consistent with the structural `Eq` when two variants compare
    /// numerically equal.
    fn numeric_rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Date(_) => 2,
            _ => 3,
        }
    }

    /// The numeric magnitude of a numeric variant, with dates normalized to
    /// their epoch milliseconds.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Date(ms) => Some(*ms as f64),
            _ => None,
        }
    }

    /// True when the value is `Null` or `Undefined`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    /// True for the `Object` variant.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Truthiness as used by `where` predicates: false for `Null`,
    /// `Undefined`, `Bool(false)`, zero, and the empty string.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Date(_) | Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Borrow the object fields, if this is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Mutably borrow the object fields, if this is an object.
    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Borrow the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read the field named `field`, yielding `Undefined` when absent or when
    /// the value is not an object.
    pub fn field(&self, field: &str) -> &Value {
        match self {
            Value::Object(fields) => fields.get(field).unwrap_or(&Value::Undefined),
            _ => &Value::Undefined,
        }
    }

    /// Walk `path` through nested objects, short-circuiting to `Undefined`
    /// when any step is nullish or absent.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> &Value {
        let mut current = self;
        for step in path {
            if current.is_nullish() {
                return &Value::Undefined;
            }
            current = current.field(step.as_ref());
        }
        current
    }

    /// Assign `value` at `path`, materializing intermediate objects.
    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        debug_assert!(!path.is_empty());
        let mut current = self;
        for step in &path[..path.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(BTreeMap::new());
            }
            current = current
                .as_object_mut()
                .expect("just materialized an object")
                .entry(step.as_ref().to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
        }
        if !current.is_object() {
            *current = Value::Object(BTreeMap::new());
        }
        if let Some(fields) = current.as_object_mut() {
            fields.insert(path[path.len() - 1].as_ref().to_string(), value);
        }
    }

    /// Merge the fields of `delta` into this object, replacing existing
    /// fields at the top level. Non-object inputs replace the value wholesale.
    pub fn merge(&mut self, delta: &Value) {
        match (self.as_object_mut(), delta.as_object()) {
            (Some(into), Some(from)) => {
                for (name, value) in from {
                    into.insert(name.clone(), value.clone());
                }
            }
            _ => *self = delta.clone(),
        }
    }

    /// Equality with numeric normalization: numbers and dates compare by
    /// magnitude, so `Date(5)` equals `Int(5)`. All other variants compare
    /// structurally, recursing through arrays and objects.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Value::Array(a), Value::Array(b)) => {
                    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
                }
                (Value::Object(a), Value::Object(b)) => {
                    a.len() == b.len()
                        && a.iter()
                            .zip(b)
                            .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
                }
                _ => self == other,
            },
        }
    }

    /// Best-effort string rendering, used by `concat`.
    pub fn coerce_string(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(ms) => ms.to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::coerce_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object]".to_string(),
        }
    }

    /// Convert from a `serde_json` value. JSON has no date or undefined
    /// variant, so none are produced.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a `serde_json` value. Dates become their epoch
    /// milliseconds; `Undefined` becomes JSON null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(ms) => serde_json::Value::from(*ms),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bitwise float equality keeps `Eq` reflexive in the presence of
            // NaN, which structural map keys require.
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b) == Ordering::Equal,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.rank().cmp(&other.rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            // Mixed numeric variants: numeric magnitude first, then a variant
            // tie-break so the order agrees with structural equality.
            (a, b) => {
                let (x, y) = (
                    a.as_number().unwrap_or(f64::NAN),
                    b.as_number().unwrap_or(f64::NAN),
                );
                x.total_cmp(&y).then(a.numeric_rank().cmp(&b.numeric_rank()))
            }
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Undefined | Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Date(ms) => ms.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Object(fields) => fields.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.coerce_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

/// Build an object value from field/value pairs.
///
/// ```
/// use rill::object;
/// let row = object![("id", 1), ("name", "alice")];
/// assert_eq!(row.field("id"), &rill::Value::Int(1));
/// ```
#[macro_export]
macro_rules! object {
    [$(($name:expr, $value:expr)),* $(,)?] => {{
        let mut fields = ::std::collections::BTreeMap::new();
        $( fields.insert($name.to_string(), $crate::Value::from($value)); )*
        $crate::Value::Object(fields)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_total_order() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(2),
            Value::Null,
            Value::Bool(true),
            Value::Float(1.5),
            Value::Undefined,
        ];
        values.sort();
        assert_eq!(values[0], Value::Undefined);
        assert_eq!(values[1], Value::Null);
        assert_eq!(values[2], Value::Bool(true));
        assert_eq!(values[3], Value::Float(1.5));
        assert_eq!(values[4], Value::Int(2));
        assert_eq!(values[5], Value::from("b"));
    }

    #[test]
    fn dates_sort_numerically() {
        assert_eq!(Value::Date(5).cmp(&Value::Int(7)), Ordering::Less);
        assert_eq!(Value::Date(9).cmp(&Value::Int(7)), Ordering::Greater);
        // Equal magnitude orders by variant, but never reports Equal for
        // structurally distinct values.
        assert_ne!(Value::Date(5).cmp(&Value::Int(5)), Ordering::Equal);
    }

    #[test]
    fn loose_eq_normalizes_dates() {
        assert!(Value::Date(5).loose_eq(&Value::Int(5)));
        assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
        assert!(!Value::Int(1).loose_eq(&Value::from("1")));
    }

    #[test]
    fn path_walk_short_circuits() {
        let row = object![("a", object![("b", 3)])];
        assert_eq!(row.get_path(&["a", "b"]), &Value::Int(3));
        assert_eq!(row.get_path(&["a", "missing", "c"]), &Value::Undefined);
        assert_eq!(row.get_path(&["z", "b"]), &Value::Undefined);
    }

    #[test]
    fn merge_replaces_top_level_fields() {
        let mut row = object![("id", 1), ("v", 1)];
        row.merge(&object![("v", 2), ("extra", true)]);
        assert_eq!(row, object![("id", 1), ("v", 2), ("extra", true)]);
    }
}
