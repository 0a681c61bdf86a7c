//! Projection of namespaced rows through select clauses.
//!
//! Select keys are output field names; a dotted key materializes nested
//! objects, and a spread-sentinel key merges an entire source (or computed
//! object) into the select scope at its nesting level.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::errors::Result;
use crate::expr::eval::{self, CompiledExpr};
use crate::expr::{Expr, SPREAD_SENTINEL};
use crate::value::Value;

/// One compiled select entry.
enum Entry {
    /// Assign the evaluated value at a (possibly nested) path.
    Field { path: Vec<String>, expr: CompiledExpr },
    /// Merge the evaluated object's fields into the scope at `path`.
    Spread { path: Vec<String>, expr: CompiledExpr },
}

/// A compiled projection from a namespaced row to an output row.
pub struct CompiledSelect {
    entries: Vec<Entry>,
}

impl CompiledSelect {
    /// Compile `select` for namespaced evaluation, skipping entries whose
    /// names appear in `skip` (used by group-by, which computes aggregate
    /// entries itself).
    pub fn compile(select: &[(String, Expr)], skip: &[String]) -> Result<CompiledSelect> {
        let mut entries = Vec::new();
        for (name, expr) in select {
            if skip.contains(name) {
                continue;
            }
            let mut path: Vec<String> = name.split('.').map(str::to_string).collect();
            let spread = path
                .last()
                .map(|segment| segment.starts_with(SPREAD_SENTINEL))
                .unwrap_or(false);
            if spread {
                path.pop();
            }
            let compiled = eval::compile_namespaced(expr)?;
            if spread {
                entries.push(Entry::Spread { path, expr: compiled });
            } else {
                entries.push(Entry::Field { path, expr: compiled });
            }
        }
        Ok(CompiledSelect { entries })
    }

    /// Evaluate against a namespaced row, merging `extra` fields (computed
    /// aggregates) at the top level first.
    pub fn project(&self, row: &Value, extra: Option<&BTreeMap<String, Value>>) -> Value {
        let mut out = Value::Object(BTreeMap::new());
        if let Some(extra) = extra {
            for (name, value) in extra {
                out.set_path(&[name.clone()], value.clone());
            }
        }
        for entry in &self.entries {
            match entry {
                Entry::Field { path, expr } => {
                    out.set_path(path, expr(row));
                }
                Entry::Spread { path, expr } => {
                    let value = expr(row);
                    let target = if path.is_empty() {
                        &mut out
                    } else {
                        // Materialize the nesting the sentinel sits at,
                        // without clobbering fields already placed there.
                        if !out.get_path(path).is_object() {
                            out.set_path(path, Value::Object(BTreeMap::new()));
                        }
                        match walk_mut(&mut out, path) {
                            Some(target) => target,
                            None => continue,
                        }
                    };
                    if let (Some(into), Some(from)) = (target.as_object_mut(), value.as_object()) {
                        for (name, field) in from {
                            into.insert(name.clone(), field.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// A projection closure for use in map operators.
    pub fn projector(self: Rc<Self>) -> impl Fn(&Value) -> Value {
        move |row| self.project(row, None)
    }
}

fn walk_mut<'v>(value: &'v mut Value, path: &[String]) -> Option<&'v mut Value> {
    let mut current = value;
    for step in path {
        current = current.as_object_mut()?.get_mut(step)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::col;
    use crate::object;

    #[test]
    fn dotted_keys_nest() {
        let select =
            vec![("id".to_string(), col("u.id")), ("info.age".to_string(), col("u.age"))];
        let compiled = CompiledSelect::compile(&select, &[]).unwrap();
        let row = object![("u", object![("id", 1), ("age", 30)])];
        assert_eq!(
            compiled.project(&row, None),
            object![("id", 1), ("info", object![("age", 30)])]
        );
    }

    #[test]
    fn spread_merges_source() {
        let select = vec![
            (format!("{SPREAD_SENTINEL}u__0"), col("u")),
            ("extra".to_string(), col("o.total")),
        ];
        let compiled = CompiledSelect::compile(&select, &[]).unwrap();
        let row = object![
            ("u", object![("id", 1), ("name", "a")]),
            ("o", object![("total", 9)])
        ];
        assert_eq!(
            compiled.project(&row, None),
            object![("id", 1), ("name", "a"), ("extra", 9)]
        );
    }

    #[test]
    fn nested_spread() {
        let select = vec![(format!("wrap.{SPREAD_SENTINEL}u__0"), col("u"))];
        let compiled = CompiledSelect::compile(&select, &[]).unwrap();
        let row = object![("u", object![("id", 1)])];
        assert_eq!(
            compiled.project(&row, None),
            object![("wrap", object![("id", 1)])]
        );
    }
}
