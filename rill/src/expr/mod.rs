//! The relational expression and query intermediate representation.
//!
//! Queries are plain data: a tree of references, literals, and calls drawn
//! from a closed function set, wrapped in a `Query` node carrying the
//! relational clauses. The optimizer rewrites this representation and the
//! compiler lowers it onto the change pipeline; both rely on the IR being
//! cheaply clonable and comparable so rewrites can run to a fixed point.

pub mod eval;
pub mod functions;

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::Error;
use crate::value::Value;

/// A dotted reference path, e.g. `["user", "address", "city"]`.
pub type RefPath = SmallVec<[String; 4]>;

/// Marks a select key whose value spreads an entire source or computed
/// object into the select scope. The full key format is
/// `__SPREAD_SENTINEL__<alias-or-path>__<n>`.
pub const SPREAD_SENTINEL: &str = "__SPREAD_SENTINEL__";

/// The closed set of scalar functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    /// Equality with date-to-epoch normalization.
    Eq,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Gte,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Lte,
    /// Short-circuit conjunction.
    And,
    /// Short-circuit disjunction.
    Or,
    /// Boolean inverse.
    Not,
    /// Membership in an array value.
    In,
    /// SQL-style pattern match.
    Like,
    /// Case-insensitive pattern match.
    Ilike,
    /// String upper-casing.
    Upper,
    /// String lower-casing.
    Lower,
    /// String or array length.
    Length,
    /// String concatenation with coercion.
    Concat,
    /// First non-null argument.
    Coalesce,
    /// Addition with null treated as zero.
    Add,
    /// Subtraction with null treated as zero.
    Subtract,
    /// Multiplication with null treated as zero.
    Multiply,
    /// Division, null on zero divisor.
    Divide,
    /// Identity check against null.
    #[serde(rename = "isNull")]
    IsNull,
    /// Identity check against undefined.
    #[serde(rename = "isUndefined")]
    IsUndefined,
}

impl Function {
    /// The wire name of the function.
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Eq => "eq",
            Function::Gt => "gt",
            Function::Gte => "gte",
            Function::Lt => "lt",
            Function::Lte => "lte",
            Function::And => "and",
            Function::Or => "or",
            Function::Not => "not",
            Function::In => "in",
            Function::Like => "like",
            Function::Ilike => "ilike",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Length => "length",
            Function::Concat => "concat",
            Function::Coalesce => "coalesce",
            Function::Add => "add",
            Function::Subtract => "subtract",
            Function::Multiply => "multiply",
            Function::Divide => "divide",
            Function::IsNull => "isNull",
            Function::IsUndefined => "isUndefined",
        }
    }

    /// Parse a wire name, rejecting anything outside the closed set.
    pub fn parse(name: &str) -> Result<Function, Error> {
        Ok(match name {
            "eq" => Function::Eq,
            "gt" => Function::Gt,
            "gte" => Function::Gte,
            "lt" => Function::Lt,
            "lte" => Function::Lte,
            "and" => Function::And,
            "or" => Function::Or,
            "not" => Function::Not,
            "in" => Function::In,
            "like" => Function::Like,
            "ilike" => Function::Ilike,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "length" => Function::Length,
            "concat" => Function::Concat,
            "coalesce" => Function::Coalesce,
            "add" => Function::Add,
            "subtract" => Function::Subtract,
            "multiply" => Function::Multiply,
            "divide" => Function::Divide,
            "isNull" => Function::IsNull,
            "isUndefined" => Function::IsUndefined,
            other => return Err(Error::UnknownFunction(other.to_string())),
        })
    }
}

/// The supported aggregate functions, compiled by the group-by operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    /// Running sum.
    Sum,
    /// Row count.
    Count,
    /// Arithmetic mean.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

impl AggregateFunction {
    /// The wire name of the aggregate.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// A host-supplied row function, compared by identity so rewritten queries
/// can still be checked for convergence.
#[derive(Clone)]
pub struct RowFn(pub Rc<dyn Fn(&Value) -> Value>);

impl RowFn {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&Value) -> Value + 'static) -> Self {
        RowFn(Rc::new(f))
    }

    /// Apply to a row.
    pub fn call(&self, row: &Value) -> Value {
        (self.0)(row)
    }
}

impl PartialEq for RowFn {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for RowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowFn(..)")
    }
}

/// An expression node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A literal value.
    Value(Value),
    /// A reference path into a row; under namespaced evaluation the first
    /// element selects a source alias.
    Ref(RefPath),
    /// A scalar function call.
    Func {
        /// Which function.
        name: Function,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// An aggregate call; legal only where group-by compilation handles it.
    Aggregate {
        /// Which aggregate.
        name: AggregateFunction,
        /// Argument expressions (empty for `count`).
        args: Vec<Expr>,
    },
    /// A reference to a registered collection under an alias.
    CollectionRef {
        /// The collection's stable identity.
        id: String,
        /// The alias this source is addressed by.
        alias: String,
    },
    /// A subquery under an alias.
    QueryRef {
        /// The inner query.
        query: Box<Query>,
        /// The alias this source is addressed by.
        alias: String,
    },
}

impl Expr {
    /// A literal.
    pub fn val(value: impl Into<Value>) -> Expr {
        Expr::Value(value.into())
    }

    /// A reference path from dotted-segment strings.
    pub fn field<S: AsRef<str>>(path: &[S]) -> Expr {
        Expr::Ref(path.iter().map(|s| s.as_ref().to_string()).collect())
    }

    /// A function call.
    pub fn func(name: Function, args: Vec<Expr>) -> Expr {
        Expr::Func { name, args }
    }

    /// An aggregate call.
    pub fn aggregate(name: AggregateFunction, args: Vec<Expr>) -> Expr {
        Expr::Aggregate { name, args }
    }

    /// The alias of a source reference, if this is one.
    pub fn source_alias(&self) -> Option<&str> {
        match self {
            Expr::CollectionRef { alias, .. } | Expr::QueryRef { alias, .. } => Some(alias),
            _ => None,
        }
    }

    /// True when any node in the tree is an aggregate call.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            _ => false,
        }
    }

    /// Collect the distinct leading path elements of every `Ref` in the
    /// tree: under namespaced evaluation, the set of aliases it touches.
    pub fn touched_aliases(&self, into: &mut Vec<String>) {
        match self {
            Expr::Ref(path) => {
                if let Some(first) = path.first() {
                    if !into.iter().any(|a| a == first) {
                        into.push(first.clone());
                    }
                }
            }
            Expr::Func { args, .. } | Expr::Aggregate { args, .. } => {
                for arg in args {
                    arg.touched_aliases(into);
                }
            }
            _ => {}
        }
    }

    /// True when some `Ref` consists solely of an alias root (it addresses a
    /// whole source rather than a field of it).
    pub fn has_bare_alias_ref(&self, aliases: &[String]) -> bool {
        match self {
            Expr::Ref(path) => {
                path.len() == 1 && aliases.iter().any(|a| Some(a.as_str()) == path.first().map(String::as_str))
            }
            Expr::Func { args, .. } | Expr::Aggregate { args, .. } => {
                args.iter().any(|arg| arg.has_bare_alias_ref(aliases))
            }
            _ => false,
        }
    }
}

/// Shorthand constructors for the common predicate shapes.
pub mod dsl {
    use super::*;

    /// `eq(left, right)`.
    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::func(Function::Eq, vec![left, right])
    }
    /// `gt(left, right)`.
    pub fn gt(left: Expr, right: Expr) -> Expr {
        Expr::func(Function::Gt, vec![left, right])
    }
    /// `gte(left, right)`.
    pub fn gte(left: Expr, right: Expr) -> Expr {
        Expr::func(Function::Gte, vec![left, right])
    }
    /// `lt(left, right)`.
    pub fn lt(left: Expr, right: Expr) -> Expr {
        Expr::func(Function::Lt, vec![left, right])
    }
    /// `lte(left, right)`.
    pub fn lte(left: Expr, right: Expr) -> Expr {
        Expr::func(Function::Lte, vec![left, right])
    }
    /// `and(clauses...)`.
    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::func(Function::And, args)
    }
    /// `or(clauses...)`.
    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::func(Function::Or, args)
    }
    /// `not(arg)`.
    pub fn not(arg: Expr) -> Expr {
        Expr::func(Function::Not, vec![arg])
    }
    /// `in(needle, haystack)`.
    pub fn is_in(needle: Expr, haystack: Expr) -> Expr {
        Expr::func(Function::In, vec![needle, haystack])
    }
    /// A reference from a dotted string, e.g. `"u.age"`.
    pub fn col(dotted: &str) -> Expr {
        Expr::Ref(dotted.split('.').map(str::to_string).collect())
    }
}

/// The join types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// Rows present on both sides.
    Inner,
    /// All left rows, right side null-padded.
    Left,
    /// All right rows, left side null-padded.
    Right,
    /// All rows from either side.
    Full,
}

impl JoinType {
    /// True for left, right, and full joins.
    pub fn is_outer(&self) -> bool {
        !matches!(self, JoinType::Inner)
    }
}

/// One join clause: a source, a type, and an equality condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    /// The joined source (collection or subquery reference).
    pub from: Expr,
    /// The join type.
    pub join_type: JoinType,
    /// The join condition; must be a single `eq`.
    pub on: Expr,
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Where nulls sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    /// Nulls before every other value.
    First,
    /// Nulls after every other value.
    #[default]
    Last,
}

/// How strings compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringSort {
    /// Plain byte-wise comparison.
    #[default]
    Lexical,
    /// Locale-aware comparison (case-insensitive primary strength).
    Locale,
}

/// Options shaping an order-by comparator, and the compatibility contract
/// an index must satisfy to serve an ordered scan.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompareOptions {
    /// Sort direction.
    pub direction: Direction,
    /// Null placement.
    pub nulls: NullsOrder,
    /// String comparison mode.
    pub string_sort: StringSort,
    /// Locale tag for locale string sorting.
    pub locale: Option<String>,
}

/// One order-by clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderByClause {
    /// The sort key expression.
    pub expr: Expr,
    /// Comparator options.
    pub compare: CompareOptions,
}

/// A relational query node.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// The root source; required.
    pub from: Option<Expr>,
    /// Join clauses, processed left to right.
    pub join: Vec<JoinClause>,
    /// Conjunctive filter clauses.
    #[serde(rename = "where")]
    pub where_clauses: Vec<Expr>,
    /// Pushed-down clauses retained on the outer query because an outer
    /// join can null the rows they filter; exempt from further pushdown.
    #[serde(default)]
    pub residual_where: Vec<Expr>,
    /// Post-aggregation filter clauses.
    pub having: Vec<Expr>,
    /// Ordering clauses.
    pub order_by: Vec<OrderByClause>,
    /// Grouping expressions.
    pub group_by: Vec<Expr>,
    /// Projection: output name to expression, in authoring order.
    pub select: Option<Vec<(String, Expr)>>,
    /// Collapse duplicate select rows.
    pub distinct: bool,
    /// Row limit; requires ordering.
    pub limit: Option<usize>,
    /// Row offset; requires ordering.
    pub offset: Option<usize>,
    /// Host-supplied projection, applied after `select`.
    #[serde(skip)]
    pub fn_select: Option<RowFn>,
    /// Host-supplied filters, applied after `where`.
    #[serde(skip)]
    pub fn_where: Vec<RowFn>,
    /// Host-supplied having filters.
    #[serde(skip)]
    pub fn_having: Vec<RowFn>,
    /// The query resolves to at most one row.
    pub single_result: bool,
}

impl Query {
    /// A query over a single source.
    pub fn from_source(source: Expr) -> Query {
        Query { from: Some(source), ..Query::default() }
    }

    /// True when the query carries any clause beyond its `from`: such a
    /// query cannot be flattened away.
    pub fn has_clauses(&self) -> bool {
        !self.where_clauses.is_empty()
            || !self.residual_where.is_empty()
            || self.select.is_some()
            || !self.group_by.is_empty()
            || !self.having.is_empty()
            || !self.order_by.is_empty()
            || !self.join.is_empty()
            || self.limit.is_some()
            || self.offset.is_some()
            || self.fn_select.is_some()
            || !self.fn_where.is_empty()
            || !self.fn_having.is_empty()
            || self.distinct
    }

    /// True when the select clause contains an aggregate expression.
    pub fn select_has_aggregates(&self) -> bool {
        self.select
            .as_ref()
            .map(|select| select.iter().any(|(_, expr)| expr.contains_aggregate()))
            .unwrap_or(false)
    }

    /// Every source alias declared by this query, `from` first.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = Vec::new();
        if let Some(alias) = self.from.as_ref().and_then(Expr::source_alias) {
            aliases.push(alias.to_string());
        }
        for join in &self.join {
            if let Some(alias) = join.from.source_alias() {
                aliases.push(alias.to_string());
            }
        }
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::dsl::*;
    use super::*;

    #[test]
    fn function_names_round_trip() {
        for f in [
            Function::Eq,
            Function::Ilike,
            Function::IsNull,
            Function::IsUndefined,
            Function::Coalesce,
        ] {
            assert_eq!(Function::parse(f.as_str()).unwrap(), f);
        }
        assert!(matches!(
            Function::parse("regexp"),
            Err(Error::UnknownFunction(name)) if name == "regexp"
        ));
    }

    #[test]
    fn touched_aliases_walks_the_tree() {
        let clause = and(vec![
            gt(col("u.age"), Expr::val(18)),
            eq(col("u.id"), col("o.uid")),
        ]);
        let mut aliases = Vec::new();
        clause.touched_aliases(&mut aliases);
        assert_eq!(aliases, vec!["u".to_string(), "o".to_string()]);
    }

    #[test]
    fn bare_alias_refs_are_detected() {
        let aliases = vec!["u".to_string()];
        assert!(col("u").has_bare_alias_ref(&aliases));
        assert!(!col("u.age").has_bare_alias_ref(&aliases));
    }
}
