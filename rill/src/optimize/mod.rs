//! Pure rewrites over the query representation.
//!
//! The optimizer iterates a small set of passes to a fixed point (bounded,
//! with convergence decided by deep equality) and recurses into subqueries:
//! conjunctions are split into their clauses, single-source clauses are
//! pushed down into the source they filter, and subqueries that no longer
//! carry any clause collapse into their inner source. Clauses pushed below
//! an outer join are additionally retained on the outer query as residuals,
//! because rows nulled by the join must still be filtered there.
//!
//! Alongside the rewritten query, optimization reports per-alias source
//! filters: pushed-down predicates expressed over the source's own rows,
//! restricted to the operator set a collection subscription can evaluate
//! (`eq`, `gt`, `gte`, `lt`, `lte`, `in`, `and`, `or`). Subscriptions use
//! these as pre-filters; queries remain free to fall back to full scans.

use std::collections::BTreeMap;

use tracing::trace;

use crate::expr::{Expr, Function, JoinType, Query, RefPath};

/// The bound on rewrite iterations before the optimizer gives up on
/// convergence and returns the current shape.
const MAX_ITERATIONS: usize = 10;

/// Per-alias predicates a collection subscription can evaluate directly
/// against single rows of that source.
pub type SourceFilters = BTreeMap<String, Expr>;

/// Optimize `query`: rewrite to a fixed point and extract source filters.
pub fn optimize(query: &Query) -> (Query, SourceFilters) {
    let mut current = query.clone();
    for iteration in 0..MAX_ITERATIONS {
        let next = pass(&current);
        if next == current {
            trace!(iteration, "optimizer reached fixpoint");
            break;
        }
        current = next;
    }
    let filters = source_filters(&current);
    (current, filters)
}

/// One rewrite pass over a query node, recursing into subquery sources.
fn pass(query: &Query) -> Query {
    let mut query = query.clone();

    // Recurse into subquery sources first so inner fixpoints settle before
    // outer decisions read them.
    query.from = match query.from.take() {
        Some(Expr::QueryRef { query: inner, alias }) => {
            Some(Expr::QueryRef { query: Box::new(pass(&inner)), alias })
        }
        other => other,
    };
    for join in &mut query.join {
        if let Expr::QueryRef { query: inner, alias } = &join.from {
            join.from =
                Expr::QueryRef { query: Box::new(pass(inner)), alias: alias.clone() };
        }
    }

    split_conjunctions(&mut query);
    push_down(&mut query);
    flatten_sources(&mut query);
    query
}

/// Replace each `where`/`having` element by the flattened set of its
/// `and`-arguments.
fn split_conjunctions(query: &mut Query) {
    query.where_clauses = query.where_clauses.drain(..).flat_map(flatten_and).collect();
    query.having = query.having.drain(..).flat_map(flatten_and).collect();
}

fn flatten_and(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::Func { name: Function::And, args } => {
            args.into_iter().flat_map(flatten_and).collect()
        }
        other => vec![other],
    }
}

/// Which join type guards an alias, if any.
fn join_type_of(query: &Query, alias: &str) -> Option<JoinType> {
    query
        .join
        .iter()
        .find(|join| join.from.source_alias() == Some(alias))
        .map(|join| join.join_type)
}

/// Push single-source where clauses into the sources they filter.
///
/// Queries without joins are left in place: there is nothing to gain from
/// wrapping their only source, and the clause remains available for source
/// filter extraction.
fn push_down(query: &mut Query) {
    if query.join.is_empty() {
        return;
    }
    let aliases = query.aliases();
    let mut remaining = Vec::new();
    let mut pushed: Vec<(String, Expr)> = Vec::new();

    for clause in std::mem::take(&mut query.where_clauses) {
        let mut touched = Vec::new();
        clause.touched_aliases(&mut touched);
        let single_alias = match (touched.first(), touched.len()) {
            (Some(alias), 1) if aliases.contains(alias) => alias.clone(),
            _ => {
                remaining.push(clause);
                continue;
            }
        };
        if clause.has_bare_alias_ref(&aliases) {
            remaining.push(clause);
            continue;
        }
        let Some(rewritten) = push_into_source(query, &single_alias, &clause) else {
            remaining.push(clause);
            continue;
        };
        pushed.push((single_alias.clone(), rewritten));

        // Outer-joined sources can be nulled by the join, so the original
        // clause stays behind as a residual filter.
        let outer = match join_type_of(query, &single_alias) {
            Some(join_type) => join_type.is_outer(),
            // The root source is nulled by right and full joins.
            None => query
                .join
                .iter()
                .any(|join| matches!(join.join_type, JoinType::Right | JoinType::Full)),
        };
        if outer && !query.residual_where.contains(&clause) {
            query.residual_where.push(clause);
        }
    }
    query.where_clauses = remaining;

    for (alias, clause) in pushed {
        apply_push(query, &alias, clause);
    }
}

/// Rewrite `clause` for the inner query of `alias`'s source, or `None` when
/// the source cannot accept it.
fn push_into_source(query: &Query, alias: &str, clause: &Expr) -> Option<Expr> {
    let source = source_of(query, alias)?;
    match source {
        // Collections accept any single-source clause.
        Expr::CollectionRef { .. } => Some(clause.clone()),
        Expr::QueryRef { query: inner, .. } => {
            if inner.select_has_aggregates()
                || !inner.group_by.is_empty()
                || !inner.having.is_empty()
                || inner.fn_select.is_some()
                || !inner.fn_where.is_empty()
                || !inner.fn_having.is_empty()
                || (inner.limit.is_some() || inner.offset.is_some())
            {
                return None;
            }
            let inner_alias = inner.from.as_ref().and_then(Expr::source_alias)?.to_string();
            // A select that remaps the referenced field blocks the push
            // unless the projection is a plain rename we can follow.
            let mut rewritten = clause.clone();
            if let Some(select) = &inner.select {
                rewritten = remap_through_select(&rewritten, alias, select, &inner_alias)?;
            } else {
                rewritten = rewrite_alias(&rewritten, alias, &inner_alias);
            }
            Some(rewritten)
        }
        _ => None,
    }
}

fn source_of<'q>(query: &'q Query, alias: &str) -> Option<&'q Expr> {
    if query.from.as_ref().and_then(Expr::source_alias) == Some(alias) {
        return query.from.as_ref();
    }
    query.join.iter().map(|join| &join.from).find(|from| from.source_alias() == Some(alias))
}

/// Replace the leading path element `from` with `to` in every `Ref`.
fn rewrite_alias(expr: &Expr, from: &str, to: &str) -> Expr {
    match expr {
        Expr::Ref(path) if path.first().map(String::as_str) == Some(from) => {
            let mut path: RefPath = path.clone();
            path[0] = to.to_string();
            Expr::Ref(path)
        }
        Expr::Func { name, args } => Expr::Func {
            name: *name,
            args: args.iter().map(|arg| rewrite_alias(arg, from, to)).collect(),
        },
        other => other.clone(),
    }
}

/// Follow a plain-rename projection: a ref `alias.field` becomes the select
/// entry's expression when that entry is itself a `Ref`; anything computed
/// blocks the push.
fn remap_through_select(
    expr: &Expr,
    alias: &str,
    select: &[(String, Expr)],
    inner_alias: &str,
) -> Option<Expr> {
    match expr {
        Expr::Ref(path) if path.first().map(String::as_str) == Some(alias) => {
            let field = path.get(1)?;
            let (_, projected) = select.iter().find(|(name, _)| name == field)?;
            match projected {
                Expr::Ref(inner_path) => {
                    let mut rewritten: RefPath = inner_path.clone();
                    if rewritten.first().map(String::as_str) != Some(inner_alias) {
                        return None;
                    }
                    rewritten.extend(path.iter().skip(2).cloned());
                    Some(Expr::Ref(rewritten))
                }
                _ => None,
            }
        }
        Expr::Func { name, args } => {
            let args: Option<Vec<Expr>> = args
                .iter()
                .map(|arg| remap_through_select(arg, alias, select, inner_alias))
                .collect();
            Some(Expr::Func { name: *name, args: args? })
        }
        other => Some(other.clone()),
    }
}

/// Install a pushed clause: append to an existing QueryRef source or wrap a
/// collection source in a synthetic filter subquery.
fn apply_push(query: &mut Query, alias: &str, clause: Expr) {
    let push = |source: &mut Expr| match source {
        Expr::QueryRef { query: inner, .. } => {
            if !inner.where_clauses.contains(&clause) {
                inner.where_clauses.push(clause.clone());
            }
        }
        Expr::CollectionRef { .. } => {
            let inner = Query {
                from: Some(source.clone()),
                where_clauses: vec![clause.clone()],
                ..Query::default()
            };
            *source = Expr::QueryRef { query: Box::new(inner), alias: alias.to_string() };
        }
        _ => {}
    };
    if query.from.as_ref().and_then(Expr::source_alias) == Some(alias) {
        if let Some(from) = query.from.as_mut() {
            push(from);
        }
        return;
    }
    for join in &mut query.join {
        if join.from.source_alias() == Some(alias) {
            push(&mut join.from);
            return;
        }
    }
}

/// Collapse QueryRef sources whose inner query carries no clauses into the
/// inner `from`, re-aliased to the outer name.
fn flatten_sources(query: &mut Query) {
    let flatten = |source: &mut Expr| {
        let Expr::QueryRef { query: inner, alias } = source else {
            return;
        };
        if inner.has_clauses() || inner.single_result {
            return;
        }
        let Some(inner_from) = inner.from.clone() else {
            return;
        };
        *source = match inner_from {
            Expr::CollectionRef { id, .. } => Expr::CollectionRef { id, alias: alias.clone() },
            Expr::QueryRef { query, .. } => Expr::QueryRef { query, alias: alias.clone() },
            other => other,
        };
    };
    if let Some(from) = query.from.as_mut() {
        flatten(from);
    }
    for join in &mut query.join {
        flatten(&mut join.from);
    }
}

/// True when the expression uses only operators a collection subscription
/// can evaluate against single rows: comparisons, membership, and the
/// boolean connectives `and`/`or`, over refs and literals.
pub fn convertible_to_source_filter(expr: &Expr) -> bool {
    match expr {
        Expr::Value(_) | Expr::Ref(_) => true,
        Expr::Func { name, args } => {
            matches!(
                name,
                Function::Eq
                    | Function::Gt
                    | Function::Gte
                    | Function::Lt
                    | Function::Lte
                    | Function::In
                    | Function::And
                    | Function::Or
            ) && args.iter().all(convertible_to_source_filter)
        }
        _ => false,
    }
}

/// Strip the leading alias from every ref, turning a namespaced clause into
/// a single-row clause over the source's rows.
fn strip_alias(expr: &Expr, alias: &str) -> Expr {
    match expr {
        Expr::Ref(path) if path.first().map(String::as_str) == Some(alias) && path.len() > 1 => {
            Expr::Ref(path.iter().skip(1).cloned().collect())
        }
        Expr::Func { name, args } => Expr::Func {
            name: *name,
            args: args.iter().map(|arg| strip_alias(arg, alias)).collect(),
        },
        other => other.clone(),
    }
}

/// Collect per-alias pre-filter expressions from an optimized query.
fn source_filters(query: &Query) -> SourceFilters {
    let mut filters = SourceFilters::new();
    let mut sources: Vec<&Expr> = Vec::new();
    sources.extend(query.from.as_ref());
    sources.extend(query.join.iter().map(|join| &join.from));

    for source in sources {
        match source {
            Expr::QueryRef { query: inner, alias } => {
                // A plain filter subquery over a collection exports its
                // convertible clauses to the collection subscription.
                let Some(Expr::CollectionRef { alias: inner_alias, .. }) = inner.from.as_ref()
                else {
                    continue;
                };
                let convertible: Vec<Expr> = inner
                    .where_clauses
                    .iter()
                    .filter(|clause| convertible_to_source_filter(clause))
                    .map(|clause| strip_alias(clause, inner_alias))
                    .collect();
                if let Some(filter) = combine(convertible) {
                    filters.insert(alias.clone(), filter);
                }
            }
            Expr::CollectionRef { alias, .. } if query.join.is_empty() => {
                // Single-source queries keep clauses in their own where;
                // export the convertible subset directly.
                let convertible: Vec<Expr> = query
                    .where_clauses
                    .iter()
                    .filter(|clause| {
                        let mut touched = Vec::new();
                        clause.touched_aliases(&mut touched);
                        touched.len() == 1
                            && touched[0] == *alias
                            && convertible_to_source_filter(clause)
                    })
                    .map(|clause| strip_alias(clause, alias))
                    .collect();
                if let Some(filter) = combine(convertible) {
                    filters.insert(alias.clone(), filter);
                }
            }
            _ => {}
        }
    }
    filters
}

fn combine(mut clauses: Vec<Expr>) -> Option<Expr> {
    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(Expr::Func { name: Function::And, args: clauses }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::dsl::*;
    use crate::expr::{JoinClause, JoinType};

    fn users() -> Expr {
        Expr::CollectionRef { id: "users".into(), alias: "u".into() }
    }

    fn orders() -> Expr {
        Expr::CollectionRef { id: "orders".into(), alias: "o".into() }
    }

    fn join_query(join_type: JoinType) -> Query {
        Query {
            from: Some(users()),
            join: vec![JoinClause {
                from: orders(),
                join_type,
                on: eq(col("u.id"), col("o.uid")),
            }],
            where_clauses: vec![gt(col("u.age"), Expr::val(18))],
            ..Query::default()
        }
    }

    #[test]
    fn optimizer_is_idempotent() {
        for join_type in [JoinType::Inner, JoinType::Left, JoinType::Full] {
            let (once, _) = optimize(&join_query(join_type));
            let (twice, _) = optimize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn single_source_clause_pushes_into_collection() {
        let (optimized, _) = optimize(&join_query(JoinType::Inner));
        assert!(optimized.where_clauses.is_empty());
        assert!(optimized.residual_where.is_empty());
        let Some(Expr::QueryRef { query: inner, alias }) = &optimized.from else {
            panic!("users source was not wrapped: {:?}", optimized.from);
        };
        assert_eq!(alias, "u");
        assert_eq!(inner.where_clauses, vec![gt(col("u.age"), Expr::val(18))]);
    }

    #[test]
    fn conjunctions_split_before_classification() {
        let mut query = join_query(JoinType::Inner);
        query.where_clauses = vec![and(vec![
            gt(col("u.age"), Expr::val(18)),
            eq(col("o.total"), Expr::val(5)),
            eq(col("u.id"), col("o.uid")),
        ])];
        let (optimized, _) = optimize(&query);
        // The multi-source conjunct stays; the single-source ones moved.
        assert_eq!(optimized.where_clauses, vec![eq(col("u.id"), col("o.uid"))]);
        let Some(Expr::QueryRef { query: inner, .. }) = &optimized.from else {
            panic!("users source was not wrapped");
        };
        assert_eq!(inner.where_clauses.len(), 1);
    }

    #[test]
    fn left_join_clause_on_nullable_side_keeps_residual() {
        let mut query = join_query(JoinType::Left);
        query.where_clauses = vec![gt(col("o.total"), Expr::val(10))];
        let (optimized, _) = optimize(&query);
        // Pushed into the orders source and retained as residual.
        assert_eq!(
            optimized.residual_where,
            vec![gt(col("o.total"), Expr::val(10))]
        );
        let Expr::QueryRef { query: inner, .. } = &optimized.join[0].from else {
            panic!("orders source was not wrapped");
        };
        assert_eq!(inner.where_clauses, vec![gt(col("o.total"), Expr::val(10))]);
    }

    #[test]
    fn root_source_under_left_join_has_no_residual() {
        let (optimized, _) = optimize(&join_query(JoinType::Left));
        assert!(optimized.residual_where.is_empty());
    }

    #[test]
    fn bare_alias_refs_stay_multi_source() {
        let mut query = join_query(JoinType::Inner);
        query.where_clauses = vec![eq(col("u"), Expr::val(1))];
        let (optimized, _) = optimize(&query);
        assert_eq!(optimized.where_clauses, vec![eq(col("u"), Expr::val(1))]);
    }

    #[test]
    fn redundant_subquery_flattens() {
        let inner = Query::from_source(users());
        let query = Query {
            from: Some(Expr::QueryRef { query: Box::new(inner), alias: "x".into() }),
            ..Query::default()
        };
        let (optimized, _) = optimize(&query);
        assert_eq!(
            optimized.from,
            Some(Expr::CollectionRef { id: "users".into(), alias: "x".into() })
        );
    }

    #[test]
    fn source_filters_exported_for_convertible_clauses() {
        let (_, filters) = optimize(&join_query(JoinType::Inner));
        assert_eq!(filters.get("u"), Some(&gt(col("age"), Expr::val(18))));

        // A like clause is not convertible and exports nothing.
        let mut query = join_query(JoinType::Inner);
        query.where_clauses =
            vec![Expr::func(Function::Like, vec![col("u.name"), Expr::val("a%")])];
        let (_, filters) = optimize(&query);
        assert!(filters.get("u").is_none());
    }

    #[test]
    fn single_source_query_exports_filters_without_rewriting() {
        let query = Query {
            from: Some(users()),
            where_clauses: vec![gt(col("u.age"), Expr::val(18))],
            ..Query::default()
        };
        let (optimized, filters) = optimize(&query);
        assert_eq!(optimized.where_clauses.len(), 1);
        assert_eq!(filters.get("u"), Some(&gt(col("age"), Expr::val(18))));
    }

    #[test]
    fn pushdown_through_renaming_select() {
        let inner = Query {
            from: Some(users()),
            select: Some(vec![("years".into(), col("u.age"))]),
            ..Query::default()
        };
        let query = Query {
            from: Some(Expr::QueryRef { query: Box::new(inner), alias: "x".into() }),
            join: vec![JoinClause {
                from: orders(),
                join_type: JoinType::Inner,
                on: eq(col("x.id"), col("o.uid")),
            }],
            where_clauses: vec![gt(col("x.years"), Expr::val(18))],
            ..Query::default()
        };
        let (optimized, _) = optimize(&query);
        assert!(optimized.where_clauses.is_empty());
        let Some(Expr::QueryRef { query: inner, .. }) = &optimized.from else {
            panic!("subquery source missing");
        };
        assert_eq!(inner.where_clauses, vec![gt(col("u.age"), Expr::val(18))]);
    }

    #[test]
    fn aggregate_subquery_blocks_pushdown() {
        let inner = Query {
            from: Some(users()),
            group_by: vec![col("u.city")],
            select: Some(vec![("city".into(), col("u.city"))]),
            ..Query::default()
        };
        let query = Query {
            from: Some(Expr::QueryRef { query: Box::new(inner), alias: "x".into() }),
            join: vec![JoinClause {
                from: orders(),
                join_type: JoinType::Inner,
                on: eq(col("x.city"), col("o.city")),
            }],
            where_clauses: vec![eq(col("x.city"), Expr::val("berlin"))],
            ..Query::default()
        };
        let (optimized, _) = optimize(&query);
        assert_eq!(optimized.where_clauses.len(), 1);
    }
}
