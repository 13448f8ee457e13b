//! Removes embedded conditions from aggregates.
//!
//! `SUM(x WHERE c)` has no direct SQL form. On a single-range query the
//! condition can usually become the WHERE clause; everywhere else it is folded
//! into the aggregated value as `SUM(CASE WHEN c THEN x ELSE NULL END)`, or
//! handed to a correlated subquery when the strategy asks for it.

use log::debug;

use super::any_exists::{AnyLocation, correlated_scope};
use super::join_optimizer::included_ranges;
use crate::entity_store::EntityMetadata;
use crate::query_ast::ast::{Ast, Node, NodeId, Query, Subquery, SubqueryKind};
use crate::query_ast::visitor::Visit;

/// Decides between a correlated subquery and `CASE WHEN` for one conditional
/// aggregate of a multi-range query.
pub trait AggregateStrategy: Send + Sync {
    /// `true` wraps `aggregate` in a subquery. The default keeps every
    /// aggregate in the main query as `CASE WHEN`.
    fn wrap_in_subquery(&self, _ast: &Ast, _aggregate: NodeId) -> bool { false }
}

/// The default policy: always `CASE WHEN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferCaseWhen;

impl AggregateStrategy for PreferCaseWhen {}

pub struct AggregateOptimizer<'a> {
    metadata: &'a dyn EntityMetadata,
    strategy: &'a dyn AggregateStrategy,
}

impl<'a> AggregateOptimizer<'a> {
    pub fn new(metadata: &'a dyn EntityMetadata, strategy: &'a dyn AggregateStrategy) -> Self {
        Self { metadata, strategy }
    }

    pub fn optimize(&self, query: &mut Query, scope: NodeId) -> bool {
        let ranges = included_ranges(query, scope);
        if ranges.len() <= 1 {
            optimize_single_range(query, scope)
        } else {
            self.optimize_multi_range(query, scope, &ranges)
        }
    }

    fn optimize_multi_range(&self, query: &mut Query, scope: NodeId, ranges: &[NodeId]) -> bool {
        let retrieve = query.scope(scope);
        let ast = query.ast();
        let mut sites: Vec<(NodeId, AnyLocation)> = Vec::new();
        for &value in &retrieve.values {
            sites.extend(conditional_aggregates(ast, value).into_iter().map(|a| (a, AnyLocation::Select)));
        }
        if let Some(cond) = retrieve.conditions {
            sites.extend(conditional_aggregates(ast, cond).into_iter().map(|a| (a, AnyLocation::Conditions)));
        }
        for item in &retrieve.sort {
            sites.extend(conditional_aggregates(ast, item.expression).into_iter().map(|a| (a, AnyLocation::OrderBy)));
        }

        let mut changed = false;
        for (aggregate, location) in sites.into_iter().rev() {
            if self.strategy.wrap_in_subquery(query.ast(), aggregate)
                && self.wrap_as_subquery(query, ranges, aggregate, location)
            {
                changed = true;
                continue;
            }
            changed |= fold_into_case_when(query.ast_mut(), aggregate);
        }
        changed
    }

    fn wrap_as_subquery(&self, query: &mut Query, ranges: &[NodeId], aggregate: NodeId, location: AnyLocation) -> bool {
        let ast = query.ast_mut();
        let Some(agg) = ast.aggregate(aggregate).cloned() else { return false };
        let referenced = ast.referenced_ranges(aggregate);
        let used: Vec<NodeId> = ranges.iter().copied().filter(|r| referenced.contains(r)).collect();
        if used.is_empty() { return false; }

        let Some(sub) = correlated_scope(ast, self.metadata, &used, agg.expression, agg.conditions) else {
            debug!("no anchor for {} subquery, folding into CASE WHEN", agg.function.name());
            return false;
        };

        let (kind, expression) = match (agg.function.is_any(), location) {
            (true, AnyLocation::Conditions) => (SubqueryKind::Exists, None),
            (true, _) => (SubqueryKind::CaseWhen, None),
            (false, _) => {
                let value = ast.deep_clone_with(agg.expression, &sub.rebind);
                (SubqueryKind::Scalar, Some(ast.aggregate_node(agg.function, value, None)))
            }
        };
        let replacement = ast.add(Node::Subquery(Subquery { kind, ranges: sub.ranges, expression, conditions: sub.conditions }));
        ast.replace(aggregate, replacement);
        debug!("{} with condition moved into {:?} subquery", agg.function.name(), kind);
        true
    }
}

/// Single-range regime: a lone conditional aggregate donates its condition to
/// the empty WHERE clause, remaining conditional aggregates in the projection
/// and ORDER BY become `CASE WHEN`.
pub fn optimize_single_range(query: &mut Query, scope: NodeId) -> bool {
    let retrieve = query.scope(scope);
    let values = retrieve.values.clone();
    let sort: Vec<NodeId> = retrieve.sort.iter().map(|s| s.expression).collect();
    let mut changed = false;

    if let [only] = values.as_slice()
        && query.scope(scope).conditions.is_none()
    {
        let ast = query.ast_mut();
        let expression = match ast.node(*only) {
            Node::Alias(a) => a.expression,
            _ => *only,
        };
        if let Some(agg) = ast.aggregate(expression)
            && !agg.function.is_any()
            && let Some(cond) = agg.conditions
        {
            let name = agg.function.name();
            ast.set_conditions(expression, None);
            ast.set_conditions(scope, Some(cond));
            debug!("condition of {} promoted to WHERE", name);
            changed = true;
        }
    }

    for root in values.into_iter().chain(sort) {
        for aggregate in conditional_aggregates(query.ast(), root).into_iter().rev() {
            changed |= fold_into_case_when(query.ast_mut(), aggregate);
        }
    }
    changed
}

/// Conditional aggregates under `root` in pre-order, subquery interiors skipped.
fn conditional_aggregates(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut collect = |ast: &Ast, id: NodeId| match ast.node(id) {
        Node::Aggregate(_) => {
            if ast.conditions_of(id).is_some() { out.push(id); }
            Visit::Descend
        }
        Node::Subquery(_) => Visit::Skip,
        _ => Visit::Descend,
    };
    let _ = ast.accept(root, &mut collect);
    out
}

/// `AGG(x WHERE c)` -> `AGG(CASE WHEN c THEN x ELSE NULL END)`.
pub fn fold_into_case_when(ast: &mut Ast, aggregate: NodeId) -> bool {
    let Some(agg) = ast.aggregate(aggregate).cloned() else { return false };
    let Some(cond) = agg.conditions else { return false };
    ast.set_conditions(aggregate, None);
    let null = ast.null();
    let case = ast.case_when(cond, agg.expression, Some(null));
    ast.replace_child(aggregate, agg.expression, case);
    debug!("{} condition folded into CASE WHEN", agg.function.name());
    true
}
