//! Rewrites `ANY(...)` into `EXISTS` / `CASE WHEN EXISTS` subqueries.
//!
//! For every ANY node the optimizer works on copies of the ranges the node reads
//! from: join predicates are split into the part that stays inside the subquery
//! and the part that correlates with the outer query, an anchor is chosen among
//! the copies, and only then is the ANY node swapped out. If no anchor can be
//! found the ANY node stays as it is and the compile step rejects the query.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, trace};

use super::anchor::{anchor_first, current_anchor, ensure_single_anchor};
use super::join_optimizer::included_ranges;
use super::predicate_split::split;
use super::predicates::combine_and;
use super::range_usage::analyze;
use crate::entity_store::EntityMetadata;
use crate::query_ast::ast::{Ast, Node, NodeId, Query, Subquery, SubqueryKind, Window};

/// Where an ANY node sits in its query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyLocation {
    Select,
    Conditions,
    /// Left alone.
    OrderBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Site {
    location: AnyLocation,
    /// Directly under a top-level projection alias.
    top_level: bool,
}

pub struct AnyOptimizer<'a> {
    metadata: &'a dyn EntityMetadata,
}

impl<'a> AnyOptimizer<'a> {
    pub fn new(metadata: &'a dyn EntityMetadata) -> Self { Self { metadata } }

    /// Rewrite the ANY nodes of `scope`. Nested retrieve scopes are left to
    /// their own call.
    pub fn optimize(&self, query: &mut Query, scope: NodeId) -> bool {
        let ast = query.ast();
        // Innermost first, so an outer ANY sees its nested ones already rewritten.
        let candidates: Vec<NodeId> = ast
            .post_order(scope)
            .into_iter()
            .filter(|&id| ast.aggregate(id).is_some_and(|a| a.function.is_any()))
            .collect();

        let mut changed = false;
        for any in candidates {
            let Some(site) = locate(query.ast(), scope, any) else {
                trace!("ANY node {:?} is outside the query projection and WHERE", any);
                continue;
            };
            if site.location == AnyLocation::OrderBy {
                trace!("ANY node {:?} in ORDER BY left as is", any);
                continue;
            }
            changed |= self.rewrite(query, scope, any, site);
        }
        changed
    }

    /// Replace `any` with its subquery.
    ///
    /// The inlining fast path (`ANY` -> `1` plus a one-row window) is only
    /// taken when the ANY is also the scope's sole projected value: the window
    /// caps the whole result, which would drop rows from any other column.
    fn rewrite(&self, query: &mut Query, scope: NodeId, any: NodeId, site: Site) -> bool {
        let ranges = included_ranges(query, scope);
        let sole_value = query.scope(scope).values.len() == 1;
        let ast = query.ast_mut();
        let Some(aggregate) = ast.aggregate(any).cloned() else { return false };

        let Some(sub) = correlated_scope(ast, self.metadata, &ranges, aggregate.expression, aggregate.conditions) else {
            debug!("no safe anchor for ANY node {:?}, keeping it", any);
            return false;
        };

        let kind = match site.location {
            AnyLocation::Conditions => SubqueryKind::Exists,
            _ => SubqueryKind::CaseWhen,
        };

        if kind == SubqueryKind::CaseWhen && sub.conditions.is_none() && sub.ranges.len() == 1 && site.top_level && sole_value {
            let one = ast.number("1");
            ast.replace(any, one);
            debug!("ANY over unfiltered range '{}' inlined as 1", ast.range_name(sub.ranges[0]));
            let retrieve = query.scope_mut(scope);
            if retrieve.window.is_none() {
                retrieve.window = Some(Window { offset: 0, size: 1 });
            }
            return true;
        }

        let range_count = sub.ranges.len();
        let replacement = ast.add(Node::Subquery(Subquery {
            kind,
            ranges: sub.ranges,
            expression: None,
            conditions: sub.conditions,
        }));
        ast.replace(any, replacement);
        debug!("ANY node {:?} rewritten to {:?} subquery over {} range(s)", any, kind, range_count);
        true
    }
}

/// Detached copies of the ranges a nested aggregate reads from, plus the WHERE
/// clause the subquery built from them needs.
#[derive(Debug, Clone)]
pub struct CorrelatedScope {
    /// Anchor first.
    pub ranges: Vec<NodeId>,
    pub conditions: Option<NodeId>,
    /// Original range -> copy.
    pub rebind: HashMap<NodeId, NodeId>,
}

/// Build the subquery scope for `expression` filtered by `conditions`.
///
/// Ranges used by either part are live and get copied. Ranges only mentioned
/// in some join predicate are correlation ranges: predicates on them move from
/// the copies' join predicates into the subquery WHERE, where they keep pointing
/// at the outer query. Returns `None` when `scope` is empty or no copy can
/// serve as anchor; nothing reachable from the query has been touched then.
pub fn correlated_scope(
    ast: &mut Ast,
    metadata: &dyn EntityMetadata,
    scope: &[NodeId],
    expression: NodeId,
    conditions: Option<NodeId>,
) -> Option<CorrelatedScope> {
    let first = *scope.first()?;
    let usage = analyze(ast, metadata, &[expression], conditions, scope);
    let joins = join_references(ast, scope);

    let mut live: Vec<NodeId> = scope.iter().copied().filter(|&r| usage.is_live(ast.range_name(r))).collect();
    if live.is_empty() {
        let referenced = ast.referenced_ranges(expression);
        live = scope.iter().copied().filter(|r| referenced.contains(r)).collect();
    }
    if live.is_empty() {
        live.push(first);
    }

    let live_names: BTreeSet<String> = live.iter().map(|&r| ast.range_name(r).to_string()).collect();
    let correlation: BTreeSet<String> =
        joins.values().flatten().filter(|name| !live_names.contains(*name)).cloned().collect();
    trace!("subquery scope: live={:?} correlation={:?}", live_names, correlation);

    let (copies, rebind) = clone_ranges(ast, &live);
    let mut promoted = Vec::new();
    for &copy in &copies {
        let join = ast.range(copy).and_then(|r| r.join_property);
        let parts = split(ast, join, &live_names, &correlation);
        ast.set_join_property(copy, parts.inner);
        promoted.extend(parts.correlation);
    }

    let own = conditions.map(|c| ast.deep_clone_with(c, &rebind));
    let parts: Vec<NodeId> = own.into_iter().chain(promoted).collect();
    let where_clause = combine_and(ast, &parts);

    let (ranges, where_clause) = ensure_single_anchor(ast, &copies, where_clause, &usage);
    let anchor = current_anchor(ast, &ranges)?;
    Some(CorrelatedScope { ranges: anchor_first(&ranges, anchor), conditions: where_clause, rebind })
}

/// For each range with a join predicate, the other range names it mentions.
fn join_references(ast: &Ast, ranges: &[NodeId]) -> BTreeMap<String, BTreeSet<String>> {
    let mut out = BTreeMap::new();
    for &r in ranges {
        let Some(range) = ast.range(r) else { continue };
        let Some(join) = range.join_property else { continue };
        let mut names = ast.referenced_range_names(join);
        names.remove(&range.name);
        out.insert(range.name.clone(), names);
    }
    out
}

/// Deep copies of `ranges`; join predicates among them are re-pointed at the
/// copies, references to anything else stay on the originals.
fn clone_ranges(ast: &mut Ast, ranges: &[NodeId]) -> (Vec<NodeId>, HashMap<NodeId, NodeId>) {
    let mut rebind = HashMap::new();
    let mut copies = Vec::with_capacity(ranges.len());
    for &r in ranges {
        let copy = ast.deep_clone(r);
        rebind.insert(r, copy);
        copies.push(copy);
    }
    for &copy in &copies {
        if let Some(join) = ast.range(copy).and_then(|r| r.join_property) {
            ast.rebind_identifiers(join, &rebind);
        }
    }
    (copies, rebind)
}

/// Walk up from `any` to the scope root and classify the slot it hangs off.
fn locate(ast: &Ast, scope: NodeId, any: NodeId) -> Option<Site> {
    let mut child = any;
    let mut boolean = false;
    loop {
        let parent = ast.parent(child)?;
        if parent == scope {
            let retrieve = ast.retrieve(scope)?;
            let location = if retrieve.values.contains(&child) {
                if boolean { AnyLocation::Conditions } else { AnyLocation::Select }
            } else if retrieve.conditions == Some(child) {
                AnyLocation::Conditions
            } else if retrieve.sort.iter().any(|s| s.expression == child) {
                AnyLocation::OrderBy
            } else {
                return None;
            };
            let top_level = !boolean && ast.parent(any) == Some(child) && matches!(ast.node(child), Node::Alias(_));
            return Some(Site { location, top_level });
        }
        match ast.node(parent) {
            Node::Aggregate(a) if a.conditions == Some(child) => boolean = true,
            Node::Case(c) if c.condition == child => boolean = true,
            Node::Range(_) | Node::Subquery(_) | Node::Retrieve(_) => return None,
            _ => {}
        }
        child = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::EntityStore;
    use crate::query_ast::ast::BinaryOp;
    use crate::query_ast::builder::QueryBuilder;

    #[test]
    fn any_in_sort_is_not_rewritten() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let id = b.ident(o, "id");
        let any = b.any(id, None);
        b.order_by(any, false);
        let total = b.ident(o, "total");
        b.select(total);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = EntityStore::new();
        assert!(!AnyOptimizer::new(&store).optimize(&mut q, root));
        assert!(q.ast().aggregate(any).is_some());
    }

    #[test]
    fn correlation_moves_into_subquery_where() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let link = b.join_eq(o, "customerId", c, "id");
        b.via(o, link, false);
        let name = b.ident(c, "name");
        b.select(name);
        let id = b.ident(o, "id");
        let big = b.cmp(o, "total", BinaryOp::Gt, "100");
        let any = b.any(id, Some(big));
        b.filter(any);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = EntityStore::new();
        assert!(AnyOptimizer::new(&store).optimize(&mut q, root));
        let ast = q.ast();
        let cond = q.retrieve().conditions.unwrap();
        let sub = ast.subquery(cond).expect("EXISTS subquery in WHERE");
        assert_eq!(sub.kind, SubqueryKind::Exists);
        assert_eq!(sub.ranges.len(), 1);
        let inner = ast.range(sub.ranges[0]).unwrap();
        assert_eq!(inner.name, "o");
        assert!(inner.is_anchor());
        assert_ne!(sub.ranges[0], o);
        // The outer customer is still referenced from inside.
        assert!(ast.referenced_ranges(sub.conditions.unwrap()).contains(&c));
        // The outer `o` range is untouched.
        assert_eq!(ast.range(o).unwrap().join_property, Some(link));
    }

    #[test]
    fn sole_unfiltered_any_is_inlined() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let id = b.ident(o, "id");
        let any = b.any(id, None);
        let alias = b.select(any);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = EntityStore::new();
        assert!(AnyOptimizer::new(&store).optimize(&mut q, root));
        let ast = q.ast();
        let Node::Alias(a) = ast.node(alias) else { panic!("alias expected") };
        assert_eq!(ast.node(a.expression), &Node::Number("1".into()));
        assert_eq!(q.retrieve().window, Some(Window { offset: 0, size: 1 }));
    }
}
