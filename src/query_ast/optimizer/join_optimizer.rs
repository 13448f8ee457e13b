//! Range/Join optimizer: decides INNER vs LEFT for every joined range and
//! drops joins nothing reads from.
//!
//! Rules run in a fixed order. Annotation-driven and WHERE-driven requiredness
//! come first, dead-join elimination last, so a range made required by either
//! rule is never eliminated.

use std::collections::{BTreeSet, HashSet};

use log::{debug, trace};

use super::predicates::{flatten_and, identifier_equality};
use super::range_usage::is_null_targets;
use crate::entity_store::EntityMetadata;
use crate::query_ast::ast::{Ast, Node, NodeId, Query};
use crate::query_ast::visitor::Visit;

pub struct JoinOptimizer<'a> {
    metadata: &'a dyn EntityMetadata,
    /// Ranges an `EXISTS(range)` predicate made required; never demoted.
    pinned: &'a BTreeSet<NodeId>,
}

impl<'a> JoinOptimizer<'a> {
    pub fn new(metadata: &'a dyn EntityMetadata, pinned: &'a BTreeSet<NodeId>) -> Self {
        Self { metadata, pinned }
    }

    /// Requiredness rules for one scope. Returns whether anything changed.
    pub fn optimize(&self, query: &mut Query, scope: NodeId) -> bool {
        let by_annotation = self.apply_annotation_requiredness(query, scope);
        let by_where = self.apply_where_requiredness(query, scope);
        by_annotation || by_where
    }

    /// `R.rf = S.sf` on range `R` becomes INNER when `S`'s entity declares a
    /// required to-one relation `sf -> R.rf`.
    pub fn apply_annotation_requiredness(&self, query: &mut Query, scope: NodeId) -> bool {
        let null_checked = query.scope(scope).conditions.map(|c| is_null_targets(query.ast(), c)).unwrap_or_default();
        let mut changed = false;

        for range in included_ranges(query, scope) {
            if null_checked.contains(&range) { continue; }
            if !self.required_by_annotation(query.ast(), range) { continue; }
            if let Some(r) = query.ast_mut().range_mut(range) {
                r.required = true;
                debug!("range '{}' joined through a required relation, using INNER JOIN", r.name);
                changed = true;
            }
        }
        trace!("annotation requiredness on {:?}: changed={}", scope, changed);
        changed
    }

    fn required_by_annotation(&self, ast: &Ast, range: NodeId) -> bool {
        let Some(r) = ast.range(range) else { return false };
        if r.required { return false; }
        let (Some(join), Some(entity)) = (r.join_property, r.entity_name.as_deref()) else { return false };
        let Some((left, right)) = identifier_equality(ast, join) else { return false };
        let (Some(l), Some(rt)) = (ast.identifier(left), ast.identifier(right)) else { return false };

        let (own, other) = if l.range == range && rt.range != range {
            (l, rt)
        } else if rt.range == range && l.range != range {
            (rt, l)
        } else {
            return false;
        };
        if !own.is_direct() || !other.is_direct() { return false; }
        let Some(owner_entity) = ast.range(other.range).and_then(|o| o.entity_name.as_deref()) else { return false };

        // Entity, foreign-key column and inverse property all have to line up.
        self.metadata.relationships_of(owner_entity).iter().any(|a| {
            a.required
                && a.is_to_one()
                && a.target_entity == entity
                && a.relation_column == other.field()
                && a.inversed_by == own.field()
        })
    }

    /// Null-rejecting WHERE references promote a range to INNER; a required
    /// range only tested with `IS NULL` goes back to LEFT.
    ///
    /// Narrower than "referenced anywhere in WHERE": only top-level conjuncts
    /// free of OR, NOT, IS NULL, CASE and EXISTS count, since a reference under
    /// those can still be satisfied by a missing row.
    pub fn apply_where_requiredness(&self, query: &mut Query, scope: NodeId) -> bool {
        let Some(cond) = query.scope(scope).conditions else { return false };
        let ranges = included_ranges(query, scope);
        let ast = query.ast();

        let null_checked = is_null_targets(ast, cond);
        let rejecting = null_rejecting_ranges(ast, cond);
        let mut promote = Vec::new();
        let mut demote = Vec::new();

        for &range in &ranges {
            let Some(r) = ast.range(range) else { continue };
            if r.is_anchor() { continue; }
            if null_checked.contains(&range) {
                if r.required && !self.pinned.contains(&range) && only_null_checked(ast, cond, range) {
                    demote.push(range);
                }
            } else if !r.required && rejecting.contains(&range) {
                promote.push(range);
            }
        }

        let ast = query.ast_mut();
        for &range in &promote {
            if let Some(r) = ast.range_mut(range) {
                r.required = true;
                debug!("range '{}' is filtered in WHERE, using INNER JOIN", r.name);
            }
        }
        for &range in &demote {
            if let Some(r) = ast.range_mut(range) {
                r.required = false;
                debug!("range '{}' is only tested for IS NULL, using LEFT JOIN", r.name);
            }
        }
        !promote.is_empty() || !demote.is_empty()
    }
}

/// Included ranges of `scope`, in declaration order.
pub fn included_ranges(query: &Query, scope: NodeId) -> Vec<NodeId> {
    query
        .scope(scope)
        .ranges
        .iter()
        .copied()
        .filter(|&r| query.ast().range(r).is_some_and(|r| r.include_as_join))
        .collect()
}

/// Ranges referenced by top-level AND conjuncts that evaluate to not-true when
/// the range's row is missing. Conjuncts with OR, NOT, IS NULL or CASE are
/// skipped, as are subquery interiors.
fn null_rejecting_ranges(ast: &Ast, cond: NodeId) -> BTreeSet<NodeId> {
    let mut out = BTreeSet::new();
    for conjunct in flatten_and(ast, cond) {
        let tolerant = ast.contains(conjunct, |n| {
            n.is_or()
                || matches!(n, Node::Not(_) | Node::CheckNull { negated: false, .. } | Node::Case(_) | Node::Exists(_))
        });
        if tolerant { continue; }
        out.extend(ast.identifiers_under(conjunct, false).into_iter().filter_map(|id| ast.identifier(id).map(|i| i.range)));
    }
    out
}

/// Every WHERE reference to `range` sits inside an `IS NULL` test.
fn only_null_checked(ast: &Ast, cond: NodeId, range: NodeId) -> bool {
    let refs: Vec<NodeId> = ast
        .identifiers_under(cond, false)
        .into_iter()
        .filter(|&id| ast.identifier(id).is_some_and(|i| i.range == range))
        .collect();
    !refs.is_empty() && refs.iter().all(|&id| under_is_null(ast, id, cond))
}

fn under_is_null(ast: &Ast, node: NodeId, root: NodeId) -> bool {
    let mut current = Some(node);
    while let Some(id) = current {
        if matches!(ast.node(id), Node::CheckNull { negated: false, .. }) { return true; }
        if id == root { return false; }
        current = ast.parent(id);
    }
    false
}

/// Exclude non-required joined ranges that nothing outside their own join
/// predicate reads from. Repeats until stable, since excluding one range can
/// free the range its predicate referenced.
pub fn eliminate_dead_joins(query: &mut Query, scope: NodeId) -> bool {
    let mut changed = false;
    loop {
        let Some(dead) = find_dead_join(query, scope) else { break };
        if let Some(r) = query.ast_mut().range_mut(dead) {
            r.include_as_join = false;
            debug!("range '{}' is never referenced, dropping its JOIN", r.name);
        }
        changed = true;
    }
    changed
}

fn find_dead_join(query: &Query, scope: NodeId) -> Option<NodeId> {
    let ast = query.ast();
    included_ranges(query, scope).into_iter().find(|&range| {
        ast.range(range).is_some_and(|r| !r.required && !r.is_anchor()) && reference_count(ast, scope, range) == 0
    })
}

/// References to `range` outside its own join predicate. Excluded ranges and
/// subquery interiors are not walked; correlated references from inside a
/// subquery are counted separately by handle, so an outer range a subquery
/// still reads from stays joined.
fn reference_count(ast: &Ast, scope: NodeId, range: NodeId) -> usize {
    let own_join = ast.range(range).and_then(|r| r.join_property);
    let mut count = 0;
    let mut subqueries = Vec::new();
    let mut walk = |ast: &Ast, id: NodeId| {
        if Some(id) == own_join { return Visit::Skip; }
        match ast.node(id) {
            Node::Range(r) if !r.include_as_join => Visit::Skip,
            Node::Subquery(_) => {
                subqueries.push(id);
                Visit::Skip
            }
            Node::Identifier(i) => {
                if i.range == range { count += 1; }
                Visit::Skip
            }
            _ => Visit::Descend,
        }
    };
    let _ = ast.accept(scope, &mut walk);
    count + subqueries.iter().map(|&s| correlated_references(ast, s, range)).sum::<usize>()
}

/// Identifiers inside subquery `sub` that point at the outer range `range`.
fn correlated_references(ast: &Ast, sub: NodeId, range: NodeId) -> usize {
    let owned: HashSet<NodeId> = ast.subquery(sub).map(|s| s.ranges.iter().copied().collect()).unwrap_or_default();
    if owned.contains(&range) { return 0; }
    ast.identifiers_under(sub, true).into_iter().filter(|&id| ast.identifier(id).is_some_and(|i| i.range == range)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::{EntityStore, RelationAnnotation, RelationKind};
    use crate::query_ast::ast::BinaryOp;
    use crate::query_ast::builder::QueryBuilder;

    fn order_customer(required: bool) -> EntityStore {
        EntityStore::new().relation(
            "Order",
            RelationAnnotation {
                kind: RelationKind::ManyToOne,
                property: "customer".into(),
                target_entity: "Customer".into(),
                relation_column: "customerId".into(),
                inversed_by: "id".into(),
                required,
            },
        )
    }

    #[test]
    fn required_relation_turns_join_inner() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let c = b.range("c", "Customer");
        let on = b.join_eq(c, "id", o, "customerId");
        b.via(c, on, false);
        let name = b.ident(c, "name");
        b.select(name);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = order_customer(true);
        let pinned = BTreeSet::new();
        assert!(JoinOptimizer::new(&store, &pinned).apply_annotation_requiredness(&mut q, root));
        assert!(q.range("c").unwrap().required);
    }

    #[test]
    fn optional_or_mismatched_relation_keeps_left_join() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let c = b.range("c", "Customer");
        let on = b.join_eq(c, "uuid", o, "customerId");
        b.via(c, on, false);
        let mut q = b.build().unwrap();
        let root = q.root();
        let pinned = BTreeSet::new();

        let store = order_customer(true);
        assert!(!JoinOptimizer::new(&store, &pinned).apply_annotation_requiredness(&mut q, root));
        let store = order_customer(false);
        assert!(!JoinOptimizer::new(&store, &pinned).apply_annotation_requiredness(&mut q, root));
        assert!(!q.range("c").unwrap().required);
    }

    #[test]
    fn or_in_where_does_not_promote() {
        let mut b = QueryBuilder::new();
        let u = b.range("u", "User");
        let p = b.range("p", "Profile");
        let on = b.join_eq(p, "userId", u, "id");
        b.via(p, on, false);
        let bio = b.cmp(p, "score", BinaryOp::Gt, "1");
        let active = b.cmp(u, "active", BinaryOp::Eq, "1");
        let either = b.or(bio, active);
        b.filter(either);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = EntityStore::new();
        let pinned = BTreeSet::new();
        assert!(!JoinOptimizer::new(&store, &pinned).apply_where_requiredness(&mut q, root));
        assert!(!q.range("p").unwrap().required);
    }

    #[test]
    fn only_plain_conjuncts_promote() {
        let build = |negate: bool| {
            let mut b = QueryBuilder::new();
            let u = b.range("u", "User");
            let p = b.range("p", "Profile");
            let on = b.join_eq(p, "userId", u, "id");
            b.via(p, on, false);
            let mut score = b.cmp(p, "score", BinaryOp::Gt, "1");
            if negate {
                score = b.not(score);
            }
            let active = b.cmp(u, "active", BinaryOp::Eq, "1");
            let both = b.and(score, active);
            b.filter(both);
            b.build().unwrap()
        };
        let store = EntityStore::new();
        let pinned = BTreeSet::new();

        let mut q = build(true);
        let root = q.root();
        assert!(!JoinOptimizer::new(&store, &pinned).apply_where_requiredness(&mut q, root));
        assert!(!q.range("p").unwrap().required);

        let mut q = build(false);
        let root = q.root();
        assert!(JoinOptimizer::new(&store, &pinned).apply_where_requiredness(&mut q, root));
        assert!(q.range("p").unwrap().required);
    }

    #[test]
    fn pinned_range_is_not_demoted() {
        let mut b = QueryBuilder::new();
        let u = b.range("u", "User");
        let p = b.range("p", "Profile");
        let on = b.join_eq(p, "userId", u, "id");
        b.via(p, on, true);
        let bio = b.ident(p, "bio");
        let check = b.is_null(bio);
        b.filter(check);
        let mut q = b.build().unwrap();
        let root = q.root();

        let store = EntityStore::new();
        let pinned: BTreeSet<NodeId> = [p].into_iter().collect();
        assert!(!JoinOptimizer::new(&store, &pinned).apply_where_requiredness(&mut q, root));
        assert!(q.range("p").unwrap().required);

        let none = BTreeSet::new();
        assert!(JoinOptimizer::new(&store, &none).apply_where_requiredness(&mut q, root));
        assert!(!q.range("p").unwrap().required);
    }

    #[test]
    fn chained_dead_joins_are_removed() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let c = b.range("c", "Customer");
        let a = b.range("a", "Address");
        let c_on = b.join_eq(c, "id", o, "customerId");
        b.via(c, c_on, false);
        let a_on = b.join_eq(a, "id", c, "addressId");
        b.via(a, a_on, false);
        let id = b.ident(o, "id");
        b.select(id);
        let mut q = b.build().unwrap();
        let root = q.root();

        assert!(eliminate_dead_joins(&mut q, root));
        assert!(!q.range("a").unwrap().include_as_join);
        assert!(!q.range("c").unwrap().include_as_join);
        assert!(q.range("o").unwrap().include_as_join);
        assert!(!eliminate_dead_joins(&mut q, root));
    }
}
