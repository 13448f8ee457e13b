//! Self-join elimination.
//!
//! Two ranges over the same entity joined on `a.f = b.f` read the same row,
//! so one of them can go. The surviving range takes over every identifier of
//! the removed one and the removed range is soft-deleted (`include_as_join =
//! false`), never dropped from the range list.

use std::collections::HashMap;

use log::debug;

use super::join_optimizer::included_ranges;
use super::predicates::identifier_equality;
use crate::query_ast::ast::{Ast, NodeId, Query};

/// Which of the pair carries the identity predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityOn {
    Kept,
    Removed,
}

/// Merge identity self-joins of `scope` until none remain.
pub fn optimize_self_joins(query: &mut Query, scope: NodeId) -> bool {
    let mut changed = false;
    while let Some((keep, remove, on)) = find_identity_pair(query, scope) {
        merge(query, scope, keep, remove, on);
        changed = true;
    }
    changed
}

fn find_identity_pair(query: &Query, scope: NodeId) -> Option<(NodeId, NodeId, IdentityOn)> {
    let ast = query.ast();
    let ranges = included_ranges(query, scope);
    for (i, &a) in ranges.iter().enumerate() {
        for &b in &ranges[i + 1..] {
            let (Some(ra), Some(rb)) = (ast.range(a), ast.range(b)) else { continue };
            if ra.entity_name.is_none() || ra.entity_name != rb.entity_name { continue; }
            if rb.join_property.is_some_and(|p| is_identity_join(ast, p, a, b)) {
                return Some((a, b, IdentityOn::Removed));
            }
            if ra.join_property.is_some_and(|p| is_identity_join(ast, p, a, b)) {
                return Some((a, b, IdentityOn::Kept));
            }
        }
    }
    None
}

/// `a.f = b.f` (either order) over exactly the pair `{a, b}`.
pub fn is_identity_join(ast: &Ast, predicate: NodeId, a: NodeId, b: NodeId) -> bool {
    let Some((left, right)) = identifier_equality(ast, predicate) else { return false };
    let (Some(l), Some(r)) = (ast.identifier(left), ast.identifier(right)) else { return false };
    let pair = (l.range == a && r.range == b) || (l.range == b && r.range == a);
    pair && a != b && !l.path.is_empty() && l.field() == r.field()
}

fn merge(query: &mut Query, scope: NodeId, keep: NodeId, remove: NodeId, on: IdentityOn) {
    let ast = query.ast_mut();

    if on == IdentityOn::Kept {
        // The kept range's own predicate was the identity link: it inherits the
        // removed range's position in the join tree instead.
        let (inherited, required) = match ast.range(remove) {
            Some(r) => (r.join_property, r.required),
            None => return,
        };
        ast.set_join_property(remove, None);
        ast.set_join_property(keep, inherited);
        if let Some(r) = ast.range_mut(keep) {
            r.required = required;
        }
    }

    let rebind: HashMap<NodeId, NodeId> = [(remove, keep)].into_iter().collect();
    let moved = ast.rebind_identifiers(scope, &rebind);
    if let Some(r) = ast.range_mut(remove) {
        r.include_as_join = false;
    }
    debug!(
        "merged self-join '{}' into '{}' ({} identifiers redirected)",
        ast.range_name(remove),
        ast.range_name(keep),
        moved
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::builder::QueryBuilder;

    #[test]
    fn identity_on_kept_range_inherits_anchor_role() {
        // `c` hangs off `d` through the identity link while `d` is the anchor.
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let d = b.range("d", "Customer");
        let link = b.join_eq(c, "id", d, "id");
        b.via(c, link, true);
        let name = b.ident(d, "name");
        b.select(name);
        let mut q = b.build().unwrap();
        let root = q.root();

        assert!(optimize_self_joins(&mut q, root));
        let ast = q.ast();
        assert!(ast.range(c).unwrap().is_anchor());
        assert!(!ast.range(d).unwrap().include_as_join);
        assert_eq!(ast.identifier(name).unwrap().range, c);
    }

    #[test]
    fn different_fields_are_not_an_identity() {
        let mut b = QueryBuilder::new();
        let e = b.range("e", "Employee");
        let m = b.range("m", "Employee");
        let link = b.join_eq(m, "id", e, "managerId");
        b.via(m, link, false);
        let mut q = b.build().unwrap();
        let root = q.root();
        assert!(!optimize_self_joins(&mut q, root));
        assert!(q.range("m").unwrap().include_as_join);
    }
}
