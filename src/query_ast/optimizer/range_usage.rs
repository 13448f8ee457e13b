//! Range usage analysis for one scope (an ANY/aggregate node or a whole query).
//!
//! Produces four per-range flags keyed by range alias, every input range
//! pre-seeded with `false`. Pure: reads the tree and the metadata oracle only.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity_store::EntityMetadata;
use crate::query_ast::ast::{Ast, BinaryOp, Node, NodeId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeUsage {
    pub used_in_expr: BTreeMap<String, bool>,
    pub used_in_cond: BTreeMap<String, bool>,
    pub has_is_null_in_cond: BTreeMap<String, bool>,
    pub non_nullable_use: BTreeMap<String, bool>,
}

fn flag(map: &BTreeMap<String, bool>, name: &str) -> bool { map.get(name).copied().unwrap_or(false) }

impl RangeUsage {
    pub fn in_expr(&self, name: &str) -> bool { flag(&self.used_in_expr, name) }

    pub fn in_cond(&self, name: &str) -> bool { flag(&self.used_in_cond, name) }

    pub fn is_null_checked(&self, name: &str) -> bool { flag(&self.has_is_null_in_cond, name) }

    pub fn non_nullable(&self, name: &str) -> bool { flag(&self.non_nullable_use, name) }

    pub fn is_live(&self, name: &str) -> bool { self.in_expr(name) || self.in_cond(name) }

    /// Whether a LEFT-joined range can be forced to INNER without changing results.
    ///
    /// Nothing may test the range for NULL, and either something uses it or the
    /// condition does not mention it at all.
    pub fn collapsible(&self, name: &str, required: bool) -> bool {
        if required { return true; }
        if self.is_null_checked(name) { return false; }
        let used = self.in_expr(name) || self.in_cond(name) || self.non_nullable(name);
        used || !self.in_cond(name)
    }
}

/// Analyze `expressions` (projection part) and `condition` for the given ranges.
pub fn analyze(
    ast: &Ast,
    metadata: &dyn EntityMetadata,
    expressions: &[NodeId],
    condition: Option<NodeId>,
    ranges: &[NodeId],
) -> RangeUsage {
    let candidates: BTreeSet<NodeId> = ranges.iter().copied().collect();
    let seeded: BTreeMap<String, bool> = ranges.iter().map(|&r| (ast.range_name(r).to_string(), false)).collect();
    let mut usage = RangeUsage {
        used_in_expr: seeded.clone(),
        used_in_cond: seeded.clone(),
        has_is_null_in_cond: seeded.clone(),
        non_nullable_use: seeded,
    };

    for &expr in expressions {
        for id in ast.identifiers_under(expr, true) {
            if let Some(ident) = ast.identifier(id)
                && candidates.contains(&ident.range)
            {
                usage.used_in_expr.insert(ast.range_name(ident.range).to_string(), true);
            }
        }
    }

    let Some(cond) = condition else { return usage };

    for id in ast.identifiers_under(cond, true) {
        let Some(ident) = ast.identifier(id) else { continue };
        if !candidates.contains(&ident.range) { continue; }
        let name = ast.range_name(ident.range).to_string();
        usage.used_in_cond.insert(name.clone(), true);
        let entity = ast.range(ident.range).and_then(|r| r.entity_name.as_deref());
        if let Some(entity) = entity
            && ident.is_direct()
            && !metadata.is_nullable(entity, ident.field())
        {
            usage.non_nullable_use.insert(name, true);
        }
    }

    for range in is_null_targets(ast, cond) {
        if candidates.contains(&range) {
            usage.has_is_null_in_cond.insert(ast.range_name(range).to_string(), true);
        }
    }

    usage
}

/// Ranges tested with `IS NULL` under the AND/OR skeleton of `cond`.
pub fn is_null_targets(ast: &Ast, cond: NodeId) -> BTreeSet<NodeId> {
    let mut out = BTreeSet::new();
    let mut stack = vec![cond];
    while let Some(id) = stack.pop() {
        match ast.node(id) {
            Node::Binary { op: BinaryOp::And | BinaryOp::Or, left, right } => {
                stack.push(*left);
                stack.push(*right);
            }
            Node::CheckNull { operand, negated: false } => {
                out.extend(ast.referenced_ranges(*operand));
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::EntityStore;
    use crate::query_ast::builder::QueryBuilder;

    #[test]
    fn flags_are_seeded_and_set() {
        let mut b = QueryBuilder::new();
        let u = b.range("u", "User");
        let p = b.range("p", "Profile");
        let on = b.join_eq(p, "userId", u, "id");
        b.via(p, on, false);
        let name = b.ident(u, "name");
        let bio = b.ident(p, "bio");
        let bio_null = b.is_null(bio);
        let active = b.cmp(u, "active", BinaryOp::Eq, "1");
        let cond = b.and(bio_null, active);
        let ast = b.ast().clone();

        let store = EntityStore::new().column("User", "active", false);
        let usage = analyze(&ast, &store, &[name], Some(cond), &[u, p]);

        assert!(usage.in_expr("u"));
        assert!(!usage.in_expr("p"));
        assert!(usage.in_cond("u") && usage.in_cond("p"));
        assert!(usage.is_null_checked("p"));
        assert!(!usage.is_null_checked("u"));
        assert!(usage.non_nullable("u"));
        assert!(!usage.non_nullable("p"));
        assert_eq!(usage.used_in_expr.len(), 2);
    }

    #[test]
    fn is_not_null_is_not_an_is_null_check() {
        let mut b = QueryBuilder::new();
        let p = b.range("p", "Profile");
        let bio = b.ident(p, "bio");
        let cond = b.is_not_null(bio);
        let ast = b.ast().clone();
        let usage = analyze(&ast, &EntityStore::new(), &[], Some(cond), &[p]);
        assert!(!usage.is_null_checked("p"));
        assert!(usage.collapsible("p", false));
    }

    #[test]
    fn null_checked_range_is_not_collapsible() {
        let mut usage = RangeUsage::default();
        usage.used_in_cond.insert("p".into(), true);
        usage.has_is_null_in_cond.insert("p".into(), true);
        assert!(!usage.collapsible("p", false));
        assert!(usage.collapsible("p", true));
    }
}
