//! Anchor selection: exactly one range per scope is the SQL `FROM` target.

use log::debug;

use super::predicates::and_with;
use super::range_usage::RangeUsage;
use crate::query_ast::ast::{Ast, NodeId};

/// Make sure one of `ranges` has no join predicate.
///
/// Returns the (possibly reordered) range list and the WHERE clause, which
/// absorbs the chosen anchor's former join predicate. When no range can be
/// promoted safely the input is returned untouched.
pub fn ensure_single_anchor(
    ast: &mut Ast,
    ranges: &[NodeId],
    conditions: Option<NodeId>,
    usage: &RangeUsage,
) -> (Vec<NodeId>, Option<NodeId>) {
    if ranges.iter().any(|&r| ast.range(r).is_some_and(|r| r.is_anchor())) {
        return (ranges.to_vec(), conditions);
    }

    let Some(anchor) = select_anchor(ast, ranges, usage) else {
        debug!("no range qualifies as anchor; keeping join structure");
        return (ranges.to_vec(), conditions);
    };

    let mut conditions = conditions;
    if let Some(join) = ast.range(anchor).and_then(|r| r.join_property) {
        ast.set_join_property(anchor, None);
        conditions = Some(and_with(ast, conditions, join));
    }
    if let Some(r) = ast.range_mut(anchor) {
        r.required = true;
    }
    debug!("promoted range '{}' to anchor", ast.range_name(anchor));
    (anchor_first(ranges, anchor), conditions)
}

/// Priority: projected and collapsible, then already required, then any
/// collapsible range.
fn select_anchor(ast: &Ast, ranges: &[NodeId], usage: &RangeUsage) -> Option<NodeId> {
    let state = |id: NodeId| ast.range(id).map(|r| (r.name.as_str(), r.required));

    ranges
        .iter()
        .copied()
        .find(|&id| state(id).is_some_and(|(name, required)| usage.in_expr(name) && usage.collapsible(name, required)))
        .or_else(|| ranges.iter().copied().find(|&id| state(id).is_some_and(|(_, required)| required)))
        .or_else(|| {
            ranges
                .iter()
                .copied()
                .find(|&id| state(id).is_some_and(|(name, required)| !required && usage.collapsible(name, false)))
        })
}

/// `ranges` with `anchor` moved to the front, others in their original order.
pub fn anchor_first(ranges: &[NodeId], anchor: NodeId) -> Vec<NodeId> {
    std::iter::once(anchor).chain(ranges.iter().copied().filter(|&r| r != anchor)).collect()
}

/// First range without a join predicate, if any.
pub fn current_anchor(ast: &Ast, ranges: &[NodeId]) -> Option<NodeId> {
    ranges.iter().copied().find(|&r| ast.range(r).is_some_and(|r| r.is_anchor()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::builder::QueryBuilder;
    use crate::query_ast::optimizer::predicates::flatten_and;

    fn usage(entries: &[(&str, bool, bool, bool)]) -> RangeUsage {
        let mut u = RangeUsage::default();
        for &(name, expr, cond, is_null) in entries {
            u.used_in_expr.insert(name.into(), expr);
            u.used_in_cond.insert(name.into(), cond);
            u.has_is_null_in_cond.insert(name.into(), is_null);
            u.non_nullable_use.insert(name.into(), false);
        }
        u
    }

    #[test]
    fn existing_anchor_is_left_alone() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let i = b.range("i", "Item");
        let on = b.join_eq(i, "orderId", o, "id");
        b.via(i, on, false);
        let u = usage(&[("o", true, false, false), ("i", true, false, false)]);
        let (ranges, cond) = ensure_single_anchor(b.ast(), &[o, i], None, &u);
        assert_eq!(ranges, vec![o, i]);
        assert!(cond.is_none());
    }

    #[test]
    fn projected_range_wins_and_join_moves_to_where() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let i = b.range("i", "Item");
        let o_on = b.join_eq(o, "customerId", c, "id");
        b.via(o, o_on, true);
        let i_on = b.join_eq(i, "orderId", o, "id");
        b.via(i, i_on, false);
        let existing = b.cmp(i, "qty", crate::query_ast::ast::BinaryOp::Gt, "1");

        let u = usage(&[("o", false, false, false), ("i", true, true, false)]);
        let (ranges, cond) = ensure_single_anchor(b.ast(), &[o, i], Some(existing), &u);
        let ast = b.ast();
        assert_eq!(ranges, vec![i, o]);
        assert!(ast.range(i).unwrap().is_anchor());
        assert!(ast.range(i).unwrap().required);
        assert_eq!(flatten_and(ast, cond.unwrap()), vec![existing, i_on]);
    }

    #[test]
    fn required_range_beats_optional_one() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let i = b.range("i", "Item");
        let o_on = b.join_eq(o, "customerId", c, "id");
        b.via(o, o_on, false);
        let i_on = b.join_eq(i, "orderId", c, "id");
        b.via(i, i_on, true);
        let u = usage(&[("o", false, true, false), ("i", false, false, false)]);
        let (ranges, cond) = ensure_single_anchor(b.ast(), &[o, i], None, &u);
        assert_eq!(ranges, vec![i, o]);
        assert_eq!(cond, Some(i_on));
    }

    #[test]
    fn null_checked_ranges_are_never_forced() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let p = b.range("p", "Profile");
        let on = b.join_eq(p, "userId", c, "id");
        b.via(p, on, false);
        let u = usage(&[("p", true, true, true)]);
        let (ranges, cond) = ensure_single_anchor(b.ast(), &[p], None, &u);
        assert_eq!(ranges, vec![p]);
        assert!(cond.is_none());
        let ast = b.ast();
        assert!(!ast.range(p).unwrap().required);
        assert_eq!(ast.range(p).unwrap().join_property, Some(on));
    }
}
