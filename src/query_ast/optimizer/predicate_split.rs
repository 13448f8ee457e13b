//! Splits a predicate into the part that only touches live ranges and the
//! part that correlates with ranges outside the live set.
//!
//! AND distributes across the join/WHERE boundary, OR does not. A conjunct that
//! mixes live and outer ranges underneath an OR stops the split and the whole
//! predicate stays where it was.

use std::collections::BTreeSet;

use log::trace;

use super::predicates::{combine_and, contains_or, flatten_and, range_names};
use crate::query_ast::ast::{Ast, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateClass {
    /// References live ranges only (or no range at all).
    Inner,
    /// References ranges outside the live set; may also reference live ones
    /// as long as no OR is involved.
    Correlation,
    /// Live and outer references under an OR.
    MixedOrComplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitPredicate {
    pub inner: Option<NodeId>,
    pub correlation: Option<NodeId>,
}

/// Classify one conjunct. Aliases in neither set are outer references too.
pub fn classify(ast: &Ast, leaf: NodeId, live: &BTreeSet<String>, correlation: &BTreeSet<String>) -> PredicateClass {
    let names = range_names(ast, leaf);
    let touches_live = names.iter().any(|n| live.contains(n));
    let outer: Vec<&String> = names.iter().filter(|n| !live.contains(*n)).collect();
    if outer.iter().any(|n| !correlation.contains(*n)) {
        trace!("conjunct references ranges outside the correlation set: {:?}", outer);
    }
    match (touches_live, outer.is_empty()) {
        (_, true) => PredicateClass::Inner,
        (false, false) => PredicateClass::Correlation,
        (true, false) if contains_or(ast, leaf) => PredicateClass::MixedOrComplex,
        (true, false) => PredicateClass::Correlation,
    }
}

pub fn split(
    ast: &mut Ast,
    predicate: Option<NodeId>,
    live: &BTreeSet<String>,
    correlation: &BTreeSet<String>,
) -> SplitPredicate {
    let Some(predicate) = predicate else { return SplitPredicate::default() };

    let mut inner = Vec::new();
    let mut outer = Vec::new();
    for leaf in flatten_and(ast, predicate) {
        match classify(ast, leaf, live, correlation) {
            PredicateClass::Inner => inner.push(leaf),
            PredicateClass::Correlation => outer.push(leaf),
            PredicateClass::MixedOrComplex => {
                trace!("not splitting predicate {:?}: OR mixes live and correlated ranges", predicate);
                return SplitPredicate { inner: Some(predicate), correlation: None };
            }
        }
    }

    // Keep the original node when one side takes everything.
    if outer.is_empty() {
        return SplitPredicate { inner: Some(predicate), correlation: None };
    }
    if inner.is_empty() {
        return SplitPredicate { inner: None, correlation: Some(predicate) };
    }
    SplitPredicate { inner: combine_and(ast, &inner), correlation: combine_and(ast, &outer) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::ast::BinaryOp;
    use crate::query_ast::builder::QueryBuilder;
    use crate::query_ast::optimizer::predicates::flatten_and;

    fn names(list: &[&str]) -> BTreeSet<String> { list.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn none_in_none_out() {
        let mut b = QueryBuilder::new();
        let out = split(b.ast(), None, &names(&["o"]), &names(&["c"]));
        assert_eq!(out, SplitPredicate::default());
    }

    #[test]
    fn splits_and_chain_by_side() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let i = b.range("i", "Item");
        let link = b.join_eq(o, "customerId", c, "id");
        let total = b.cmp(o, "total", BinaryOp::Gt, "10");
        let item = b.join_eq(i, "orderId", o, "id");
        let vip = b.cmp(c, "vip", BinaryOp::Eq, "1");
        let a1 = b.and(link, total);
        let a2 = b.and(a1, item);
        let pred = b.and(a2, vip);

        let out = split(b.ast(), Some(pred), &names(&["o", "i"]), &names(&["c"]));
        let ast = b.ast();
        assert_eq!(flatten_and(ast, out.inner.unwrap()), vec![total, item]);
        assert_eq!(flatten_and(ast, out.correlation.unwrap()), vec![link, vip]);
    }

    #[test]
    fn or_mixing_sides_blocks_split() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let total = b.cmp(o, "total", BinaryOp::Gt, "10");
        let vip = b.cmp(c, "vip", BinaryOp::Eq, "1");
        let either = b.or(total, vip);
        let flag = b.cmp(o, "open", BinaryOp::Eq, "1");
        let pred = b.and(either, flag);

        let out = split(b.ast(), Some(pred), &names(&["o"]), &names(&["c"]));
        assert_eq!(out, SplitPredicate { inner: Some(pred), correlation: None });
    }

    #[test]
    fn pure_correlation_is_fully_promoted() {
        let mut b = QueryBuilder::new();
        let c = b.range("c", "Customer");
        let o = b.range("o", "Order");
        let link = b.join_eq(o, "customerId", c, "id");
        let out = split(b.ast(), Some(link), &names(&["o"]), &names(&["c"]));
        assert_eq!(out, SplitPredicate { inner: None, correlation: Some(link) });
    }
}
