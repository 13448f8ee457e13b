//! `EXISTS(range)` at the top of a scope's WHERE is a requiredness marker, not a
//! predicate: the conjunct is removed and the range becomes an INNER join.

use std::collections::BTreeSet;

use log::debug;

use super::predicates::{combine_and, flatten_and};
use crate::query_ast::ast::{Node, NodeId, Query};

/// Returns the ranges of `scope` that were marked required.
pub fn extract_exists(query: &mut Query, scope: NodeId) -> BTreeSet<NodeId> {
    let declared = query.scope(scope).ranges.clone();
    let Some(cond) = query.scope(scope).conditions else { return BTreeSet::new() };
    let ast = query.ast_mut();

    let mut pinned = BTreeSet::new();
    let mut remaining = Vec::new();
    for conjunct in flatten_and(ast, cond) {
        let target = match ast.node(conjunct) {
            Node::Exists(inner) => ast.identifier(*inner).map(|i| i.range).filter(|r| declared.contains(r)),
            _ => None,
        };
        match target {
            Some(range) => {
                pinned.insert(range);
            }
            None => remaining.push(conjunct),
        }
    }
    if pinned.is_empty() { return pinned; }

    for &range in &pinned {
        if let Some(r) = ast.range_mut(range) {
            r.required = true;
            debug!("EXISTS({}) turned into an INNER JOIN", r.name);
        }
    }
    let rebuilt = combine_and(ast, &remaining);
    ast.set_conditions(scope, rebuilt);
    pinned
}
