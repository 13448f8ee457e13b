//! Small predicate utilities shared by the passes.

use std::collections::BTreeSet;

use crate::query_ast::ast::{Ast, BinaryOp, Node, NodeId};

/// Leaf conjuncts of an AND-tree, left to right. Uses an explicit stack so
/// long AND chains do not recurse.
pub fn flatten_and(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        match ast.node(id) {
            Node::Binary { op: BinaryOp::And, left, right } => {
                stack.push(*right);
                stack.push(*left);
            }
            _ => out.push(id),
        }
    }
    out
}

/// Left-deep AND of `parts`: `((p0 AND p1) AND p2) ...`.
pub fn combine_and(ast: &mut Ast, parts: &[NodeId]) -> Option<NodeId> {
    let (first, rest) = parts.split_first()?;
    let mut acc = *first;
    for &part in rest {
        acc = ast.and(acc, part);
    }
    Some(acc)
}

/// `existing AND extra`, or just `extra`.
pub fn and_with(ast: &mut Ast, existing: Option<NodeId>, extra: NodeId) -> NodeId {
    match existing {
        Some(e) => ast.and(e, extra),
        None => extra,
    }
}

pub fn contains_or(ast: &Ast, root: NodeId) -> bool { ast.contains(root, Node::is_or) }

/// Range aliases referenced anywhere under `root`.
pub fn range_names(ast: &Ast, root: NodeId) -> BTreeSet<String> { ast.referenced_range_names(root) }

/// Operands of `a.x = b.y` when both sides are identifiers.
pub fn identifier_equality(ast: &Ast, predicate: NodeId) -> Option<(NodeId, NodeId)> {
    match ast.node(predicate) {
        Node::Binary { op: BinaryOp::Eq, left, right } => {
            ast.identifier(*left)?;
            ast.identifier(*right)?;
            Some((*left, *right))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::ast::Range;

    #[test]
    fn flatten_and_rebuild_preserves_order() {
        let mut ast = Ast::new();
        let o = ast.add(Node::Range(Range {
            name: "o".into(),
            entity_name: Some("Order".into()),
            join_property: None,
            required: false,
            include_as_join: true,
            query: None,
        }));
        let leaves: Vec<NodeId> = (0..4).map(|i| ast.identifier_node(o, &[format!("f{i}").as_str()])).collect();
        let ab = ast.and(leaves[0], leaves[1]);
        let cd = ast.and(leaves[2], leaves[3]);
        let all = ast.and(ab, cd);
        assert_eq!(flatten_and(&ast, all), leaves);

        let rebuilt = combine_and(&mut ast, &leaves).unwrap();
        assert_eq!(flatten_and(&ast, rebuilt), leaves);
        assert!(combine_and(&mut ast, &[]).is_none());
    }
}
