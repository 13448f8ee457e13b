//! Traversal over the arena AST.
//!
//! Searches that stop early return `ControlFlow::Break` with the node that
//! ended the walk instead of unwinding.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use super::ast::{Ast, Node, NodeId};

/// What a visitor wants to happen after seeing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Descend,
    /// Do not enter this node's children.
    Skip,
    Stop,
}

pub trait AstVisitor {
    fn visit(&mut self, ast: &Ast, id: NodeId) -> Visit;
}

impl<F> AstVisitor for F
where
    F: FnMut(&Ast, NodeId) -> Visit,
{
    fn visit(&mut self, ast: &Ast, id: NodeId) -> Visit { self(ast, id) }
}

impl Ast {
    /// Pre-order walk from `root`, children in slot order.
    pub fn accept<V: AstVisitor + ?Sized>(&self, root: NodeId, visitor: &mut V) -> ControlFlow<NodeId> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match visitor.visit(self, id) {
                Visit::Stop => return ControlFlow::Break(id),
                Visit::Skip => continue,
                Visit::Descend => {
                    let children = self.node(id).children();
                    stack.extend(children.into_iter().rev());
                }
            }
        }
        ControlFlow::Continue(())
    }

    pub fn find(&self, root: NodeId, pred: impl Fn(&Node) -> bool) -> Option<NodeId> {
        let mut check = |ast: &Ast, id: NodeId| if pred(ast.node(id)) { Visit::Stop } else { Visit::Descend };
        match self.accept(root, &mut check) {
            ControlFlow::Break(id) => Some(id),
            ControlFlow::Continue(()) => None,
        }
    }

    pub fn contains(&self, root: NodeId, pred: impl Fn(&Node) -> bool) -> bool {
        self.find(root, pred).is_some()
    }

    /// `root` and everything below it, pre-order.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut collect = |_: &Ast, id: NodeId| {
            out.push(id);
            Visit::Descend
        };
        let _ = self.accept(root, &mut collect);
        out
    }

    /// Children before parents.
    pub fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for child in self.node(id).children().into_iter().rev() {
                stack.push((child, false));
            }
        }
        out
    }

    /// Identifier nodes under `root`. With `enter_subqueries == false` the
    /// interior of `Subquery` nodes is not visited.
    pub fn identifiers_under(&self, root: NodeId, enter_subqueries: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut collect = |ast: &Ast, id: NodeId| match ast.node(id) {
            Node::Identifier(_) => {
                out.push(id);
                Visit::Skip
            }
            Node::Subquery(_) if !enter_subqueries && id != root => Visit::Skip,
            _ => Visit::Descend,
        };
        let _ = self.accept(root, &mut collect);
        out
    }

    /// Range handles referenced by identifiers under `root`.
    pub fn referenced_ranges(&self, root: NodeId) -> BTreeSet<NodeId> {
        self.identifiers_under(root, true)
            .into_iter()
            .filter_map(|id| self.identifier(id).map(|i| i.range))
            .collect()
    }

    /// Alias names of ranges referenced under `root`.
    pub fn referenced_range_names(&self, root: NodeId) -> BTreeSet<String> {
        self.referenced_ranges(root)
            .into_iter()
            .map(|range| self.range_name(range).to_string())
            .collect()
    }

    /// Nearest ancestor (or `id` itself) matching `pred`.
    pub fn ancestor_where(&self, id: NodeId, pred: impl Fn(&Node) -> bool) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if pred(self.node(node)) { return Some(node); }
            current = self.parent(node);
        }
        None
    }
}
