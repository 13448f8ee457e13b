//! Structural checks between processing and optimization, plus the check that
//! optimization left no ANY behind. Any failure stops compilation of the query.

use std::collections::{BTreeSet, HashSet};

use super::ast::{Ast, Node, NodeId, Query};
use super::errors::QueryError;
use super::explain::explain;
use crate::query_ast::visitor::Visit;

pub fn validate(query: &Query) -> Result<(), QueryError> {
    validate_retrieve(query.ast(), query.root())
}

/// Checks one retrieve scope, then the queries behind its temporary ranges.
fn validate_retrieve(ast: &Ast, root: NodeId) -> Result<(), QueryError> {
    let Some(retrieve) = ast.retrieve(root) else { return Err(QueryError::EmptyQuery) };

    let mut names = BTreeSet::new();
    for &range in &retrieve.ranges {
        if !names.insert(ast.range_name(range)) {
            return Err(QueryError::DuplicateRange(ast.range_name(range).to_string()));
        }
    }

    let declared: HashSet<NodeId> = retrieve.ranges.iter().copied().collect();
    let has_anchor = retrieve.ranges.iter().any(|&r| ast.range(r).is_some_and(|r| r.include_as_join && r.is_anchor()));
    if !retrieve.ranges.is_empty() && !has_anchor {
        return Err(QueryError::NoAnchorRange);
    }

    for &range in &retrieve.ranges {
        let Some(r) = ast.range(range) else { continue };
        if let Some(join) = r.join_property {
            if let Some(relation) = ast.identifier(join) {
                return Err(QueryError::InvalidViaRelation {
                    range: r.name.clone(),
                    relation: format!("{}.{}", ast.range_name(relation.range), relation.path.join(".")),
                });
            }
            check_declared(ast, join, &declared, &format!("join predicate of range '{}'", r.name))?;
            if let Some(function) = first_aggregate(ast, join, false) {
                return Err(QueryError::AggregateInJoin { range: r.name.clone(), function: function.to_string() });
            }
        }
        if let Some(nested) = r.query {
            validate_retrieve(ast, nested)?;
        }
    }

    for &value in &retrieve.values {
        check_declared(ast, value, &declared, "retrieve")?;
    }
    for item in &retrieve.sort {
        check_declared(ast, item.expression, &declared, "sort")?;
        if ast.contains(item.expression, |n| matches!(n, Node::Aggregate(a) if a.function.is_any())) {
            return Err(QueryError::AnyInSort);
        }
    }
    if let Some(cond) = retrieve.conditions {
        check_declared(ast, cond, &declared, "where")?;
        if let Some(function) = first_aggregate(ast, cond, true) {
            return Err(QueryError::AggregateInWhere(function.to_string()));
        }
    }
    Ok(())
}

/// Identifiers outside subqueries must point at a range of this scope.
fn check_declared(ast: &Ast, root: NodeId, declared: &HashSet<NodeId>, clause: &str) -> Result<(), QueryError> {
    for id in ast.identifiers_under(root, false) {
        let Some(ident) = ast.identifier(id) else { continue };
        if !declared.contains(&ident.range) {
            return Err(QueryError::UndeclaredRange { clause: clause.to_string(), range: ast.range_name(ident.range).to_string() });
        }
    }
    Ok(())
}

/// Name of the first aggregate under `root` outside subqueries. ANY and
/// everything below it is skipped when `allow_any` is set.
fn first_aggregate(ast: &Ast, root: NodeId, allow_any: bool) -> Option<&'static str> {
    let mut offending = None;
    let mut check = |ast: &Ast, id: NodeId| match ast.node(id) {
        Node::Aggregate(a) if allow_any && a.function.is_any() => Visit::Skip,
        Node::Aggregate(a) => {
            offending = Some(a.function.name());
            Visit::Stop
        }
        Node::Subquery(_) => Visit::Skip,
        _ => Visit::Descend,
    };
    let _ = ast.accept(root, &mut check);
    offending
}

/// Fails when an ANY node survived optimization anywhere in the tree.
pub fn ensure_any_rewritten(query: &Query) -> Result<(), QueryError> {
    let ast = query.ast();
    match ast.find(query.root(), |n| matches!(n, Node::Aggregate(a) if a.function.is_any())) {
        Some(any) => Err(QueryError::UnresolvedAny(explain(ast, any))),
        None => Ok(()),
    }
}
