//! Processing phase: macro expansion and `via` relation expansion. Runs
//! before validation, so the optimizer only ever sees explicit predicates.

use log::debug;

use super::ast::{Node, NodeId, Query};
use super::errors::QueryError;
use crate::entity_store::EntityMetadata;

/// Upper bound on nested macro expansion rounds.
pub const MAX_MACRO_DEPTH: usize = 16;

/// Replace every `@name` placeholder with a copy of the macro body.
pub fn expand_macros(query: &mut Query) -> Result<bool, QueryError> {
    let root = query.root();
    let mut expanded_any = false;

    for _ in 0..MAX_MACRO_DEPTH {
        let placeholders: Vec<(NodeId, String)> = query
            .ast()
            .descendants(root)
            .into_iter()
            .filter_map(|id| match query.ast().node(id) {
                Node::Macro(name) => Some((id, name.clone())),
                _ => None,
            })
            .collect();
        if placeholders.is_empty() {
            return Ok(expanded_any);
        }

        for (placeholder, name) in placeholders {
            let body = query.retrieve().macros.get(&name).copied().ok_or_else(|| QueryError::UnknownMacro(name.clone()))?;
            let ast = query.ast_mut();
            let copy = ast.deep_clone(body);
            ast.replace(placeholder, copy);
            debug!("expanded macro @{}", name);
        }
        expanded_any = true;
    }

    // Still placeholders after the last round: the macros reference each other.
    let ast = query.ast();
    match ast.descendants(root).into_iter().find_map(|id| match ast.node(id) {
        Node::Macro(name) => Some(name.clone()),
        _ => None,
    }) {
        Some(name) => Err(QueryError::UnknownMacro(name)),
        None => Ok(expanded_any),
    }
}

/// Turn `via o.property` into `r.<inversed_by> = o.<relation_column>` using the
/// relation annotations declared on `o`'s entity.
pub fn expand_via_relations(query: &mut Query, metadata: &dyn EntityMetadata) -> Result<bool, QueryError> {
    let mut expanded = false;
    for range in query.ranges() {
        let ast = query.ast();
        let Some(r) = ast.range(range) else { continue };
        let Some(join) = r.join_property else { continue };
        let Some(relation) = ast.identifier(join) else { continue };
        if relation.range == range || !relation.is_direct() { continue; }

        let owner = relation.range;
        let property = relation.field().to_string();
        let invalid = || QueryError::InvalidViaRelation {
            range: r.name.clone(),
            relation: format!("{}.{}", ast.range_name(owner), property),
        };
        let owner_entity = ast.range(owner).and_then(|o| o.entity_name.as_deref()).ok_or_else(invalid)?;
        let target = r.entity_name.as_deref().ok_or_else(invalid)?;
        let annotation = metadata
            .relationships_of(owner_entity)
            .iter()
            .find(|a| a.property == property && a.target_entity == target)
            .ok_or_else(invalid)?;
        let (inversed_by, relation_column) = (annotation.inversed_by.clone(), annotation.relation_column.clone());
        let name = r.name.clone();

        let ast = query.ast_mut();
        let left = ast.identifier_node(range, &[inversed_by.as_str()]);
        let right = ast.identifier_node(owner, &[relation_column.as_str()]);
        let predicate = ast.eq(left, right);
        ast.set_join_property(range, Some(predicate));
        debug!("range '{}' joined via {}: {}.{} = {}.{}", name, property, name, inversed_by, ast.range_name(owner), relation_column);
        expanded = true;
    }
    Ok(expanded)
}
