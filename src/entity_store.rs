//! Read-only entity metadata consulted by the optimizer.
//!
//! The optimizer only asks two questions: "is this column nullable?" and
//! "which relationship annotations does this entity declare?". Anything that can
//! answer them (cached reflection data, a generated schema, a test fixture)
//! implements [`EntityMetadata`].

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::query_ast::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub primary_key: bool,
}

fn default_nullable() -> bool { true }

/// Relationship annotation declared on an entity.
///
/// `relation_column` is the field on the declaring entity and `inversed_by`
/// the field on `target_entity` it joins against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationAnnotation {
    pub kind: RelationKind,
    pub property: String,
    pub target_entity: String,
    pub relation_column: String,
    pub inversed_by: String,
    #[serde(default)]
    pub required: bool,
}

impl RelationAnnotation {
    /// Whether each row of the declaring entity points at exactly one target row.
    pub fn is_to_one(&self) -> bool { matches!(self.kind, RelationKind::ManyToOne | RelationKind::OneToOne) }
}

pub trait EntityMetadata: Send + Sync {
    fn columns_of(&self, entity: &str) -> Option<&BTreeMap<String, ColumnInfo>>;

    fn relationships_of(&self, entity: &str) -> &[RelationAnnotation];

    /// Unknown entities and fields count as nullable.
    fn is_nullable(&self, entity: &str, field: &str) -> bool {
        self.columns_of(entity)
            .and_then(|columns| columns.get(field))
            .map(|c| c.nullable)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnInfo>,
    #[serde(default)]
    pub relations: Vec<RelationAnnotation>,
}

/// In-memory metadata store, immutable once handed to the optimizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityStore {
    entities: BTreeMap<String, EntityDefinition>,
}

impl EntityStore {
    pub fn new() -> Self { Self::default() }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let store = Self::from_json(&raw)?;
        info!("Loaded metadata for {} entities from {}", store.entities.len(), path.display());
        Ok(store)
    }

    pub fn column(mut self, entity: &str, field: &str, nullable: bool) -> Self {
        self.entities.entry(entity.to_string()).or_default().columns.insert(
            field.to_string(),
            ColumnInfo { nullable, column_type: String::new(), primary_key: false },
        );
        self
    }

    pub fn primary_key(mut self, entity: &str, field: &str) -> Self {
        self.entities.entry(entity.to_string()).or_default().columns.insert(
            field.to_string(),
            ColumnInfo { nullable: false, column_type: "integer".into(), primary_key: true },
        );
        self
    }

    pub fn relation(mut self, entity: &str, annotation: RelationAnnotation) -> Self {
        self.entities.entry(entity.to_string()).or_default().relations.push(annotation);
        self
    }
}

impl EntityMetadata for EntityStore {
    fn columns_of(&self, entity: &str) -> Option<&BTreeMap<String, ColumnInfo>> {
        self.entities.get(entity).map(|e| &e.columns)
    }

    fn relationships_of(&self, entity: &str) -> &[RelationAnnotation] {
        self.entities.get(entity).map(|e| e.relations.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_nullable() {
        let store = EntityStore::new().column("Order", "id", false);
        assert!(!store.is_nullable("Order", "id"));
        assert!(store.is_nullable("Order", "note"));
        assert!(store.is_nullable("Missing", "id"));
    }

    #[test]
    fn loads_from_json() {
        let raw = r#"{
            "Order": {
                "columns": { "id": { "nullable": false, "type": "integer", "primary_key": true }, "note": {} },
                "relations": [{
                    "kind": "ManyToOne", "property": "customer", "target_entity": "Customer",
                    "relation_column": "customerId", "inversed_by": "id", "required": true
                }]
            }
        }"#;
        let store = EntityStore::from_json(raw).expect("valid metadata");
        assert!(!store.is_nullable("Order", "id"));
        assert!(store.is_nullable("Order", "note"));
        let rel = &store.relationships_of("Order")[0];
        assert!(rel.required && rel.is_to_one());
        assert!(store.relationships_of("Customer").is_empty());
    }
}
