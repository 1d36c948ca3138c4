//! Schema metadata collaborator contract.
//!
//! The application declares, per entity, which fields and relationships
//! participate in sync and which entity carries a large binary payload.
//! Consumed read-only by the converter and the cache manager.

use std::collections::HashMap;

use crate::types::FieldValue;

/// Declared kind of a synced field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Real,
    Boolean,
    Bytes,
    Timestamp,
}

impl FieldKind {
    /// Whether a wire value is acceptable for this declared kind.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (FieldKind::String, FieldValue::String(_))
                | (FieldKind::Integer, FieldValue::Integer(_))
                | (FieldKind::Real, FieldValue::Real(_))
                | (FieldKind::Boolean, FieldValue::Boolean(_))
                | (FieldKind::Bytes, FieldValue::Bytes(_))
                | (FieldKind::Timestamp, FieldValue::Timestamp(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub struct RelationshipSchema {
    pub name: String,
    pub target_entity: String,
    pub to_many: bool,
}

/// Declaration of the large-binary payload field on a cacheable entity.
#[derive(Debug, Clone)]
pub struct AssetSchema {
    pub field: String,
}

/// Sync declaration for one entity.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub name: String,
    pub record_type: String,
    pub fields: Vec<FieldSchema>,
    pub relationships: Vec<RelationshipSchema>,
    /// Present when the entity carries a cacheable binary payload.
    pub asset: Option<AssetSchema>,
    /// Routes records of this entity to the public partition.
    pub public: bool,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_type: record_type.into(),
            fields: Vec::new(),
            relationships: Vec::new(),
            asset: None,
            public: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn with_to_one(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relationships.push(RelationshipSchema {
            name: name.into(),
            target_entity: target.into(),
            to_many: false,
        });
        self
    }

    pub fn with_to_many(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relationships.push(RelationshipSchema {
            name: name.into(),
            target_entity: target.into(),
            to_many: true,
        });
        self
    }

    pub fn with_asset(mut self, field: impl Into<String>) -> Self {
        self.asset = Some(AssetSchema {
            field: field.into(),
        });
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.asset.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipSchema> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Read-only lookup over every declared entity.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    by_entity: HashMap<String, EntitySchema>,
    record_type_to_entity: HashMap<String, String>,
}

impl SchemaMap {
    pub fn new(entities: Vec<EntitySchema>) -> Self {
        let mut by_entity = HashMap::new();
        let mut record_type_to_entity = HashMap::new();
        for entity in entities {
            record_type_to_entity.insert(entity.record_type.clone(), entity.name.clone());
            by_entity.insert(entity.name.clone(), entity);
        }
        Self {
            by_entity,
            record_type_to_entity,
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.by_entity.get(name)
    }

    pub fn entity_for_record_type(&self, record_type: &str) -> Option<&EntitySchema> {
        self.record_type_to_entity
            .get(record_type)
            .and_then(|name| self.by_entity.get(name))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.by_entity.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_schema() -> EntitySchema {
        EntitySchema::new("note", "Note")
            .with_field("title", FieldKind::String)
            .with_to_one("folder", "folder")
            .with_asset("payload")
    }

    #[test]
    fn lookup_by_entity_and_record_type() {
        let map = SchemaMap::new(vec![note_schema()]);
        assert!(map.entity("note").is_some());
        assert_eq!(map.entity_for_record_type("Note").unwrap().name, "note");
        assert!(map.entity("folder").is_none());
    }

    #[test]
    fn cacheable_entities_declare_an_asset_field() {
        let schema = note_schema();
        assert!(schema.is_cacheable());
        assert_eq!(schema.asset.as_ref().unwrap().field, "payload");
    }

    #[test]
    fn field_kind_validation() {
        assert!(FieldKind::String.accepts(&FieldValue::String("x".into())));
        assert!(!FieldKind::String.accepts(&FieldValue::Integer(1)));
    }
}
