//! Stateless mapping between local objects and remote wire records.
//!
//! `to_object` is idempotent: the same record converts to the same local
//! identity, matched by remote record name. Reference fields whose targets
//! are not yet materialized are captured as missing references and resolved
//! in a single pass at the end of a pull session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::schema::{RelationshipSchema, SchemaMap};
use crate::store::{LocalStore, ObjectMutation};
use crate::types::{
    CacheAttributes, CacheState, DatabaseScope, FieldValue, LocalObject, MissingReference,
    ObjectId, RecordId, Relation, RemoteRecord, SystemFields,
};

/// Mutations accumulated over one pull session, committed as one
/// transaction. Reads resolve against the working set before the store so
/// conversions observe earlier conversions of the same session.
#[derive(Debug, Default)]
pub struct WorkingSet {
    objects: HashMap<ObjectId, LocalObject>,
    by_record_name: HashMap<(String, String), ObjectId>,
    missing: Vec<MissingReference>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&LocalObject> {
        self.objects.get(id)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut LocalObject> {
        self.objects.get_mut(id)
    }

    /// Match by entity and remote record name within the session.
    pub fn lookup(&self, entity: &str, record_name: &str) -> Option<&LocalObject> {
        self.by_record_name
            .get(&(entity.to_string(), record_name.to_string()))
            .and_then(|id| self.objects.get(id))
    }

    pub fn insert(&mut self, object: LocalObject) {
        if let Some(record_name) = object.service.record_name.clone() {
            self.by_record_name
                .insert((object.entity.clone(), record_name), object.id.clone());
        }
        self.objects.insert(object.id.clone(), object);
    }

    pub fn record_missing(&mut self, reference: MissingReference) {
        self.missing.push(reference);
    }

    pub fn take_missing(&mut self) -> Vec<MissingReference> {
        std::mem::take(&mut self.missing)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drain the session into one commit batch.
    pub fn into_mutations(self) -> Vec<ObjectMutation> {
        self.objects.into_values().map(ObjectMutation::Save).collect()
    }
}

/// Object/record converter over the declared schema.
#[derive(Clone)]
pub struct Converter {
    schema: Arc<SchemaMap>,
}

impl Converter {
    pub fn new(schema: Arc<SchemaMap>) -> Self {
        Self { schema }
    }

    /// Build the wire record for one local object. Requires assigned record
    /// information; relationship targets without record information are
    /// omitted (they join the record once pushed themselves).
    pub fn to_record(&self, object: &LocalObject, store: &dyn LocalStore) -> Result<RemoteRecord> {
        let schema = self
            .schema
            .entity(&object.entity)
            .ok_or_else(|| SyncError::UnknownEntity(object.entity.clone()))?;
        let id = object.record_id().ok_or_else(|| {
            SyncError::Conversion(format!("object {} has no record information", object.id))
        })?;

        let mut record = RemoteRecord::new(id, schema.record_type.clone());
        record.change_tag = object.system_fields().and_then(|sf| sf.change_tag);

        for field in &schema.fields {
            if let Some(value) = object.fields.get(&field.name) {
                if !field.kind.accepts(value) {
                    return Err(SyncError::Conversion(format!(
                        "field {} on {} has mismatched value type",
                        field.name, object.entity
                    )));
                }
                record.set(field.name.clone(), value.clone());
            }
        }

        for relationship in &schema.relationships {
            match object.relations.get(&relationship.name) {
                Some(Relation::ToOne(Some(target))) => {
                    if let Some(target_id) = Self::target_record_id(store, target)? {
                        record.set(relationship.name.clone(), FieldValue::Reference(target_id));
                    } else {
                        tracing::debug!(
                            relation = %relationship.name,
                            target = %target,
                            "skipping reference to target without record information"
                        );
                    }
                }
                Some(Relation::ToMany(targets)) => {
                    let mut ids = Vec::with_capacity(targets.len());
                    for target in targets {
                        if let Some(target_id) = Self::target_record_id(store, target)? {
                            ids.push(target_id);
                        }
                    }
                    if !ids.is_empty() {
                        record.set(relationship.name.clone(), FieldValue::ReferenceList(ids));
                    }
                }
                Some(Relation::ToOne(None)) | None => {}
            }
        }

        Ok(record)
    }

    /// Materialize one fetched record into the session working set,
    /// match-or-create by record name. Unresolvable reference targets are
    /// recorded as missing, never errors.
    pub fn to_object(
        &self,
        record: &RemoteRecord,
        store: &dyn LocalStore,
        session: &mut WorkingSet,
    ) -> Result<ObjectId> {
        let schema = self
            .schema
            .entity_for_record_type(&record.record_type)
            .ok_or_else(|| SyncError::UnknownEntity(record.record_type.clone()))?;

        let mut object = match session.lookup(&schema.name, &record.id.name) {
            Some(existing) => existing.clone(),
            None => match store.fetch_by_record_name(&schema.name, &record.id.name)? {
                Some(existing) => existing,
                None => {
                    let mut created = LocalObject::new(schema.name.clone());
                    created.service.record_name = Some(record.id.name.clone());
                    created.service.zone = Some(record.id.zone.clone());
                    created.service.scope = Some(if schema.public {
                        DatabaseScope::Public
                    } else {
                        DatabaseScope::of(&record.id.zone)
                    });
                    created
                }
            },
        };

        object.set_system_fields(&SystemFields {
            record: record.id.clone(),
            record_type: record.record_type.clone(),
            change_tag: record.change_tag.clone(),
        })?;

        for field in &schema.fields {
            if let Some(value) = record.get(&field.name) {
                if !field.kind.accepts(value) {
                    return Err(SyncError::MalformedRecord {
                        record: record.id.name.clone(),
                        message: format!("field {} has unexpected value type", field.name),
                    });
                }
                object.fields.insert(field.name.clone(), value.clone());
            }
        }

        if let Some(asset) = &schema.asset {
            if object.service.cache.is_none() {
                let remote_payload = record.get(&asset.field).is_some();
                object.service.cache = Some(CacheAttributes {
                    state: if remote_payload {
                        CacheState::Remote
                    } else {
                        CacheState::Local
                    },
                    ..CacheAttributes::default()
                });
            }
        }

        for relationship in &schema.relationships {
            let Some(value) = record.get(&relationship.name) else {
                continue;
            };
            let targets = value.reference_targets();
            if targets.is_empty() {
                return Err(SyncError::MalformedRecord {
                    record: record.id.name.clone(),
                    message: format!("field {} is not a reference", relationship.name),
                });
            }

            let mut unresolved = Vec::new();
            for target in targets {
                let resolved = session
                    .lookup(&relationship.target_entity, &target.name)
                    .map(|o| o.id.clone())
                    .or_else(|| {
                        store
                            .fetch_by_record_name(&relationship.target_entity, &target.name)
                            .ok()
                            .flatten()
                            .map(|o| o.id)
                    });
                match resolved {
                    Some(target_id) => {
                        Self::relation_slot(&mut object, relationship).set_target(target_id);
                    }
                    None => unresolved.push(target.name.clone()),
                }
            }
            if !unresolved.is_empty() {
                session.record_missing(MissingReference {
                    object_id: object.id.clone(),
                    relation: relationship.name.clone(),
                    targets: unresolved,
                });
            }
        }

        // The pulled state is in sync with the server; nothing pends a push.
        object.service.changed_keys.clear();

        let id = object.id.clone();
        session.insert(object);
        Ok(id)
    }

    /// Second pass over a drained session: set relations whose targets are
    /// now materialized. Returns the count that remained unresolved, which
    /// is a warning, not an error.
    pub fn resolve_missing(&self, store: &dyn LocalStore, session: &mut WorkingSet) -> usize {
        let mut unresolved = 0;

        for missing in session.take_missing() {
            let Some(owner) = session.get(&missing.object_id) else {
                continue;
            };
            let Some(relationship) = self
                .schema
                .entity(&owner.entity)
                .and_then(|s| s.relationship(&missing.relation))
                .cloned()
            else {
                continue;
            };

            for target_name in &missing.targets {
                let resolved = session
                    .lookup(&relationship.target_entity, target_name)
                    .map(|o| o.id.clone())
                    .or_else(|| {
                        store
                            .fetch_by_record_name(&relationship.target_entity, target_name)
                            .ok()
                            .flatten()
                            .map(|o| o.id)
                    });
                match resolved {
                    Some(target_id) => {
                        if let Some(owner) = session.get_mut(&missing.object_id) {
                            Self::relation_slot(owner, &relationship).set_target(target_id);
                        }
                    }
                    None => {
                        tracing::warn!(
                            relation = %missing.relation,
                            target = %target_name,
                            "reference target not found after resolution pass"
                        );
                        unresolved += 1;
                    }
                }
            }
        }

        unresolved
    }

    /// Remote identity of a relationship target, if it has been assigned.
    fn target_record_id(store: &dyn LocalStore, target: &ObjectId) -> Result<Option<RecordId>> {
        Ok(store.get(target)?.and_then(|o| o.record_id()))
    }

    fn relation_slot<'a>(
        object: &'a mut LocalObject,
        relationship: &RelationshipSchema,
    ) -> &'a mut Relation {
        object
            .relations
            .entry(relationship.name.clone())
            .or_insert_with(|| {
                if relationship.to_many {
                    Relation::ToMany(Default::default())
                } else {
                    Relation::ToOne(None)
                }
            })
    }

    pub fn schema(&self) -> &SchemaMap {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldKind};
    use crate::store::MemoryStore;
    use crate::types::{RecordId, ZoneId};

    fn schema() -> Arc<SchemaMap> {
        Arc::new(SchemaMap::new(vec![
            EntitySchema::new("note", "Note")
                .with_field("title", FieldKind::String)
                .with_to_one("folder", "folder"),
            EntitySchema::new("folder", "Folder")
                .with_field("name", FieldKind::String)
                .with_to_many("notes", "note"),
        ]))
    }

    fn note_record(name: &str, folder: Option<&str>) -> RemoteRecord {
        let zone = ZoneId::private("default");
        let mut record = RemoteRecord::new(RecordId::new(name, zone.clone()), "Note");
        record.set("title", FieldValue::String(format!("title of {name}")));
        if let Some(folder) = folder {
            record.set(
                "folder",
                FieldValue::Reference(RecordId::new(folder, zone)),
            );
        }
        record.change_tag = Some("v1".into());
        record
    }

    #[test]
    fn to_object_is_idempotent_by_record_name() {
        let store = MemoryStore::new();
        let converter = Converter::new(schema());
        let mut session = WorkingSet::new();

        let record = note_record("n1", None);
        let first = converter.to_object(&record, &store, &mut session).unwrap();
        let second = converter.to_object(&record, &store, &mut session).unwrap();

        assert_eq!(first, second);
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn unresolved_reference_is_recorded_not_failed() {
        let store = MemoryStore::new();
        let converter = Converter::new(schema());
        let mut session = WorkingSet::new();

        let id = converter
            .to_object(&note_record("n1", Some("f1")), &store, &mut session)
            .unwrap();

        let object = session.get(&id).unwrap();
        assert!(matches!(
            object.relations.get("folder"),
            None | Some(Relation::ToOne(None))
        ));

        // Materialize the folder, then the resolution pass repairs it.
        let mut folder = RemoteRecord::new(
            RecordId::new("f1", ZoneId::private("default")),
            "Folder",
        );
        folder.set("name", FieldValue::String("inbox".into()));
        converter.to_object(&folder, &store, &mut session).unwrap();

        let unresolved = converter.resolve_missing(&store, &mut session);
        assert_eq!(unresolved, 0);

        let object = session.get(&id).unwrap();
        let Relation::ToOne(Some(folder_id)) = object.relations.get("folder").unwrap() else {
            panic!("folder relation not set");
        };
        assert!(session.get(folder_id).is_some());
    }

    #[test]
    fn unknown_record_type_is_an_error() {
        let store = MemoryStore::new();
        let converter = Converter::new(schema());
        let mut session = WorkingSet::new();

        let record = RemoteRecord::new(
            RecordId::new("x", ZoneId::private("default")),
            "Mystery",
        );
        let err = converter.to_object(&record, &store, &mut session).unwrap_err();
        assert!(matches!(err, SyncError::UnknownEntity(_)));
    }

    #[test]
    fn round_trip_preserves_fields_and_references() {
        let store = MemoryStore::new();
        let converter = Converter::new(schema());
        let mut session = WorkingSet::new();

        converter
            .to_object(&note_record("n1", Some("f1")), &store, &mut session)
            .unwrap();
        let mut folder = RemoteRecord::new(
            RecordId::new("f1", ZoneId::private("default")),
            "Folder",
        );
        folder.set("name", FieldValue::String("inbox".into()));
        converter.to_object(&folder, &store, &mut session).unwrap();
        converter.resolve_missing(&store, &mut session);

        store
            .commit("driftsync.pull", session.into_mutations())
            .unwrap();

        let note = store.fetch_by_record_name("note", "n1").unwrap().unwrap();
        let record = converter.to_record(&note, &store).unwrap();
        assert_eq!(record.record_type, "Note");
        assert_eq!(record.change_tag.as_deref(), Some("v1"));
        assert_eq!(
            record.get("title"),
            Some(&FieldValue::String("title of n1".into()))
        );
        let Some(FieldValue::Reference(folder_ref)) = record.get("folder") else {
            panic!("folder reference missing");
        };
        assert_eq!(folder_ref.name, "f1");
    }

    #[test]
    fn to_record_requires_record_information() {
        let store = MemoryStore::new();
        let converter = Converter::new(schema());
        let object = LocalObject::new("note");
        let err = converter.to_record(&object, &store).unwrap_err();
        assert!(matches!(err, SyncError::Conversion(_)));
    }
}
