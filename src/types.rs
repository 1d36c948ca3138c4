//! Core types for driftsync

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Unique identifier for a local object
pub type ObjectId = String;

/// Zone owner name designating the device's own private partition.
pub const CURRENT_USER_OWNER: &str = "__current_user__";

/// A remote partition owning a related set of records and their
/// change-tracking scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    pub name: String,
    pub owner: String,
}

impl ZoneId {
    /// Zone owned by the current user.
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: CURRENT_USER_OWNER.to_string(),
        }
    }

    /// Zone shared by another owner.
    pub fn shared(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }

    pub fn is_current_user(&self) -> bool {
        self.owner == CURRENT_USER_OWNER
    }
}

/// Identifier of one remote record: a name unique within its zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub name: String,
    pub zone: ZoneId,
}

impl RecordId {
    pub fn new(name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }
}

/// Destination database partition for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseScope {
    Public,
    Private,
    Shared,
}

impl DatabaseScope {
    /// Default scope for a zone, from its ownership.
    pub fn of(zone: &ZoneId) -> Self {
        if zone.is_current_user() {
            DatabaseScope::Private
        } else {
            DatabaseScope::Shared
        }
    }
}

/// A typed field value on a record or local object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Reference(RecordId),
    ReferenceList(Vec<RecordId>),
    /// Opaque handle to a large binary payload managed by the cache pipeline.
    Asset(String),
}

impl FieldValue {
    /// Reference targets carried by this value, if it is a reference field.
    pub fn reference_targets(&self) -> &[RecordId] {
        match self {
            FieldValue::Reference(id) => std::slice::from_ref(id),
            FieldValue::ReferenceList(ids) => ids.as_slice(),
            _ => &[],
        }
    }
}

/// The wire representation of one entity instance. Immutable once fetched;
/// a new value replaces it on resave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    pub record_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Opaque server version metadata required for conflict-checked saves.
    pub change_tag: Option<String>,
}

impl RemoteRecord {
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            change_tag: None,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// All record identifiers referenced from this record's fields.
    pub fn references(&self) -> Vec<RecordId> {
        self.fields
            .values()
            .flat_map(|v| v.reference_targets().iter().cloned())
            .collect()
    }
}

/// A named relationship on a local object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    ToOne(Option<ObjectId>),
    ToMany(BTreeSet<ObjectId>),
}

impl Relation {
    /// Point the relation at `target`: replace for to-one, insert for to-many.
    pub fn set_target(&mut self, target: ObjectId) {
        match self {
            Relation::ToOne(slot) => *slot = Some(target),
            Relation::ToMany(set) => {
                set.insert(target);
            }
        }
    }
}

/// Cache lifecycle state of one cacheable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Payload exists only locally.
    Local,
    /// Upload requested.
    Upload,
    /// Upload transfer in flight.
    Uploading,
    /// Payload exists locally and remotely.
    Cached,
    /// Download requested.
    Download,
    /// Download transfer in flight.
    Downloading,
    /// Payload exists only remotely.
    Remote,
    /// Local payload eviction requested.
    Unload,
}

/// Cache bookkeeping carried by a cacheable local object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheAttributes {
    pub state: CacheState,
    /// Monotonic within one transfer, reset to zero on terminal outcomes.
    pub upload_progress: f64,
    pub download_progress: f64,
    pub last_error: Option<String>,
    /// Identifier of the in-flight long-lived operation, persisted before
    /// submission so a restart can resume instead of resubmitting.
    pub operation_id: Option<String>,
    /// Local path of the binary payload, when present on this device.
    pub asset_path: Option<PathBuf>,
}

impl Default for CacheAttributes {
    fn default() -> Self {
        Self {
            state: CacheState::Local,
            upload_progress: 0.0,
            download_progress: 0.0,
            last_error: None,
            operation_id: None,
            asset_path: None,
        }
    }
}

/// System metadata cached from the last save of a record, sufficient to
/// re-issue a conflict-aware save after the original record is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFields {
    pub record: RecordId,
    pub record_type: String,
    pub change_tag: Option<String>,
}

impl SystemFields {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Per-entity service attributes maintained by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServiceAttributes {
    /// Remote record name, assigned on first push or pull.
    pub record_name: Option<String>,
    pub zone: Option<ZoneId>,
    /// Destination partition; derived from zone ownership and schema.
    pub scope: Option<DatabaseScope>,
    /// Serialized [`SystemFields`] blob from the last successful save.
    pub system_fields: Option<String>,
    /// Property names changed since the last successful push.
    pub changed_keys: Vec<String>,
    /// Present only on cacheable entities.
    pub cache: Option<CacheAttributes>,
}

/// An entity instance in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalObject {
    pub id: ObjectId,
    pub entity: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub relations: BTreeMap<String, Relation>,
    pub service: ServiceAttributes,
}

impl LocalObject {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity: entity.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            service: ServiceAttributes::default(),
        }
    }

    /// Set a field value and track the key as changed since last push.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        self.mark_changed(&name);
        self.fields.insert(name, value);
    }

    /// Set a relation and track the key as changed since last push.
    pub fn set_relation(&mut self, name: impl Into<String>, relation: Relation) {
        let name = name.into();
        self.mark_changed(&name);
        self.relations.insert(name, relation);
    }

    pub fn mark_changed(&mut self, key: &str) {
        if !self.service.changed_keys.iter().any(|k| k == key) {
            self.service.changed_keys.push(key.to_string());
        }
    }

    /// Remote identity, once record information has been assigned.
    pub fn record_id(&self) -> Option<RecordId> {
        match (&self.service.record_name, &self.service.zone) {
            (Some(name), Some(zone)) => Some(RecordId::new(name.clone(), zone.clone())),
            _ => None,
        }
    }

    /// Destination partition, defaulting from zone ownership.
    pub fn scope(&self) -> DatabaseScope {
        self.service
            .scope
            .or_else(|| self.service.zone.as_ref().map(DatabaseScope::of))
            .unwrap_or(DatabaseScope::Private)
    }

    pub fn system_fields(&self) -> Option<SystemFields> {
        self.service
            .system_fields
            .as_deref()
            .and_then(|raw| SystemFields::decode(raw).ok())
    }

    pub fn set_system_fields(&mut self, fields: &SystemFields) -> Result<()> {
        self.service.system_fields = Some(fields.encode()?);
        Ok(())
    }

    pub fn cache(&self) -> Option<&CacheAttributes> {
        self.service.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut CacheAttributes> {
        self.service.cache.as_mut()
    }
}

/// Kind of one change observed in the local change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Delete marker retaining enough metadata to be actionable after the
/// originating object is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub record: RecordId,
    pub scope: DatabaseScope,
    /// In-flight transfer operation for the deleted object, if any, so the
    /// transfer can be cancelled.
    pub operation_id: Option<String>,
}

/// One unit of work for the push pipeline, derived from a history
/// transaction. Consumed exactly once.
#[derive(Debug, Clone)]
pub enum ChangeIntent {
    /// Insert or update: a snapshot of the object with its changed keys.
    Save(LocalObject),
    Delete(Tombstone),
}

/// Opaque, totally ordered token over the local change log.
///
/// Advances only after the corresponding push batch fully succeeds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SyncCursor(pub u64);

impl SyncCursor {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(SyncCursor(u64::from_le_bytes(arr)))
    }
}

/// A reference encountered during conversion whose target was not yet
/// materialized locally. Lives for one pull session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReference {
    pub object_id: ObjectId,
    pub relation: String,
    /// Record names of the unresolved targets.
    pub targets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_ownership_selects_scope() {
        assert_eq!(
            DatabaseScope::of(&ZoneId::private("zone")),
            DatabaseScope::Private
        );
        assert_eq!(
            DatabaseScope::of(&ZoneId::shared("zone", "other-user")),
            DatabaseScope::Shared
        );
    }

    #[test]
    fn set_field_tracks_changed_keys_once() {
        let mut object = LocalObject::new("note");
        object.set_field("title", FieldValue::String("a".into()));
        object.set_field("title", FieldValue::String("b".into()));
        object.set_field("body", FieldValue::String("c".into()));

        assert_eq!(object.service.changed_keys, vec!["title", "body"]);
    }

    #[test]
    fn record_id_requires_assigned_record_information() {
        let mut object = LocalObject::new("note");
        assert!(object.record_id().is_none());

        object.service.record_name = Some("rec-1".into());
        object.service.zone = Some(ZoneId::private("default"));
        let id = object.record_id().expect("record id");
        assert_eq!(id.name, "rec-1");
    }

    #[test]
    fn system_fields_round_trip() {
        let fields = SystemFields {
            record: RecordId::new("rec-1", ZoneId::private("default")),
            record_type: "Note".into(),
            change_tag: Some("v3".into()),
        };
        let encoded = fields.encode().unwrap();
        assert_eq!(SystemFields::decode(&encoded).unwrap(), fields);
    }

    #[test]
    fn relation_set_target_replaces_and_inserts() {
        let mut one = Relation::ToOne(Some("a".into()));
        one.set_target("b".into());
        assert_eq!(one, Relation::ToOne(Some("b".into())));

        let mut many = Relation::ToMany(BTreeSet::from(["a".to_string()]));
        many.set_target("b".into());
        assert_eq!(
            many,
            Relation::ToMany(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn cursor_byte_round_trip() {
        let cursor = SyncCursor(42);
        assert_eq!(SyncCursor::from_bytes(&cursor.to_bytes()), Some(cursor));
        assert_eq!(SyncCursor::from_bytes(&[1, 2, 3]), None);
    }
}
