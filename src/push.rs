//! Push pipeline: ships change intents to the remote store and reconciles
//! per-record outcomes.
//!
//! Operations are grouped by destination scope and chunked to the backend
//! batch limit. Conflicts retry individually with a field-level
//! last-writer-wins merge; transient outcomes set the global pause deadline
//! and cancel the rest of the batch; a missing zone triggers the full
//! rebuild-and-reupload sequence.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::{DeleteOrdering, SyncConfig};
use crate::convert::Converter;
use crate::error::{ErrorSink, Module, RemoteError, Result, SyncError};
use crate::remote::{RecordOutcome, RemoteStore, SavedRecord};
use crate::store::LocalStore;
use crate::throttle::Throttle;
use crate::types::{
    ChangeIntent, DatabaseScope, LocalObject, ObjectId, RecordId, RemoteRecord, SystemFields,
    ZoneId,
};

/// Provenance of one save operation, kept to reconcile its outcome.
#[derive(Debug, Clone)]
struct SaveOrigin {
    object_id: ObjectId,
    changed_keys: Vec<String>,
    attempted: RemoteRecord,
}

#[derive(Debug, Default)]
struct ScopeBatch {
    saves: Vec<RemoteRecord>,
    deletes: Vec<RecordId>,
    origins: HashMap<RecordId, SaveOrigin>,
}

pub struct PushPipeline {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    converter: Converter,
    throttle: Arc<Throttle>,
    sink: Arc<dyn ErrorSink>,
    config: Arc<SyncConfig>,
}

impl PushPipeline {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        converter: Converter,
        throttle: Arc<Throttle>,
        sink: Arc<dyn ErrorSink>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            remote,
            converter,
            throttle,
            sink,
            config,
        }
    }

    /// Durably ship one transaction's intents. `Ok` means every operation
    /// reconciled; the caller may then advance its cursor.
    pub async fn push_intents(&self, intents: Vec<ChangeIntent>) -> Result<()> {
        self.push_intents_inner(intents, true).await
    }

    /// Re-upload every object of every declared entity, not just pending
    /// deltas. Used standalone and by zone recovery.
    pub async fn push_all_local_data(&self) -> Result<()> {
        self.push_all(true).await
    }

    /// Assign record information to an object that has never been pushed,
    /// persisting the assignment so dependent conversions can observe it.
    pub fn ensure_record_information(&self, object: &mut LocalObject) -> Result<()> {
        if object.record_id().is_some() {
            return Ok(());
        }
        let schema = self
            .converter
            .schema()
            .entity(&object.entity)
            .ok_or_else(|| SyncError::UnknownEntity(object.entity.clone()))?;

        let record_name = uuid::Uuid::new_v4().to_string();
        let zone = self.config.zone.clone();
        let scope = if schema.public {
            DatabaseScope::Public
        } else {
            DatabaseScope::of(&zone)
        };

        object.service.record_name = Some(record_name.clone());
        object.service.zone = Some(zone.clone());
        object.service.scope = Some(scope);

        self.store
            .update(&self.config.service_context_name, &object.id, &mut |o| {
                o.service.record_name = Some(record_name.clone());
                o.service.zone = Some(zone.clone());
                o.service.scope = Some(scope);
            })?;
        Ok(())
    }

    async fn push_all(&self, allow_zone_recovery: bool) -> Result<()> {
        let mut intents = Vec::new();
        for entity in self.converter.schema().entities() {
            for mut object in self.store.fetch_entity(&entity.name)? {
                self.ensure_record_information(&mut object)?;
                intents.push(ChangeIntent::Save(object));
            }
        }
        self.push_intents_inner(intents, allow_zone_recovery).await
    }

    async fn push_intents_inner(
        &self,
        intents: Vec<ChangeIntent>,
        allow_zone_recovery: bool,
    ) -> Result<()> {
        if self.throttle.is_paused() {
            return Err(SyncError::Paused);
        }

        let mut batches: HashMap<DatabaseScope, ScopeBatch> = HashMap::new();
        for intent in intents {
            match intent {
                ChangeIntent::Save(object) => {
                    match self.converter.to_record(&object, self.store.as_ref()) {
                        Ok(record) => {
                            let batch = batches.entry(object.scope()).or_default();
                            batch.origins.insert(
                                record.id.clone(),
                                SaveOrigin {
                                    object_id: object.id.clone(),
                                    changed_keys: object.service.changed_keys.clone(),
                                    attempted: record.clone(),
                                },
                            );
                            batch.saves.push(record);
                        }
                        // Skip the single object, keep the batch going.
                        Err(e) => self.sink.report(&e, Module::Push),
                    }
                }
                ChangeIntent::Delete(tombstone) => {
                    batches
                        .entry(tombstone.scope)
                        .or_default()
                        .deletes.push(tombstone.record);
                }
            }
        }

        let mut saved: Vec<(ObjectId, SavedRecord)> = Vec::new();
        for (scope, batch) in batches {
            self.submit_scope(scope, batch, &mut saved, allow_zone_recovery)
                .await?;
        }

        self.persist_results(saved);
        Ok(())
    }

    async fn submit_scope(
        &self,
        scope: DatabaseScope,
        batch: ScopeBatch,
        saved: &mut Vec<(ObjectId, SavedRecord)>,
        allow_zone_recovery: bool,
    ) -> Result<()> {
        let chunks = self.plan_chunks(batch.saves.clone(), batch.deletes.clone());

        for (chunk_saves, chunk_deletes) in chunks {
            // A deadline set mid-batch cancels the remainder for later retry.
            if self.throttle.is_paused() {
                return Err(SyncError::Paused);
            }

            let outcomes = match self.remote.modify(scope, chunk_saves, chunk_deletes).await {
                Ok(outcomes) => outcomes,
                Err(e) => return self.handle_failure(scope, e, allow_zone_recovery).await,
            };

            for outcome in outcomes {
                match outcome {
                    RecordOutcome::Saved(ack) => {
                        if let Some(origin) = batch.origins.get(&ack.id) {
                            saved.push((origin.object_id.clone(), ack));
                        }
                    }
                    RecordOutcome::Deleted(_) => {}
                    RecordOutcome::Failed { id, error } => match error {
                        RemoteError::Conflict { server_record } => {
                            let ack = self
                                .retry_conflict(scope, &id, server_record, &batch)
                                .await?;
                            if let Some(origin) = batch.origins.get(&ack.id) {
                                saved.push((origin.object_id.clone(), ack));
                            }
                        }
                        other => return self.handle_failure(scope, other, allow_zone_recovery).await,
                    },
                }
            }
        }

        Ok(())
    }

    /// Conflict policy: the server holds a newer version. Refetch it, lay
    /// the locally changed fields on top, and resubmit that record alone.
    async fn retry_conflict(
        &self,
        scope: DatabaseScope,
        id: &RecordId,
        server_record: Option<Box<RemoteRecord>>,
        batch: &ScopeBatch,
    ) -> Result<SavedRecord> {
        let origin = batch.origins.get(id).ok_or_else(|| {
            SyncError::Sync(format!("conflict outcome for unknown record {}", id.name))
        })?;

        let server = match server_record {
            Some(record) => *record,
            None => {
                let outcomes = self
                    .remote
                    .fetch(scope, vec![id.clone()], None)
                    .await
                    .map_err(SyncError::Remote)?;
                let fetched = outcomes
                    .into_iter()
                    .find(|o| &o.id == id)
                    .and_then(|o| o.result.ok());
                fetched.ok_or_else(|| {
                    SyncError::Sync(format!("conflicting record {} could not be refetched", id.name))
                })?
            }
        };

        let merged = merge_changed_fields(server, &origin.attempted, &origin.changed_keys);

        let outcomes = self
            .remote
            .modify(scope, vec![merged], Vec::new())
            .await
            .map_err(SyncError::Remote)?;
        match outcomes.into_iter().find(|o| o.id() == id) {
            Some(RecordOutcome::Saved(ack)) => Ok(ack),
            Some(RecordOutcome::Failed { error, .. }) => {
                let err = SyncError::Remote(error);
                self.sink.report(&err, Module::Push);
                Err(err)
            }
            _ => Err(SyncError::Sync(format!(
                "no outcome for conflict retry of {}",
                id.name
            ))),
        }
    }

    /// Server error policy for everything except per-record conflicts.
    async fn handle_failure(
        &self,
        scope: DatabaseScope,
        error: RemoteError,
        allow_zone_recovery: bool,
    ) -> Result<()> {
        if let Some(retry_after) = error.retry_after() {
            self.throttle.pause_for(retry_after);
            tracing::info!(?scope, ?retry_after, "remote asked to retry later; pausing");
            return Err(SyncError::Remote(error));
        }

        match error {
            RemoteError::Cancelled => Err(SyncError::Cancelled),
            RemoteError::ZoneNotFound(zone) if allow_zone_recovery => {
                self.recover_zone(zone.clone()).await?;
                Err(SyncError::Remote(RemoteError::ZoneNotFound(zone)))
            }
            other => {
                let err = SyncError::Remote(other);
                self.sink.report(&err, Module::Push);
                Err(err)
            }
        }
    }

    /// The single most serious recovery scenario: the zone was deleted out
    /// from under us. Recreate the zone, recreate subscriptions, then
    /// re-upload all local data, in that dependency order.
    fn recover_zone(&self, zone: ZoneId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::warn!(zone = %zone.name, "zone missing; rebuilding and re-uploading");
            let scope = DatabaseScope::of(&zone);

            if let Err(e) = self.remote.create_zone(zone.clone()).await {
                let err = SyncError::Remote(e);
                self.sink.report(&err, Module::Push);
                return Err(err);
            }
            if let Err(e) = self.remote.create_subscription(scope).await {
                let err = SyncError::Remote(e);
                self.sink.report(&err, Module::Push);
                return Err(err);
            }
            self.push_all(false).await
        })
    }

    fn persist_results(&self, saved: Vec<(ObjectId, SavedRecord)>) {
        for (object_id, ack) in saved {
            let result = self
                .store
                .update(&self.config.service_context_name, &object_id, &mut |o| {
                    o.service.changed_keys.clear();
                    let record_type = self
                        .converter
                        .schema()
                        .entity(&o.entity)
                        .map(|s| s.record_type.clone())
                        .unwrap_or_default();
                    let _ = o.set_system_fields(&SystemFields {
                        record: ack.id.clone(),
                        record_type,
                        change_tag: Some(ack.change_tag.clone()),
                    });
                });
            if let Err(e) = result {
                // The cursor is not advanced past a failed bookkeeping
                // commit; the next run re-derives state from the log.
                self.sink.report(&SyncError::Store(e), Module::Push);
            }
        }
    }

    fn plan_chunks(
        &self,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Vec<(Vec<RemoteRecord>, Vec<RecordId>)> {
        plan_chunks(
            saves,
            deletes,
            self.config.max_batch_size,
            self.config.delete_ordering,
        )
    }
}

/// Overlay the locally changed fields of `attempted` onto the server's
/// newer record. Unchanged fields keep the server's values; the server's
/// change tag is kept so the resubmission passes the version check.
pub fn merge_changed_fields(
    mut server: RemoteRecord,
    attempted: &RemoteRecord,
    changed_keys: &[String],
) -> RemoteRecord {
    for key in changed_keys {
        match attempted.get(key) {
            Some(value) => {
                server.set(key.clone(), value.clone());
            }
            None => {
                server.fields.remove(key);
            }
        }
    }
    server
}

/// Split one scope's operations into batches within the backend limit,
/// honoring the delete-ordering policy.
pub fn plan_chunks(
    saves: Vec<RemoteRecord>,
    deletes: Vec<RecordId>,
    max_batch_size: usize,
    ordering: DeleteOrdering,
) -> Vec<(Vec<RemoteRecord>, Vec<RecordId>)> {
    let max = max_batch_size.max(1);
    let mut chunks = Vec::new();

    match ordering {
        DeleteOrdering::BeforeSaves => {
            for chunk in deletes.chunks(max) {
                chunks.push((Vec::new(), chunk.to_vec()));
            }
            for chunk in saves.chunks(max) {
                chunks.push((chunk.to_vec(), Vec::new()));
            }
        }
        DeleteOrdering::WithSaves => {
            let mut deletes = deletes.into_iter().peekable();
            let mut saves = saves.into_iter().peekable();
            while deletes.peek().is_some() || saves.peek().is_some() {
                let mut chunk_deletes = Vec::new();
                let mut chunk_saves = Vec::new();
                while chunk_deletes.len() < max && deletes.peek().is_some() {
                    chunk_deletes.push(deletes.next().expect("peeked"));
                }
                while chunk_deletes.len() + chunk_saves.len() < max && saves.peek().is_some() {
                    chunk_saves.push(saves.next().expect("peeked"));
                }
                chunks.push((chunk_saves, chunk_deletes));
            }
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldValue, ZoneId};

    fn record(name: &str) -> RemoteRecord {
        RemoteRecord::new(
            RecordId::new(name, ZoneId::private("default")),
            "Note",
        )
    }

    fn record_id(name: &str) -> RecordId {
        RecordId::new(name, ZoneId::private("default"))
    }

    #[test]
    fn before_saves_ordering_puts_every_delete_chunk_first() {
        let saves: Vec<_> = (0..3).map(|i| record(&format!("s{i}"))).collect();
        let deletes: Vec<_> = (0..3).map(|i| record_id(&format!("d{i}"))).collect();

        let chunks = plan_chunks(saves, deletes, 2, DeleteOrdering::BeforeSaves);
        assert_eq!(chunks.len(), 4);
        assert!(chunks[0].0.is_empty() && chunks[0].1.len() == 2);
        assert!(chunks[1].0.is_empty() && chunks[1].1.len() == 1);
        assert!(chunks[2].1.is_empty() && chunks[2].0.len() == 2);
        assert!(chunks[3].1.is_empty() && chunks[3].0.len() == 1);
    }

    #[test]
    fn with_saves_ordering_respects_the_batch_limit() {
        let saves: Vec<_> = (0..3).map(|i| record(&format!("s{i}"))).collect();
        let deletes: Vec<_> = (0..2).map(|i| record_id(&format!("d{i}"))).collect();

        let chunks = plan_chunks(saves, deletes, 4, DeleteOrdering::WithSaves);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1.len(), 2);
        assert_eq!(chunks[0].0.len(), 2);
        assert_eq!(chunks[1].0.len(), 1);
        for (saves, deletes) in &chunks {
            assert!(saves.len() + deletes.len() <= 4);
        }
    }

    #[test]
    fn conflict_merge_keeps_server_values_for_unchanged_fields() {
        let mut server = record("n1");
        server.change_tag = Some("v7".into());
        server.set("title", FieldValue::String("server title".into()));
        server.set("body", FieldValue::String("server body".into()));

        let mut attempted = record("n1");
        attempted.change_tag = Some("v3".into());
        attempted.set("title", FieldValue::String("local title".into()));
        attempted.set("body", FieldValue::String("local body".into()));

        let merged = merge_changed_fields(server, &attempted, &["title".to_string()]);
        assert_eq!(
            merged.get("title"),
            Some(&FieldValue::String("local title".into()))
        );
        assert_eq!(
            merged.get("body"),
            Some(&FieldValue::String("server body".into()))
        );
        assert_eq!(merged.change_tag.as_deref(), Some("v7"));
    }

    #[test]
    fn conflict_merge_removes_fields_cleared_locally() {
        let mut server = record("n1");
        server.set("title", FieldValue::String("server title".into()));

        let attempted = record("n1");
        let merged = merge_changed_fields(server, &attempted, &["title".to_string()]);
        assert!(merged.get("title").is_none());
    }
}
