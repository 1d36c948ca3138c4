//! In-memory reference implementation of the local store.
//!
//! Backs the test suite and embedded use. Objects live in a map guarded by
//! one lock; every commit appends one transaction to an ordered change log
//! with a monotonic sequence cursor.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{ChangeRecord, LocalStore, ObjectMutation, StoreEvent, Transaction};
use crate::error::StoreError;
use crate::types::{CacheState, ChangeKind, LocalObject, ObjectId, SyncCursor, Tombstone};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<ObjectId, LocalObject>,
    log: Vec<Transaction>,
    next_seq: u64,
    /// Highest sequence removed from the log; cursors below it are expired.
    floor: u64,
}

/// In-memory [`LocalStore`] with a durable-ordered change log.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                next_seq: 1,
                ..Inner::default()
            }),
            events,
        }
    }

    /// Number of retained history transactions.
    pub fn history_len(&self) -> usize {
        self.inner.read().log.len()
    }

    fn tombstone_for(object: &LocalObject) -> Option<Tombstone> {
        let record = object.record_id()?;
        Some(Tombstone {
            scope: object.scope(),
            operation_id: object.cache().and_then(|c| c.operation_id.clone()),
            record,
        })
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, id: &ObjectId) -> Result<Option<LocalObject>, StoreError> {
        Ok(self.inner.read().objects.get(id).cloned())
    }

    fn fetch_entity(&self, entity: &str) -> Result<Vec<LocalObject>, StoreError> {
        Ok(self
            .inner
            .read()
            .objects
            .values()
            .filter(|o| o.entity == entity)
            .cloned()
            .collect())
    }

    fn fetch_by_record_name(
        &self,
        entity: &str,
        record_name: &str,
    ) -> Result<Option<LocalObject>, StoreError> {
        Ok(self
            .inner
            .read()
            .objects
            .values()
            .find(|o| {
                o.entity == entity && o.service.record_name.as_deref() == Some(record_name)
            })
            .cloned())
    }

    fn fetch_cacheables(&self, states: &[CacheState]) -> Result<Vec<LocalObject>, StoreError> {
        Ok(self
            .inner
            .read()
            .objects
            .values()
            .filter(|o| o.cache().is_some_and(|c| states.contains(&c.state)))
            .cloned()
            .collect())
    }

    fn commit(&self, context: &str, mutations: Vec<ObjectMutation>) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }

        let event = {
            let mut inner = self.inner.write();
            let mut changes = Vec::with_capacity(mutations.len());
            let mut saved = Vec::new();
            let mut deleted = Vec::new();

            for mutation in mutations {
                match mutation {
                    ObjectMutation::Save(object) => {
                        let kind = if inner.objects.contains_key(&object.id) {
                            ChangeKind::Update
                        } else {
                            ChangeKind::Insert
                        };
                        changes.push(ChangeRecord {
                            kind,
                            object_id: object.id.clone(),
                            entity: object.entity.clone(),
                            changed_keys: object.service.changed_keys.clone(),
                            tombstone: None,
                        });
                        saved.push(object.id.clone());
                        inner.objects.insert(object.id.clone(), object);
                    }
                    ObjectMutation::Delete(id) => {
                        let Some(existing) = inner.objects.remove(&id) else {
                            continue;
                        };
                        changes.push(ChangeRecord {
                            kind: ChangeKind::Delete,
                            object_id: id.clone(),
                            entity: existing.entity.clone(),
                            changed_keys: Vec::new(),
                            tombstone: Self::tombstone_for(&existing),
                        });
                        deleted.push(id);
                    }
                }
            }

            if changes.is_empty() {
                return Ok(());
            }

            let cursor = SyncCursor(inner.next_seq);
            inner.next_seq += 1;
            inner.log.push(Transaction {
                cursor,
                context: context.to_string(),
                changes,
            });

            StoreEvent::DidSave {
                context: context.to_string(),
                saved,
                deleted,
            }
        };

        // Nobody listening is fine.
        let _ = self.events.send(event);
        Ok(())
    }

    fn update(
        &self,
        context: &str,
        id: &ObjectId,
        apply: &mut dyn FnMut(&mut LocalObject),
    ) -> Result<bool, StoreError> {
        let event = {
            let mut inner = self.inner.write();
            let Some(object) = inner.objects.get_mut(id) else {
                return Ok(false);
            };
            apply(object);
            let changed_keys = object.service.changed_keys.clone();
            let entity = object.entity.clone();

            let cursor = SyncCursor(inner.next_seq);
            inner.next_seq += 1;
            inner.log.push(Transaction {
                cursor,
                context: context.to_string(),
                changes: vec![ChangeRecord {
                    kind: ChangeKind::Update,
                    object_id: id.clone(),
                    entity,
                    changed_keys,
                    tombstone: None,
                }],
            });

            StoreEvent::DidSave {
                context: context.to_string(),
                saved: vec![id.clone()],
                deleted: Vec::new(),
            }
        };

        let _ = self.events.send(event);
        Ok(true)
    }

    fn history_since(&self, cursor: Option<SyncCursor>) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.inner.read();
        match cursor {
            Some(cursor) => {
                if cursor.0 < inner.floor {
                    return Err(StoreError::CursorExpired);
                }
                Ok(inner
                    .log
                    .iter()
                    .filter(|tx| tx.cursor > cursor)
                    .cloned()
                    .collect())
            }
            None => Ok(inner.log.clone()),
        }
    }

    fn delete_history_before(&self, cursor: SyncCursor) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let removed_max = inner
            .log
            .iter()
            .filter(|tx| tx.cursor <= cursor)
            .map(|tx| tx.cursor.0)
            .max();
        inner.log.retain(|tx| tx.cursor > cursor);
        if let Some(removed_max) = removed_max {
            inner.floor = inner.floor.max(removed_max);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
