//! Local store collaborator contract.
//!
//! The engine consumes the local object store through [`LocalStore`]:
//! named-context atomic commits, a durable ordered change history, and a
//! did-save event subscription. [`CursorStore`] persists the opaque history
//! cursor in durable key-value storage.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::types::{CacheState, ChangeKind, LocalObject, ObjectId, SyncCursor, Tombstone};

/// One unit of an atomic commit.
#[derive(Debug, Clone)]
pub enum ObjectMutation {
    Save(LocalObject),
    Delete(ObjectId),
}

/// One change within a history transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub object_id: ObjectId,
    pub entity: String,
    /// Property names changed by this commit (insert/update only).
    pub changed_keys: Vec<String>,
    /// Delete metadata; present only for deletes of objects that had been
    /// assigned remote record information.
    pub tombstone: Option<Tombstone>,
}

/// An ordered list of changes for a single logical local commit, tagged with
/// the context name that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Cursor position after this transaction.
    pub cursor: SyncCursor,
    pub context: String,
    pub changes: Vec<ChangeRecord>,
}

/// Context lifecycle event published by the store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    DidSave {
        context: String,
        saved: Vec<ObjectId>,
        deleted: Vec<ObjectId>,
    },
}

/// The local object store.
///
/// Commits are atomic and observable by any read issued after `commit`
/// returns (strict happens-before). All methods may be called from any
/// thread; implementations serialize internally.
pub trait LocalStore: Send + Sync {
    fn get(&self, id: &ObjectId) -> Result<Option<LocalObject>, StoreError>;

    /// Every object of one entity.
    fn fetch_entity(&self, entity: &str) -> Result<Vec<LocalObject>, StoreError>;

    /// Match by remote record name within one entity.
    fn fetch_by_record_name(
        &self,
        entity: &str,
        record_name: &str,
    ) -> Result<Option<LocalObject>, StoreError>;

    /// Every cacheable object whose cache state is one of `states`.
    fn fetch_cacheables(&self, states: &[CacheState]) -> Result<Vec<LocalObject>, StoreError>;

    /// Commit a batch of mutations as one history transaction under the
    /// given context name.
    fn commit(&self, context: &str, mutations: Vec<ObjectMutation>) -> Result<(), StoreError>;

    /// Atomic read-modify-write of a single object, committed under the
    /// given context name. Returns false when the object no longer exists.
    fn update(
        &self,
        context: &str,
        id: &ObjectId,
        apply: &mut dyn FnMut(&mut LocalObject),
    ) -> Result<bool, StoreError>;

    /// Transactions recorded after `cursor` (all retained history for
    /// `None`). Fails with [`StoreError::CursorExpired`] when the cursor
    /// predates retained history.
    fn history_since(&self, cursor: Option<SyncCursor>) -> Result<Vec<Transaction>, StoreError>;

    /// Drop history up to and including `cursor`.
    fn delete_history_before(&self, cursor: SyncCursor) -> Result<(), StoreError>;

    /// Subscribe to context lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Durable key-value storage for the opaque history cursor.
///
/// A missing value is a valid state meaning "full resync required".
pub trait CursorStore: Send + Sync {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn save(&self, key: &str, value: &[u8]);
    fn clear(&self, key: &str);
}

/// In-memory cursor storage.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    fn save(&self, key: &str, value: &[u8]) {
        self.values.lock().insert(key.to_string(), value.to_vec());
    }

    fn clear(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_store_round_trip() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load("k"), None);

        store.save("k", &SyncCursor(7).to_bytes());
        let cursor = store.load("k").and_then(|b| SyncCursor::from_bytes(&b));
        assert_eq!(cursor, Some(SyncCursor(7)));

        store.clear("k");
        assert_eq!(store.load("k"), None);
    }
}
