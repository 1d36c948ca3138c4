//! Remote record store collaborator contract.
//!
//! The engine rides on an existing record-store API: identifier-addressed
//! records partitioned into zones, batched modify/fetch with per-record
//! outcomes, and long-lived transfer operations that survive the process and
//! can be reattached to by identifier.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::types::{DatabaseScope, RecordId, RemoteRecord, ZoneId};

/// Server acknowledgement of one saved record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
    pub id: RecordId,
    /// New opaque version metadata for subsequent conflict-checked saves.
    pub change_tag: String,
}

/// Per-record outcome of a modify batch.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Saved(SavedRecord),
    Deleted(RecordId),
    Failed { id: RecordId, error: RemoteError },
}

impl RecordOutcome {
    pub fn id(&self) -> &RecordId {
        match self {
            RecordOutcome::Saved(saved) => &saved.id,
            RecordOutcome::Deleted(id) => id,
            RecordOutcome::Failed { id, .. } => id,
        }
    }
}

/// Per-record outcome of a fetch batch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub id: RecordId,
    pub result: Result<RemoteRecord, RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
}

/// A long-lived binary transfer to submit.
///
/// The caller chooses `operation_id` and persists it before submission, so a
/// process restart can resume by identifier instead of resubmitting.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub operation_id: String,
    pub kind: TransferKind,
    pub scope: DatabaseScope,
    pub record: RecordId,
    /// Field on the record holding the binary payload.
    pub asset_field: String,
    /// Source path for uploads, destination path for downloads.
    pub asset_path: Option<PathBuf>,
}

/// Event stream of one long-lived transfer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Fraction complete in [0, 1]. May arrive out of order.
    Progress(f64),
    Completed {
        /// Local path of the fetched payload (downloads only).
        asset_path: Option<PathBuf>,
    },
    Failed(RemoteError),
}

/// Handle onto an in-flight long-lived transfer.
#[derive(Debug)]
pub struct TransferHandle {
    pub operation_id: String,
    pub events: async_channel::Receiver<TransferEvent>,
}

/// The remote record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Submit one batch of saves and deletes; returns one outcome per
    /// operation. A batch-level error applies to every operation in it.
    async fn modify(
        &self,
        scope: DatabaseScope,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RecordOutcome>, RemoteError>;

    /// Fetch records by identifier, optionally restricted to desired fields.
    async fn fetch(
        &self,
        scope: DatabaseScope,
        ids: Vec<RecordId>,
        desired_fields: Option<Vec<String>>,
    ) -> Result<Vec<FetchOutcome>, RemoteError>;

    async fn create_zone(&self, zone: ZoneId) -> Result<(), RemoteError>;

    async fn delete_zone(&self, zone: ZoneId) -> Result<(), RemoteError>;

    async fn create_subscription(&self, scope: DatabaseScope) -> Result<(), RemoteError>;

    /// Start a new long-lived transfer.
    async fn submit_transfer(&self, request: TransferRequest)
        -> Result<TransferHandle, RemoteError>;

    /// Reattach to a long-lived transfer by identifier. `Ok(None)` means the
    /// operation is no longer known to the backend.
    async fn resume_transfer(
        &self,
        operation_id: &str,
    ) -> Result<Option<TransferHandle>, RemoteError>;

    /// Request cooperative cancellation of an in-flight operation.
    async fn cancel_operation(&self, operation_id: &str) -> Result<(), RemoteError>;
}
