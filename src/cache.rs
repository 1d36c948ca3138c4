//! Cache state machine for large binary payloads.
//!
//! Each cacheable object carries a cache state driven here:
//!
//! ```text
//! local → upload → uploading → cached | local (with error)
//! remote → download → downloading → cached | remote (with error)
//! cached | remote → unload → remote
//! ```
//!
//! Transfers are long-lived remote operations. The operation identifier is
//! persisted on the owning object before submission, so a process restart
//! resumes the transfer by identifier instead of resubmitting. Progress only
//! ever increases; terminal outcomes reset it to zero.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::config::SyncConfig;
use crate::error::{ErrorSink, Module, RemoteError, SyncError};
use crate::remote::{RemoteStore, TransferEvent, TransferHandle, TransferKind, TransferRequest};
use crate::schema::SchemaMap;
use crate::store::{LocalStore, StoreEvent};
use crate::throttle::Throttle;
use crate::types::{CacheState, LocalObject, ObjectId};

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug)]
enum CacheCommand {
    Process(Vec<ObjectId>),
    Restart,
    Cancel(Vec<String>),
    Stop,
}

/// Drives cache state transitions on one serial worker, observing the local
/// store for trigger states and owning the in-flight transfer registry.
pub struct CacheManager {
    sender: mpsc::Sender<CacheCommand>,
}

impl CacheManager {
    /// Spawn the worker and the store observer. Interrupted and failed
    /// transfers found in persisted state are restarted immediately.
    pub fn start(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        schema: Arc<SchemaMap>,
        throttle: Arc<Throttle>,
        sink: Arc<dyn ErrorSink>,
        config: Arc<SyncConfig>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);

        let worker = CacheWorker {
            store: store.clone(),
            remote,
            schema,
            throttle,
            sink,
            config,
            active: Arc::new(DashMap::new()),
        };
        tokio::spawn(worker.run(receiver));

        // Subscribe before returning so no trigger commit is missed.
        let events = store.subscribe();
        tokio::spawn(observe_store(events, store, sender.clone()));

        let manager = Self { sender };
        manager.send(CacheCommand::Restart);
        manager
    }

    /// Explicit application request to act on the given objects' current
    /// cache states.
    pub async fn request(&self, ids: Vec<ObjectId>) {
        let _ = self.sender.send(CacheCommand::Process(ids)).await;
    }

    /// Cancel specific in-flight long-lived operations by identifier. Used
    /// when the owning object is deleted mid-transfer. Outcomes of cancelled
    /// operations are swallowed.
    pub async fn cancel_operations(&self, operation_ids: Vec<String>) {
        let _ = self.sender.send(CacheCommand::Cancel(operation_ids)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(CacheCommand::Stop).await;
    }

    fn send(&self, command: CacheCommand) {
        let _ = self.sender.try_send(command);
    }
}

/// Watch did-save events for objects entering a trigger state.
async fn observe_store(
    mut events: broadcast::Receiver<StoreEvent>,
    store: Arc<dyn LocalStore>,
    sender: mpsc::Sender<CacheCommand>,
) {
    loop {
        match events.recv().await {
            Ok(StoreEvent::DidSave { saved, .. }) => {
                let mut triggered = Vec::new();
                for id in saved {
                    let Ok(Some(object)) = store.get(&id) else {
                        continue;
                    };
                    if object.cache().is_some_and(|c| {
                        matches!(
                            c.state,
                            CacheState::Upload | CacheState::Download | CacheState::Unload
                        )
                    }) {
                        triggered.push(id);
                    }
                }
                if !triggered.is_empty()
                    && sender.send(CacheCommand::Process(triggered)).await.is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "cache observer lagged behind store events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct CacheWorker {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    schema: Arc<SchemaMap>,
    throttle: Arc<Throttle>,
    sink: Arc<dyn ErrorSink>,
    config: Arc<SyncConfig>,
    /// Object id → in-flight operation id. At most one per entry.
    active: Arc<DashMap<ObjectId, String>>,
}

impl CacheWorker {
    async fn run(self, mut receiver: mpsc::Receiver<CacheCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                CacheCommand::Process(ids) => {
                    for id in ids {
                        self.process(&id).await;
                    }
                }
                CacheCommand::Restart => self.restart().await,
                CacheCommand::Cancel(ids) => self.cancel(ids).await,
                CacheCommand::Stop => break,
            }
        }
        tracing::info!("cache worker stopped");
    }

    async fn process(&self, id: &ObjectId) {
        let Ok(Some(object)) = self.store.get(id) else {
            return;
        };
        let Some(cache) = object.cache() else {
            return;
        };
        match cache.state {
            CacheState::Upload | CacheState::Uploading => {
                self.transfer(&object, TransferKind::Upload).await;
            }
            CacheState::Download | CacheState::Downloading => {
                self.transfer(&object, TransferKind::Download).await;
            }
            CacheState::Unload => self.unload(&object),
            _ => {}
        }
    }

    /// Resume interrupted transfers from persisted state and re-queue
    /// failed uploads. Run at startup.
    async fn restart(&self) {
        let interrupted = self.store.fetch_cacheables(&[
            CacheState::Upload,
            CacheState::Uploading,
            CacheState::Download,
            CacheState::Downloading,
        ]);
        if let Ok(objects) = interrupted {
            for object in objects {
                self.process(&object.id).await;
            }
        }

        if let Ok(objects) = self.store.fetch_cacheables(&[CacheState::Local]) {
            for object in objects {
                if object.cache().is_some_and(|c| c.last_error.is_some()) {
                    let _ = self.store.update(
                        &self.config.service_context_name,
                        &object.id,
                        &mut |o| {
                            if let Some(cache) = o.cache_mut() {
                                cache.last_error = None;
                                cache.state = CacheState::Upload;
                            }
                        },
                    );
                    self.process(&object.id).await;
                }
            }
        }
    }

    async fn transfer(&self, object: &LocalObject, kind: TransferKind) {
        // The pause gates new submissions, never in-flight transfers.
        if self.throttle.is_paused() {
            return;
        }
        if self.active.contains_key(&object.id) {
            return;
        }

        let Some(cache) = object.cache() else {
            return;
        };
        let Some(asset) = self
            .schema
            .entity(&object.entity)
            .and_then(|s| s.asset.as_ref())
        else {
            return;
        };
        let Some(record) = object.record_id() else {
            tracing::debug!(object = %object.id, "no record information yet; transfer deferred");
            return;
        };

        let mut handle = None;
        if let Some(operation_id) = &cache.operation_id {
            match self.remote.resume_transfer(operation_id).await {
                Ok(Some(resumed)) => handle = Some(resumed),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(operation = %operation_id, error = %e, "resume failed; submitting anew");
                }
            }
        }

        let in_flight = match kind {
            TransferKind::Upload => CacheState::Uploading,
            TransferKind::Download => CacheState::Downloading,
        };

        let handle = match handle {
            Some(handle) => handle,
            None => {
                let operation_id = uuid::Uuid::new_v4().to_string();
                // Persist the identifier before submission so a restart can
                // resume this transfer instead of duplicating it.
                let persist = {
                    let operation_id = operation_id.clone();
                    self.store.update(
                        &self.config.service_context_name,
                        &object.id,
                        &mut move |o| {
                            if let Some(cache) = o.cache_mut() {
                                cache.operation_id = Some(operation_id.clone());
                                cache.state = in_flight;
                            }
                        },
                    )
                };
                if !matches!(persist, Ok(true)) {
                    return;
                }

                let request = TransferRequest {
                    operation_id,
                    kind,
                    scope: object.scope(),
                    record,
                    asset_field: asset.field.clone(),
                    asset_path: cache.asset_path.clone(),
                };
                match self.remote.submit_transfer(request).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.finish_failed(&object.id, kind, e);
                        return;
                    }
                }
            }
        };

        self.active
            .insert(object.id.clone(), handle.operation_id.clone());
        let _ = self.store.update(
            &self.config.service_context_name,
            &object.id,
            &mut |o| {
                if let Some(cache) = o.cache_mut() {
                    cache.state = in_flight;
                    cache.operation_id = Some(handle.operation_id.clone());
                }
            },
        );

        self.spawn_consumer(object.id.clone(), kind, handle);
    }

    fn spawn_consumer(&self, id: ObjectId, kind: TransferKind, handle: TransferHandle) {
        let store = self.store.clone();
        let sink = self.sink.clone();
        let throttle = self.throttle.clone();
        let active = self.active.clone();
        let context = self.config.service_context_name.clone();

        tokio::spawn(async move {
            while let Ok(event) = handle.events.recv().await {
                match event {
                    TransferEvent::Progress(progress) => {
                        let _ = store.update(&context, &id, &mut |o| {
                            if let Some(cache) = o.cache_mut() {
                                let slot = match kind {
                                    TransferKind::Upload => &mut cache.upload_progress,
                                    TransferKind::Download => &mut cache.download_progress,
                                };
                                advance_progress(slot, progress);
                            }
                        });
                    }
                    TransferEvent::Completed { asset_path } => {
                        let _ = store.update(&context, &id, &mut |o| {
                            if let Some(cache) = o.cache_mut() {
                                match kind {
                                    TransferKind::Upload => cache.upload_progress = 0.0,
                                    TransferKind::Download => cache.download_progress = 0.0,
                                }
                                cache.state = CacheState::Cached;
                                cache.last_error = None;
                                cache.operation_id = None;
                                if kind == TransferKind::Download {
                                    if let Some(path) = asset_path.clone() {
                                        cache.asset_path = Some(path);
                                    }
                                }
                            }
                        });
                        break;
                    }
                    TransferEvent::Failed(error) => {
                        let cancelled = matches!(error, RemoteError::Cancelled);
                        if let Some(retry_after) = error.retry_after() {
                            throttle.pause_for(retry_after);
                        }
                        if !cancelled {
                            sink.report(&SyncError::Remote(error.clone()), Module::Cache);
                        }
                        let _ = store.update(&context, &id, &mut |o| {
                            if let Some(cache) = o.cache_mut() {
                                match kind {
                                    TransferKind::Upload => {
                                        cache.upload_progress = 0.0;
                                        cache.state = CacheState::Local;
                                    }
                                    TransferKind::Download => {
                                        cache.download_progress = 0.0;
                                        cache.state = CacheState::Remote;
                                    }
                                }
                                cache.last_error =
                                    (!cancelled).then(|| error.to_string());
                                cache.operation_id = None;
                            }
                        });
                        break;
                    }
                }
            }
            // On a closed stream without a terminal event the operation id
            // stays persisted, so the next restart resumes it.
            active.remove(&id);
        });
    }

    /// Terminal bookkeeping when a submission itself fails.
    fn finish_failed(&self, id: &ObjectId, kind: TransferKind, error: RemoteError) {
        let cancelled = matches!(error, RemoteError::Cancelled);
        if let Some(retry_after) = error.retry_after() {
            self.throttle.pause_for(retry_after);
        }
        if !cancelled {
            self.sink
                .report(&SyncError::Remote(error.clone()), Module::Cache);
        }
        let _ = self
            .store
            .update(&self.config.service_context_name, id, &mut |o| {
                if let Some(cache) = o.cache_mut() {
                    match kind {
                        TransferKind::Upload => {
                            cache.upload_progress = 0.0;
                            cache.state = CacheState::Local;
                        }
                        TransferKind::Download => {
                            cache.download_progress = 0.0;
                            cache.state = CacheState::Remote;
                        }
                    }
                    cache.last_error = (!cancelled).then(|| error.to_string());
                    cache.operation_id = None;
                }
            });
    }

    /// Delete the local payload and demote to `remote`. No network round
    /// trip.
    fn unload(&self, object: &LocalObject) {
        if let Some(path) = object.cache().and_then(|c| c.asset_path.clone()) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "payload removal failed");
            }
        }
        let _ = self.store.update(
            &self.config.service_context_name,
            &object.id,
            &mut |o| {
                if let Some(cache) = o.cache_mut() {
                    cache.asset_path = None;
                    cache.state = CacheState::Remote;
                }
            },
        );
    }

    async fn cancel(&self, operation_ids: Vec<String>) {
        for operation_id in operation_ids {
            if let Err(e) = self.remote.cancel_operation(&operation_id).await {
                // Cancellation outcomes are swallowed.
                tracing::debug!(operation = %operation_id, error = %e, "cancel request failed");
            }
        }
    }
}

/// Fold one progress callback into the stored value. Late or out-of-order
/// callbacks reporting a lower value are ignored; values outside [0, 1] are
/// clamped.
pub fn advance_progress(slot: &mut f64, reported: f64) {
    let reported = reported.clamp(0.0, 1.0);
    if reported > *slot {
        *slot = reported;
    }
}
