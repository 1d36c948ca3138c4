//! Change-history cursor processor.
//!
//! One serial worker owns all history processing. Local saves mark the
//! worker dirty and a debounce interval elapses before a run; an explicit
//! trigger runs immediately. A trigger arriving during an active run is
//! coalesced into exactly one follow-up run. The persisted cursor advances
//! only after a transaction's push batch fully succeeds, which guarantees
//! at-least-once redelivery of failed transactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::error::{ErrorSink, Module, StoreError, SyncError};
use crate::push::PushPipeline;
use crate::store::{CursorStore, LocalStore, Transaction};
use crate::throttle::Throttle;
use crate::types::{CacheState, ChangeIntent, ChangeKind, ObjectId, SyncCursor};

const COMMAND_CAPACITY: usize = 16;
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum HistoryCommand {
    /// Process now.
    Trigger,
    /// A local save happened; process after the debounce interval.
    MarkDirty,
    Stop,
}

/// Handle onto the serial history worker.
#[derive(Clone)]
pub struct HistoryProcessor {
    sender: mpsc::Sender<HistoryCommand>,
}

impl HistoryProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        store: Arc<dyn LocalStore>,
        cursor_store: Arc<dyn CursorStore>,
        push: Arc<PushPipeline>,
        cache: Arc<CacheManager>,
        throttle: Arc<Throttle>,
        sink: Arc<dyn ErrorSink>,
        config: Arc<SyncConfig>,
        online: Arc<AtomicBool>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let worker = HistoryWorker {
            store,
            cursor_store,
            push,
            cache,
            throttle,
            sink,
            config,
            online,
        };
        tokio::spawn(worker.run(receiver));
        Self { sender }
    }

    /// Request an immediate run. A request during an active run is queued
    /// and coalesced, never dropped or duplicated.
    pub fn trigger(&self) {
        let _ = self.sender.try_send(HistoryCommand::Trigger);
    }

    /// Note a local mutation; a run follows once the debounce elapses.
    pub fn mark_dirty(&self) {
        let _ = self.sender.try_send(HistoryCommand::MarkDirty);
    }

    pub async fn stop(&self) {
        let _ = self.sender.send(HistoryCommand::Stop).await;
    }
}

struct HistoryWorker {
    store: Arc<dyn LocalStore>,
    cursor_store: Arc<dyn CursorStore>,
    push: Arc<PushPipeline>,
    cache: Arc<CacheManager>,
    throttle: Arc<Throttle>,
    sink: Arc<dyn ErrorSink>,
    config: Arc<SyncConfig>,
    online: Arc<AtomicBool>,
}

impl HistoryWorker {
    async fn run(self, mut receiver: mpsc::Receiver<HistoryCommand>) {
        let mut last_dirty: Option<Instant> = None;
        let mut check = interval(CHECK_INTERVAL);

        loop {
            tokio::select! {
                cmd = receiver.recv() => {
                    match cmd {
                        Some(HistoryCommand::Trigger) => {
                            if Self::drain(&mut receiver, &mut last_dirty) {
                                break;
                            }
                            self.process_once().await;
                            last_dirty = None;
                        }
                        Some(HistoryCommand::MarkDirty) => {
                            last_dirty = Some(Instant::now());
                        }
                        Some(HistoryCommand::Stop) | None => break,
                    }
                }
                _ = check.tick() => {
                    if let Some(dirty_at) = last_dirty {
                        if dirty_at.elapsed() >= self.config.debounce {
                            last_dirty = None;
                            self.process_once().await;
                        }
                    }
                }
            }
        }

        tracing::info!("history processor stopped");
    }

    /// Collapse queued triggers into the run about to start. Returns true
    /// when a stop request was queued.
    fn drain(
        receiver: &mut mpsc::Receiver<HistoryCommand>,
        last_dirty: &mut Option<Instant>,
    ) -> bool {
        loop {
            match receiver.try_recv() {
                Ok(HistoryCommand::Trigger) => continue,
                Ok(HistoryCommand::MarkDirty) => *last_dirty = Some(Instant::now()),
                Ok(HistoryCommand::Stop) => return true,
                Err(_) => return false,
            }
        }
    }

    async fn process_once(&self) {
        if !self.online.load(Ordering::Relaxed) {
            return;
        }
        // We've been asked to retry later.
        if self.throttle.is_paused() {
            return;
        }

        let cursor = self
            .cursor_store
            .load(&self.config.cursor_key)
            .and_then(|bytes| SyncCursor::from_bytes(&bytes));

        let transactions = match self.store.history_since(cursor) {
            Ok(transactions) => transactions,
            Err(StoreError::CursorExpired) => {
                tracing::warn!("history cursor expired; resyncing from the beginning");
                self.cursor_store.clear(&self.config.cursor_key);
                self.sink
                    .report(&SyncError::Store(StoreError::CursorExpired), Module::Push);
                match self.store.history_since(None) {
                    Ok(transactions) => transactions,
                    Err(e) => {
                        self.sink.report(&SyncError::Store(e), Module::Push);
                        return;
                    }
                }
            }
            Err(e) => {
                self.sink.report(&SyncError::Store(e), Module::Push);
                return;
            }
        };

        for transaction in transactions {
            if !self.process_transaction(&transaction).await {
                break;
            }
        }
    }

    /// Push one transaction and, only on full success, advance and persist
    /// the cursor. Returns false when processing must stop.
    async fn process_transaction(&self, transaction: &Transaction) -> bool {
        // Changes originating from the pull pipeline's own commits, and our
        // bookkeeping commits, must not be re-pushed.
        if transaction.context == self.config.push_context_name {
            let mut intents = Vec::new();
            let mut cancel_operations = Vec::new();
            let mut inserted: Vec<ObjectId> = Vec::new();

            for change in &transaction.changes {
                match change.kind {
                    ChangeKind::Insert | ChangeKind::Update => {
                        // An object gone from the store was deleted by a
                        // later transaction; its tombstone follows there.
                        let Ok(Some(mut object)) = self.store.get(&change.object_id) else {
                            continue;
                        };
                        if let Err(e) = self.push.ensure_record_information(&mut object) {
                            self.sink.report(&e, Module::Push);
                            continue;
                        }
                        if change.kind == ChangeKind::Insert {
                            inserted.push(object.id.clone());
                        }
                        intents.push(ChangeIntent::Save(object));
                    }
                    ChangeKind::Delete => {
                        let Some(tombstone) = &change.tombstone else {
                            continue;
                        };
                        if let Some(operation_id) = &tombstone.operation_id {
                            cancel_operations.push(operation_id.clone());
                        }
                        intents.push(ChangeIntent::Delete(tombstone.clone()));
                    }
                }
            }

            let result = if intents.is_empty() {
                Ok(())
            } else {
                self.push.push_intents(intents).await
            };

            // In-flight asset transfers for deleted objects are cancelled
            // regardless of the batch outcome.
            if !cancel_operations.is_empty() {
                self.cache.cancel_operations(cancel_operations).await;
            }

            match result {
                Ok(()) => self.promote_cacheables(&inserted),
                Err(e) => {
                    if !e.is_cancellation() && !matches!(e, SyncError::Paused) {
                        tracing::debug!(error = %e, "push failed; cursor stays for redelivery");
                    }
                    return false;
                }
            }
        }

        self.cursor_store
            .save(&self.config.cursor_key, &transaction.cursor.to_bytes());
        if let Err(e) = self.store.delete_history_before(transaction.cursor) {
            self.sink.report(&SyncError::Store(e), Module::Push);
        }
        true
    }

    /// Newly inserted cacheable objects with a local payload start their
    /// upload once the insert itself has pushed.
    fn promote_cacheables(&self, inserted: &[ObjectId]) {
        for id in inserted {
            let needs_upload = self
                .store
                .get(id)
                .ok()
                .flatten()
                .and_then(|o| o.cache().map(|c| c.state == CacheState::Local))
                .unwrap_or(false);
            if !needs_upload {
                continue;
            }
            let _ = self
                .store
                .update(&self.config.service_context_name, id, &mut |o| {
                    if let Some(cache) = o.cache_mut() {
                        if cache.state == CacheState::Local {
                            cache.state = CacheState::Upload;
                        }
                    }
                });
        }
    }
}
