//! Engine façade wiring the pipelines together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::convert::Converter;
use crate::error::{ErrorSink, Result};
use crate::history::HistoryProcessor;
use crate::pull::{PullPipeline, PullReport};
use crate::push::PushPipeline;
use crate::remote::RemoteStore;
use crate::schema::SchemaMap;
use crate::store::{CursorStore, LocalStore, StoreEvent};
use crate::throttle::Throttle;
use crate::types::{DatabaseScope, ObjectId, RecordId};

/// Bidirectional sync engine between a local object store and a remote
/// record store.
///
/// Owns the change-history processor, the push and pull pipelines, the
/// cache state machine, and the shared pause deadline. Collaborators are
/// consumed through the traits in [`crate::store`], [`crate::remote`], and
/// [`crate::error`].
pub struct SyncEngine {
    throttle: Arc<Throttle>,
    push: Arc<PushPipeline>,
    pull: PullPipeline,
    cache: Arc<CacheManager>,
    history: HistoryProcessor,
    online: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Wire the collaborators and start the background workers. History
    /// processing runs once immediately, resuming whatever a previous
    /// process left behind.
    pub fn start(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        cursor_store: Arc<dyn CursorStore>,
        schema: Arc<SchemaMap>,
        config: SyncConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let throttle = Arc::new(Throttle::new());
        let converter = Converter::new(schema.clone());
        let online = Arc::new(AtomicBool::new(true));

        let push = Arc::new(PushPipeline::new(
            store.clone(),
            remote.clone(),
            converter.clone(),
            throttle.clone(),
            sink.clone(),
            config.clone(),
        ));
        let pull = PullPipeline::new(
            store.clone(),
            remote.clone(),
            converter,
            throttle.clone(),
            sink.clone(),
            config.clone(),
        );
        let cache = Arc::new(CacheManager::start(
            store.clone(),
            remote,
            schema,
            throttle.clone(),
            sink.clone(),
            config.clone(),
        ));
        let history = HistoryProcessor::spawn(
            store.clone(),
            cursor_store,
            push.clone(),
            cache.clone(),
            throttle.clone(),
            sink,
            config.clone(),
            online.clone(),
        );

        // Subscribe before returning so no save event is missed.
        let events = store.subscribe();
        tokio::spawn(watch_saves(
            events,
            history.clone(),
            throttle.clone(),
            online.clone(),
            config,
        ));

        history.trigger();

        Arc::new(Self {
            throttle,
            push,
            pull,
            cache,
            history,
            online,
        })
    }

    /// Process pending change history now, without waiting for a debounce.
    pub fn sync_now(&self) {
        self.history.trigger();
    }

    /// Fetch the record graph reachable from `roots` into the local store.
    pub async fn pull_records(
        &self,
        roots: Vec<RecordId>,
        scope: DatabaseScope,
    ) -> Result<PullReport> {
        self.pull.pull_records(roots, scope).await
    }

    /// Re-upload every local object, not just pending deltas.
    pub async fn push_all_local_data(&self) -> Result<()> {
        self.push.push_all_local_data().await
    }

    /// Act on the current cache states of the given objects.
    pub async fn request_cache_transfers(&self, ids: Vec<ObjectId>) {
        self.cache.request(ids).await;
    }

    /// Toggle connectivity. Going online re-triggers history processing.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::Relaxed);
        if online && !was_online {
            self.history.trigger();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// The process-wide pause deadline shared by every pipeline.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub async fn shutdown(&self) {
        self.history.stop().await;
        self.cache.shutdown().await;
    }
}

/// Mark the history worker dirty for every push-eligible save.
async fn watch_saves(
    mut events: broadcast::Receiver<StoreEvent>,
    history: HistoryProcessor,
    throttle: Arc<Throttle>,
    online: Arc<AtomicBool>,
    config: Arc<SyncConfig>,
) {
    loop {
        match events.recv().await {
            Ok(StoreEvent::DidSave { context, .. }) => {
                if context != config.push_context_name {
                    continue;
                }
                if !online.load(Ordering::Relaxed) {
                    continue;
                }
                // We've been asked to retry later.
                if throttle.is_paused() {
                    continue;
                }
                history.mark_dirty();
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Missed events are fine; the next run reads the full log.
                history.mark_dirty();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
