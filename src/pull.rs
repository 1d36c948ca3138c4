//! Pull pipeline: breadth-first fetch of a record graph into local objects.
//!
//! The frontier is an explicit queue gated by a seen-set, so cyclic graphs
//! terminate and total work is bounded by the reachable record set. Each
//! fetched record converts immediately; references to records not yet
//! materialized resolve in one pass after the frontier drains, and the whole
//! session commits as a single transaction.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::SyncConfig;
use crate::convert::{Converter, WorkingSet};
use crate::error::{ErrorSink, Module, RemoteError, Result, SyncError};
use crate::remote::{FetchOutcome, RemoteStore};
use crate::store::LocalStore;
use crate::throttle::Throttle;
use crate::types::{DatabaseScope, RecordId};

/// Summary of one pull session. Partial success is expected; per-record
/// failures and unresolved references are counted, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Records fetched successfully.
    pub fetched: usize,
    /// Records converted into local objects.
    pub converted: usize,
    /// Records that failed to fetch and were omitted from the graph.
    pub failed_records: usize,
    /// References whose targets stayed unresolved after the resolution pass.
    pub unresolved_references: usize,
}

pub struct PullPipeline {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    converter: Converter,
    throttle: Arc<Throttle>,
    sink: Arc<dyn ErrorSink>,
    config: Arc<SyncConfig>,
}

impl PullPipeline {
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

    /// Fetch the graph reachable from `roots` and materialize it locally.
    pub async fn pull_records(
        &self,
        roots: Vec<RecordId>,
        scope: DatabaseScope,
    ) -> Result<PullReport> {
        if self.throttle.is_paused() {
            return Err(SyncError::Paused);
        }

        let mut report = PullReport::default();
        if roots.is_empty() {
            return Ok(report);
        }

        let mut session = WorkingSet::new();
        let mut seen: HashSet<RecordId> = roots.iter().cloned().collect();
        let mut frontier = roots;

        // One frontier fully resolves before the next begins; only the
        // fetches inside a frontier run concurrently.
        while !frontier.is_empty() {
            let chunks: Vec<Vec<RecordId>> = frontier
                .chunks(self.config.max_batch_size.max(1))
                .map(|c| c.to_vec())
                .collect();
            let results: Vec<Result<Vec<FetchOutcome>, RemoteError>> = stream::iter(chunks)
                .map(|chunk| self.remote.fetch(scope, chunk, None))
                .buffer_unordered(self.config.pull_fetch_concurrency.max(1))
                .collect()
                .await;

            let mut next = Vec::new();
            for result in results {
                let outcomes = match result {
                    Ok(outcomes) => outcomes,
                    Err(e) => return self.fail_fetch(e),
                };
                for outcome in outcomes {
                    match outcome.result {
                        Ok(record) => {
                            report.fetched += 1;
                            for target in record.references() {
                                if seen.insert(target.clone()) {
                                    next.push(target);
                                }
                            }
                            match self.converter.to_object(
                                &record,
                                self.store.as_ref(),
                                &mut session,
                            ) {
                                Ok(_) => report.converted += 1,
                                // Skip the single record, keep the graph.
                                Err(e) => self.sink.report(&e, Module::Pull),
                            }
                        }
                        Err(RemoteError::Cancelled) => {}
                        Err(e) => {
                            report.failed_records += 1;
                            self.sink.report(&SyncError::Remote(e), Module::Pull);
                        }
                    }
                }
            }
            frontier = next;
        }

        report.unresolved_references = self
            .converter
            .resolve_missing(self.store.as_ref(), &mut session);

        if !session.is_empty() {
            self.store
                .commit(&self.config.pull_context_name, session.into_mutations())?;
        }

        tracing::info!(
            fetched = report.fetched,
            converted = report.converted,
            failed = report.failed_records,
            unresolved = report.unresolved_references,
            "pull session committed"
        );
        Ok(report)
    }

    /// Frontier-level fetch failure: the whole session stops, but transient
    /// outcomes only pause and cancellation stays silent.
    fn fail_fetch(&self, error: RemoteError) -> Result<PullReport> {
        if let Some(retry_after) = error.retry_after() {
            self.throttle.pause_for(retry_after);
            return Err(SyncError::Remote(error));
        }
        if matches!(error, RemoteError::Cancelled) {
            return Err(SyncError::Cancelled);
        }
        let err = SyncError::Remote(error);
        self.sink.report(&err, Module::Pull);
        Err(err)
    }
}
