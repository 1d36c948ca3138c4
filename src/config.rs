//! Engine configuration

use std::time::Duration;

use crate::types::ZoneId;

/// Ordering of delete operations relative to saves within one push batch.
///
/// The backend accepts arbitrary same-batch graphs, but deletes must precede
/// or accompany saves so a tombstoned record is never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOrdering {
    /// Submit all deletes before any saves (default).
    BeforeSaves,
    /// Submit deletes and saves in the same batches.
    WithSaves,
}

/// Configuration for a [`crate::engine::SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Zone new records are created in.
    pub zone: ZoneId,
    /// Maximum operations (saves + deletes) per remote batch.
    pub max_batch_size: usize,
    /// Quiet period between a local save and history processing.
    pub debounce: Duration,
    pub delete_ordering: DeleteOrdering,
    /// Context name whose commits are eligible for push. Application
    /// mutations must be committed under this name.
    pub push_context_name: String,
    /// Context name used by the pull pipeline; its commits are never
    /// re-pushed.
    pub pull_context_name: String,
    /// Context name for the engine's own bookkeeping commits (service
    /// attributes, cache state); consumed but never converted.
    pub service_context_name: String,
    /// Well-known key the history cursor is persisted under.
    pub cursor_key: String,
    /// Concurrent record fetches within one pull frontier.
    pub pull_fetch_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            zone: ZoneId::private("driftsync"),
            max_batch_size: 400,
            debounce: Duration::from_secs(2),
            delete_ordering: DeleteOrdering::BeforeSaves,
            push_context_name: "driftsync.push".to_string(),
            pull_context_name: "driftsync.pull".to_string(),
            service_context_name: "driftsync.service".to_string(),
            cursor_key: "driftsync.history-cursor".to_string(),
            pull_fetch_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_consistent() {
        let config = SyncConfig::default();
        assert!(config.max_batch_size > 0);
        assert!(config.pull_fetch_concurrency > 0);
        assert_ne!(config.push_context_name, config.pull_context_name);
        assert_ne!(config.push_context_name, config.service_context_name);
    }
}
