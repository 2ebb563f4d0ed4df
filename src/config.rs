//! Node-level configuration for the flow framework.

use std::sync::Arc;

use crate::checkpoints::{CheckpointStore, InMemoryCheckpointStore, StoreError};
use crate::types::{NodeId, Party};

/// Selects the backing implementation of the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointBackend {
    /// Volatile process-local storage; tests and ephemeral nodes.
    InMemory,
    #[cfg(feature = "sqlite")]
    /// Durable SQLite-backed storage (see `checkpoints::sqlite`).
    Sqlite,
}

/// Buffering policy for the broadcast feeds (state machines, tx mappings).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedConfig {
    /// Per-subscriber buffer; overflow drops oldest with a loss marker.
    pub buffer_capacity: usize,
}

impl FeedConfig {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: if buffer_capacity == 0 {
                Self::DEFAULT_BUFFER_CAPACITY
            } else {
                buffer_capacity
            },
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER_CAPACITY)
    }
}

/// Static configuration of one node's flow framework instance.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Identity this node advertises to counterparties.
    pub identity: Party,
    /// Concrete transport endpoint this node consumes from.
    pub node_id: NodeId,
    /// Application identity carried in `SessionInit`/`SessionConfirm`.
    pub app_id: String,
    pub checkpointer: CheckpointBackend,
    pub sqlite_db_name: Option<String>,
    pub feeds: FeedConfig,
    /// Whether the network directory is usable at construction time. Nodes
    /// integrating a network map start with `false` and call
    /// `notify_network_ready` on the first tick; starts requested before then
    /// are queued with their entry point not yet run.
    pub network_ready_at_start: bool,
}

impl NodeConfig {
    #[must_use]
    pub fn new(identity: Party, node_id: NodeId) -> Self {
        Self {
            identity,
            node_id,
            app_id: "ledgerflow".to_string(),
            checkpointer: CheckpointBackend::InMemory,
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
            feeds: FeedConfig::default(),
            network_ready_at_start: true,
        }
    }

    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if let Some(name) = provided {
            return Some(name);
        }
        dotenvy::dotenv().ok();
        Some(std::env::var("SQLITE_DB_NAME").unwrap_or_else(|_| "ledgerflow.db".to_string()))
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    #[must_use]
    pub fn with_checkpointer(mut self, backend: CheckpointBackend) -> Self {
        self.checkpointer = backend;
        self
    }

    #[must_use]
    pub fn with_sqlite_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = Self::resolve_sqlite_db_name(Some(name.into()));
        self
    }

    #[must_use]
    pub fn with_feeds(mut self, feeds: FeedConfig) -> Self {
        self.feeds = feeds;
        self
    }

    #[must_use]
    pub fn network_ready_at_start(mut self, ready: bool) -> Self {
        self.network_ready_at_start = ready;
        self
    }

    /// Build the checkpoint store this configuration selects.
    pub async fn build_store(&self) -> Result<Arc<dyn CheckpointStore>, StoreError> {
        match &self.checkpointer {
            CheckpointBackend::InMemory => Ok(Arc::new(InMemoryCheckpointStore::new())),
            #[cfg(feature = "sqlite")]
            CheckpointBackend::Sqlite => {
                let db_url = std::env::var("LEDGERFLOW_SQLITE_URL")
                    .ok()
                    .or_else(|| {
                        self.sqlite_db_name
                            .as_ref()
                            .map(|name| format!("sqlite://{name}"))
                    })
                    .unwrap_or_else(|| "sqlite://ledgerflow.db".to_string());
                // SQLite will not create the backing file on connect; do it
                // here so first runs work out of the box.
                if let Some(path) = db_url.strip_prefix("sqlite://") {
                    let path = path.trim();
                    if !path.is_empty() {
                        let p = std::path::Path::new(path);
                        if let Some(parent) = p.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        if !p.exists() {
                            let _ = std::fs::File::create_new(p);
                        }
                    }
                }
                let store = crate::checkpoints::SqliteCheckpointStore::connect(&db_url).await?;
                Ok(Arc::new(store))
            }
        }
    }
}
