//! Application state shared by every route

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::persistence::PersistCommand;
use crate::registry::Registry;

/// Per-connection knobs taken from the server config
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub api_key: Option<String>,
    pub auto_approve: bool,
    pub event_queue_capacity: usize,
    pub allow_remote_origins: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            auto_approve: false,
            event_queue_capacity: 10_000,
            allow_remote_origins: false,
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            auto_approve: config.auto_approve,
            event_queue_capacity: config.event_queue_capacity.max(1),
            allow_remote_origins: config.allow_remote_origins,
        }
    }
}

pub struct AppState {
    pub registry: Arc<Registry>,
    pub settings: ConnectionSettings,
    persist_tx: mpsc::Sender<PersistCommand>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        settings: ConnectionSettings,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> Self {
        Self {
            registry,
            settings,
            persist_tx,
        }
    }

    pub fn persist(&self) -> &mpsc::Sender<PersistCommand> {
        &self.persist_tx
    }
}
