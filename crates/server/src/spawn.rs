//! Spawn capability handed to every session.

use std::sync::Weak;

use async_trait::async_trait;
use switchyard_connector_core::{ConnectorError, SpawnHandler, SpawnRequest, SpawnResult};
use tracing::warn;

use crate::registry::Registry;

/// Creates sub-sessions of `parent_id` through the registry.
///
/// Holds a weak reference: the registry owns the sessions that own this.
pub struct RegistrySpawner {
    registry: Weak<Registry>,
    parent_id: String,
}

impl RegistrySpawner {
    pub fn new(registry: Weak<Registry>, parent_id: String) -> Self {
        Self {
            registry,
            parent_id,
        }
    }
}

#[async_trait]
impl SpawnHandler for RegistrySpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, ConnectorError> {
        let Some(registry) = self.registry.upgrade() else {
            return Err(ConnectorError::Provider("server is shutting down".into()));
        };
        registry
            .spawn_child(&self.parent_id, request)
            .await
            .map_err(|e| {
                warn!(
                    component = "spawn",
                    event = "session.spawn_failed",
                    parent_id = %self.parent_id,
                    error = %e,
                    "Sub-session failed"
                );
                ConnectorError::Provider(e.to_string())
            })
    }
}
