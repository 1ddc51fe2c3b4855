//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::registry::RegistryConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "switchyard")]
#[command(about = "Serve agent sessions over WebSocket", version)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "SWITCHYARD_BIND", default_value = "127.0.0.1:4300")]
    pub bind: SocketAddr,

    /// Data directory for the session store and logs (default: ~/.switchyard)
    #[arg(long, env = "SWITCHYARD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Token clients must present before anything else
    #[arg(long, env = "SWITCHYARD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Answer every approval prompt without asking the client
    #[arg(long, env = "SWITCHYARD_AUTO_APPROVE")]
    pub auto_approve: bool,

    /// Profile used when a client doesn't pick one
    #[arg(long, env = "SWITCHYARD_DEFAULT_PROFILE")]
    pub default_profile: Option<String>,

    /// Per-connection event buffer; events beyond it are dropped
    #[arg(long, env = "SWITCHYARD_EVENT_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub event_queue_capacity: usize,

    /// Per-session input queue; callers wait when it is full
    #[arg(long, env = "SWITCHYARD_WORK_QUEUE_CAPACITY", default_value_t = 64)]
    pub work_queue_capacity: usize,

    /// Accept websocket upgrades from non-localhost origins
    #[arg(long, env = "SWITCHYARD_ALLOW_REMOTE_ORIGINS")]
    pub allow_remote_origins: bool,
}

impl ServerConfig {
    pub fn registry_config(&self, db_path: PathBuf) -> RegistryConfig {
        RegistryConfig {
            db_path: Some(db_path),
            default_profile: self.default_profile.clone(),
            work_queue_capacity: self.work_queue_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let config = ServerConfig::try_parse_from(["switchyard"]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:4300".parse::<SocketAddr>().unwrap());
        assert_eq!(config.event_queue_capacity, 10_000);
        assert_eq!(config.work_queue_capacity, 64);
        assert!(!config.auto_approve);
    }

    #[test]
    fn flags_flow_into_registry_config() {
        let config = ServerConfig::try_parse_from([
            "switchyard",
            "--default-profile",
            "fast",
            "--work-queue-capacity",
            "0",
        ])
        .unwrap();
        let registry = config.registry_config(PathBuf::from("/tmp/s.db"));
        assert_eq!(registry.default_profile.as_deref(), Some("fast"));
        assert_eq!(registry.work_queue_capacity, 1);
        assert_eq!(registry.db_path, Some(PathBuf::from("/tmp/s.db")));
    }
}
