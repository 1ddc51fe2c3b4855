//! Switchyard server
//!
//! Turns long-lived agent sessions into a concurrency-safe, resumable,
//! streamable service. The `registry` owns session lifecycle, each session
//! runs inputs through its own `session_worker`, and executor hook events
//! reach clients through the `fanout` and `translator` as wire messages.

pub mod approval;
pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod migration_runner;
pub mod paths;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod session_worker;
pub mod spawn;
pub mod state;
pub mod surface;
pub mod translator;
pub mod websocket;

pub use error::SessionError;
pub use registry::{CreateOptions, Registry, RegistryConfig};
