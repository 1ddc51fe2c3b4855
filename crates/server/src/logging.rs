//! Structured file logging.
//!
//! Everything goes to `<log_dir>/server.log` through a non-blocking writer.
//! Behavior is driven by environment:
//!
//! - `SWITCHYARD_LOG_FILTER`, then `RUST_LOG`, then [`DEFAULT_FILTER`]
//! - `SWITCHYARD_LOG_FORMAT`: `json` (default) or `pretty`
//! - `SWITCHYARD_TRUNCATE_LOG_ON_START=1` starts from an empty file
//! - `SWITCHYARD_RUN_ID` overrides the generated run id

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything other than `pretty` logs JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Logging options resolved from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Filter directives; an unparsable value falls through to the next source
    pub filter: String,
    pub format: LogFormat,
    pub truncate: bool,
    pub run_id: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::resolve(
            var("SWITCHYARD_LOG_FILTER").as_deref(),
            var("RUST_LOG").as_deref(),
            var("SWITCHYARD_LOG_FORMAT").as_deref(),
            var("SWITCHYARD_TRUNCATE_LOG_ON_START").as_deref(),
            var("SWITCHYARD_RUN_ID"),
        )
    }

    fn resolve(
        filter: Option<&str>,
        rust_log: Option<&str>,
        format: Option<&str>,
        truncate: Option<&str>,
        run_id: Option<String>,
    ) -> Self {
        let filter = [filter, rust_log]
            .into_iter()
            .flatten()
            .find(|directives| EnvFilter::try_new(directives).is_ok())
            .unwrap_or(DEFAULT_FILTER)
            .to_string();
        Self {
            filter,
            format: LogFormat::parse(format),
            truncate: truncate == Some("1"),
            run_id: run_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(generate_run_id),
        }
    }
}

fn generate_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), millis)
}

/// Keeps the non-blocking writer alive; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    init_logging_with(log_dir, LogSettings::from_env())
}

pub fn init_logging_with(log_dir: &Path, settings: LogSettings) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    if settings.truncate {
        std::fs::File::create(&log_path)?;
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));

    // Exactly one of the two format layers is present.
    let (json, pretty) = match settings.format {
        LogFormat::Json => (
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        ),
        LogFormat::Pretty => (
            None,
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&settings.filter)?)
        .with(json)
        .with(pretty)
        .try_init()?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %settings.run_id,
        log_path = %log_path.display(),
        format = settings.format.as_str(),
        filter = %settings.filter,
        "Logging initialized"
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        log_path,
        guard,
    })
}
