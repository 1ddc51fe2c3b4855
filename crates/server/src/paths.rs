//! Central path resolution for Switchyard data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SWITCHYARD_DATA_DIR`
//! env > `~/.switchyard`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::warn;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn default_data_dir() -> PathBuf {
    home_dir().join(".switchyard")
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var("SWITCHYARD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir()),
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Current data directory; the default location if never initialized.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(default_data_dir)
}

pub fn db_path() -> PathBuf {
    data_dir().join("switchyard.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(data_dir())?;
    std::fs::create_dir_all(log_dir())?;
    Ok(())
}

/// Expand a leading `~` and fall back to home for empty input.
pub fn expand_working_dir(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = if trimmed.is_empty() || trimmed == "~" {
        home_dir()
    } else if let Some(rest) = trimmed.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(trimmed)
    };
    path.to_string_lossy().into_owned()
}

/// If the process cwd was deleted out from under us, move to home.
/// Returns the fallback directory when one was applied.
pub fn ensure_process_cwd() -> Option<PathBuf> {
    let healthy = std::env::current_dir()
        .map(|cwd| cwd.is_dir())
        .unwrap_or(false);
    if healthy {
        return None;
    }

    let home = home_dir();
    match std::env::set_current_dir(&home) {
        Ok(()) => {
            warn!(
                component = "paths",
                event = "paths.cwd_fallback",
                fallback = %home.display(),
                "Process working directory vanished, falling back to home"
            );
            Some(home)
        }
        Err(e) => {
            warn!(
                component = "paths",
                event = "paths.cwd_fallback_failed",
                error = %e,
                "Could not fall back to home directory"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_against_home() {
        let home = home_dir();
        assert_eq!(expand_working_dir("~"), home.to_string_lossy());
        assert_eq!(expand_working_dir(""), home.to_string_lossy());
        assert_eq!(
            expand_working_dir("~/code"),
            home.join("code").to_string_lossy()
        );
        assert_eq!(expand_working_dir("/srv/app"), "/srv/app");
    }

    #[test]
    fn healthy_cwd_is_left_alone() {
        assert!(ensure_process_cwd().is_none());
    }
}
