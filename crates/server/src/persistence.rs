//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access. Writers never wait on
//! the database: they push a `PersistCommand` and move on.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use switchyard_connector_core::TranscriptEntry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::migration_runner::run_migrations;

/// Commands that can be persisted
#[derive(Debug)]
pub enum PersistCommand {
    SessionCreate {
        id: String,
        project_id: String,
        working_dir: String,
        profile: Option<String>,
        parent_id: Option<String>,
    },

    /// Replace the stored transcript with the executor's current one
    TranscriptReplace {
        session_id: String,
        entries: Vec<TranscriptEntry>,
    },

    /// Record a completed turn
    SessionTouch { id: String, turn_count: u64 },

    SessionEnd { id: String },

    /// Write everything queued so far, then reply
    Flush { reply: oneshot::Sender<()> },
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(64),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is dropped (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "PersistenceWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(PersistCommand::Flush { reply }) => {
                        self.flush().await;
                        let _ = reply.send(());
                    }
                    Some(cmd) => {
                        self.batch.push(cmd);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        debug!(
            component = "persistence",
            event = "persistence.stopped",
            "PersistenceWriter stopped"
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count = count,
                    "Persisted commands"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Flush a batch of commands to SQLite (runs in blocking thread)
fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = batch.len();

    let tx = conn.unchecked_transaction()?;
    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
                "Failed to execute command"
            );
        }
    }
    tx.commit()?;

    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::SessionCreate {
            id,
            project_id,
            working_dir,
            profile,
            parent_id,
        } => {
            let now = now_iso8601();
            conn.execute(
                "INSERT INTO sessions (id, project_id, working_dir, profile, parent_id, status, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   working_dir = ?3,
                   profile = COALESCE(?4, profile),
                   status = 'active',
                   ended_at = NULL,
                   last_activity_at = ?6",
                params![id, project_id, working_dir, profile, parent_id, now],
            )?;
        }

        PersistCommand::TranscriptReplace {
            session_id,
            entries,
        } => {
            conn.execute(
                "DELETE FROM transcript_entries WHERE session_id = ?1",
                params![session_id],
            )?;
            let mut stmt = conn.prepare(
                "INSERT INTO transcript_entries (session_id, sequence, role, content)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (sequence, entry) in entries.iter().enumerate() {
                let content = serde_json::to_string(&entry.content)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![session_id, sequence as i64, entry.role, content])?;
            }
        }

        PersistCommand::SessionTouch { id, turn_count } => {
            conn.execute(
                "UPDATE sessions SET turn_count = ?1, last_activity_at = ?2 WHERE id = ?3",
                params![turn_count as i64, now_iso8601(), id],
            )?;
        }

        PersistCommand::SessionEnd { id } => {
            conn.execute(
                "UPDATE sessions SET status = 'ended', ended_at = ?1 WHERE id = ?2",
                params![now_iso8601(), id],
            )?;
        }

        // Handled by the writer loop before batching
        PersistCommand::Flush { reply } => {
            let _ = reply.send(());
        }
    }

    Ok(())
}

/// Create the database (and its directory) and bring the schema up to date.
pub fn init_store(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(db_path)?;
    run_migrations(&mut conn)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub project_id: String,
    pub working_dir: String,
    pub profile: Option<String>,
    pub parent_id: Option<String>,
    pub ended: bool,
    pub turn_count: u64,
    pub created_at: String,
    pub last_activity_at: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
}

/// Load one session and its transcript (includes ended sessions).
pub async fn load_session(
    db_path: PathBuf,
    id: &str,
) -> Result<Option<StoredSession>, anyhow::Error> {
    let id = id.to_string();
    let stored = tokio::task::spawn_blocking(move || load_session_blocking(&db_path, &id)).await??;
    Ok(stored)
}

fn load_session_blocking(db_path: &Path, id: &str) -> anyhow::Result<Option<StoredSession>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = open(db_path)?;

    let row = conn
        .query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()?;

    let Some(mut session) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT role, content FROM transcript_entries
         WHERE session_id = ?1 ORDER BY sequence",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (role, content) = row?;
        let content = serde_json::from_str(&content)
            .unwrap_or(serde_json::Value::String(content));
        session.transcript.push(TranscriptEntry { role, content });
    }

    Ok(Some(session))
}

const SESSION_COLUMNS: &str =
    "id, project_id, working_dir, profile, parent_id, status, turn_count, created_at, last_activity_at";

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSession> {
    let status: String = row.get(5)?;
    let turn_count: i64 = row.get(6)?;
    Ok(StoredSession {
        id: row.get(0)?,
        project_id: row.get(1)?,
        working_dir: row.get(2)?,
        profile: row.get(3)?,
        parent_id: row.get(4)?,
        ended: status == "ended",
        turn_count: turn_count.max(0) as u64,
        created_at: row.get(7)?,
        last_activity_at: row.get(8)?,
        transcript: Vec::new(),
    })
}

/// Every stored session that has not been ended, most recently active
/// first. Transcripts are not loaded.
pub async fn list_sessions(db_path: PathBuf) -> Result<Vec<StoredSession>, anyhow::Error> {
    let sessions = tokio::task::spawn_blocking(move || list_sessions_blocking(&db_path)).await??;
    Ok(sessions)
}

fn list_sessions_blocking(db_path: &Path) -> anyhow::Result<Vec<StoredSession>> {
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = open(db_path)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sessions
         WHERE status != 'ended'
         ORDER BY COALESCE(last_activity_at, created_at) DESC, id",
        SESSION_COLUMNS
    ))?;
    let sessions = stmt
        .query_map([], session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

/// Ask the writer to flush and wait for it. No-op if the writer is gone.
pub async fn flush(persist_tx: &mpsc::Sender<PersistCommand>) {
    let (reply, done) = oneshot::channel();
    if persist_tx.send(PersistCommand::Flush { reply }).await.is_ok() {
        let _ = done.await;
    }
}

/// Current UTC time as ISO 8601 (`YYYY-MM-DDTHH:MM:SSZ`)
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format_iso8601(secs)
}

fn format_iso8601(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
