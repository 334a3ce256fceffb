//! Session identity and the recovery journal.
//!
//! The session id is a monotonically increasing integer across process
//! starts, persisted in `<working_dir>/.session` on clean shutdown. A missing
//! or unreadable marker falls back to the current unix time in milliseconds,
//! which preserves monotonicity against any previously persisted counter.
//!
//! The recovery journal is `logs/recovery/<session>.jsonl` — one JSON object
//! per recovery-relevant event. On unrecoverable failure the final entry is
//! appended before the process exits.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::{ComponentState, TransitionEvent};

const SESSION_FILE: &str = ".session";

/// Next session id for `working_dir`: previous persisted id + 1, or unix-ms.
pub fn acquire_session_id(working_dir: &Path) -> u64 {
    let marker = working_dir.join(SESSION_FILE);
    match fs::read_to_string(&marker) {
        Ok(text) => match text.trim().parse::<u64>() {
            Ok(prev) => prev + 1,
            Err(_) => {
                warn!(path = ?marker, "session marker unreadable — falling back to unix-ms");
                unix_ms()
            }
        },
        Err(_) => unix_ms(),
    }
}

/// Persist the session id. Called only on clean shutdown, so a crash leaves
/// the previous marker (or none) and the next start falls forward.
pub fn persist_session_id(working_dir: &Path, session: u64) -> Result<()> {
    fs::create_dir_all(working_dir)?;
    fs::write(working_dir.join(SESSION_FILE), format!("{session}\n"))?;
    Ok(())
}

fn unix_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// One journaled recovery event.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    pub ts: String,
    pub session: u64,
    pub component: String,
    pub from_state: ComponentState,
    pub to_state: ComponentState,
    pub cause: String,
    pub severity: String,
}

impl RecoveryEvent {
    pub fn from_transition(session: u64, event: &TransitionEvent, severity: &str) -> Self {
        Self {
            ts: event.timestamp.to_rfc3339(),
            session,
            component: event.component.clone(),
            from_state: event.from,
            to_state: event.to,
            cause: event.cause.clone(),
            severity: severity.to_string(),
        }
    }
}

/// Append-only jsonl journal under `logs/recovery/`.
pub struct RecoveryJournal {
    path: PathBuf,
    session: u64,
    file: Mutex<Option<File>>,
}

impl RecoveryJournal {
    pub fn new(working_dir: &Path, session: u64) -> Result<Self> {
        let dir = working_dir.join("logs").join("recovery");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            session,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Append one event and flush it to disk immediately — journal entries
    /// exist to survive the crash that follows them.
    pub fn append(&self, event: &RecoveryEvent) -> Result<()> {
        let line = serde_json::to_string(event).map_err(anyhow::Error::from)?;
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
        } else {
            debug!(path = ?self.path, "journal already closed; entry dropped");
        }
        Ok(())
    }

    pub fn append_transition(&self, event: &TransitionEvent, severity: &str) -> Result<()> {
        self.append(&RecoveryEvent::from_transition(self.session, event, severity))
    }

    /// Flush and close. Further appends are dropped with a debug note.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if let Some(mut file) = guard.take() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}
