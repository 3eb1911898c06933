//! Append-only JSONL event log for build sessions.
//!
//! Every queue transition is recorded with a timestamp and the element it
//! concerns, giving sessions an audit trail that survives the process.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiln_types::{Error, ErrorKind, Result};

/// Default events file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a log directory.
pub fn events_path(log_dir: &Path) -> PathBuf {
    log_dir.join(EVENTS_FILE)
}

/// The queue an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Track,
    Pull,
    Fetch,
    Build,
    Push,
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueName::Track => "track",
            QueueName::Pull => "pull",
            QueueName::Fetch => "fetch",
            QueueName::Build => "build",
            QueueName::Push => "push",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventType {
    SessionStarted { targets: Vec<String> },
    Dispatched { queue: QueueName },
    Finished { queue: QueueName },
    Skipped { queue: QueueName, reason: String },
    Failed { queue: QueueName, error: String },
    Retrying { queue: QueueName, attempt: u32 },
    SessionFinished { failed: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub timestamp: DateTime<Utc>,
    /// Element full name, or `-` for session-level events.
    pub element: String,
    #[serde(flatten)]
    pub event_type: EventType,
}

/// In-memory event log, flushed to JSONL on demand.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BuildEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, element: &str, event_type: EventType) {
        self.events.push(BuildEvent {
            timestamp: Utc::now(),
            element: element.to_string(),
            event_type,
        });
    }

    pub fn all_events(&self) -> &[BuildEvent] {
        &self.events
    }

    /// Append all recorded events to a JSONL file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(ErrorKind::Load, "failed to create events dir", &e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(ErrorKind::Load, "failed to open events file", &e))?;
        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).map_err(|e| {
                Error::new(
                    ErrorKind::Load,
                    "encode-failed",
                    format!("failed to serialize event: {}", e),
                )
            })?;
            writeln!(writer, "{}", line)
                .map_err(|e| Error::io(ErrorKind::Load, "failed to write event", &e))?;
        }
        writer
            .flush()
            .map_err(|e| Error::io(ErrorKind::Load, "failed to flush events", &e))
    }

    /// Read a previously written JSONL event file.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .map_err(|e| Error::io(ErrorKind::Load, "failed to open events file", &e))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line =
                line.map_err(|e| Error::io(ErrorKind::Load, "failed to read events", &e))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| {
                Error::new(
                    ErrorKind::Load,
                    "decode-failed",
                    format!("corrupt event line: {}", e),
                )
            })?;
            events.push(event);
        }
        Ok(Self { events })
    }
}
