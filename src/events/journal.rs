use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::state_dir;
use crate::error::Result;
use crate::events::{EventBus, OrchestratorEvent};

const EVENTS_DIR_NAME: &str = "events";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// One journaled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub schema_version: u32,
    pub recorded_at: DateTime<Utc>,
    pub event: OrchestratorEvent,
}

impl JournalRecord {
    pub fn new(event: OrchestratorEvent) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            recorded_at: Utc::now(),
            event,
        }
    }
}

/// Append-only JSONL log of orchestrator events.
#[derive(Debug, Clone)]
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    /// Journal at `.featureloop/events/events.jsonl` under the project root.
    pub fn new(project_root: &Path) -> Result<Self> {
        let dir = state_dir(project_root).join(EVENTS_DIR_NAME);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(EVENTS_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Read every record; malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => debug!(error = %err, "Skipping malformed journal line"),
            }
        }
        Ok(records)
    }

    /// Subscribe to the bus and append every event until the bus closes.
    ///
    /// Write failures are logged and the subscriber keeps going.
    pub fn spawn_subscriber(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(err) = self.append(&JournalRecord::new(event)) {
                            warn!(path = %self.path.display(), error = %err, "Failed to journal event");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event journal lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
