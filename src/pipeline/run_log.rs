//! Per-run log: one JSON object per line in `run.log`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::{Phase, PipelineError};

pub const RUN_LOG_FILE: &str = "run.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogEvent {
    Enter,
    Complete,
    Skip,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub ts: DateTime<Utc>,
    pub phase: Phase,
    pub event: RunLogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only JSON-lines writer. Write failures are logged, never raised.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    pub fn create(dir: &Path) -> Result<Self, PipelineError> {
        let path = dir.join(RUN_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PipelineError::Io { path: path.clone(), source })?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enter(&self, phase: Phase) {
        self.write(phase, RunLogEvent::Enter, None);
    }

    pub fn complete(&self, phase: Phase, detail: Option<String>) {
        self.write(phase, RunLogEvent::Complete, detail);
    }

    pub fn skip(&self, phase: Phase, reason: &str) {
        self.write(phase, RunLogEvent::Skip, Some(reason.to_string()));
    }

    pub fn exception(&self, phase: Phase, error: &str) {
        self.write(phase, RunLogEvent::Exception, Some(error.to_string()));
    }

    fn write(&self, phase: Phase, event: RunLogEvent, detail: Option<String>) {
        let entry = RunLogEntry { ts: Utc::now(), phase, event, detail };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize run log entry");
                return;
            }
        };
        let Ok(mut file) = self.file.lock() else {
            warn!("Run log lock poisoned");
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(path = %self.path.display(), error = %e, "Failed to append to run log");
        }
    }
}

/// Read every entry back, skipping unparsable lines.
pub fn read_entries(path: &Path) -> std::io::Result<Vec<RunLogEntry>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().filter_map(|l| serde_json::from_str(l).ok()).collect())
}
