use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use super::write_json;
use crate::signal::{CompletionSignal, SignalSource};

/// Last completion observed locally for an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub issue_number: String,
    pub agent_type: Option<String>,
    pub step_num: Option<usize>,
    pub next_agent: Option<String>,
    pub is_workflow_done: bool,
    pub source: SignalSource,
    pub timestamp: DateTime<Utc>,
}

impl CompletionMarker {
    pub fn from_signal(issue: &str, signal: &CompletionSignal) -> Self {
        Self {
            issue_number: issue.to_string(),
            agent_type: signal.agent_type.clone(),
            step_num: signal.step_num,
            next_agent: signal.next_agent().map(str::to_string),
            is_workflow_done: signal.is_workflow_done(),
            source: signal.source,
            timestamp: signal.timestamp,
        }
    }
}

/// Per-issue completion marker files
#[derive(Debug, Clone)]
pub struct CompletionMarkers {
    dir: PathBuf,
}

impl CompletionMarkers {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, issue: &str) -> PathBuf {
        self.dir.join(format!("{}.json", issue))
    }

    pub fn read(&self, issue: &str) -> Option<CompletionMarker> {
        let content = std::fs::read_to_string(self.path(issue)).ok()?;
        match serde_json::from_str(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable completion marker for issue #{}: {}", issue, e);
                None
            }
        }
    }

    /// Write the marker; failures are logged and reported as `false`
    pub fn write(&self, marker: &CompletionMarker) -> bool {
        match write_json(&self.path(&marker.issue_number), marker) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to write completion marker for issue #{}: {}",
                    marker.issue_number, e
                );
                false
            }
        }
    }

    pub fn remove(&self, issue: &str) -> bool {
        std::fs::remove_file(self.path(issue)).is_ok()
    }
}
