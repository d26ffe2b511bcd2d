//! Append-only audit trail
//!
//! One JSON-Lines file per workflow id. Events for issues that have no
//! workflow mapping yet land in `_nexus_system.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::store::WorkflowMapping;

/// Log file catching events for unmapped issues
pub const SYSTEM_LOG: &str = "_nexus_system";

/// Audit event types. Serialized names are stable; tooling parses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowCreated,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowStopped,
    WorkflowReset,
    WorkflowReconciled,
    StepCompleted,
    StepAwaitingApproval,
    StepApproved,
    StepDenied,
    AgentLaunched,
    AgentLaunchFailed,
    AgentRetry,
    AgentFailed,
    AgentTimeoutKill,
    AgentDead,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditData {
    pub issue_number: String,
    pub details: serde_json::Value,
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub data: AuditData,
    pub user_id: Option<String>,
}

/// Audit log store
#[derive(Debug, Clone)]
pub struct AuditStore {
    dir: PathBuf,
    mapping: WorkflowMapping,
}

impl AuditStore {
    pub fn new(dir: impl Into<PathBuf>, mapping: WorkflowMapping) -> Self {
        Self {
            dir: dir.into(),
            mapping,
        }
    }

    fn log_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", workflow_id))
    }

    /// Workflow ids with a log on disk, the system log included
    fn workflow_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }

    /// Append an event for an issue. Write failures are logged and reported
    /// as `false`.
    pub fn log(
        &self,
        issue: &str,
        event_type: EventType,
        details: impl Into<serde_json::Value>,
        user_id: Option<&str>,
    ) -> bool {
        let workflow_id = self
            .mapping
            .get(issue)
            .unwrap_or_else(|| SYSTEM_LOG.to_string());

        let event = AuditEvent {
            workflow_id,
            timestamp: Utc::now(),
            event_type,
            data: AuditData {
                issue_number: issue.to_string(),
                details: details.into(),
            },
            user_id: user_id.map(str::to_string),
        };

        match self.append(&event) {
            Ok(()) => {
                debug!("Audit #{} {}", issue, event_type);
                true
            }
            Err(e) => {
                warn!("Failed to append audit event {} for issue #{}: {}", event_type, issue, e);
                false
            }
        }
    }

    fn append(&self, event: &AuditEvent) -> crate::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&event.workflow_id))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Every event recorded for a workflow, oldest first. Malformed lines are skipped.
    pub fn workflow_history(&self, workflow_id: &str) -> Vec<AuditEvent> {
        let file = match std::fs::File::open(self.log_path(workflow_id)) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    /// Most recent `limit` events for an issue, oldest first.
    ///
    /// Unmapped issues (never created, or forgotten) are looked up across
    /// every log in the directory.
    pub fn history(&self, issue: &str, limit: usize) -> Vec<AuditEvent> {
        let files = match self.mapping.get(issue) {
            Some(workflow_id) => vec![workflow_id],
            None => self.workflow_ids(),
        };

        let mut events: Vec<_> = files
            .iter()
            .flat_map(|id| self.workflow_history(id))
            .filter(|e| e.data.issue_number == issue)
            .collect();
        events.sort_by_key(|e| e.timestamp);

        let skip = events.len().saturating_sub(limit);
        events.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> AuditStore {
        let mapping = WorkflowMapping::new(dir.path().join("workflow_mapping.json"));
        AuditStore::new(dir.path().join("audit"), mapping)
    }

    #[test]
    fn test_event_names_are_verbatim() {
        let names: Vec<String> = [
            EventType::WorkflowStarted,
            EventType::AgentLaunchFailed,
            EventType::AgentTimeoutKill,
            EventType::StepAwaitingApproval,
        ]
        .iter()
        .map(|e| e.to_string())
        .collect();
        assert_eq!(
            names,
            vec![
                "WORKFLOW_STARTED",
                "AGENT_LAUNCH_FAILED",
                "AGENT_TIMEOUT_KILL",
                "STEP_AWAITING_APPROVAL"
            ]
        );
    }

    #[test]
    fn test_unmapped_issue_goes_to_system_log() {
        let dir = TempDir::new().unwrap();
        let audit = store(&dir);

        assert!(audit.log("5", EventType::AgentLaunchFailed, "no tool", None));
        assert!(dir.path().join("audit/_nexus_system.jsonl").exists());
        assert_eq!(audit.history("5", 10).len(), 1);
    }

    #[test]
    fn test_history_per_workflow() {
        let dir = TempDir::new().unwrap();
        let audit = store(&dir);
        audit.mapping.set("9", "core-9-full").unwrap();

        audit.log("9", EventType::WorkflowStarted, "started", None);
        audit.log("9", EventType::StepApproved, "step 2", Some("lead"));
        audit.log("9", EventType::WorkflowCompleted, "done", None);

        let events = audit.history("9", 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::StepApproved);
        assert_eq!(events[0].user_id.as_deref(), Some("lead"));
        assert_eq!(events[1].workflow_id, "core-9-full");

        let line = std::fs::read_to_string(dir.path().join("audit/core-9-full.jsonl")).unwrap();
        let first: serde_json::Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(first["event_type"], "WORKFLOW_STARTED");
        assert_eq!(first["data"]["issue_number"], "9");
        assert_eq!(first["data"]["details"], "started");
    }

    #[test]
    fn test_history_survives_unmapping() {
        let dir = TempDir::new().unwrap();
        let audit = store(&dir);
        audit.mapping.set("4", "core-4-full").unwrap();
        audit.log("4", EventType::AgentLaunched, "triage", None);
        audit.mapping.remove("4").unwrap();
        audit.log("4", EventType::AgentLaunchFailed, "no tool", None);

        let events = audit.history("4", 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::AgentLaunched);
        assert_eq!(events[1].workflow_id, SYSTEM_LOG);
    }
}
