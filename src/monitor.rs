//! Agent monitoring
//!
//! Detects agents that stopped writing their log while their process is
//! still alive, kills them, and budgets how often an (issue, agent) pair may
//! be relaunched.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit::{AuditStore, EventType};
use crate::normalize_agent;
use crate::process::{file_mtime, terminate, Liveness, ProcessProbe};

/// Relaunches allowed per (issue, agent) before the agent is marked failed
pub const MAX_RETRIES: u32 = 2;

/// How long a killed agent gets to exit after SIGTERM
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Stuck-agent detection and retry budgeting.
///
/// Retry counters live in memory and belong to this instance.
pub struct AgentMonitor {
    stuck_threshold: Duration,
    liveness: Arc<dyn Liveness>,
    probe: Arc<dyn ProcessProbe>,
    audit: AuditStore,
    retries: Mutex<HashMap<(String, String), u32>>,
}

impl AgentMonitor {
    pub fn new(
        stuck_threshold: Duration,
        liveness: Arc<dyn Liveness>,
        probe: Arc<dyn ProcessProbe>,
        audit: AuditStore,
    ) -> Self {
        Self {
            stuck_threshold,
            liveness,
            probe,
            audit,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn stuck_threshold(&self) -> Duration {
        self.stuck_threshold
    }

    fn key(issue: &str, agent: &str) -> (String, String) {
        (issue.to_string(), normalize_agent(agent))
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<(String, String), u32>> {
        self.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `(timed_out, pid)`. Timed out only when the log is older than the
    /// stuck threshold and the agent process is still alive.
    pub fn check_timeout_at(&self, issue: &str, log_file: &Path, now: DateTime<Utc>) -> (bool, Option<u32>) {
        let pid = self.liveness.running_pid(issue);
        let Some(modified) = file_mtime(log_file) else {
            return (false, pid);
        };

        let silent_for = now
            .signed_duration_since(modified)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stale = silent_for > self.stuck_threshold;

        match pid {
            Some(pid) if stale => {
                warn!(
                    "Agent for issue #{} (pid {}) silent for {}",
                    issue,
                    pid,
                    humantime::format_duration(Duration::from_secs(silent_for.as_secs()))
                );
                (true, Some(pid))
            }
            _ => (false, pid),
        }
    }

    pub fn check_timeout(&self, issue: &str, log_file: &Path) -> (bool, Option<u32>) {
        self.check_timeout_at(issue, log_file, Utc::now())
    }

    /// Terminate an agent process. Returns `false` when it could not be killed.
    pub async fn kill_agent(&self, pid: u32, issue: &str) -> bool {
        if terminate(self.probe.as_ref(), pid, KILL_GRACE).await {
            info!("Killed agent pid {} for issue #{}", pid, issue);
            self.audit.log(
                issue,
                EventType::AgentTimeoutKill,
                serde_json::json!({ "pid": pid }),
                None,
            );
            true
        } else {
            error!("Failed to kill agent pid {} for issue #{}", pid, issue);
            false
        }
    }

    /// Spend one retry for (issue, agent). `false` once the budget is gone.
    pub fn should_retry(&self, issue: &str, agent: &str) -> bool {
        let key = Self::key(issue, agent);
        let mut counters = self.counters();
        let count = counters.entry(key).or_insert(0);

        if *count < MAX_RETRIES {
            *count += 1;
            let attempt = *count;
            drop(counters);
            info!(
                "Retrying @{} for issue #{} (attempt {}/{})",
                agent, issue, attempt, MAX_RETRIES
            );
            self.audit.log(
                issue,
                EventType::AgentRetry,
                serde_json::json!({ "agent_type": agent, "attempt": attempt, "max_retries": MAX_RETRIES }),
                None,
            );
            true
        } else {
            drop(counters);
            error!(
                "@{} for issue #{} exhausted {} retries",
                agent, issue, MAX_RETRIES
            );
            self.audit.log(
                issue,
                EventType::AgentFailed,
                serde_json::json!({ "agent_type": agent, "reason": "max retries exceeded" }),
                None,
            );
            false
        }
    }

    pub fn retry_count(&self, issue: &str, agent: &str) -> u32 {
        self.counters()
            .get(&Self::key(issue, agent))
            .copied()
            .unwrap_or(0)
    }

    /// Clear the counter after a permanent failure
    pub fn mark_failed(&self, issue: &str, agent: &str, reason: &str) {
        self.counters().remove(&Self::key(issue, agent));
        error!("@{} permanently failed on issue #{}: {}", agent, issue, reason);
    }

    /// Clear the counter after a successful completion
    pub fn reset_retries(&self, issue: &str, agent: &str) {
        self.counters().remove(&Self::key(issue, agent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkflowMapping;
    use tempfile::TempDir;

    struct FakeLiveness(Option<u32>);

    impl Liveness for FakeLiveness {
        fn running_pid(&self, _issue: &str) -> Option<u32> {
            self.0
        }

        fn last_log_activity(&self, _issue: &str) -> Option<DateTime<Utc>> {
            None
        }
    }

    struct StubbornProbe;

    impl ProcessProbe for StubbornProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn signal(&self, _pid: u32, _force: bool) -> bool {
            false
        }
    }

    fn monitor(dir: &TempDir, pid: Option<u32>) -> AgentMonitor {
        let mapping = WorkflowMapping::new(dir.path().join("workflow_mapping.json"));
        AgentMonitor::new(
            Duration::from_secs(15 * 60),
            Arc::new(FakeLiveness(pid)),
            Arc::new(StubbornProbe),
            AuditStore::new(dir.path().join("audit"), mapping),
        )
    }

    #[test]
    fn test_retry_cap() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir, None);

        assert!(monitor.should_retry("1", "Implement"));
        assert!(monitor.should_retry("1", "Implement"));
        assert!(!monitor.should_retry("1", "Implement"));
        assert!(!monitor.should_retry("1", "Implement"));

        monitor.reset_retries("1", "Implement");
        assert!(monitor.should_retry("1", "Implement"));

        let events: Vec<_> = monitor.audit.history("1", 10).into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            events,
            vec![
                EventType::AgentRetry,
                EventType::AgentRetry,
                EventType::AgentFailed,
                EventType::AgentFailed,
                EventType::AgentRetry
            ]
        );
    }

    #[test]
    fn test_agent_names_share_counter() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir, None);

        assert!(monitor.should_retry("2", "@Copilot"));
        assert!(monitor.should_retry("2", "copilot"));
        assert!(!monitor.should_retry("2", "COPILOT"));
        assert_eq!(monitor.retry_count("2", "@copilot"), MAX_RETRIES);

        monitor.mark_failed("2", "Copilot", "gave up");
        assert_eq!(monitor.retry_count("2", "copilot"), 0);
    }

    #[test]
    fn test_timeout_requires_live_process() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("agent.log");
        std::fs::write(&log, "working").unwrap();
        let later = Utc::now() + chrono::Duration::minutes(20);

        let alive = monitor(&dir, Some(99));
        assert_eq!(alive.check_timeout_at("3", &log, later), (true, Some(99)));
        assert_eq!(alive.check_timeout_at("3", &log, Utc::now()), (false, Some(99)));

        let dead = monitor(&dir, None);
        assert_eq!(dead.check_timeout_at("3", &log, later), (false, None));

        let missing = dir.path().join("missing.log");
        assert_eq!(alive.check_timeout_at("3", &missing, later), (false, Some(99)));
    }

    #[tokio::test]
    async fn test_kill_failure_returns_false() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir, Some(1));
        assert!(!monitor.kill_agent(12345, "4").await);
        assert!(monitor.audit.history("4", 10).is_empty());
    }
}
