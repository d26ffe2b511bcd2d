//! Reconciliation between the workflow record and completion signals
//!
//! Three sources describe where an issue's chain stands: the workflow
//! record's step pointer, the local completion marker and the structured
//! comments on the issue. [`Reconciler::build_workflow_snapshot`] compares
//! them without touching anything; [`Reconciler::reconcile_issue_from_signals`]
//! replays comment signals into the record.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::EventType;
use crate::normalize_agent;
use crate::process::Liveness;
use crate::signal::{extract_from_comments, latest, CompletionSignal};
use crate::store::{CompletionMarker, CompletionMarkers, LaunchRegistry};
use crate::tracker::IssueTracker;
use crate::workflow::{Workflow, WorkflowEngine, WorkflowState};
use crate::{Error, Result};

/// A disagreement between signal sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftFlag {
    /// Local marker routes to a different agent than the record's pointer
    CompletionMismatch,
    /// The live agent belongs to a different step than the pointer
    WorkflowPointerMismatch,
    /// A newer comment signal routes differently than the local marker
    StaleLocalCompletion,
    /// The caller expected a different running agent
    ExpectedAgentMismatch,
    /// Active workflow with neither a local nor a comment signal
    NoSignal,
}

impl std::fmt::Display for DriftFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriftFlag::CompletionMismatch => "completion_mismatch",
            DriftFlag::WorkflowPointerMismatch => "workflow_pointer_mismatch",
            DriftFlag::StaleLocalCompletion => "stale_local_completion",
            DriftFlag::ExpectedAgentMismatch => "expected_agent_mismatch",
            DriftFlag::NoSignal => "no_signal",
        };
        write!(f, "{}", s)
    }
}

/// Suggested operator action for a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHint {
    ReconcileThenContinue,
    None,
}

impl std::fmt::Display for RecoveryHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryHint::ReconcileThenContinue => write!(f, "reconcile then continue"),
            RecoveryHint::None => write!(f, "none"),
        }
    }
}

/// Point-in-time view of an issue across all signal sources
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub issue: String,
    pub workflow_id: Option<String>,
    pub state: Option<WorkflowState>,
    pub paused: bool,
    pub current_step: usize,
    pub total_steps: usize,
    pub current_agent: Option<String>,
    /// Agent the caller believes is running
    pub expected_running_agent: Option<String>,
    pub running_pid: Option<u32>,
    pub process_running: bool,
    /// Agent and step of the live process, from the launch registry
    pub running_agent: Option<String>,
    pub running_step: Option<usize>,
    pub local_completion: Option<CompletionMarker>,
    pub comment_signal: Option<CompletionMarker>,
    pub drift_flags: Vec<DriftFlag>,
    pub recovery_hint: RecoveryHint,
}

impl Snapshot {
    pub fn has_drift(&self) -> bool {
        !self.drift_flags.is_empty()
    }

    /// Human-readable rendering for the CLI
    pub fn summary(&self) -> String {
        let mut out = format!("🔎 Issue #{}\n", self.issue);
        match (&self.workflow_id, self.state) {
            (Some(id), Some(state)) => {
                out.push_str(&format!(
                    "Workflow: {} ({}{})\n",
                    id,
                    state,
                    if self.paused { ", paused" } else { "" }
                ));
                out.push_str(&format!(
                    "Indexed:  step {}/{} @{}\n",
                    self.current_step,
                    self.total_steps,
                    self.current_agent.as_deref().unwrap_or("-")
                ));
            }
            _ => out.push_str("Workflow: none\n"),
        }
        match self.running_pid {
            Some(pid) => out.push_str(&format!(
                "Running:  step {} @{} (pid {})\n",
                self.running_step.map_or("?".to_string(), |s| s.to_string()),
                self.running_agent.as_deref().unwrap_or("-"),
                pid
            )),
            None => out.push_str("Running:  no live agent\n"),
        }
        let describe = |m: &Option<CompletionMarker>| match m {
            Some(m) if m.is_workflow_done => format!("workflow done ({})", m.timestamp.to_rfc3339()),
            Some(m) => format!(
                "next @{} ({})",
                m.next_agent.as_deref().unwrap_or("-"),
                m.timestamp.to_rfc3339()
            ),
            None => "none".to_string(),
        };
        out.push_str(&format!("Local:    {}\n", describe(&self.local_completion)));
        out.push_str(&format!("Comment:  {}\n", describe(&self.comment_signal)));

        if self.drift_flags.is_empty() {
            out.push_str("✅ No drift\n");
        } else {
            let flags: Vec<String> = self.drift_flags.iter().map(|f| f.to_string()).collect();
            out.push_str(&format!("⚠️  Drift: {}\n", flags.join(", ")));
        }
        out.push_str(&format!("Recovery: {}", self.recovery_hint));
        out
    }
}

/// Outcome of a reconcile
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub issue: String,
    pub signals_scanned: usize,
    pub signals_newer: usize,
    pub signals_applied: usize,
    pub signals_skipped: usize,
    pub state: WorkflowState,
    pub current_step: usize,
    pub current_agent: Option<String>,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "Issue #{}: scanned {}, newer {}, applied {}, skipped {} → {} at step {} (@{})",
            self.issue,
            self.signals_scanned,
            self.signals_newer,
            self.signals_applied,
            self.signals_skipped,
            self.state,
            self.current_step,
            self.current_agent.as_deref().unwrap_or("-")
        )
    }
}

fn same_agent(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize_agent(a) == normalize_agent(b),
        (None, None) => true,
        _ => false,
    }
}

fn routes_alike(a: &CompletionMarker, b: &CompletionMarker) -> bool {
    a.is_workflow_done == b.is_workflow_done
        && same_agent(a.next_agent.as_deref(), b.next_agent.as_deref())
}

/// Agent a signal completes: its `agent_type`, else the record's current
/// agent when the reported step (if any) is the current one.
pub(crate) fn completed_agent(signal: &CompletionSignal, wf: &Workflow) -> Option<String> {
    if let Some(agent) = &signal.agent_type {
        return Some(agent.clone());
    }
    match signal.step_num {
        Some(step) if step != wf.current_step => None,
        _ => wf.active_agent_type().map(str::to_string),
    }
}

/// Cross-checks and replays completion signals
pub struct Reconciler {
    engine: Arc<WorkflowEngine>,
    tracker: Arc<dyn IssueTracker>,
    registry: LaunchRegistry,
    markers: CompletionMarkers,
    liveness: Arc<dyn Liveness>,
}

impl Reconciler {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        tracker: Arc<dyn IssueTracker>,
        registry: LaunchRegistry,
        markers: CompletionMarkers,
        liveness: Arc<dyn Liveness>,
    ) -> Self {
        Self {
            engine,
            tracker,
            registry,
            markers,
            liveness,
        }
    }

    /// Newest comment signal on the issue; tracker failures read as none
    async fn latest_comment_signal(&self, issue: &str, repo: &str) -> Option<CompletionSignal> {
        match self.tracker.get_issue(repo, issue, true).await {
            Ok(found) => latest(&extract_from_comments(&found.comments)).cloned(),
            Err(e) => {
                warn!("Could not read comments for issue #{}: {}", issue, e);
                None
            }
        }
    }

    /// Compare record, local marker, comments and the live process. Mutates nothing.
    pub async fn build_workflow_snapshot(
        &self,
        issue: &str,
        repo: &str,
        expected_running_agent: Option<&str>,
    ) -> Snapshot {
        let wf = self.engine.find_workflow_for_issue(issue);
        let local = self.markers.read(issue);
        let comment = self
            .latest_comment_signal(issue, repo)
            .await
            .map(|s| CompletionMarker::from_signal(issue, &s));

        let running_pid = self.liveness.running_pid(issue);
        let running_agent = running_pid
            .and_then(|_| self.registry.get(issue))
            .map(|entry| entry.agent_type);
        let running_step = match (&wf, &running_agent) {
            (Some(wf), Some(agent)) => wf.step_for_agent(agent),
            _ => None,
        };

        let mut flags = Vec::new();
        if let Some(wf) = &wf {
            let active = !wf.state.is_terminal();
            let current_agent = wf.active_agent_type();

            if active {
                if let Some(next) = local.as_ref().and_then(|m| m.next_agent.as_deref()) {
                    if !same_agent(Some(next), current_agent) {
                        flags.push(DriftFlag::CompletionMismatch);
                    }
                }
            }

            if running_agent.is_some() && running_step != Some(wf.current_step) {
                flags.push(DriftFlag::WorkflowPointerMismatch);
            }

            if let (Some(local), Some(comment)) = (&local, &comment) {
                if comment.timestamp > local.timestamp && !routes_alike(local, comment) {
                    flags.push(DriftFlag::StaleLocalCompletion);
                }
            }

            if let Some(expected) = expected_running_agent {
                if !same_agent(Some(expected), wf.expected_running_agent()) {
                    flags.push(DriftFlag::ExpectedAgentMismatch);
                }
            }

            if active && local.is_none() && comment.is_none() {
                flags.push(DriftFlag::NoSignal);
            }
        }

        let recovery_hint = if flags.iter().any(|f| {
            matches!(
                f,
                DriftFlag::WorkflowPointerMismatch
                    | DriftFlag::StaleLocalCompletion
                    | DriftFlag::CompletionMismatch
            )
        }) {
            RecoveryHint::ReconcileThenContinue
        } else {
            RecoveryHint::None
        };

        Snapshot {
            issue: issue.to_string(),
            workflow_id: wf.as_ref().map(|w| w.id.clone()),
            state: wf.as_ref().map(|w| w.state),
            paused: wf.as_ref().is_some_and(|w| w.paused),
            current_step: wf.as_ref().map_or(0, |w| w.current_step),
            total_steps: wf.as_ref().map_or(0, |w| w.steps.len()),
            current_agent: wf
                .as_ref()
                .and_then(|w| w.active_agent_type().map(str::to_string)),
            expected_running_agent: expected_running_agent.map(str::to_string),
            running_pid,
            process_running: running_pid.is_some(),
            running_agent,
            running_step,
            local_completion: local,
            comment_signal: comment,
            drift_flags: flags,
            recovery_hint,
        }
    }

    /// Replay comment signals newer than the record's last applied signal,
    /// oldest first.
    pub async fn reconcile_issue_from_signals(
        &self,
        issue: &str,
        project: &str,
        repo: &str,
    ) -> Result<ReconcileReport> {
        let mut wf = self.engine.workflow_for_issue(issue)?;
        let found = self.tracker.get_issue(repo, issue, true).await?;
        let signals = extract_from_comments(&found.comments);

        let newer: Vec<&CompletionSignal> = signals
            .iter()
            .filter(|s| wf.last_signal_at.map_or(true, |applied| s.timestamp > applied))
            .collect();
        debug!(
            "Issue #{} ({}): {} signals, {} newer than last applied",
            issue,
            project,
            signals.len(),
            newer.len()
        );

        let mut applied = 0;
        let mut skipped = 0;
        let mut last_applied: Option<&CompletionSignal> = None;

        for signal in newer.iter().copied() {
            let Some(agent) = completed_agent(signal, &wf) else {
                debug!("Skipping signal for step {:?} on issue #{}", signal.step_num, issue);
                skipped += 1;
                continue;
            };

            let outputs = serde_json::json!({
                "source": "comment",
                "comment_id": signal.comment_id,
                "next_agent": signal.next_agent(),
            });
            match self.engine.complete_step_for_issue(issue, &agent, outputs).await {
                Ok(_) => {
                    wf = self.engine.mark_signal_applied(issue, signal.timestamp)?;
                    applied += 1;
                    last_applied = Some(signal);
                }
                Err(e @ (Error::AgentMismatch { .. } | Error::InvalidTransition { .. })) => {
                    debug!("Skipping signal from @{} on issue #{}: {}", agent, issue, e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(signal) = last_applied {
            self.markers.write(&CompletionMarker::from_signal(issue, signal));
        }

        let report = ReconcileReport {
            issue: issue.to_string(),
            signals_scanned: signals.len(),
            signals_newer: newer.len(),
            signals_applied: applied,
            signals_skipped: skipped,
            state: wf.state,
            current_step: wf.current_step,
            current_agent: wf.active_agent_type().map(str::to_string),
        };

        self.engine.audit().log(
            issue,
            EventType::WorkflowReconciled,
            serde_json::json!({
                "scanned": report.signals_scanned,
                "newer": report.signals_newer,
                "applied": report.signals_applied,
                "skipped": report.signals_skipped,
                "current_step": report.current_step,
            }),
            None,
        );
        info!("Reconciled {}", report.summary());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Message, Notifier};
    use crate::store::{DataDir, LaunchEntry, LaunchMode};
    use crate::tracker::{Comment, Issue};
    use crate::workflow::{DefinitionSource, Finalizer, NewWorkflow, ResolvedDefinition, Step};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ChainDefinitions;

    impl DefinitionSource for ChainDefinitions {
        fn load(&self, _project: &str, _tier: &str) -> Result<ResolvedDefinition> {
            Ok(ResolvedDefinition {
                name: "chain".to_string(),
                steps: vec![
                    Step::new(1, "triage", "Triage"),
                    Step::new(2, "design", "Design"),
                    Step::new(3, "implement", "Implement"),
                ],
            })
        }
    }

    struct QuietNotifier;

    #[async_trait]
    impl Notifier for QuietNotifier {
        async fn send(&self, _message: &Message) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingFinalizer(Mutex<usize>);

    #[async_trait]
    impl Finalizer for CountingFinalizer {
        async fn finalize(&self, _issue: &str, _repo: &str, _last: &str, _project: &str) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CommentTracker(Mutex<Vec<Comment>>);

    impl CommentTracker {
        fn post(&self, id: &str, body: &str, at: DateTime<Utc>) {
            self.0.lock().unwrap().push(Comment {
                id: id.to_string(),
                body: body.to_string(),
                author: "agent-bot".to_string(),
                created_at: at,
            });
        }
    }

    #[async_trait]
    impl IssueTracker for CommentTracker {
        async fn get_issue(&self, _repo: &str, issue: &str, with_comments: bool) -> Result<Issue> {
            Ok(Issue {
                number: issue.to_string(),
                comments: if with_comments {
                    self.0.lock().unwrap().clone()
                } else {
                    Vec::new()
                },
                ..Default::default()
            })
        }

        async fn add_comment(&self, _repo: &str, _issue: &str, _body: &str) -> Result<()> {
            Ok(())
        }

        async fn add_label(&self, _repo: &str, _issue: &str, _label: &str) -> Result<()> {
            Ok(())
        }

        async fn update_issue_body(&self, _repo: &str, _issue: &str, _body: &str) -> Result<()> {
            Ok(())
        }

        async fn close_issue(&self, _repo: &str, _issue: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FixedLiveness(Option<u32>);

    impl Liveness for FixedLiveness {
        fn running_pid(&self, _issue: &str) -> Option<u32> {
            self.0
        }

        fn last_log_activity(&self, _issue: &str) -> Option<DateTime<Utc>> {
            None
        }
    }

    struct Fixture {
        _dir: TempDir,
        data: DataDir,
        engine: Arc<WorkflowEngine>,
        tracker: Arc<CommentTracker>,
        finalizer: Arc<CountingFinalizer>,
    }

    impl Fixture {
        fn reconciler(&self, pid: Option<u32>) -> Reconciler {
            Reconciler::new(
                self.engine.clone(),
                self.tracker.clone(),
                LaunchRegistry::new(self.data.registry_file()),
                CompletionMarkers::new(self.data.completions_dir()),
                Arc::new(FixedLiveness(pid)),
            )
        }
    }

    async fn fixture(issue: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let data = DataDir::new(dir.path());
        let finalizer = Arc::new(CountingFinalizer::default());
        let engine = Arc::new(WorkflowEngine::new(
            &data,
            Arc::new(ChainDefinitions),
            Arc::new(QuietNotifier),
            finalizer.clone(),
        ));
        let id = engine
            .create_workflow_for_issue(&NewWorkflow {
                issue: issue.to_string(),
                project: "core".to_string(),
                tier: "full".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_workflow(&id).await.unwrap();
        Fixture {
            _dir: dir,
            data,
            engine,
            tracker: Arc::new(CommentTracker::default()),
            finalizer,
        }
    }

    #[tokio::test]
    async fn test_reconcile_applies_in_creation_order() {
        let fx = fixture("20").await;
        let t1 = Utc::now() - Duration::minutes(30);
        let t2 = t1 + Duration::minutes(10);
        let t3 = t2 + Duration::minutes(10);
        // Posted out of order
        fx.tracker.post("c3", "Step 3 complete by @Implement. Workflow complete", t3);
        fx.tracker.post("c1", "Step 1 complete by @Triage\nReady for @Design", t1);
        fx.tracker.post("c2", "Step 2 complete by @Design\nReady for @Implement", t2);

        let report = fx
            .reconciler(None)
            .reconcile_issue_from_signals("20", "core", "acme/core")
            .await
            .unwrap();

        assert_eq!(report.signals_scanned, 3);
        assert_eq!(report.signals_newer, 3);
        assert_eq!(report.signals_applied, 3);
        assert_eq!(report.signals_skipped, 0);
        assert_eq!(report.state, WorkflowState::Completed);
        assert_eq!(*fx.finalizer.0.lock().unwrap(), 1);

        let wf = fx.engine.workflow_for_issue("20").unwrap();
        assert_eq!(wf.last_signal_at, Some(t3));
        assert_eq!(wf.steps[0].outputs["comment_id"], "c1");
        assert_eq!(wf.steps[2].outputs["comment_id"], "c3");

        let events = fx.engine.audit().history("20", 100);
        assert_eq!(events.last().unwrap().event_type, EventType::WorkflowReconciled);
    }

    #[tokio::test]
    async fn test_reconcile_skips_mismatch_and_old_signals() {
        let fx = fixture("21").await;
        let t0 = Utc::now() - Duration::minutes(30);
        fx.tracker.post("c1", "Step 1 complete by @Triage\nReady for @Design", t0);
        let reconciler = fx.reconciler(None);

        let first = reconciler
            .reconcile_issue_from_signals("21", "core", "acme/core")
            .await
            .unwrap();
        assert_eq!(first.signals_applied, 1);
        assert_eq!(first.current_agent.as_deref(), Some("Design"));

        // A late duplicate from the wrong agent and a replay of c1
        fx.tracker.post("c2", "Step 1 complete by @Triage\nReady for @Design", t0 + Duration::minutes(5));
        let second = reconciler
            .reconcile_issue_from_signals("21", "core", "acme/core")
            .await
            .unwrap();
        assert_eq!(second.signals_scanned, 2);
        assert_eq!(second.signals_newer, 1);
        assert_eq!(second.signals_applied, 0);
        assert_eq!(second.signals_skipped, 1);
        assert_eq!(second.current_step, 2);
    }

    #[tokio::test]
    async fn test_reconcile_without_workflow() {
        let fx = fixture("22").await;
        assert!(matches!(
            fx.reconciler(None)
                .reconcile_issue_from_signals("999", "core", "acme/core")
                .await,
            Err(Error::NoWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_flags_drift_without_mutating() {
        let fx = fixture("23").await;
        let markers = CompletionMarkers::new(fx.data.completions_dir());
        let registry = LaunchRegistry::new(fx.data.registry_file());

        // Local marker thinks Implement is next; the record is still at Triage
        let t0 = Utc::now() - Duration::minutes(10);
        let local = crate::signal::extract(
            "Step 2 complete by @Design. Ready for @Implement",
            crate::signal::SignalSource::Log,
            t0,
        )
        .unwrap();
        markers.write(&CompletionMarker::from_signal("23", &local));
        // A newer comment routes to Design
        fx.tracker.post("c1", "Step 1 complete by @Triage. Ready for @Design", t0 + Duration::minutes(5));
        // Design is running according to the registry
        registry
            .record(
                "23",
                LaunchEntry {
                    timestamp: Utc::now(),
                    pid: 4321,
                    tier: "full".to_string(),
                    mode: LaunchMode::Initial,
                    tool: "copilot".to_string(),
                    agent_type: "Design".to_string(),
                },
            )
            .unwrap();

        let snapshot = fx
            .reconciler(Some(4321))
            .build_workflow_snapshot("23", "acme/core", Some("Implement"))
            .await;

        assert_eq!(snapshot.current_step, 1);
        assert_eq!(snapshot.running_step, Some(2));
        assert!(snapshot.drift_flags.contains(&DriftFlag::CompletionMismatch));
        assert!(snapshot.drift_flags.contains(&DriftFlag::WorkflowPointerMismatch));
        assert!(snapshot.drift_flags.contains(&DriftFlag::StaleLocalCompletion));
        assert!(snapshot.drift_flags.contains(&DriftFlag::ExpectedAgentMismatch));
        assert_eq!(snapshot.recovery_hint, RecoveryHint::ReconcileThenContinue);
        assert!(snapshot.summary().contains("reconcile then continue"));

        // Nothing moved
        let wf = fx.engine.workflow_for_issue("23").unwrap();
        assert_eq!(wf.current_step, 1);
        assert!(wf.last_signal_at.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_no_signal() {
        let fx = fixture("24").await;
        let snapshot = fx
            .reconciler(None)
            .build_workflow_snapshot("24", "acme/core", Some("Triage"))
            .await;
        assert_eq!(snapshot.drift_flags, vec![DriftFlag::NoSignal]);
        assert_eq!(snapshot.recovery_hint, RecoveryHint::None);
        assert!(!snapshot.process_running);
    }
}
