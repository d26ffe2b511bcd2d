//! Process orchestration
//!
//! Ties the pieces together. Triggers come from the log scan, the issue
//! comment webhook, the periodic sweep and operator commands; each one may
//! end in launching the agent for the workflow's current step.
//!
//! ```text
//! signal ──► marker ──► engine.complete_step ──► guard ──► launcher ──► registry
//!                                   │
//!                                   └─► approval gate / finalize
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, EventType};
use crate::config::Config;
use crate::guard::{Denial, LaunchGuard};
use crate::launcher::{AgentLauncher, CliLauncher, LaunchRequest};
use crate::monitor::AgentMonitor;
use crate::notify::{ChannelNotifier, Message, Notifier};
use crate::process::{read_tail, AgentActivity, Liveness, ProcessProbe, SignalProbe};
use crate::reconcile::{completed_agent, ReconcileReport, Reconciler, Snapshot};
use crate::signal::{extract, CompletionSignal, SignalSource};
use crate::store::{CompletionMarker, CompletionMarkers, DataDir, LaunchEntry, LaunchMode, LaunchRegistry};
use crate::tier::detect_workflow_tier;
use crate::tracker::{GitHubTracker, IssueTracker};
use crate::workflow::{
    DefinitionSource, Finalizer, IssueFinalizer, NewWorkflow, Workflow, WorkflowEngine,
    WorkflowState, YamlDefinitions,
};
use crate::{normalize_agent, Error, Result};

/// Result of a trigger for one issue
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// An agent process was started
    Launched {
        agent_type: String,
        pid: u32,
        tool: String,
    },
    /// The launch guard refused
    Skipped(Denial),
    /// No tool could be started; not retried automatically
    LaunchFailed(String),
    AwaitingApproval,
    Paused,
    /// The workflow is not running
    Finished(WorkflowState),
    /// Nothing to act on
    Ignored(String),
}

impl std::fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerOutcome::Launched {
                agent_type,
                pid,
                tool,
            } => write!(f, "🚀 Launched @{} with {} (pid {})", agent_type, tool, pid),
            TriggerOutcome::Skipped(denial) => write!(f, "⏸️  Launch skipped: {}", denial),
            TriggerOutcome::LaunchFailed(reason) => write!(f, "❌ Launch failed: {}", reason),
            TriggerOutcome::AwaitingApproval => write!(f, "⏳ Awaiting approval"),
            TriggerOutcome::Paused => write!(f, "⏸️  Workflow paused"),
            TriggerOutcome::Finished(state) => write!(f, "Workflow {}", state),
            TriggerOutcome::Ignored(reason) => write!(f, "Ignored: {}", reason),
        }
    }
}

/// Counts from one sweep of the launch registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub killed: usize,
    pub dead: usize,
    pub retried: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// External collaborators, injected at construction
pub struct Collaborators {
    pub tracker: Arc<dyn IssueTracker>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub notifier: Arc<dyn Notifier>,
    pub finalizer: Arc<dyn Finalizer>,
    pub definitions: Arc<dyn DefinitionSource>,
    pub probe: Arc<dyn ProcessProbe>,
}

impl Collaborators {
    /// Production implementations built from configuration
    pub fn from_config(config: &Config) -> Self {
        let tracker: Arc<dyn IssueTracker> = Arc::new(GitHubTracker::from_config(&config.github));
        let notifier: Arc<dyn Notifier> =
            Arc::new(ChannelNotifier::from_config(&config.notifications));
        Self {
            finalizer: Arc::new(IssueFinalizer::new(tracker.clone(), notifier.clone())),
            launcher: Arc::new(CliLauncher::new(config.launcher.tools.clone())),
            definitions: Arc::new(YamlDefinitions::from_config(config)),
            probe: Arc::new(SignalProbe),
            tracker,
            notifier,
        }
    }
}

/// GitHub `issue_comment` webhook payload, reduced to what is read
#[derive(Debug, Deserialize)]
struct CommentPayload {
    action: String,
    issue: PayloadIssue,
    comment: PayloadComment,
    #[serde(default)]
    repository: Option<PayloadRepository>,
}

#[derive(Debug, Deserialize)]
struct PayloadIssue {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct PayloadComment {
    id: u64,
    #[serde(default)]
    body: String,
    user: PayloadUser,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PayloadUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PayloadRepository {
    full_name: String,
}

/// Prompt handed to an agent tool
pub fn build_prompt(wf: &Workflow, issue_url: &str, mode: LaunchMode) -> String {
    let Some(step) = wf.current() else {
        return format!("Review issue {}", issue_url);
    };
    let total = wf.steps.len();

    let mut prompt = format!(
        "You are @{agent}, working on issue #{issue}: {title}\n\
         Issue: {url}\n\
         Workflow: {name}, step {num}/{total} ({step})\n",
        agent = step.agent_type,
        issue = wf.issue(),
        title = wf.metadata.title,
        url = issue_url,
        name = wf.name,
        num = step.step_num,
        total = total,
        step = step.name,
    );
    if !step.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", step.description));
    }
    if mode == LaunchMode::Continuation {
        prompt.push_str(
            "\nA previous run of this step stopped before finishing. Read the issue \
             comments for its progress and continue from there.\n",
        );
    }

    let handoff = match wf.steps.get(step.step_num) {
        Some(next) => format!("Ready for @{}", next.agent_type),
        None => "Workflow complete".to_string(),
    };
    prompt.push_str(&format!(
        "\nWhen your step is done, post a comment on the issue ending with:\n\n\
         ## Step {} Complete by @{}\n{}\n",
        step.step_num, step.agent_type, handoff
    ));
    prompt
}

/// The orchestration service
pub struct Orchestrator {
    config: Config,
    data: DataDir,
    engine: Arc<WorkflowEngine>,
    guard: LaunchGuard,
    monitor: AgentMonitor,
    registry: LaunchRegistry,
    markers: CompletionMarkers,
    activity: Arc<AgentActivity>,
    reconciler: Reconciler,
    tracker: Arc<dyn IssueTracker>,
    launcher: Arc<dyn AgentLauncher>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn ProcessProbe>,
    /// Webhook comment ids already handled, per issue
    seen_comments: Mutex<HashMap<String, HashSet<u64>>>,
    /// (issue, pid) pairs already alerted as dead
    dead_alerts: Mutex<HashSet<(String, u32)>>,
    /// Log signal time last rejected per issue, so a scan does not retry it
    rejected_logs: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            tracker,
            launcher,
            notifier,
            finalizer,
            definitions,
            probe,
        } = collaborators;

        let data = DataDir::new(config.data_dir());
        let registry = LaunchRegistry::new(data.registry_file());
        let markers = CompletionMarkers::new(data.completions_dir());
        let activity = Arc::new(AgentActivity::new(registry.clone(), probe.clone(), data.clone()));

        let repos: HashMap<String, String> = config
            .projects
            .iter()
            .map(|(name, project)| (name.clone(), project.repo.clone()))
            .collect();
        let engine = Arc::new(
            WorkflowEngine::new(&data, definitions, notifier.clone(), finalizer).with_repos(repos),
        );

        let guard = LaunchGuard::new(config.timing.launch_cooldown, activity.clone());
        guard.seed_from_registry(&registry);

        let monitor = AgentMonitor::new(
            config.timing.stuck_threshold,
            activity.clone(),
            probe.clone(),
            engine.audit().clone(),
        );

        let reconciler = Reconciler::new(
            engine.clone(),
            tracker.clone(),
            registry.clone(),
            markers.clone(),
            activity.clone(),
        );

        Self {
            config,
            data,
            engine,
            guard,
            monitor,
            registry,
            markers,
            activity,
            reconciler,
            tracker,
            launcher,
            notifier,
            probe,
            seen_comments: Mutex::new(HashMap::new()),
            dead_alerts: Mutex::new(HashSet::new()),
            rejected_logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn registry(&self) -> &LaunchRegistry {
        &self.registry
    }

    pub fn markers(&self) -> &CompletionMarkers {
        &self.markers
    }

    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    pub fn guard(&self) -> &LaunchGuard {
        &self.guard
    }

    fn repo_for(&self, wf: &Workflow) -> String {
        if !wf.metadata.repo.is_empty() {
            return wf.metadata.repo.clone();
        }
        self.config
            .projects
            .get(&wf.metadata.project)
            .map(|p| p.repo.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Create a workflow for an issue. The tier comes from the issue's labels
    /// unless given.
    pub async fn create_workflow(
        &self,
        issue: &str,
        project: Option<&str>,
        tier: Option<&str>,
    ) -> Result<String> {
        let project_name = self.config.resolve_project_name(project)?;
        let project = self.config.project(&project_name)?;
        let found = self.tracker.get_issue(&project.repo, issue, false).await?;

        let tier = match tier {
            Some(tier) => tier.to_string(),
            None => {
                let detected = detect_workflow_tier(&found.labels);
                debug!("Issue #{} labels {:?} → tier {}", issue, found.labels, detected);
                detected
            }
        };

        self.engine
            .create_workflow_for_issue(&NewWorkflow {
                issue: issue.to_string(),
                title: found.title,
                project: project_name,
                tier,
                task_type: String::new(),
                description: found.body,
            })
            .await
    }

    /// Start the issue's workflow and launch the first agent
    pub async fn start_issue(&self, issue: &str) -> Result<TriggerOutcome> {
        let workflow_id = self
            .engine
            .workflow_id_for_issue(issue)
            .ok_or_else(|| Error::NoWorkflow(issue.to_string()))?;
        let wf = self.engine.start_workflow(&workflow_id).await?;
        if wf.state == WorkflowState::AwaitingApproval {
            return Ok(TriggerOutcome::AwaitingApproval);
        }
        self.launch_next(issue, None, LaunchMode::Initial).await
    }

    pub async fn approve_issue(&self, issue: &str, approved_by: &str) -> Result<TriggerOutcome> {
        self.engine.approve_step(issue, approved_by).await?;
        self.launch_next(issue, None, LaunchMode::Initial).await
    }

    pub async fn deny_issue(&self, issue: &str, denied_by: &str, reason: &str) -> Result<Workflow> {
        let wf = self.engine.deny_step(issue, denied_by, reason).await?;
        self.drop_tracking(issue);
        Ok(wf)
    }

    pub fn pause_issue(&self, issue: &str, reason: &str) -> Result<Workflow> {
        self.engine.pause_workflow(issue, reason)
    }

    /// Resume and launch the current step unless its agent is still running
    pub async fn resume_issue(&self, issue: &str) -> Result<TriggerOutcome> {
        self.engine.resume_workflow(issue)?;
        self.launch_next(issue, None, LaunchMode::Continuation).await
    }

    /// Move the pointer back to an agent's step. The local marker is dropped
    /// since it describes the abandoned position.
    pub fn reset_issue(&self, issue: &str, agent_type: &str) -> Result<Workflow> {
        let wf = self.engine.reset_to_agent_for_issue(issue, agent_type)?;
        self.markers.remove(issue);
        self.guard.clear(issue);
        Ok(wf)
    }

    /// Continue an issue's chain, optionally naming the agent expected next
    pub async fn continue_issue(&self, issue: &str, from: Option<&str>) -> Result<TriggerOutcome> {
        let wf = self.engine.workflow_for_issue(issue)?;
        if wf.state.is_terminal() {
            return Err(Error::InvalidTransition {
                workflow_id: wf.id,
                state: wf.state.to_string(),
                action: "continue",
            });
        }
        self.guard.clear(issue);
        self.launch_next(issue, from, LaunchMode::Continuation).await
    }

    /// Kill the live agent, cancel the workflow and close the issue
    pub async fn stop_issue(&self, issue: &str, reason: &str) -> Result<Workflow> {
        self.kill_live_agent(issue).await;
        let wf = self.engine.stop_workflow(issue, reason)?;
        self.registry.remove(issue)?;
        self.guard.clear(issue);
        self.drop_tracking(issue);

        let repo = self.repo_for(&wf);
        let body = format!("🛑 Workflow stopped: {}", reason);
        if let Err(e) = self.tracker.add_comment(&repo, issue, &body).await {
            warn!("Failed to comment on issue #{}: {}", issue, e);
        }
        if let Err(e) = self.tracker.close_issue(&repo, issue).await {
            warn!("Failed to close issue #{}: {}", issue, e);
        }
        Ok(wf)
    }

    /// Drop every local trace of an issue except its audit history
    pub async fn forget_issue(&self, issue: &str) -> Result<Option<String>> {
        self.kill_live_agent(issue).await;
        let workflow_id = self.engine.forget_issue(issue)?;
        self.markers.remove(issue);
        self.registry.remove(issue)?;
        self.guard.clear(issue);
        self.drop_tracking(issue);
        Ok(workflow_id)
    }

    /// Drop the in-memory webhook, dead-alert and log bookkeeping for an issue
    fn drop_tracking(&self, issue: &str) {
        self.seen_comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(issue);
        self.dead_alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(alerted, _)| alerted != issue);
        self.rejected_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(issue);
    }

    async fn kill_live_agent(&self, issue: &str) {
        if let Some(pid) = self.activity.running_pid(issue) {
            self.monitor.kill_agent(pid, issue).await;
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn status(&self, issue: &str) -> Result<String> {
        let mut status = self.engine.status(issue)?;
        if let Some(entry) = self.registry.get(issue) {
            let alive = self.probe.is_alive(entry.pid);
            status.push_str(&format!(
                "\n\nAgent: @{} via {} (pid {}, {}, launched {})",
                entry.agent_type,
                entry.tool,
                entry.pid,
                if alive { "running" } else { "exited" },
                entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            ));
        }
        Ok(status)
    }

    pub fn audit_history(&self, issue: &str, limit: usize) -> Vec<AuditEvent> {
        self.engine.audit().history(issue, limit)
    }

    pub async fn snapshot(&self, issue: &str) -> Result<Snapshot> {
        let wf = self.engine.workflow_for_issue(issue)?;
        let repo = self.repo_for(&wf);
        let expected = wf.expected_running_agent().map(str::to_string);
        Ok(self
            .reconciler
            .build_workflow_snapshot(issue, &repo, expected.as_deref())
            .await)
    }

    pub async fn reconcile(&self, issue: &str) -> Result<ReconcileReport> {
        let wf = self.engine.workflow_for_issue(issue)?;
        let repo = self.repo_for(&wf);
        self.reconciler
            .reconcile_issue_from_signals(issue, &wf.metadata.project, &repo)
            .await
    }

    // ------------------------------------------------------------------
    // Launching
    // ------------------------------------------------------------------

    /// Launch the agent for the workflow's current step if the guard allows.
    ///
    /// The guard is consulted before routing, so a busy issue is skipped even
    /// when its routing is off. Otherwise `requested_agent` (or the local
    /// marker's next agent) must agree with the record's expected agent.
    pub async fn launch_next(
        &self,
        issue: &str,
        requested_agent: Option<&str>,
        mode: LaunchMode,
    ) -> Result<TriggerOutcome> {
        let wf = self.engine.workflow_for_issue(issue)?;
        match wf.state {
            WorkflowState::Running => {}
            WorkflowState::AwaitingApproval => return Ok(TriggerOutcome::AwaitingApproval),
            state => return Ok(TriggerOutcome::Finished(state)),
        }
        if wf.paused {
            debug!("Issue #{} is paused, not launching", issue);
            return Ok(TriggerOutcome::Paused);
        }

        let Some(expected) = wf.active_agent_type().map(str::to_string) else {
            return Ok(TriggerOutcome::Finished(wf.state));
        };

        // A busy issue is a no-op whatever the routing says
        if let Some(denial) = self.guard.check_at(issue, &expected, Utc::now()) {
            info!("Not launching @{} for issue #{}: {}", expected, issue, denial);
            return Ok(TriggerOutcome::Skipped(denial));
        }

        let routed = self.markers.read(issue).and_then(|m| m.next_agent);
        let agent = requested_agent
            .map(str::to_string)
            .or(routed)
            .unwrap_or_else(|| expected.clone());

        if normalize_agent(&agent) != normalize_agent(&expected) {
            warn!(
                "Refusing to launch @{} for issue #{}: workflow is at @{}",
                agent, issue, expected
            );
            return Err(Error::AgentMismatch {
                issue: issue.to_string(),
                expected,
                actual: agent,
            });
        }

        if let Err(denial) = self.guard.try_claim(issue, &expected) {
            info!("Not launching @{} for issue #{}: {}", expected, issue, denial);
            return Ok(TriggerOutcome::Skipped(denial));
        }

        match self.invoke(issue, &wf, &expected, mode).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.guard.clear(issue);
                Err(e)
            }
        }
    }

    async fn invoke(
        &self,
        issue: &str,
        wf: &Workflow,
        agent: &str,
        mode: LaunchMode,
    ) -> Result<TriggerOutcome> {
        let project = self.config.project(&wf.metadata.project)?;
        let issue_url = project.issue_url(issue);
        let request = LaunchRequest {
            issue: issue.to_string(),
            agent_type: agent.to_string(),
            prompt: build_prompt(wf, &issue_url, mode),
            workspace_dir: crate::config::expand_path(&project.workspace),
            agents_dir: project.agents_dir.as_deref().map(crate::config::expand_path),
            issue_url,
            tool_preference: project.tool_preference.clone(),
            log_dir: self.data.issue_logs_dir(issue),
            mode,
        };

        match self.launcher.invoke_agent(&request).await {
            Ok(launched) => {
                let now = Utc::now();
                self.registry.record(
                    issue,
                    LaunchEntry {
                        timestamp: now,
                        pid: launched.pid,
                        tier: wf.metadata.tier.clone(),
                        mode,
                        tool: launched.tool.clone(),
                        agent_type: agent.to_string(),
                    },
                )?;
                self.guard.record_launch_at(issue, agent, launched.pid, now);
                self.engine.audit().log(
                    issue,
                    EventType::AgentLaunched,
                    serde_json::json!({
                        "agent_type": agent,
                        "pid": launched.pid,
                        "tool": launched.tool,
                        "mode": mode,
                        "step_num": wf.current_step,
                        "log_file": launched.log_file,
                    }),
                    None,
                );
                Ok(TriggerOutcome::Launched {
                    agent_type: agent.to_string(),
                    pid: launched.pid,
                    tool: launched.tool,
                })
            }
            Err(Error::NoToolAvailable(reason)) => {
                error!("No tool could launch @{} for issue #{}: {}", agent, issue, reason);
                self.guard.clear(issue);
                self.engine.audit().log(
                    issue,
                    EventType::AgentLaunchFailed,
                    serde_json::json!({ "agent_type": agent, "reason": reason }),
                    None,
                );
                let message = Message::alert("Agent launch failed")
                    .for_issue(issue)
                    .with_body(&format!("@{}: {}", agent, reason))
                    .with_action("Retry", &format!("nexus continue {}", issue));
                self.notifier.send(&message).await;
                Ok(TriggerOutcome::LaunchFailed(reason))
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Apply a completion signal read from a log or comment.
    ///
    /// The local marker is only written once the engine has accepted the
    /// completion, so a rejected signal cannot steer later launches.
    pub async fn on_completion(&self, issue: &str, signal: &CompletionSignal) -> Result<TriggerOutcome> {
        let wf = self.engine.workflow_for_issue(issue)?;
        let Some(agent) = completed_agent(signal, &wf) else {
            return Ok(TriggerOutcome::Ignored(format!(
                "signal for step {:?} does not match step {}",
                signal.step_num, wf.current_step
            )));
        };

        let outputs = serde_json::json!({
            "source": signal.source,
            "comment_id": signal.comment_id,
            "next_agent": signal.next_agent(),
        });
        let wf = self.engine.complete_step_for_issue(issue, &agent, outputs).await?;
        self.markers.write(&CompletionMarker::from_signal(issue, signal));
        if signal.source == SignalSource::Comment {
            self.engine.mark_signal_applied(issue, signal.timestamp)?;
        }
        self.follow_up(issue, &agent, &wf).await
    }

    /// Record a finished step reported by an operator and launch whatever comes next
    pub async fn complete_step(
        &self,
        issue: &str,
        agent: &str,
        outputs: serde_json::Value,
    ) -> Result<TriggerOutcome> {
        let wf = self.engine.complete_step_for_issue(issue, agent, outputs).await?;
        self.follow_up(issue, agent, &wf).await
    }

    async fn follow_up(&self, issue: &str, agent: &str, wf: &Workflow) -> Result<TriggerOutcome> {
        self.monitor.reset_retries(issue, agent);
        self.registry.remove(issue)?;
        self.guard.clear(issue);

        match wf.state {
            WorkflowState::Running if wf.paused => Ok(TriggerOutcome::Paused),
            WorkflowState::Running => self.launch_next(issue, None, LaunchMode::Initial).await,
            WorkflowState::AwaitingApproval => Ok(TriggerOutcome::AwaitingApproval),
            state => {
                if state.is_terminal() {
                    self.drop_tracking(issue);
                }
                Ok(TriggerOutcome::Finished(state))
            }
        }
    }

    /// Handle a GitHub `issue_comment` webhook payload
    pub async fn handle_issue_comment(&self, payload: &str) -> Result<TriggerOutcome> {
        let payload: CommentPayload = serde_json::from_str(payload)?;
        let issue = payload.issue.number.to_string();

        if payload.action != "created" {
            return Ok(TriggerOutcome::Ignored(format!("action {}", payload.action)));
        }
        if let Some(bot) = &self.config.github.bot_login {
            if payload.comment.user.login.eq_ignore_ascii_case(bot) {
                return Ok(TriggerOutcome::Ignored("comment by the bot".to_string()));
            }
        }
        if !self.first_sighting(&issue, payload.comment.id) {
            return Ok(TriggerOutcome::Ignored(format!(
                "comment {} already handled",
                payload.comment.id
            )));
        }

        let Some(wf) = self.engine.find_workflow_for_issue(&issue) else {
            return Ok(TriggerOutcome::Ignored(format!("no workflow for issue #{}", issue)));
        };
        if let Some(repo) = payload.repository.as_ref().map(|r| r.full_name.as_str()) {
            let expected = self.repo_for(&wf);
            if !expected.is_empty() && !expected.eq_ignore_ascii_case(repo) {
                return Ok(TriggerOutcome::Ignored(format!("repository {}", repo)));
            }
        }
        if wf
            .last_signal_at
            .is_some_and(|applied| payload.comment.created_at <= applied)
        {
            return Ok(TriggerOutcome::Ignored("signal already applied".to_string()));
        }

        let Some(mut signal) = extract(
            &payload.comment.body,
            SignalSource::Comment,
            payload.comment.created_at,
        ) else {
            return Ok(TriggerOutcome::Ignored("no completion signal".to_string()));
        };
        signal.comment_id = Some(payload.comment.id.to_string());

        info!(
            "Comment {} on issue #{} by {}: {:?}",
            payload.comment.id, issue, payload.comment.user.login, signal.handoff
        );
        self.on_completion(&issue, &signal).await
    }

    fn first_sighting(&self, issue: &str, comment_id: u64) -> bool {
        self.seen_comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(issue.to_string())
            .or_default()
            .insert(comment_id)
    }

    /// Apply completion markers from the logs of agents that have exited
    pub async fn scan_log_completions(&self) -> Vec<(String, Result<TriggerOutcome>)> {
        let mut results = Vec::new();

        for (issue, entry) in self.registry.entries() {
            if self.probe.is_alive(entry.pid) {
                continue;
            }
            let Some(log) = self.activity.latest_log(&issue) else {
                continue;
            };
            let Some(modified) = crate::process::file_mtime(&log) else {
                continue;
            };
            let Some(text) = read_tail(&log, self.config.launcher.log_tail_bytes) else {
                continue;
            };
            let Some(signal) = extract(&text, SignalSource::Log, modified) else {
                continue;
            };
            if self
                .markers
                .read(&issue)
                .is_some_and(|m| m.timestamp >= signal.timestamp)
            {
                continue;
            }
            if self.log_rejected(&issue, signal.timestamp) {
                continue;
            }

            info!("Found completion in {} for issue #{}", log.display(), issue);
            let outcome = self.on_completion(&issue, &signal).await;
            let rejected = match &outcome {
                Err(e) => {
                    warn!("Could not apply log completion for issue #{}: {}", issue, e);
                    true
                }
                Ok(TriggerOutcome::Ignored(_)) => true,
                Ok(_) => false,
            };
            if rejected {
                self.rejected_logs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(issue.clone(), signal.timestamp);
            }
            results.push((issue, outcome));
        }
        results
    }

    fn log_rejected(&self, issue: &str, at: DateTime<Utc>) -> bool {
        self.rejected_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(issue)
            .is_some_and(|rejected| *rejected >= at)
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Kill stuck agents, detect dead ones and retry or fail them
    pub async fn sweep_stuck_agents(&self) -> SweepReport {
        self.sweep_stuck_agents_at(Utc::now()).await
    }

    pub async fn sweep_stuck_agents_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for (issue, entry) in self.registry.entries() {
            report.checked += 1;

            let Some(wf) = self.engine.find_workflow_for_issue(&issue) else {
                self.prune(&issue, &mut report);
                continue;
            };
            if wf.state.is_terminal() {
                self.prune(&issue, &mut report);
                continue;
            }

            if let Some(log) = self.activity.latest_log(&issue) {
                if let (true, Some(pid)) = self.monitor.check_timeout_at(&issue, &log, now) {
                    if self.monitor.kill_agent(pid, &issue).await {
                        report.killed += 1;
                        self.retry_or_fail(&issue, &entry.agent_type, "stuck", &mut report)
                            .await;
                    }
                    continue;
                }
            }

            if self.is_dead(&issue, &entry, &wf, now) {
                report.dead += 1;
                self.alert_dead(&issue, &entry).await;
                self.retry_or_fail(&issue, &entry.agent_type, "process exited", &mut report)
                    .await;
            }
        }

        if report != SweepReport::default() {
            debug!("Sweep: {:?}", report);
        }
        report
    }

    fn prune(&self, issue: &str, report: &mut SweepReport) {
        if let Err(e) = self.registry.remove(issue) {
            warn!("Failed to prune registry entry for issue #{}: {}", issue, e);
        }
        self.drop_tracking(issue);
        report.pruned += 1;
    }

    /// Gone without a completion, and launched longer ago than the stuck threshold
    fn is_dead(&self, issue: &str, entry: &LaunchEntry, wf: &Workflow, now: DateTime<Utc>) -> bool {
        if !WorkflowEngine::accepts_launch(wf) || self.probe.is_alive(entry.pid) {
            return false;
        }
        let age = now
            .signed_duration_since(entry.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age <= self.monitor.stuck_threshold() {
            return false;
        }
        !self
            .markers
            .read(issue)
            .is_some_and(|m| m.timestamp > entry.timestamp)
    }

    async fn alert_dead(&self, issue: &str, entry: &LaunchEntry) {
        let first = self
            .dead_alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((issue.to_string(), entry.pid));
        if !first {
            return;
        }
        warn!(
            "Agent @{} (pid {}) for issue #{} exited without completing",
            entry.agent_type, entry.pid, issue
        );
        self.engine.audit().log(
            issue,
            EventType::AgentDead,
            serde_json::json!({ "agent_type": entry.agent_type, "pid": entry.pid }),
            None,
        );
        let message = Message::warning("Agent exited without completing")
            .for_issue(issue)
            .with_body(&format!("@{} (pid {})", entry.agent_type, entry.pid));
        self.notifier.send(&message).await;
    }

    async fn retry_or_fail(&self, issue: &str, agent: &str, reason: &str, report: &mut SweepReport) {
        if self.monitor.should_retry(issue, agent) {
            report.retried += 1;
            self.guard.clear(issue);
            match self.launch_next(issue, None, LaunchMode::Continuation).await {
                Ok(outcome) => info!("Retry for issue #{}: {}", issue, outcome),
                Err(e) => warn!("Retry for issue #{} failed: {}", issue, e),
            }
            return;
        }

        report.failed += 1;
        self.monitor.mark_failed(issue, agent, reason);
        let message = Message::alert("Agent failed")
            .for_issue(issue)
            .with_body(&format!(
                "@{} {} and used all retries. The workflow is still running.",
                agent, reason
            ))
            .with_action("Continue", &format!("nexus continue {}", issue));
        self.notifier.send(&message).await;
        if let Err(e) = self.registry.remove(issue) {
            warn!("Failed to drop registry entry for issue #{}: {}", issue, e);
        }
    }

    /// Launch the current step of running workflows that have no agent.
    ///
    /// Issues whose last launch ended in AGENT_FAILED or AGENT_LAUNCH_FAILED
    /// wait for an operator `continue`.
    pub async fn launch_pending(&self) -> Vec<(String, TriggerOutcome)> {
        let mut launched = Vec::new();
        for wf in self.engine.list_workflows() {
            if !WorkflowEngine::accepts_launch(&wf) {
                continue;
            }
            let issue = wf.issue().to_string();
            if self.registry.get(&issue).is_some() || self.awaits_operator(&issue) {
                continue;
            }
            match self.launch_next(&issue, None, LaunchMode::Initial).await {
                Ok(outcome) => launched.push((issue, outcome)),
                Err(e) => warn!("Could not launch pending step for issue #{}: {}", issue, e),
            }
        }
        launched
    }

    fn awaits_operator(&self, issue: &str) -> bool {
        self.engine
            .audit()
            .history(issue, 200)
            .iter()
            .rev()
            .find(|e| {
                matches!(
                    e.event_type,
                    EventType::AgentLaunched
                        | EventType::AgentFailed
                        | EventType::AgentLaunchFailed
                        | EventType::StepCompleted
                        | EventType::StepApproved
                        | EventType::WorkflowResumed
                        | EventType::WorkflowReset
                )
            })
            .is_some_and(|e| {
                matches!(
                    e.event_type,
                    EventType::AgentFailed | EventType::AgentLaunchFailed
                )
            })
    }

    /// Poll until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let timing = &self.config.timing;
        info!(
            "Watching (scan every {}, sweep every {})",
            humantime::format_duration(timing.scan_interval),
            humantime::format_duration(timing.poll_interval)
        );

        let mut scan = tokio::time::interval(timing.scan_interval);
        let mut sweep = tokio::time::interval(timing.poll_interval);
        let mut heartbeat = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = scan.tick() => {
                    self.scan_log_completions().await;
                }
                _ = sweep.tick() => {
                    self.sweep_stuck_agents().await;
                    self.launch_pending().await;
                }
                _ = heartbeat.tick() => {}
            }
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutting down watch loop");
                break;
            }
        }
    }
}
