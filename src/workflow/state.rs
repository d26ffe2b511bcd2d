//! Workflow records
//!
//! A [`Workflow`] is an ordered list of [`Step`]s with a 1-based pointer and
//! a lifecycle state. The transition methods here are pure: they validate
//! and mutate the record, and the engine takes care of persistence, audit
//! and notifications around them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{normalize_agent, Error, Result};

/// Default approval window in seconds
pub const DEFAULT_APPROVAL_TIMEOUT: u64 = 86_400;

/// Workflow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, not started
    Pending,
    /// A step is running (or the workflow is paused between steps)
    Running,
    /// Waiting at an approval gate
    AwaitingApproval,
    /// All steps finished
    Completed,
    /// Denied at a gate or failed permanently
    Failed,
    /// Stopped by an operator
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::AwaitingApproval => "awaiting_approval",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

fn default_approval_timeout() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT
}

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position
    pub step_num: usize,
    pub name: String,
    /// Agent role expected to execute the step
    pub agent_type: String,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Seconds
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    pub fn new(step_num: usize, name: &str, agent_type: &str) -> Self {
        Self {
            step_num,
            name: name.to_string(),
            agent_type: agent_type.to_string(),
            description: String::new(),
            status: StepStatus::Pending,
            approval_required: false,
            approvers: Vec::new(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            started_at: None,
            completed_at: None,
            outputs: serde_json::Value::Null,
            error: None,
        }
    }

    /// Gate this step behind an approval
    pub fn with_approval(mut self, approvers: &[&str]) -> Self {
        self.approval_required = true;
        self.approvers = approvers.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn matches_agent(&self, agent: &str) -> bool {
        normalize_agent(&self.agent_type) == normalize_agent(agent)
    }

    fn start(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.error = None;
    }

    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.outputs = serde_json::Value::Null;
        self.error = None;
    }
}

/// Issue context a workflow was created for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub issue_number: String,
    pub project: String,
    pub repo: String,
    pub tier: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// What a step completion led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The last step finished; the workflow is complete
    Finished,
    /// The next step is gated and waits for approval
    AwaitingApproval,
    /// The next step is now running
    Started,
}

/// A workflow run for one issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub state: WorkflowState,
    /// 1-based index into `steps`
    pub current_step: usize,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Creation time of the last comment signal applied to this record
    #[serde(default)]
    pub last_signal_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a pending workflow. Steps are renumbered from 1.
    pub fn new(id: &str, name: &str, mut steps: Vec<Step>, metadata: WorkflowMetadata) -> Self {
        let now = Utc::now();
        for (idx, step) in steps.iter_mut().enumerate() {
            step.step_num = idx + 1;
            step.reset();
        }

        Self {
            id: id.to_string(),
            name: name.to_string(),
            state: WorkflowState::Pending,
            current_step: 1,
            steps,
            paused: false,
            pause_reason: None,
            metadata,
            last_signal_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn issue(&self) -> &str {
        &self.metadata.issue_number
    }

    /// Step at the pointer
    pub fn current(&self) -> Option<&Step> {
        self.current_step
            .checked_sub(1)
            .and_then(|idx| self.steps.get(idx))
    }

    fn current_mut(&mut self) -> Option<&mut Step> {
        self.current_step
            .checked_sub(1)
            .and_then(move |idx| self.steps.get_mut(idx))
    }

    /// Agent of the step at the pointer
    pub fn active_agent_type(&self) -> Option<&str> {
        self.current().map(|s| s.agent_type.as_str())
    }

    /// Agent that should have a live process right now, if any
    pub fn expected_running_agent(&self) -> Option<&str> {
        match self.state {
            WorkflowState::Running => self.active_agent_type(),
            _ => None,
        }
    }

    /// 1-based step number for an agent
    pub fn step_for_agent(&self, agent: &str) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.matches_agent(agent))
            .map(|s| s.step_num)
    }

    /// Agent of the most recently completed step
    pub fn last_completed_agent(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .map(|s| s.agent_type.as_str())
    }

    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (done, self.steps.len())
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            workflow_id: self.id.clone(),
            state: self.state.to_string(),
            action,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// PENDING → RUNNING with step 1 running, or straight to the gate when
    /// step 1 needs approval.
    pub fn start(&mut self) -> Result<Advance> {
        if self.state != WorkflowState::Pending {
            return Err(self.invalid("start"));
        }
        if self.steps.is_empty() {
            return Err(Error::Config(format!("Workflow {} has no steps", self.id)));
        }

        let now = Utc::now();
        self.current_step = 1;
        self.touch();

        if self.steps[0].approval_required {
            self.state = WorkflowState::AwaitingApproval;
            return Ok(Advance::AwaitingApproval);
        }

        self.state = WorkflowState::Running;
        self.steps[0].start(now);
        Ok(Advance::Started)
    }

    /// Complete the step at the pointer on behalf of `agent`.
    ///
    /// A stale or unexpected agent is rejected with [`Error::AgentMismatch`]
    /// and leaves the record untouched.
    pub fn complete_current(&mut self, agent: &str, outputs: serde_json::Value) -> Result<Advance> {
        if self.state != WorkflowState::Running {
            return Err(self.invalid("complete a step"));
        }

        let issue = self.issue().to_string();
        let workflow_id = self.id.clone();
        let now = Utc::now();
        let step = self.current_mut().ok_or_else(|| Error::InvalidTransition {
            workflow_id,
            state: WorkflowState::Running.to_string(),
            action: "complete a step past the end",
        })?;

        if !step.matches_agent(agent) {
            return Err(Error::AgentMismatch {
                issue,
                expected: step.agent_type.clone(),
                actual: agent.to_string(),
            });
        }

        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        step.outputs = outputs;
        step.error = None;
        self.touch();

        if self.current_step >= self.steps.len() {
            self.state = WorkflowState::Completed;
            self.paused = false;
            self.pause_reason = None;
            return Ok(Advance::Finished);
        }

        self.current_step += 1;
        let next = &mut self.steps[self.current_step - 1];
        if next.approval_required {
            self.state = WorkflowState::AwaitingApproval;
            return Ok(Advance::AwaitingApproval);
        }

        next.start(now);
        Ok(Advance::Started)
    }

    /// AWAITING_APPROVAL → RUNNING, gated step running
    pub fn approve(&mut self) -> Result<()> {
        if self.state != WorkflowState::AwaitingApproval {
            return Err(Error::NotAwaitingApproval {
                issue: self.issue().to_string(),
                state: self.state.to_string(),
            });
        }

        let now = Utc::now();
        if let Some(step) = self.current_mut() {
            step.start(now);
        }
        self.state = WorkflowState::Running;
        self.touch();
        Ok(())
    }

    /// AWAITING_APPROVAL → FAILED, gated step failed with the denial recorded
    pub fn deny(&mut self, denied_by: &str, reason: &str) -> Result<()> {
        if self.state != WorkflowState::AwaitingApproval {
            return Err(Error::NotAwaitingApproval {
                issue: self.issue().to_string(),
                state: self.state.to_string(),
            });
        }

        let now = Utc::now();
        if let Some(step) = self.current_mut() {
            step.status = StepStatus::Failed;
            step.completed_at = Some(now);
            step.error = Some(format!("Denied by {}: {}", denied_by, reason));
        }
        self.state = WorkflowState::Failed;
        self.paused = false;
        self.touch();
        Ok(())
    }

    /// RUNNING → RUNNING[paused]. A workflow at an approval gate is already
    /// held, so pausing it is rejected.
    pub fn pause(&mut self, reason: &str) -> Result<()> {
        if self.state != WorkflowState::Running || self.paused {
            return Err(self.invalid("pause"));
        }
        self.paused = true;
        self.pause_reason = Some(reason.to_string());
        self.touch();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.paused || self.state.is_terminal() {
            return Err(self.invalid("resume"));
        }
        self.paused = false;
        self.pause_reason = None;
        self.touch();
        Ok(())
    }

    /// Any non-terminal state → CANCELLED
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("stop"));
        }

        if let Some(step) = self.current_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Failed;
                step.error = Some(format!("Stopped: {}", reason));
            }
        }
        self.state = WorkflowState::Cancelled;
        self.paused = false;
        self.touch();
        Ok(())
    }

    /// Administrative rewind (or skip ahead) to the step owned by `agent`.
    /// Allowed from any state, terminal ones included.
    pub fn reset_to_agent(&mut self, agent: &str) -> Result<()> {
        let target = self.step_for_agent(agent).ok_or_else(|| Error::UnknownAgent {
            workflow_id: self.id.clone(),
            agent: agent.to_string(),
        })?;

        let now = Utc::now();
        for step in self.steps.iter_mut() {
            if step.step_num < target {
                if !matches!(step.status, StepStatus::Completed | StepStatus::Failed) {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(now);
                }
            } else if step.step_num == target {
                step.reset();
                step.start(now);
            } else {
                step.reset();
            }
        }

        self.current_step = target;
        self.state = WorkflowState::Running;
        self.paused = false;
        self.pause_reason = None;
        self.touch();
        Ok(())
    }

    /// Human-readable progress summary
    pub fn summary(&self) -> String {
        let (done, total) = self.progress();
        let mut state = self.state.to_string();
        if self.paused {
            state.push_str(" (paused)");
        }

        let mut lines = vec![
            format!("Workflow: {} ({})", self.name, self.id),
            format!("Issue: #{} [{}]", self.metadata.issue_number, self.metadata.tier),
            format!("State: {}", state),
            format!(
                "Step: {}/{} {}",
                self.current_step,
                total,
                self.active_agent_type().unwrap_or("-")
            ),
            format!("Progress: {}/{} steps completed", done, total),
            String::new(),
            "Steps:".to_string(),
        ];

        for step in &self.steps {
            let icon = match step.status {
                StepStatus::Pending => "⬜",
                StepStatus::Running => "🔄",
                StepStatus::Completed => "✅",
                StepStatus::Failed => "❌",
            };
            let gate = if step.approval_required { " 🔒" } else { "" };
            lines.push(format!(
                "  {} {}. {} (@{}){}",
                icon, step.step_num, step.name, step.agent_type, gate
            ));
            if let Some(err) = &step.error {
                lines.push(format!("       {}", err));
            }
        }

        lines.join("\n")
    }
}
