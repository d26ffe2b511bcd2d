//! Workflow state engine
//!
//! Owns workflow records and the issue → workflow mapping. Every transition
//! loads the record, applies a [`Workflow`] method, saves it back and records
//! an audit event. Launching agents is the orchestrator's job; the engine
//! only moves state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::definition::{canonical_tier, DefinitionSource};
use super::finalize::Finalizer;
use super::gate::{approval_message, approval_request};
use super::state::{Advance, Workflow, WorkflowMetadata, WorkflowState};
use crate::audit::{AuditStore, EventType};
use crate::notify::{Message, Notifier};
use crate::store::{ApprovalStore, DataDir, PendingApproval, WorkflowMapping, WorkflowStore};
use crate::{Error, Result};

/// Input for [`WorkflowEngine::create_workflow_for_issue`]
#[derive(Debug, Clone, Default)]
pub struct NewWorkflow {
    pub issue: String,
    pub title: String,
    pub project: String,
    pub tier: String,
    pub task_type: String,
    pub description: String,
}

/// The workflow state machine service
pub struct WorkflowEngine {
    store: WorkflowStore,
    mapping: WorkflowMapping,
    approvals: ApprovalStore,
    audit: AuditStore,
    definitions: Arc<dyn DefinitionSource>,
    notifier: Arc<dyn Notifier>,
    finalizer: Arc<dyn Finalizer>,
    /// project → repository
    repos: HashMap<String, String>,
}

impl WorkflowEngine {
    pub fn new(
        data: &DataDir,
        definitions: Arc<dyn DefinitionSource>,
        notifier: Arc<dyn Notifier>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        let mapping = WorkflowMapping::new(data.mapping_file());
        Self {
            store: WorkflowStore::new(data.workflows_dir()),
            approvals: ApprovalStore::new(data.approvals_file()),
            audit: AuditStore::new(data.audit_dir(), mapping.clone()),
            mapping,
            definitions,
            notifier,
            finalizer,
            repos: HashMap::new(),
        }
    }

    /// Register project → repository names used for new workflows
    pub fn with_repos(mut self, repos: HashMap<String, String>) -> Self {
        self.repos = repos;
        self
    }

    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }

    pub fn mapping(&self) -> &WorkflowMapping {
        &self.mapping
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn workflow_id_for_issue(&self, issue: &str) -> Option<String> {
        self.mapping.get(issue)
    }

    /// Workflow mapped to an issue, or [`Error::NoWorkflow`]
    pub fn workflow_for_issue(&self, issue: &str) -> Result<Workflow> {
        let id = self
            .mapping
            .get(issue)
            .ok_or_else(|| Error::NoWorkflow(issue.to_string()))?;
        self.store.load(&id)
    }

    /// Like [`workflow_for_issue`](Self::workflow_for_issue) but unmapped or
    /// unreadable workflows are `None`
    pub fn find_workflow_for_issue(&self, issue: &str) -> Option<Workflow> {
        match self.workflow_for_issue(issue) {
            Ok(wf) => Some(wf),
            Err(Error::NoWorkflow(_)) => None,
            Err(e) => {
                warn!("Failed to load workflow for issue #{}: {}", issue, e);
                None
            }
        }
    }

    pub fn expected_running_agent(&self, issue: &str) -> Option<String> {
        self.find_workflow_for_issue(issue)
            .and_then(|wf| wf.expected_running_agent().map(str::to_string))
    }

    pub fn pending_approval(&self, issue: &str) -> Option<PendingApproval> {
        self.approvals.get(issue)
    }

    pub fn list_workflows(&self) -> Vec<Workflow> {
        self.store.list()
    }

    /// Status summary including any pending approval
    pub fn status(&self, issue: &str) -> Result<String> {
        let wf = self.workflow_for_issue(issue)?;
        let mut summary = wf.summary();
        if let Some(approval) = self.approvals.get(issue) {
            summary.push_str(&format!(
                "\n\nAwaiting approval for step {} ({}) from {} since {} (expires {})",
                approval.step_num,
                approval.step_name,
                if approval.approvers.is_empty() {
                    "any operator".to_string()
                } else {
                    approval.approvers.join(", ")
                },
                approval.requested_at.format("%Y-%m-%d %H:%M UTC"),
                approval.expires_at().format("%Y-%m-%d %H:%M UTC"),
            ));
        }
        Ok(summary)
    }

    fn repo_for(&self, project: &str) -> String {
        self.repos
            .get(project)
            .cloned()
            .unwrap_or_else(|| project.to_string())
    }

    fn save(&self, wf: &Workflow) -> Result<()> {
        self.store.save(wf)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Materialize a workflow for an issue from the project's definition.
    ///
    /// Configuration problems (no definition, missing file, unknown tier)
    /// fail the call and alert the operator.
    pub async fn create_workflow_for_issue(&self, request: &NewWorkflow) -> Result<String> {
        let issue = request.issue.as_str();
        let tier = canonical_tier(&request.tier);

        if let Some(existing) = self.find_workflow_for_issue(issue) {
            if !existing.state.is_terminal() {
                return Err(Error::InvalidTransition {
                    workflow_id: existing.id,
                    state: existing.state.to_string(),
                    action: "create another workflow",
                });
            }
        }

        let definition = match self.definitions.load(&request.project, &tier) {
            Ok(definition) => definition,
            Err(e) => {
                error!("Cannot create workflow for issue #{}: {}", issue, e);
                let message = Message::alert("Workflow creation failed")
                    .for_issue(issue)
                    .with_body(&format!("Project {} tier {}: {}", request.project, tier, e));
                self.notifier.send(&message).await;
                return Err(e);
            }
        };

        let workflow_id = format!("{}-{}-{}", request.project, issue, tier);
        let metadata = WorkflowMetadata {
            issue_number: issue.to_string(),
            project: request.project.clone(),
            repo: self.repo_for(&request.project),
            tier: tier.clone(),
            task_type: request.task_type.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
        };
        let wf = Workflow::new(&workflow_id, &definition.name, definition.steps, metadata);

        self.save(&wf)?;
        self.mapping.set(issue, &workflow_id)?;
        self.approvals.clear(issue)?;
        self.audit.log(
            issue,
            EventType::WorkflowCreated,
            serde_json::json!({ "tier": tier, "steps": wf.steps.len(), "name": wf.name }),
            None,
        );

        info!(
            "Created workflow {} for issue #{} ({} steps)",
            workflow_id,
            issue,
            wf.steps.len()
        );
        Ok(workflow_id)
    }

    /// PENDING → RUNNING
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let mut wf = self.store.load(workflow_id)?;
        let advance = wf.start()?;
        self.save(&wf)?;

        let issue = wf.issue().to_string();
        self.audit.log(
            &issue,
            EventType::WorkflowStarted,
            format!("Started {} at step 1", wf.name),
            None,
        );
        info!("Started workflow {} for issue #{}", wf.id, issue);

        if advance == Advance::AwaitingApproval {
            self.request_approval(&wf).await?;
        }
        Ok(wf)
    }

    /// Record that `completed_agent_type` finished the current step and
    /// advance the workflow.
    pub async fn complete_step_for_issue(
        &self,
        issue: &str,
        completed_agent_type: &str,
        outputs: serde_json::Value,
    ) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        let step_num = wf.current_step;

        let advance = match wf.complete_current(completed_agent_type, outputs) {
            Ok(advance) => advance,
            Err(e @ Error::AgentMismatch { .. }) => {
                warn!("Drift on issue #{}: {}", issue, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.save(&wf)?;
        self.audit.log(
            issue,
            EventType::StepCompleted,
            serde_json::json!({ "step_num": step_num, "agent_type": completed_agent_type }),
            None,
        );

        match advance {
            Advance::Finished => {
                info!("Workflow {} completed for issue #{}", wf.id, issue);
                self.audit.log(
                    issue,
                    EventType::WorkflowCompleted,
                    format!("All {} steps completed", wf.steps.len()),
                    None,
                );
                self.finalize(&wf).await;
            }
            Advance::AwaitingApproval => self.request_approval(&wf).await?,
            Advance::Started => {
                debug!(
                    "Issue #{} advanced to step {} (@{})",
                    issue,
                    wf.current_step,
                    wf.active_agent_type().unwrap_or("-")
                );
            }
        }

        if wf.paused {
            info!("Issue #{} is paused; next step will not auto-launch", issue);
        }
        Ok(wf)
    }

    async fn request_approval(&self, wf: &Workflow) -> Result<()> {
        let issue = wf.issue();
        let step = wf.current().ok_or_else(|| Error::InvalidTransition {
            workflow_id: wf.id.clone(),
            state: wf.state.to_string(),
            action: "request approval past the last step",
        })?;

        self.approvals.set(issue, approval_request(step, Utc::now()))?;
        self.audit.log(
            issue,
            EventType::StepAwaitingApproval,
            serde_json::json!({
                "step_num": step.step_num,
                "step_name": step.name,
                "approvers": step.approvers,
            }),
            None,
        );
        info!(
            "Issue #{} awaiting approval for step {} ({})",
            issue, step.step_num, step.name
        );
        self.notifier.send(&approval_message(wf, step)).await;
        Ok(())
    }

    async fn finalize(&self, wf: &Workflow) {
        let issue = wf.issue();
        let last_agent = wf.last_completed_agent().unwrap_or_default();
        let repo = &wf.metadata.repo;
        let project = &wf.metadata.project;

        if let Err(e) = self.finalizer.finalize(issue, repo, last_agent, project).await {
            error!("Finalization failed for issue #{}: {}", issue, e);
            let message = Message::alert("Finalization failed")
                .for_issue(issue)
                .with_body(&format!("{}: {}", repo, e));
            self.notifier.send(&message).await;
        }
    }

    /// AWAITING_APPROVAL → RUNNING
    pub async fn approve_step(&self, issue: &str, approved_by: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        wf.approve()?;
        self.save(&wf)?;
        self.approvals.clear(issue)?;

        let step = wf.current().map(|s| (s.step_num, s.name.clone()));
        self.audit.log(
            issue,
            EventType::StepApproved,
            serde_json::json!({ "step_num": step.as_ref().map(|s| s.0), "step_name": step.map(|s| s.1) }),
            Some(approved_by),
        );
        info!("Issue #{} step {} approved by {}", issue, wf.current_step, approved_by);
        Ok(wf)
    }

    /// AWAITING_APPROVAL → FAILED
    pub async fn deny_step(&self, issue: &str, denied_by: &str, reason: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        wf.deny(denied_by, reason)?;
        self.save(&wf)?;
        self.approvals.clear(issue)?;

        self.audit.log(
            issue,
            EventType::StepDenied,
            serde_json::json!({ "step_num": wf.current_step, "reason": reason }),
            Some(denied_by),
        );
        info!("Issue #{} step {} denied by {}: {}", issue, wf.current_step, denied_by, reason);

        let message = Message::warning("Step denied")
            .for_issue(issue)
            .with_body(&format!("Denied by {}: {}", denied_by, reason));
        self.notifier.send(&message).await;
        Ok(wf)
    }

    pub fn pause_workflow(&self, issue: &str, reason: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        wf.pause(reason)?;
        self.save(&wf)?;
        self.audit.log(issue, EventType::WorkflowPaused, reason, None);
        info!("Paused workflow for issue #{}: {}", issue, reason);
        Ok(wf)
    }

    pub fn resume_workflow(&self, issue: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        wf.resume()?;
        self.save(&wf)?;
        self.audit.log(issue, EventType::WorkflowResumed, "resumed", None);
        info!("Resumed workflow for issue #{}", issue);
        Ok(wf)
    }

    /// Any non-terminal state → CANCELLED
    pub fn stop_workflow(&self, issue: &str, reason: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        wf.cancel(reason)?;
        self.save(&wf)?;
        self.approvals.clear(issue)?;
        self.audit.log(issue, EventType::WorkflowStopped, reason, None);
        info!("Stopped workflow for issue #{}: {}", issue, reason);
        Ok(wf)
    }

    /// Administrative pointer reset to the step owned by `agent_type`
    pub fn reset_to_agent_for_issue(&self, issue: &str, agent_type: &str) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        let previous = (wf.state, wf.current_step);
        wf.reset_to_agent(agent_type)?;
        self.save(&wf)?;
        self.approvals.clear(issue)?;
        self.audit.log(
            issue,
            EventType::WorkflowReset,
            serde_json::json!({
                "from_state": previous.0,
                "from_step": previous.1,
                "to_step": wf.current_step,
                "agent_type": agent_type,
            }),
            None,
        );
        warn!(
            "Issue #{} reset from step {} ({}) to step {} (@{})",
            issue, previous.1, previous.0, wf.current_step, agent_type
        );
        Ok(wf)
    }

    /// Remember the newest comment signal applied to the record
    pub fn mark_signal_applied(&self, issue: &str, at: DateTime<Utc>) -> Result<Workflow> {
        let mut wf = self.workflow_for_issue(issue)?;
        if wf.last_signal_at.map_or(true, |prev| at > prev) {
            wf.last_signal_at = Some(at);
            self.save(&wf)?;
        }
        Ok(wf)
    }

    /// Drop the mapping, record and pending approval for an issue. The audit
    /// history is kept.
    pub fn forget_issue(&self, issue: &str) -> Result<Option<String>> {
        let workflow_id = self.mapping.remove(issue)?;
        if let Some(id) = &workflow_id {
            self.store.delete(id);
        }
        self.approvals.clear(issue)?;
        info!("Forgot issue #{} (workflow {:?})", issue, workflow_id);
        Ok(workflow_id)
    }

    /// Whether the orchestrator may launch an agent for this workflow
    pub fn accepts_launch(wf: &Workflow) -> bool {
        wf.state == WorkflowState::Running && !wf.paused
    }
}
