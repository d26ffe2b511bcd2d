//! Approval gates
//!
//! A step with `approval_required` stops the workflow in
//! `AWAITING_APPROVAL` until an approver answers with `approve` or `deny`.

use chrono::{DateTime, Utc};

use super::state::{Step, Workflow};
use crate::notify::Message;
use crate::store::PendingApproval;

/// Pending-approval record for a gated step
pub fn approval_request(step: &Step, now: DateTime<Utc>) -> PendingApproval {
    PendingApproval {
        step_num: step.step_num,
        step_name: step.name.clone(),
        approvers: step.approvers.clone(),
        approval_timeout: step.approval_timeout,
        requested_at: now,
    }
}

/// Operator message asking the approvers for a decision
pub fn approval_message(workflow: &Workflow, step: &Step) -> Message {
    let issue = workflow.issue();
    let approvers = if step.approvers.is_empty() {
        "any operator".to_string()
    } else {
        step.approvers
            .iter()
            .map(|a| format!("@{}", a.trim_start_matches('@')))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let timeout = humantime::format_duration(std::time::Duration::from_secs(step.approval_timeout));

    let mut body = format!(
        "Step {} ({}) for @{} needs approval.\nApprovers: {}\nExpires in {}",
        step.step_num, step.name, step.agent_type, approvers, timeout
    );
    if !workflow.metadata.title.is_empty() {
        body = format!("{}\n\n{}", workflow.metadata.title, body);
    }

    Message::warning("Approval required")
        .for_issue(issue)
        .with_body(&body)
        .with_action("Approve", &format!("nexus approve {}", issue))
        .with_action("Deny", &format!("nexus deny {} --reason \"...\"", issue))
}
