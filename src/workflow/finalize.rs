//! Workflow finalization
//!
//! Runs once when the last step of a workflow completes.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::notify::{Message, Notifier};
use crate::tracker::IssueTracker;
use crate::Result;

/// Closes out an issue after its workflow completed
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, issue: &str, repo: &str, last_agent: &str, project: &str) -> Result<()>;
}

/// Comments on the issue, closes it and tells the operator
pub struct IssueFinalizer {
    tracker: Arc<dyn IssueTracker>,
    notifier: Arc<dyn Notifier>,
}

impl IssueFinalizer {
    pub fn new(tracker: Arc<dyn IssueTracker>, notifier: Arc<dyn Notifier>) -> Self {
        Self { tracker, notifier }
    }
}

#[async_trait]
impl Finalizer for IssueFinalizer {
    async fn finalize(&self, issue: &str, repo: &str, last_agent: &str, project: &str) -> Result<()> {
        let comment = format!(
            "✅ Workflow complete. Final step finished by @{}.\n\nClosing this issue.",
            last_agent
        );
        self.tracker.add_comment(repo, issue, &comment).await?;
        self.tracker.close_issue(repo, issue).await?;
        info!("Finalized {}#{} ({})", repo, issue, project);

        let message = Message::new("Workflow completed")
            .for_issue(issue)
            .with_body(&format!(
                "{} ({}) closed after @{}",
                repo, project, last_agent
            ))
            .with_action("Open", &format!("https://github.com/{}/issues/{}", repo, issue));
        self.notifier.send(&message).await;
        Ok(())
    }
}
