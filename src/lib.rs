//! Nexus: issue-driven agent workflow orchestration
//!
//! Coordinates multi-step AI agent workflows triggered by GitHub issues:
//! - **Workflows**: tiered step sequences with approval gates, pause/resume and stop
//! - **Signals**: completion markers parsed from agent logs and issue comments
//! - **Guards**: cooldown plus liveness checks so an issue never runs two agents
//! - **Reconciliation**: drift detection between the record, local markers and comments
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │    Trigger (log poll / issue comment)   │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   Signal extractor → Workflow engine    │
//! │   complete_step / approval gate         │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │   Orchestrator: guard → launch agent    │
//! │   stuck sweep → kill / retry / fail     │
//! └─────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod config;
pub mod guard;
pub mod launcher;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod reconcile;
pub mod shutdown;
pub mod signal;
pub mod store;
pub mod tier;
pub mod tracker;
pub mod workflow;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditStore, EventType};
pub use config::Config;
pub use guard::LaunchGuard;
pub use launcher::{AgentLauncher, LaunchRequest, LaunchedAgent};
pub use monitor::AgentMonitor;
pub use notify::{Message, Notifier};
pub use orchestrator::{Collaborators, Orchestrator, SweepReport, TriggerOutcome};
pub use reconcile::{DriftFlag, ReconcileReport, Reconciler, RecoveryHint, Snapshot};
pub use signal::{CompletionSignal, Handoff, SignalSource};
pub use tracker::IssueTracker;
pub use workflow::{Step, StepStatus, Workflow, WorkflowEngine, WorkflowState};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No workflow mapped to issue #{0}")]
    NoWorkflow(String),

    #[error("Workflow not found: {0}")]
    UnknownWorkflow(String),

    #[error("Invalid transition for {workflow_id}: cannot {action} while {state}")]
    InvalidTransition {
        workflow_id: String,
        state: String,
        action: &'static str,
    },

    #[error("Issue #{issue} is not awaiting approval (state: {state})")]
    NotAwaitingApproval { issue: String, state: String },

    #[error("Agent mismatch on issue #{issue}: workflow expects {expected}, got {actual}")]
    AgentMismatch {
        issue: String,
        expected: String,
        actual: String,
    },

    #[error("Workflow {workflow_id} has no step for agent {agent}")]
    UnknownAgent { workflow_id: String, agent: String },

    #[error("No agent tool available: {0}")]
    NoToolAvailable(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Issue tracker error: {0}")]
    Tracker(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Normalize an agent reference for comparison and keying.
///
/// Strips whitespace, backticks and a leading `@`, then lowercases, so
/// `@Copilot`, `` `copilot` `` and `copilot` all compare equal.
pub fn normalize_agent(agent: &str) -> String {
    agent
        .trim()
        .trim_matches('`')
        .trim()
        .trim_start_matches('@')
        .trim()
        .to_lowercase()
}
