//! Workflow state machine
//!
//! Provides workflow management for issue-driven agent chains:
//!
//! - **Definitions**: tiered step lists loaded from YAML
//! - **State**: persistent workflow records with a 1-based step pointer
//! - **Gates**: approval stops between steps
//! - **Engine**: validated transitions, audit trail and finalization
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING --start--> RUNNING
//! RUNNING --complete_step(last step)--> COMPLETED [finalize]
//! RUNNING --complete_step(next step gated)--> AWAITING_APPROVAL
//! RUNNING --complete_step(next step)--> RUNNING (pointer advances)
//! AWAITING_APPROVAL --approve--> RUNNING
//! AWAITING_APPROVAL --deny--> FAILED
//! RUNNING --pause--> RUNNING[paused]  --resume--> RUNNING
//! any non-terminal --stop--> CANCELLED
//! ```

pub mod definition;
pub mod engine;
pub mod finalize;
pub mod gate;
pub mod state;

pub use definition::{
    canonical_tier, DefinitionSource, ResolvedDefinition, WorkflowDefinition, YamlDefinitions,
};
pub use engine::{NewWorkflow, WorkflowEngine};
pub use finalize::{Finalizer, IssueFinalizer};
pub use gate::{approval_message, approval_request};
pub use state::{Advance, Step, StepStatus, Workflow, WorkflowMetadata, WorkflowState};
