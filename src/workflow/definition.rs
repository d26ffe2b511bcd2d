//! Workflow definition parsing
//!
//! A definition file lists the steps of each tier:
//!
//! ```yaml
//! name: Standard delivery
//! tiers:
//!   full:
//!     steps:
//!       - name: triage
//!         agent_type: Triage
//!       - name: design
//!         agent_type: Design
//!         approval_required: true
//!         approvers: [lead]
//!       - name: implement
//!         agent_type: Implement
//!   fast-track:
//!     steps:
//!       - name: implement
//!         agent_type: Implement
//! ```
//!
//! A file with a top-level `steps:` list serves every tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::state::{Step, DEFAULT_APPROVAL_TIMEOUT};
use crate::config::{expand_path, Config};
use crate::{Error, Result};

/// Parsed definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Steps shared by every tier
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Per-tier step lists
    #[serde(default)]
    pub tiers: HashMap<String, TierDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout: u64,
}

fn default_approval_timeout() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT
}

impl StepDefinition {
    fn to_step(&self, step_num: usize) -> Step {
        let mut step = Step::new(step_num, &self.name, &self.agent_type);
        step.description = self.description.clone();
        step.approval_required = self.approval_required;
        step.approvers = self.approvers.clone();
        step.approval_timeout = self.approval_timeout;
        step
    }
}

/// Steps and display name resolved for one tier
#[derive(Debug, Clone)]
pub struct ResolvedDefinition {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Map tier aliases onto the canonical tier names
pub fn canonical_tier(tier: &str) -> String {
    let lowered = tier.trim().to_lowercase().replace('_', "-");
    match lowered.as_str() {
        "tier-1-simple" | "simple" | "fast" => "fast-track".to_string(),
        "tier-2-standard" | "standard" | "short" => "shortened".to_string(),
        "tier-3-complex" | "tier-4-critical" | "complex" | "critical" => "full".to_string(),
        _ => lowered,
    }
}

impl WorkflowDefinition {
    /// Load a definition from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Workflow definition not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a definition from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the step list for a tier
    pub fn resolve(&self, tier: &str) -> Result<ResolvedDefinition> {
        let tier = canonical_tier(tier);

        let (name, defs) = if self.tiers.is_empty() {
            (self.name.clone(), &self.steps)
        } else {
            let tier_def = self.tiers.get(&tier).ok_or_else(|| {
                let mut known: Vec<_> = self.tiers.keys().cloned().collect();
                known.sort();
                Error::Config(format!(
                    "Tier '{}' is not defined (available: {})",
                    tier,
                    known.join(", ")
                ))
            })?;
            let name = tier_def
                .name
                .clone()
                .unwrap_or_else(|| format!("{} ({})", self.name, tier));
            (name, &tier_def.steps)
        };

        if defs.is_empty() {
            return Err(Error::Config(format!("Tier '{}' has no steps", tier)));
        }

        Ok(ResolvedDefinition {
            name,
            steps: defs
                .iter()
                .enumerate()
                .map(|(idx, def)| def.to_step(idx + 1))
                .collect(),
        })
    }
}

/// Source of step sequences for new workflows
pub trait DefinitionSource: Send + Sync {
    fn load(&self, project: &str, tier: &str) -> Result<ResolvedDefinition>;
}

/// Definitions read from each project's configured YAML file
pub struct YamlDefinitions {
    paths: HashMap<String, Option<PathBuf>>,
}

impl YamlDefinitions {
    pub fn from_config(config: &Config) -> Self {
        let paths = config
            .projects
            .iter()
            .map(|(name, project)| {
                (
                    name.clone(),
                    project.workflow_definition.as_deref().map(expand_path),
                )
            })
            .collect();
        Self { paths }
    }
}

impl DefinitionSource for YamlDefinitions {
    fn load(&self, project: &str, tier: &str) -> Result<ResolvedDefinition> {
        let path = self
            .paths
            .get(project)
            .ok_or_else(|| Error::Config(format!("Unknown project: {}", project)))?
            .as_ref()
            .ok_or_else(|| {
                Error::Config(format!(
                    "No workflow definition configured for project {}",
                    project
                ))
            })?;

        WorkflowDefinition::load(path)?.resolve(tier)
    }
}
