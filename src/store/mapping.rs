use std::collections::BTreeMap;
use std::path::PathBuf;

use super::JsonMap;
use crate::Result;

/// Durable issue → workflow id mapping
#[derive(Debug, Clone)]
pub struct WorkflowMapping {
    map: JsonMap<String>,
}

impl WorkflowMapping {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            map: JsonMap::new(path),
        }
    }

    pub fn get(&self, issue: &str) -> Option<String> {
        self.map.get(issue)
    }

    pub fn set(&self, issue: &str, workflow_id: &str) -> Result<()> {
        self.map.insert(issue, workflow_id.to_string())
    }

    pub fn remove(&self, issue: &str) -> Result<Option<String>> {
        self.map.remove(issue)
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.map.load()
    }

    /// Reverse lookup
    pub fn issue_for_workflow(&self, workflow_id: &str) -> Option<String> {
        self.map
            .load()
            .into_iter()
            .find(|(_, id)| id == workflow_id)
            .map(|(issue, _)| issue)
    }
}
