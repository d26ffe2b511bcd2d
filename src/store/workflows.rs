use std::path::PathBuf;
use tracing::warn;

use super::write_json;
use crate::workflow::Workflow;
use crate::{Error, Result};

/// Workflow records, one JSON file per workflow id
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", workflow_id))
    }

    pub fn exists(&self, workflow_id: &str) -> bool {
        self.path(workflow_id).exists()
    }

    pub fn save(&self, workflow: &Workflow) -> Result<()> {
        write_json(&self.path(&workflow.id), workflow)
    }

    pub fn load(&self, workflow_id: &str) -> Result<Workflow> {
        let path = self.path(workflow_id);
        if !path.exists() {
            return Err(Error::UnknownWorkflow(workflow_id.to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn delete(&self, workflow_id: &str) -> bool {
        std::fs::remove_file(self.path(workflow_id)).is_ok()
    }

    /// All readable workflow records, newest update first
    pub fn list(&self) -> Vec<Workflow> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut workflows: Vec<Workflow> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| {
                let content = std::fs::read_to_string(&p).ok()?;
                match serde_json::from_str(&content) {
                    Ok(wf) => Some(wf),
                    Err(e) => {
                        warn!("Skipping unreadable workflow {}: {}", p.display(), e);
                        None
                    }
                }
            })
            .collect();

        workflows.sort_by(|a: &Workflow, b: &Workflow| b.updated_at.cmp(&a.updated_at));
        workflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Step, WorkflowMetadata};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_list_delete() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = Workflow::new(
            "core-1-full",
            "full",
            vec![Step::new(1, "triage", "Triage")],
            WorkflowMetadata::default(),
        );

        store.save(&wf).unwrap();
        assert!(store.exists("core-1-full"));
        assert_eq!(store.load("core-1-full").unwrap(), wf);
        assert_eq!(store.list().len(), 1);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("core-1-full.json")).unwrap())
                .unwrap();
        for field in ["id", "name", "state", "current_step", "steps"] {
            assert!(raw.get(field).is_some(), "missing {}", field);
        }

        assert!(store.delete("core-1-full"));
        assert!(matches!(store.load("core-1-full"), Err(Error::UnknownWorkflow(_))));
    }
}
