//! Flat-file persistence
//!
//! Every store here is a whole-file JSON document that is read, mutated and
//! written back. There is no locking: concurrent writers (an operator command
//! racing the background sweep) resolve as last-writer-wins.

mod approvals;
mod mapping;
mod markers;
mod registry;
mod workflows;

pub use approvals::{ApprovalStore, PendingApproval};
pub use mapping::WorkflowMapping;
pub use markers::{CompletionMarker, CompletionMarkers};
pub use registry::{LaunchEntry, LaunchMode, LaunchRegistry};
pub use workflows::WorkflowStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::Result;

/// Layout of the data directory
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mapping_file(&self) -> PathBuf {
        self.root.join("workflow_mapping.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("launched_agents.json")
    }

    pub fn approvals_file(&self) -> PathBuf {
        self.root.join("approval_state.json")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn completions_dir(&self) -> PathBuf {
        self.root.join("completions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-issue agent log directory
    pub fn issue_logs_dir(&self, issue: &str) -> PathBuf {
        self.logs_dir().join(issue)
    }
}

/// A JSON object on disk mapping string keys to values
#[derive(Debug, Clone)]
pub struct JsonMap<V> {
    path: PathBuf,
    _value: PhantomData<V>,
}

impl<V> JsonMap<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole map. Missing files are empty; unreadable ones are
    /// logged and treated as empty.
    pub fn load(&self) -> BTreeMap<String, V> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };

        if content.trim().is_empty() {
            return BTreeMap::new();
        }

        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!("Failed to parse {}: {}", self.path.display(), e);
                BTreeMap::new()
            }
        }
    }

    /// Write the whole map
    pub fn save(&self, map: &BTreeMap<String, V>) -> Result<()> {
        write_json(&self.path, map)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.load().remove(key)
    }

    pub fn insert(&self, key: &str, value: V) -> Result<()> {
        let mut map = self.load();
        map.insert(key.to_string(), value);
        self.save(&map)
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        let mut map = self.load();
        let removed = map.remove(key);
        if removed.is_some() {
            self.save(&map)?;
        }
        Ok(removed)
    }
}

/// Serialize `value` to `path`, replacing the file in one rename
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
