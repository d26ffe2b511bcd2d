use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::JsonMap;
use crate::Result;

/// How an agent was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// First launch for a step
    Initial,
    /// Relaunch after a stall, or an operator continue
    Continuation,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Initial => write!(f, "initial"),
            LaunchMode::Continuation => write!(f, "continuation"),
        }
    }
}

/// Last launch recorded for an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchEntry {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub tier: String,
    pub mode: LaunchMode,
    pub tool: String,
    pub agent_type: String,
}

impl LaunchEntry {
    /// Whether the launch happened within `window` of `now`
    pub fn is_recent(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        match age.to_std() {
            Ok(age) => age < window,
            // Timestamp in the future: treat as just launched
            Err(_) => true,
        }
    }
}

/// Launched-agent registry: issue → last launch
#[derive(Debug, Clone)]
pub struct LaunchRegistry {
    map: JsonMap<LaunchEntry>,
}

impl LaunchRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            map: JsonMap::new(path),
        }
    }

    pub fn record(&self, issue: &str, entry: LaunchEntry) -> Result<()> {
        self.map.insert(issue, entry)
    }

    /// Entry regardless of age
    pub fn get(&self, issue: &str) -> Option<LaunchEntry> {
        self.map.get(issue)
    }

    /// Entry only if it falls inside the recency window
    pub fn recent(&self, issue: &str, window: Duration, now: DateTime<Utc>) -> Option<LaunchEntry> {
        self.get(issue).filter(|e| e.is_recent(window, now))
    }

    /// Tier of the last launch. Ignores the recency window so a slow agent
    /// keeps its classification.
    pub fn tier(&self, issue: &str) -> Option<String> {
        self.get(issue).map(|e| e.tier)
    }

    pub fn remove(&self, issue: &str) -> Result<Option<LaunchEntry>> {
        self.map.remove(issue)
    }

    pub fn entries(&self) -> Vec<(String, LaunchEntry)> {
        self.map.load().into_iter().collect()
    }
}
