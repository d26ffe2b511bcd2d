use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::JsonMap;
use crate::Result;

/// An approval gate waiting on a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step_num: usize,
    pub step_name: String,
    pub approvers: Vec<String>,
    /// Seconds
    pub approval_timeout: u64,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.requested_at + chrono::Duration::seconds(self.approval_timeout as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Approval gate state: issue → pending approval
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    map: JsonMap<PendingApproval>,
}

impl ApprovalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            map: JsonMap::new(path),
        }
    }

    pub fn get(&self, issue: &str) -> Option<PendingApproval> {
        self.map.get(issue)
    }

    pub fn set(&self, issue: &str, approval: PendingApproval) -> Result<()> {
        self.map.insert(issue, approval)
    }

    pub fn clear(&self, issue: &str) -> Result<Option<PendingApproval>> {
        self.map.remove(issue)
    }
}
