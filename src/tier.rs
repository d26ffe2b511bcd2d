//! Workflow tier selection from issue labels

/// Tier used when no label says otherwise
pub const DEFAULT_TIER: &str = "full";

const FAST_TRACK_LABELS: &[&str] = &["critical", "hotfix", "urgent"];
const SHORTENED_LABELS: &[&str] = &["bug", "fix"];
const FULL_LABELS: &[&str] = &["feature", "enhancement", "improvement"];

/// Pick a tier for an issue.
///
/// An explicit `workflow:<tier>` label wins; otherwise severity labels map to
/// fast-track, bug labels to shortened and feature labels to full.
pub fn detect_workflow_tier(labels: &[String]) -> String {
    let labels: Vec<String> = labels.iter().map(|l| l.trim().to_lowercase()).collect();

    if let Some(explicit) = labels
        .iter()
        .find_map(|l| l.strip_prefix("workflow:"))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return explicit.to_string();
    }

    let has_any = |set: &[&str]| labels.iter().any(|l| set.contains(&l.as_str()));

    if has_any(FAST_TRACK_LABELS) {
        "fast-track".to_string()
    } else if has_any(SHORTENED_LABELS) {
        "shortened".to_string()
    } else if has_any(FULL_LABELS) {
        "full".to_string()
    } else {
        DEFAULT_TIER.to_string()
    }
}
