//! Completion signal extraction
//!
//! Agents announce the end of their step in free text, either in their log
//! output or in an issue comment:
//!
//! ```text
//! ## Step 2 Complete by @Design
//! Ready for @Implement
//! ```
//!
//! [`extract`] turns such text into a [`CompletionSignal`]. The routing part
//! is a tagged [`Handoff`] so "no next agent" and "workflow done" stay
//! distinct from a literal agent name.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::tracker::Comment;

/// Where a signal was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Agent log file
    Log,
    /// Issue comment
    Comment,
}

/// What should happen after the step that produced the signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Nothing routable: no next agent named, or a sentinel such as `@none`
    NoSignal,
    /// Hand over to the named agent
    NextAgent(String),
    /// The chain is finished
    WorkflowDone,
}

/// A parsed completion marker
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSignal {
    /// Agent that just finished ("by @X")
    pub agent_type: Option<String>,
    /// Step number the agent reported
    pub step_num: Option<usize>,
    pub handoff: Handoff,
    pub source: SignalSource,
    /// Log modification time or comment creation time
    pub timestamp: DateTime<Utc>,
    /// Comment id for comment signals
    pub comment_id: Option<String>,
}

impl CompletionSignal {
    pub fn next_agent(&self) -> Option<&str> {
        match &self.handoff {
            Handoff::NextAgent(agent) => Some(agent),
            _ => None,
        }
    }

    pub fn is_workflow_done(&self) -> bool {
        matches!(self.handoff, Handoff::WorkflowDone)
    }
}

/// Values that mean "no next agent" when they appear where an agent name is expected
const SENTINELS: &[&str] = &[
    "", "none", "n/a", "na", "null", "no", "done", "end", "finish", "finished", "complete",
];

fn ready_for_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bready\s+for\s+`?@([\w/-]*)").expect("valid regex"))
}

fn next_agent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bnext\s+agent\s*:\s*\**\s*`?@?([\w/-]*)").expect("valid regex")
    })
}

fn terminal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(workflow\s+(?:is\s+)?complete(?:d)?|ready\s+for\s+review|ready\s+to\s+merge|implementation\s+complete(?:d)?|all\s+steps\s+(?:are\s+)?complete(?:d)?)\b",
        )
        .expect("valid regex")
    })
}

fn step_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bstep\s+(\d+)\s*(:|complete)").expect("valid regex"))
}

fn finished_by_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:by|for)\s+`?@([\w-]+)").expect("valid regex"))
}

/// Strip whitespace, backticks and a leading `@` from an agent reference,
/// keeping its case.
pub fn clean_agent_reference(raw: &str) -> String {
    raw.trim()
        .trim_matches('`')
        .trim()
        .trim_start_matches('@')
        .trim()
        .to_string()
}

/// Whether an agent reference is a "no next agent" sentinel
pub fn is_sentinel(raw: &str) -> bool {
    let cleaned = clean_agent_reference(raw).to_lowercase();
    SENTINELS.contains(&cleaned.as_str())
}

/// Normalize a next-agent reference, mapping sentinels to `None`
pub fn normalize_next_agent(raw: &str) -> Option<String> {
    if is_sentinel(raw) {
        None
    } else {
        Some(clean_agent_reference(raw))
    }
}

/// First "by @X" / "for @X" that is not part of "Ready for @X"
fn finished_agent(text: &str) -> Option<String> {
    finished_by_re().captures_iter(text).find_map(|caps| {
        let whole = caps.get(0)?;
        let before = text[..whole.start()].trim_end().to_lowercase();
        if before.ends_with("ready") {
            return None;
        }
        let agent = clean_agent_reference(caps.get(1)?.as_str());
        (!is_sentinel(&agent)).then_some(agent)
    })
}

/// Parse a block of text into at most one completion signal.
///
/// Returns `None` unless the text carries a routing marker (ready-for, next
/// agent), a terminal phrase or an explicit "Step N Complete". A bare
/// "Step N:" heading only supplies the step number.
pub fn extract(text: &str, source: SignalSource, timestamp: DateTime<Utc>) -> Option<CompletionSignal> {
    let next_raw = ready_for_re()
        .captures(text)
        .or_else(|| next_agent_re().captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    // (number, "Step N Complete") for every step marker; a completion wins over a heading
    let steps: Vec<(Option<usize>, bool)> = step_re()
        .captures_iter(text)
        .map(|caps| {
            let num = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
            let complete = caps
                .get(2)
                .is_some_and(|m| m.as_str().eq_ignore_ascii_case("complete"));
            (num, complete)
        })
        .collect();
    let step_complete = steps.iter().any(|(_, complete)| *complete);
    let step_num = steps
        .iter()
        .find(|(_, complete)| *complete)
        .or_else(|| steps.first())
        .and_then(|(num, _)| *num);

    let terminal = terminal_re().is_match(text);

    if next_raw.is_none() && !terminal && !step_complete {
        return None;
    }

    let handoff = match next_raw.as_deref().and_then(normalize_next_agent) {
        Some(agent) => Handoff::NextAgent(agent),
        None if terminal => Handoff::WorkflowDone,
        None => Handoff::NoSignal,
    };

    Some(CompletionSignal {
        agent_type: finished_agent(text),
        step_num,
        handoff,
        source,
        timestamp,
        comment_id: None,
    })
}

/// Extract every signal from a list of comments, oldest first
pub fn extract_from_comments(comments: &[Comment]) -> Vec<CompletionSignal> {
    let mut signals: Vec<CompletionSignal> = comments
        .iter()
        .filter_map(|comment| {
            extract(&comment.body, SignalSource::Comment, comment.created_at).map(|mut s| {
                s.comment_id = Some(comment.id.clone());
                s
            })
        })
        .collect();
    signals.sort_by_key(|s| s.timestamp);
    signals
}

/// Most recent signal by timestamp
pub fn latest(signals: &[CompletionSignal]) -> Option<&CompletionSignal> {
    signals.iter().max_by_key(|s| s.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Option<CompletionSignal> {
        extract(text, SignalSource::Comment, Utc::now())
    }

    #[test]
    fn test_ready_for_agent() {
        let signal = parse("## Step 2 Complete by @Design\n\nReady for @Implement").unwrap();
        assert_eq!(signal.next_agent(), Some("Implement"));
        assert_eq!(signal.agent_type.as_deref(), Some("Design"));
        assert_eq!(signal.step_num, Some(2));
        assert!(!signal.is_workflow_done());
    }

    #[test]
    fn test_case_insensitive() {
        let signal = parse("READY FOR @triage").unwrap();
        assert_eq!(signal.next_agent(), Some("triage"));
        assert!(signal.agent_type.is_none());
    }

    #[test]
    fn test_next_agent_field() {
        let signal = parse("Step 1: triage done\nNext agent: `@Design`").unwrap();
        assert_eq!(signal.next_agent(), Some("Design"));
        assert_eq!(signal.step_num, Some(1));
    }

    #[test]
    fn test_sentinels_are_not_agents() {
        for text in ["Ready for @none", "Next agent: N/A", "Next agent: null", "Ready for @"] {
            let signal = parse(text).unwrap();
            assert_eq!(signal.handoff, Handoff::NoSignal, "{}", text);
            assert_eq!(signal.next_agent(), None);
            assert!(!signal.is_workflow_done());
        }
    }

    #[test]
    fn test_terminal_phrases() {
        for text in [
            "Workflow complete.",
            "PR is ready for review",
            "This is ready to merge",
            "Implementation complete by @Implement",
            "All steps completed",
        ] {
            let signal = parse(text).unwrap();
            assert!(signal.is_workflow_done(), "{}", text);
        }
    }

    #[test]
    fn test_next_agent_beats_terminal_phrase() {
        let signal = parse("Implementation complete. Ready for @Review").unwrap();
        assert_eq!(signal.next_agent(), Some("Review"));
    }

    #[test]
    fn test_no_signal_in_plain_text() {
        assert!(parse("Looks good to me, thanks @alice").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn test_step_heading_alone_is_not_a_signal() {
        assert!(parse("Step 1: I can reproduce this on main, logs attached.").is_none());
        assert!(parse("See step 2: the migration fails").is_none());
    }

    #[test]
    fn test_step_complete_is_a_signal() {
        let signal = parse("Step 3 complete by @Implement").unwrap();
        assert_eq!(signal.step_num, Some(3));
        assert_eq!(signal.agent_type.as_deref(), Some("Implement"));
        assert_eq!(signal.handoff, Handoff::NoSignal);
    }

    #[test]
    fn test_ready_for_is_not_finished_by() {
        let signal = parse("Done for @Triage. Ready for @Design").unwrap();
        assert_eq!(signal.agent_type.as_deref(), Some("Triage"));
        assert_eq!(signal.next_agent(), Some("Design"));
    }

    #[test]
    fn test_latest_picks_newest_not_first() {
        let old = Utc::now() - chrono::Duration::minutes(5);
        let new = Utc::now();
        let signals = vec![
            extract("Ready for @Implement", SignalSource::Comment, new).unwrap(),
            extract("Ready for @Design", SignalSource::Comment, old).unwrap(),
        ];
        assert_eq!(latest(&signals).unwrap().next_agent(), Some("Implement"));
    }

    #[test]
    fn test_extract_from_comments_sorted() {
        let base = Utc::now();
        let comment = |id: &str, body: &str, offset: i64| Comment {
            id: id.to_string(),
            body: body.to_string(),
            author: "bot".to_string(),
            created_at: base + chrono::Duration::seconds(offset),
        };
        let comments = vec![
            comment("3", "Step 3 complete by @C. Ready for @D", 30),
            comment("1", "Step 1 complete by @A. Ready for @B", 10),
            comment("x", "unrelated chatter", 15),
            comment("2", "Step 2 complete by @B. Ready for @C", 20),
        ];

        let signals = extract_from_comments(&comments);
        let ids: Vec<_> = signals.iter().filter_map(|s| s.comment_id.as_deref()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
