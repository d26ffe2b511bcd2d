//! Launch, sweep and webhook behavior of the orchestrator

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use common::{comment_payload, harness, Harness, PlainDefinitions, BOT};
use nexus::guard::Denial;
use nexus::signal::SignalSource;
use nexus::store::{CompletionMarker, LaunchMode};
use nexus::{Error, EventType, TriggerOutcome, WorkflowState};

async fn started(issue: &str) -> Harness {
    let h = harness(Arc::new(PlainDefinitions));
    h.orchestrator.create_workflow(issue, None, None).await.unwrap();
    let outcome = h.orchestrator.start_issue(issue).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { .. }));
    h
}

fn events(h: &Harness, issue: &str) -> Vec<EventType> {
    h.orchestrator
        .audit_history(issue, 200)
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_second_launch_is_skipped() {
    let h = started("1").await;
    let outcome = h
        .orchestrator
        .launch_next("1", None, LaunchMode::Initial)
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Skipped(Denial::Cooldown { .. })));
    assert_eq!(h.launcher.agents(), vec!["Triage"]);

    let entry = h.orchestrator.registry().get("1").unwrap();
    assert_eq!(entry.agent_type, "Triage");
    assert_eq!(entry.tier, "full");
    assert_eq!(entry.mode, LaunchMode::Initial);
}

#[tokio::test]
async fn test_tier_from_labels() {
    let h = harness(Arc::new(PlainDefinitions));
    *h.tracker.labels.lock().unwrap() = vec!["bug".to_string()];
    let id = h.orchestrator.create_workflow("2", None, None).await.unwrap();
    assert_eq!(id, "core-2-shortened");

    // An active workflow cannot be created twice
    assert!(matches!(
        h.orchestrator.create_workflow("2", None, None).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_no_tool_available_waits_for_operator() {
    let h = harness(Arc::new(PlainDefinitions));
    *h.launcher.fail.lock().unwrap() = true;
    h.orchestrator.create_workflow("3", None, None).await.unwrap();

    let outcome = h.orchestrator.start_issue("3").await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::LaunchFailed(_)));
    assert!(events(&h, "3").contains(&EventType::AgentLaunchFailed));
    assert!(h.notifier.titles().contains(&"Agent launch failed".to_string()));
    assert!(h.orchestrator.registry().get("3").is_none());

    // The poll does not retry on its own
    *h.launcher.fail.lock().unwrap() = false;
    assert!(h.orchestrator.launch_pending().await.is_empty());

    let outcome = h.orchestrator.continue_issue("3", None).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { .. }));
    assert_eq!(h.launcher.launches.lock().unwrap()[0].1, LaunchMode::Continuation);
}

#[tokio::test]
async fn test_continue_rejects_other_agent() {
    let h = started("4").await;
    h.probe.exit(h.running_pid("4"));
    let err = h
        .orchestrator
        .continue_issue("4", Some("@implement"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentMismatch { .. }));

    // Matching names are normalized
    let h2 = harness(Arc::new(PlainDefinitions));
    h2.orchestrator.create_workflow("4", None, None).await.unwrap();
    h2.orchestrator
        .engine()
        .start_workflow("core-4-full")
        .await
        .unwrap();
    let outcome = h2
        .orchestrator
        .continue_issue("4", Some("`@triage`"))
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { .. }));
}

#[tokio::test]
async fn test_webhook_filters() {
    let h = started("5").await;
    let at = Utc::now() + ChronoDuration::seconds(1);
    let body = "Step 1 complete by @Triage. Ready for @Implement";

    let edited = comment_payload(5, 10, "someone", body, at).replace("\"created\"", "\"edited\"");
    assert!(matches!(
        h.orchestrator.handle_issue_comment(&edited).await.unwrap(),
        TriggerOutcome::Ignored(_)
    ));

    let by_bot = comment_payload(5, 11, BOT, body, at);
    assert!(matches!(
        h.orchestrator.handle_issue_comment(&by_bot).await.unwrap(),
        TriggerOutcome::Ignored(_)
    ));

    let chatter = comment_payload(5, 12, "someone", "Looks good to me", at);
    assert!(matches!(
        h.orchestrator.handle_issue_comment(&chatter).await.unwrap(),
        TriggerOutcome::Ignored(_)
    ));

    let signal = comment_payload(5, 13, "someone", body, at);
    let outcome = h.orchestrator.handle_issue_comment(&signal).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Implement"));

    // Redelivery of the same comment
    assert!(matches!(
        h.orchestrator.handle_issue_comment(&signal).await.unwrap(),
        TriggerOutcome::Ignored(_)
    ));
    assert_eq!(h.launcher.agents(), vec!["Triage", "Implement"]);
}

#[tokio::test]
async fn test_stale_agent_signal_is_rejected() {
    let h = started("6").await;
    let at = Utc::now() + ChronoDuration::seconds(1);
    let payload = comment_payload(6, 20, "someone", "Step 2 complete by @Implement. Workflow complete", at);

    let err = h.orchestrator.handle_issue_comment(&payload).await.unwrap_err();
    assert!(matches!(err, Error::AgentMismatch { .. }));
    let wf = h.orchestrator.engine().workflow_for_issue("6").unwrap();
    assert_eq!(wf.current_step, 1);
    assert_eq!(wf.state, WorkflowState::Running);

    // The rejected signal leaves no marker behind to misroute the next launch
    assert!(h.orchestrator.markers().read("6").is_none());
    h.probe.exit(h.running_pid("6"));
    let outcome = h.orchestrator.continue_issue("6", None).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Triage"));
}

#[tokio::test]
async fn test_wrong_agent_comment_keeps_routing() {
    let h = started("50").await;
    let at = Utc::now() + ChronoDuration::seconds(1);
    let payload = comment_payload(
        50,
        30,
        "someone",
        "Step 1 complete by @Design. Ready for @Implement",
        at,
    );

    let err = h.orchestrator.handle_issue_comment(&payload).await.unwrap_err();
    assert!(matches!(
        err,
        Error::AgentMismatch { ref expected, ref actual, .. } if expected == "Triage" && actual == "Design"
    ));
    assert!(h.orchestrator.markers().read("50").is_none());

    h.probe.exit(h.running_pid("50"));
    let outcome = h.orchestrator.continue_issue("50", None).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Triage"));

    // Later sweeps launch nothing extra and raise no routing errors
    assert!(h.orchestrator.launch_pending().await.is_empty());
    assert_eq!(h.launcher.agents(), vec!["Triage", "Triage"]);
}

#[tokio::test]
async fn test_step_heading_comment_does_not_advance() {
    let h = started("51").await;
    let at = Utc::now() + ChronoDuration::seconds(1);
    let payload = comment_payload(
        51,
        31,
        "alice",
        "Step 1: I can reproduce this on main, logs attached.",
        at,
    );

    let outcome = h.orchestrator.handle_issue_comment(&payload).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Ignored(_)));

    let wf = h.orchestrator.engine().workflow_for_issue("51").unwrap();
    assert_eq!(wf.current_step, 1);
    assert_eq!(h.launcher.agents(), vec!["Triage"]);
    assert!(h.orchestrator.markers().read("51").is_none());
}

#[tokio::test]
async fn test_busy_issue_skips_before_routing() {
    let h = started("52").await;
    // A marker routing elsewhere, e.g. written by hand
    h.orchestrator.markers().write(&CompletionMarker {
        issue_number: "52".to_string(),
        agent_type: Some("Triage".to_string()),
        step_num: Some(1),
        next_agent: Some("Implement".to_string()),
        is_workflow_done: false,
        source: SignalSource::Log,
        timestamp: Utc::now(),
    });

    let outcome = h
        .orchestrator
        .launch_next("52", None, LaunchMode::Initial)
        .await
        .unwrap();
    assert!(matches!(outcome, TriggerOutcome::Skipped(Denial::Cooldown { .. })));

    // Once the issue is free, the routing disagreement surfaces
    h.probe.exit(h.running_pid("52"));
    h.orchestrator.guard().clear("52");
    assert!(matches!(
        h.orchestrator.launch_next("52", None, LaunchMode::Initial).await,
        Err(Error::AgentMismatch { .. })
    ));
}

#[tokio::test]
async fn test_forget_drops_seen_comments() {
    let h = started("53").await;
    let body = "Step 1 complete by @Triage. Ready for @Implement";
    let payload = comment_payload(53, 40, "someone", body, Utc::now() + ChronoDuration::seconds(1));
    h.orchestrator.handle_issue_comment(&payload).await.unwrap();

    h.orchestrator.forget_issue("53").await.unwrap();
    h.orchestrator.create_workflow("53", None, None).await.unwrap();
    h.orchestrator.start_issue("53").await.unwrap();

    // The new workflow has no memory of the old comment id
    let outcome = h.orchestrator.handle_issue_comment(&payload).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Implement"));
}

#[tokio::test]
async fn test_stuck_agent_killed_and_retried() {
    let h = started("7").await;
    let pid = h.running_pid("7");
    h.write_log("7", "thinking...", Duration::from_secs(20 * 60));

    let report = h.orchestrator.sweep_stuck_agents().await;
    assert_eq!(report.killed, 1);
    assert_eq!(report.retried, 1);
    assert!(!h.probe.alive.lock().unwrap().contains(&pid));

    let launches = h.launcher.launches.lock().unwrap().clone();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1], ("Triage".to_string(), LaunchMode::Continuation));
    assert_ne!(h.running_pid("7"), pid);

    let events = events(&h, "7");
    assert!(events.contains(&EventType::AgentTimeoutKill));
    assert!(events.contains(&EventType::AgentRetry));
}

#[tokio::test]
async fn test_retries_exhausted_leave_workflow_running() {
    let h = started("8").await;
    h.write_log("8", "thinking...", Duration::from_secs(20 * 60));

    for _ in 0..2 {
        let report = h.orchestrator.sweep_stuck_agents().await;
        assert_eq!(report.retried, 1);
    }
    let report = h.orchestrator.sweep_stuck_agents().await;
    assert_eq!(report.killed, 1);
    assert_eq!(report.failed, 1);

    assert!(h.orchestrator.registry().get("8").is_none());
    assert!(h.notifier.titles().contains(&"Agent failed".to_string()));
    assert!(events(&h, "8").contains(&EventType::AgentFailed));

    let wf = h.orchestrator.engine().workflow_for_issue("8").unwrap();
    assert_eq!(wf.state, WorkflowState::Running);
    assert!(h.orchestrator.launch_pending().await.is_empty());
    assert_eq!(h.launcher.agents().len(), 3);
}

#[tokio::test]
async fn test_dead_agent_detected_once() {
    let h = started("9").await;
    let pid = h.running_pid("9");
    h.probe.exit(pid);

    let later = Utc::now() + ChronoDuration::minutes(20);
    let report = h.orchestrator.sweep_stuck_agents_at(later).await;
    assert_eq!(report.dead, 1);
    assert_eq!(report.retried, 1);
    assert!(events(&h, "9").contains(&EventType::AgentDead));

    // The relaunched agent is alive and young
    let report = h.orchestrator.sweep_stuck_agents().await;
    assert_eq!(report.dead, 0);
    assert_eq!(
        h.notifier
            .titles()
            .iter()
            .filter(|t| *t == "Agent exited without completing")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_log_completion_then_pending_launch() {
    let h = started("10").await;
    let pid = h.running_pid("10");
    let log = h.write_log(
        "10",
        "done.\n## Step 1 Complete by @Triage\nReady for @Implement\n",
        Duration::from_secs(5),
    );

    // Still running: nothing is read
    assert!(h.orchestrator.scan_log_completions().await.is_empty());

    h.probe.exit(pid);
    let results = h.orchestrator.scan_log_completions().await;
    assert_eq!(results.len(), 1);
    // The finished agent's log is too fresh for an immediate launch
    assert!(matches!(
        results[0].1,
        Ok(TriggerOutcome::Skipped(Denial::RecentLogActivity { .. }))
    ));
    assert_eq!(
        h.orchestrator.engine().workflow_for_issue("10").unwrap().current_step,
        2
    );

    std::fs::File::options()
        .write(true)
        .open(&log)
        .unwrap()
        .set_modified(std::time::SystemTime::now() - Duration::from_secs(600))
        .unwrap();
    let launched = h.orchestrator.launch_pending().await;
    assert_eq!(launched.len(), 1);
    assert!(matches!(launched[0].1, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Implement"));
}

#[tokio::test]
async fn test_pause_blocks_then_resume_launches() {
    let h = started("11").await;
    h.orchestrator.pause_issue("11", "waiting on infra").unwrap();

    let outcome = h
        .orchestrator
        .complete_step("11", "Triage", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(outcome, TriggerOutcome::Paused);
    assert!(h.orchestrator.launch_pending().await.is_empty());

    let outcome = h.orchestrator.resume_issue("11").await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Implement"));
}

#[tokio::test]
async fn test_stop_kills_and_closes() {
    let h = started("12").await;
    let pid = h.running_pid("12");

    let wf = h.orchestrator.stop_issue("12", "duplicate").await.unwrap();
    assert_eq!(wf.state, WorkflowState::Cancelled);
    assert!(!h.probe.alive.lock().unwrap().contains(&pid));
    assert!(h.orchestrator.registry().get("12").is_none());
    assert_eq!(*h.tracker.closed.lock().unwrap(), vec!["12".to_string()]);
    assert!(h.tracker.posted.lock().unwrap()[0].1.contains("duplicate"));

    assert!(matches!(
        h.orchestrator.launch_next("12", None, LaunchMode::Initial).await.unwrap(),
        TriggerOutcome::Finished(WorkflowState::Cancelled)
    ));
}

#[tokio::test]
async fn test_forget_keeps_audit() {
    let h = started("13").await;
    assert_eq!(
        h.orchestrator.forget_issue("13").await.unwrap().as_deref(),
        Some("core-13-full")
    );
    assert!(h.orchestrator.engine().find_workflow_for_issue("13").is_none());
    assert!(h.orchestrator.registry().get("13").is_none());
    assert!(matches!(h.orchestrator.status("13"), Err(Error::NoWorkflow(_))));
    assert!(events(&h, "13").contains(&EventType::AgentLaunched));
}

#[tokio::test]
async fn test_reset_then_continue() {
    let h = started("14").await;
    h.orchestrator
        .complete_step("14", "Triage", serde_json::json!({}))
        .await
        .unwrap();
    // @Implement is running now; it exits before the operator steps back
    h.probe.exit(h.running_pid("14"));

    let wf = h.orchestrator.reset_issue("14", "triage").unwrap();
    assert_eq!(wf.current_step, 1);

    let outcome = h.orchestrator.continue_issue("14", Some("Triage")).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Launched { ref agent_type, .. } if agent_type == "Triage"));
}

#[tokio::test]
async fn test_snapshot_and_reconcile() {
    let h = started("15").await;
    let t0 = Utc::now() + ChronoDuration::seconds(1);
    h.tracker.post("c1", "Step 1 complete by @Triage\nReady for @Implement", t0);

    let snapshot = h.orchestrator.snapshot("15").await.unwrap();
    assert_eq!(snapshot.current_agent.as_deref(), Some("Triage"));
    assert!(snapshot.process_running);
    assert!(snapshot.comment_signal.is_some());
    assert!(!snapshot.has_drift());

    let report = h.orchestrator.reconcile("15").await.unwrap();
    assert_eq!(report.signals_applied, 1);
    assert_eq!(report.current_agent.as_deref(), Some("Implement"));
    assert_eq!(
        h.orchestrator.markers().read("15").unwrap().next_agent.as_deref(),
        Some("Implement")
    );
}
