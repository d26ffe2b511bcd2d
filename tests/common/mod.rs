//! In-memory collaborators for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use nexus::config::ProjectConfig;
use nexus::launcher::{AgentLauncher, LaunchRequest, LaunchedAgent};
use nexus::notify::{Message, Notifier};
use nexus::orchestrator::Collaborators;
use nexus::process::ProcessProbe;
use nexus::store::LaunchMode;
use nexus::tracker::{Comment, Issue, IssueTracker};
use nexus::workflow::{DefinitionSource, Finalizer, ResolvedDefinition, Step};
use nexus::{Config, Error, Orchestrator, Result};

pub const REPO: &str = "acme/core";
pub const PROJECT: &str = "core";
pub const BOT: &str = "nexus-bot";

/// Triage → Design (approval by lead) → Implement
pub struct GatedDefinitions;

impl DefinitionSource for GatedDefinitions {
    fn load(&self, _project: &str, _tier: &str) -> Result<ResolvedDefinition> {
        Ok(ResolvedDefinition {
            name: "full".to_string(),
            steps: vec![
                Step::new(1, "triage", "Triage"),
                Step::new(2, "design", "Design").with_approval(&["lead"]),
                Step::new(3, "implement", "Implement"),
            ],
        })
    }
}

/// Triage → Implement without gates
pub struct PlainDefinitions;

impl DefinitionSource for PlainDefinitions {
    fn load(&self, _project: &str, _tier: &str) -> Result<ResolvedDefinition> {
        Ok(ResolvedDefinition {
            name: "shortened".to_string(),
            steps: vec![
                Step::new(1, "triage", "Triage"),
                Step::new(2, "implement", "Implement"),
            ],
        })
    }
}

#[derive(Default)]
pub struct FakeTracker {
    pub labels: Mutex<Vec<String>>,
    pub comments: Mutex<Vec<Comment>>,
    pub posted: Mutex<Vec<(String, String)>>,
    pub closed: Mutex<Vec<String>>,
}

impl FakeTracker {
    pub fn post(&self, id: &str, body: &str, at: DateTime<Utc>) {
        self.comments.lock().unwrap().push(Comment {
            id: id.to_string(),
            body: body.to_string(),
            author: "agent".to_string(),
            created_at: at,
        });
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn get_issue(&self, _repo: &str, issue: &str, with_comments: bool) -> Result<Issue> {
        Ok(Issue {
            number: issue.to_string(),
            title: format!("Issue {}", issue),
            body: "Something is broken".to_string(),
            state: "open".to_string(),
            labels: self.labels.lock().unwrap().clone(),
            comments: if with_comments {
                self.comments.lock().unwrap().clone()
            } else {
                Vec::new()
            },
        })
    }

    async fn add_comment(&self, _repo: &str, issue: &str, body: &str) -> Result<()> {
        self.posted
            .lock()
            .unwrap()
            .push((issue.to_string(), body.to_string()));
        Ok(())
    }

    async fn add_label(&self, _repo: &str, _issue: &str, _label: &str) -> Result<()> {
        Ok(())
    }

    async fn update_issue_body(&self, _repo: &str, _issue: &str, _body: &str) -> Result<()> {
        Ok(())
    }

    async fn close_issue(&self, _repo: &str, issue: &str) -> Result<()> {
        self.closed.lock().unwrap().push(issue.to_string());
        Ok(())
    }
}

/// Processes are a set of live pids
#[derive(Default)]
pub struct FakeProbe {
    pub alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn spawn(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn exit(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn signal(&self, pid: u32, _force: bool) -> bool {
        self.alive.lock().unwrap().remove(&pid)
    }
}

/// Hands out increasing pids and marks them alive
pub struct FakeLauncher {
    probe: Arc<FakeProbe>,
    next_pid: Mutex<u32>,
    pub fail: Mutex<bool>,
    pub launches: Mutex<Vec<(String, LaunchMode)>>,
}

impl FakeLauncher {
    pub fn new(probe: Arc<FakeProbe>) -> Self {
        Self {
            probe,
            next_pid: Mutex::new(1000),
            fail: Mutex::new(false),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn agents(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(agent, _)| agent.clone())
            .collect()
    }
}

#[async_trait]
impl AgentLauncher for FakeLauncher {
    async fn invoke_agent(&self, request: &LaunchRequest) -> Result<LaunchedAgent> {
        if *self.fail.lock().unwrap() {
            return Err(Error::NoToolAvailable("copilot: not found".to_string()));
        }
        let pid = {
            let mut next = self.next_pid.lock().unwrap();
            *next += 1;
            *next
        };
        self.probe.spawn(pid);
        self.launches
            .lock()
            .unwrap()
            .push((request.agent_type.clone(), request.mode));
        Ok(LaunchedAgent {
            pid,
            tool: "copilot".to_string(),
            log_file: request.log_dir.join(format!("copilot_{}.log", request.issue)),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier(pub Mutex<Vec<Message>>);

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|m| m.title.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &Message) -> bool {
        self.0.lock().unwrap().push(message.clone());
        true
    }
}

#[derive(Default)]
pub struct RecordingFinalizer(pub Mutex<Vec<(String, String, String, String)>>);

#[async_trait]
impl Finalizer for RecordingFinalizer {
    async fn finalize(&self, issue: &str, repo: &str, last_agent: &str, project: &str) -> Result<()> {
        self.0.lock().unwrap().push((
            issue.to_string(),
            repo.to_string(),
            last_agent.to_string(),
            project.to_string(),
        ));
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Orchestrator,
    pub tracker: Arc<FakeTracker>,
    pub probe: Arc<FakeProbe>,
    pub launcher: Arc<FakeLauncher>,
    pub notifier: Arc<RecordingNotifier>,
    pub finalizer: Arc<RecordingFinalizer>,
}

pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.join("data");
    config.github.bot_login = Some(BOT.to_string());
    config.default_project = Some(PROJECT.to_string());
    config.projects = HashMap::from([(
        PROJECT.to_string(),
        ProjectConfig {
            repo: REPO.to_string(),
            workspace: dir.to_path_buf(),
            agents_dir: None,
            workflow_definition: None,
            tool_preference: None,
        },
    )]);
    config
}

pub fn harness(definitions: Arc<dyn DefinitionSource>) -> Harness {
    let dir = TempDir::new().unwrap();
    let tracker = Arc::new(FakeTracker::default());
    let probe = Arc::new(FakeProbe::default());
    let launcher = Arc::new(FakeLauncher::new(probe.clone()));
    let notifier = Arc::new(RecordingNotifier::default());
    let finalizer = Arc::new(RecordingFinalizer::default());

    let orchestrator = Orchestrator::new(
        config(dir.path()),
        Collaborators {
            tracker: tracker.clone(),
            launcher: launcher.clone(),
            notifier: notifier.clone(),
            finalizer: finalizer.clone(),
            definitions,
            probe: probe.clone(),
        },
    );

    Harness {
        dir,
        orchestrator,
        tracker,
        probe,
        launcher,
        notifier,
        finalizer,
    }
}

impl Harness {
    pub fn data_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }

    /// Write an agent log for an issue, last modified `age` ago
    pub fn write_log(&self, issue: &str, content: &str, age: Duration) -> std::path::PathBuf {
        let dir = self.data_dir().join("logs").join(issue);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("copilot_{}_run.log", issue));
        std::fs::write(&path, content).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        path
    }

    pub fn running_pid(&self, issue: &str) -> u32 {
        self.orchestrator.registry().get(issue).unwrap().pid
    }
}

/// A GitHub `issue_comment` webhook body
pub fn comment_payload(issue: u64, id: u64, author: &str, body: &str, at: DateTime<Utc>) -> String {
    serde_json::json!({
        "action": "created",
        "issue": { "number": issue },
        "comment": {
            "id": id,
            "body": body,
            "user": { "login": author },
            "created_at": at.to_rfc3339(),
        },
        "repository": { "full_name": REPO },
    })
    .to_string()
}
