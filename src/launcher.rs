//! Agent process launcher
//!
//! Starts an external AI coding agent for one workflow step. Launches are
//! fire-and-forget: the child is spawned with its output redirected to a log
//! file and is never awaited.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, info, warn};

use crate::config::ToolConfig;
use crate::store::LaunchMode;
use crate::{Error, Result};

/// Everything a launcher needs to start an agent
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub issue: String,
    pub agent_type: String,
    pub prompt: String,
    pub workspace_dir: PathBuf,
    pub agents_dir: Option<PathBuf>,
    pub issue_url: String,
    pub tool_preference: Option<String>,
    /// Directory the agent's log file goes into
    pub log_dir: PathBuf,
    pub mode: LaunchMode,
}

/// A started agent process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedAgent {
    pub pid: u32,
    pub tool: String,
    pub log_file: PathBuf,
}

/// Starts agent processes.
///
/// Fails with [`Error::NoToolAvailable`] when no configured tool could be started.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn invoke_agent(&self, request: &LaunchRequest) -> Result<LaunchedAgent>;
}

/// Launches the command-line tools listed in the configuration
pub struct CliLauncher {
    tools: Vec<ToolConfig>,
}

impl CliLauncher {
    pub fn new(tools: Vec<ToolConfig>) -> Self {
        Self { tools }
    }

    /// Tools in the order they should be tried
    fn ordered_tools(&self, preference: Option<&str>) -> Vec<&ToolConfig> {
        let mut tools: Vec<&ToolConfig> = self.tools.iter().collect();
        if let Some(pref) = preference {
            tools.sort_by_key(|t| !t.name.eq_ignore_ascii_case(pref));
        }
        tools
    }

    /// Split a command template into argv, substituting placeholders per argument
    pub fn render_command(template: &str, request: &LaunchRequest) -> Result<Vec<String>> {
        let words = shell_words::split(template)
            .map_err(|e| Error::Config(format!("Invalid tool command '{}': {}", template, e)))?;

        let agents_dir = request
            .agents_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let workspace = request.workspace_dir.display().to_string();

        let argv: Vec<String> = words
            .iter()
            .map(|word| {
                word.replace("{prompt}", &request.prompt)
                    .replace("{agent}", &request.agent_type)
                    .replace("{issue_url}", &request.issue_url)
                    .replace("{agents_dir}", &agents_dir)
                    .replace("{workspace}", &workspace)
            })
            .collect();

        if argv.is_empty() {
            return Err(Error::Config(format!("Empty tool command '{}'", template)));
        }
        Ok(argv)
    }

    fn spawn(&self, tool: &ToolConfig, request: &LaunchRequest) -> Result<LaunchedAgent> {
        let argv = Self::render_command(&tool.command, request)?;

        std::fs::create_dir_all(&request.log_dir)?;
        let log_file = request.log_dir.join(format!(
            "{}_{}_{}.log",
            tool.name,
            request.issue,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let stdout = std::fs::File::create(&log_file)?;
        let stderr = stdout.try_clone()?;

        let spawned = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&request.workspace_dir)
            .env("NEXUS_ISSUE", &request.issue)
            .env("NEXUS_AGENT", &request.agent_type)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&log_file);
                return Err(e.into());
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| Error::Launch(format!("{} exited before reporting a pid", tool.name)))?;

        Ok(LaunchedAgent {
            pid,
            tool: tool.name.clone(),
            log_file,
        })
    }
}

#[async_trait]
impl AgentLauncher for CliLauncher {
    async fn invoke_agent(&self, request: &LaunchRequest) -> Result<LaunchedAgent> {
        let mut failures = Vec::new();

        for tool in self.ordered_tools(request.tool_preference.as_deref()) {
            debug!("Trying {} for @{} on issue #{}", tool.name, request.agent_type, request.issue);
            match self.spawn(tool, request) {
                Ok(launched) => {
                    info!(
                        "Launched @{} for issue #{} with {} (pid {}, {})",
                        request.agent_type, request.issue, launched.tool, launched.pid, request.mode
                    );
                    return Ok(launched);
                }
                Err(e) => {
                    warn!("{} unavailable for issue #{}: {}", tool.name, request.issue, e);
                    failures.push(format!("{}: {}", tool.name, e));
                }
            }
        }

        Err(Error::NoToolAvailable(if failures.is_empty() {
            "no tools configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}
