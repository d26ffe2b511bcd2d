//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding workflow records, registries and audit logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Cooldowns, thresholds and polling intervals
    #[serde(default)]
    pub timing: TimingConfig,

    /// GitHub access
    #[serde(default)]
    pub github: GitHubConfig,

    /// Agent tools the launcher may start
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Operator notification channels
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Per-project settings keyed by project name
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,

    /// Project used when a command does not name one
    #[serde(default)]
    pub default_project: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.nexus/data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timing: TimingConfig::default(),
            github: GitHubConfig::default(),
            launcher: LauncherConfig::default(),
            notifications: NotificationsConfig::default(),
            projects: HashMap::new(),
            default_project: None,
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .nexus/config.toml in current directory
            let local = PathBuf::from(".nexus/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.nexus/config.toml
            dirs::home_dir().map(|h| h.join(".nexus/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Data directory with `~` and environment variables expanded
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// Look up a project by name
    pub fn project(&self, name: &str) -> Result<&ProjectConfig> {
        self.projects
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown project: {}", name)))
    }

    /// Resolve an optional project name, falling back to `default_project`
    /// or the only configured project.
    pub fn resolve_project_name(&self, name: Option<&str>) -> Result<String> {
        if let Some(name) = name {
            self.project(name)?;
            return Ok(name.to_string());
        }
        if let Some(default) = &self.default_project {
            return Ok(default.clone());
        }
        if self.projects.len() == 1 {
            if let Some(name) = self.projects.keys().next() {
                return Ok(name.clone());
            }
        }
        Err(Error::Config(
            "No project given and no default_project configured".to_string(),
        ))
    }

    /// Find the project that owns a repository ("owner/name")
    pub fn project_for_repo(&self, repo: &str) -> Option<(&str, &ProjectConfig)> {
        self.projects
            .iter()
            .find(|(_, p)| p.repo.eq_ignore_ascii_case(repo))
            .map(|(name, p)| (name.as_str(), p))
    }

    /// Create the data directory layout
    pub fn init(&self) -> Result<()> {
        let data_dir = self.data_dir();
        for sub in ["workflows", "audit", "completions", "logs"] {
            std::fs::create_dir_all(data_dir.join(sub))?;
        }
        Ok(())
    }
}

/// Expand `~` and `$VARS` in a path, leaving it untouched if expansion fails
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

/// Resolve a `${VAR}` placeholder from the environment
pub fn resolve_env(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum gap between two launches for the same issue
    #[serde(default = "default_launch_cooldown", with = "humantime_serde")]
    pub launch_cooldown: Duration,

    /// Registry entries younger than this count as "recently launched"
    #[serde(default = "default_recent_window", with = "humantime_serde")]
    pub recent_window: Duration,

    /// Log silence after which a live agent is considered stuck
    #[serde(default = "default_stuck_threshold", with = "humantime_serde")]
    pub stuck_threshold: Duration,

    /// Interval of the stuck/dead agent sweep
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Interval of the log completion scan
    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,
}

fn default_launch_cooldown() -> Duration {
    Duration::from_secs(120)
}

fn default_recent_window() -> Duration {
    Duration::from_secs(120)
}

fn default_stuck_threshold() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            launch_cooldown: default_launch_cooldown(),
            recent_window: default_recent_window(),
            stuck_threshold: default_stuck_threshold(),
            poll_interval: default_poll_interval(),
            scan_interval: default_scan_interval(),
        }
    }
}

/// GitHub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// API token; `${GITHUB_TOKEN}` style placeholders are resolved
    #[serde(default = "default_github_token")]
    pub token: String,

    /// REST API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Login of the bot account; its own comments are ignored by the webhook path
    #[serde(default)]
    pub bot_login: Option<String>,
}

fn default_github_token() -> String {
    "${GITHUB_TOKEN}".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: default_github_token(),
            api_base: default_api_base(),
            bot_login: None,
        }
    }
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Tools in preference order
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,

    /// How many bytes of a log to scan for completion markers
    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: u64,
}

fn default_log_tail_bytes() -> u64 {
    64 * 1024
}

fn default_tools() -> Vec<ToolConfig> {
    vec![
        ToolConfig {
            name: "copilot".to_string(),
            command: "copilot -p {prompt} --allow-all-tools".to_string(),
        },
        ToolConfig {
            name: "claude".to_string(),
            command: "claude -p {prompt} --dangerously-skip-permissions".to_string(),
        },
    ]
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tools: default_tools(),
            log_tail_bytes: default_log_tail_bytes(),
        }
    }
}

/// A launchable agent tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool name, used as preference key and in log file names
    pub name: String,

    /// Command template. Placeholders: `{prompt}`, `{agent}`, `{issue_url}`,
    /// `{agents_dir}`, `{workspace}`
    pub command: String,
}

/// Notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Telegram bot channel
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Also log every notification through tracing
    #[serde(default = "default_true")]
    pub log: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            telegram: None,
            log: true,
        }
    }
}

/// Telegram bot credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// Per-project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Repository as "owner/name"
    pub repo: String,

    /// Working directory agents run in
    pub workspace: PathBuf,

    /// Directory holding agent role definitions
    #[serde(default)]
    pub agents_dir: Option<PathBuf>,

    /// Workflow definition YAML; required to create workflows
    #[serde(default)]
    pub workflow_definition: Option<PathBuf>,

    /// Preferred tool name
    #[serde(default)]
    pub tool_preference: Option<String>,
}

impl ProjectConfig {
    /// Issue URL for an issue number in this project's repository
    pub fn issue_url(&self, issue: &str) -> String {
        format!("https://github.com/{}/issues/{}", self.repo, issue)
    }
}

// Custom serde module for Duration using humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
