//! Operator notifications
//!
//! Supports:
//! - Telegram bot
//! - Log output (always on by default, also used in tests)

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{resolve_env, NotificationsConfig};
use crate::{Error, Result};

/// How loudly a message should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Alert,
}

/// A suggested follow-up command attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub label: String,
    pub command: String,
}

/// A message for the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub title: String,
    pub severity: Severity,
    pub issue: Option<String>,
    pub body: Option<String>,
    pub actions: Vec<Action>,
}

impl Message {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            severity: Severity::Info,
            issue: None,
            body: None,
            actions: Vec::new(),
        }
    }

    /// A message that needs operator attention
    pub fn alert(title: &str) -> Self {
        Self {
            severity: Severity::Alert,
            ..Self::new(title)
        }
    }

    pub fn warning(title: &str) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::new(title)
        }
    }

    pub fn for_issue(mut self, issue: &str) -> Self {
        self.issue = Some(issue.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_action(mut self, label: &str, command: &str) -> Self {
        self.actions.push(Action {
            label: label.to_string(),
            command: command.to_string(),
        });
        self
    }

    /// Single-line rendering for logs
    pub fn plain(&self) -> String {
        let mut line = match &self.issue {
            Some(issue) => format!("[#{}] {}", issue, self.title),
            None => self.title.clone(),
        };
        if let Some(body) = &self.body {
            line.push_str(" - ");
            line.push_str(&body.replace('\n', " "));
        }
        line
    }

    /// Format for Telegram
    pub fn format_telegram(&self) -> String {
        let icon = match self.severity {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Alert => "🚨",
        };

        let mut msg = format!("{} *{}*\n", icon, self.title);
        if let Some(issue) = &self.issue {
            msg.push_str(&format!("Issue: #{}\n", issue));
        }
        if let Some(body) = &self.body {
            msg.push_str(&format!("\n{}\n", body));
        }
        if !self.actions.is_empty() {
            msg.push_str("\nActions:\n");
            for action in &self.actions {
                msg.push_str(&format!("• {}: `{}`\n", action.label, action.command));
            }
        }
        msg
    }
}

/// Sends messages to the operator. Returns whether delivery succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> bool;
}

/// A single delivery channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Send a message
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Telegram notification channel
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": message.format_telegram(),
                "parse_mode": "Markdown"
            }))
            .send()
            .await
            .map_err(|e| Error::Notification(format!("Telegram send failed: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!("Telegram error: {}", body)));
        }

        info!("Telegram notification sent");
        Ok(())
    }
}

/// Log notification channel
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &Message) -> Result<()> {
        match message.severity {
            Severity::Info => info!("📢 {}", message.plain()),
            Severity::Warning => warn!("📢 {}", message.plain()),
            Severity::Alert => error!("🚨 {}", message.plain()),
        }
        Ok(())
    }
}

/// Fans a message out to every configured channel
pub struct ChannelNotifier {
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl ChannelNotifier {
    pub fn new(channels: Vec<Box<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Build the channel list from configuration
    pub fn from_config(config: &NotificationsConfig) -> Self {
        let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();

        if let Some(telegram) = &config.telegram {
            channels.push(Box::new(TelegramChannel::new(
                resolve_env(&telegram.bot_token),
                resolve_env(&telegram.chat_id),
            )));
        }

        if config.log || channels.is_empty() {
            channels.push(Box::new(LogChannel));
        }

        Self::new(channels)
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, message: &Message) -> bool {
        let results = join_all(self.channels.iter().map(|c| c.send(message))).await;

        let mut delivered = false;
        for (channel, result) in self.channels.iter().zip(results) {
            match result {
                Ok(()) => delivered = true,
                Err(e) => warn!("Failed to send notification via {}: {}", channel.name(), e),
            }
        }
        delivered
    }
}
