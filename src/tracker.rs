//! Issue tracker adapter
//!
//! The orchestrator only needs a handful of issue operations. They sit behind
//! [`IssueTracker`] so tests can swap in an in-memory tracker; the production
//! implementation talks to the GitHub REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{resolve_env, GitHubConfig};
use crate::{Error, Result};

/// An issue comment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// An issue with the fields the orchestrator reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Issue {
    pub number: String,
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
    pub comments: Vec<Comment>,
}

/// Issue tracker operations
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Fetch an issue. Comments are only fetched when `with_comments` is set.
    async fn get_issue(&self, repo: &str, issue: &str, with_comments: bool) -> Result<Issue>;

    async fn add_comment(&self, repo: &str, issue: &str, body: &str) -> Result<()>;

    async fn add_label(&self, repo: &str, issue: &str, label: &str) -> Result<()>;

    async fn update_issue_body(&self, repo: &str, issue: &str, body: &str) -> Result<()>;

    async fn close_issue(&self, repo: &str, issue: &str) -> Result<()>;
}

/// GitHub REST v3 tracker
pub struct GitHubTracker {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Deserialize)]
struct GhComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: GhUser,
    created_at: DateTime<Utc>,
}

impl GitHubTracker {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &GitHubConfig) -> Self {
        Self::new(&config.api_base, &resolve_env(&config.token))
    }

    fn url(&self, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus");
        if self.token.is_empty() || self.token.starts_with("${") {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tracker(format!("GitHub returned {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn list_comments(&self, repo: &str, issue: &str) -> Result<Vec<Comment>> {
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let url = self.url(repo, &format!("issues/{}/comments?per_page=100&page={}", issue, page));
            let batch: Vec<GhComment> = self
                .send(self.request(reqwest::Method::GET, &url))
                .await?
                .json()
                .await?;
            let done = batch.len() < 100;
            comments.extend(batch.into_iter().map(|c| Comment {
                id: c.id.to_string(),
                body: c.body.unwrap_or_default(),
                author: c.user.login,
                created_at: c.created_at,
            }));
            if done {
                break;
            }
            page += 1;
        }
        debug!("Fetched {} comments for {}#{}", comments.len(), repo, issue);
        Ok(comments)
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn get_issue(&self, repo: &str, issue: &str, with_comments: bool) -> Result<Issue> {
        let url = self.url(repo, &format!("issues/{}", issue));
        let gh: GhIssue = self
            .send(self.request(reqwest::Method::GET, &url))
            .await?
            .json()
            .await?;

        let comments = if with_comments {
            self.list_comments(repo, issue).await?
        } else {
            Vec::new()
        };

        Ok(Issue {
            number: gh.number.to_string(),
            title: gh.title,
            body: gh.body.unwrap_or_default(),
            state: gh.state,
            labels: gh.labels.into_iter().map(|l| l.name).collect(),
            comments,
        })
    }

    async fn add_comment(&self, repo: &str, issue: &str, body: &str) -> Result<()> {
        let url = self.url(repo, &format!("issues/{}/comments", issue));
        self.send(
            self.request(reqwest::Method::POST, &url)
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn add_label(&self, repo: &str, issue: &str, label: &str) -> Result<()> {
        let url = self.url(repo, &format!("issues/{}/labels", issue));
        self.send(
            self.request(reqwest::Method::POST, &url)
                .json(&serde_json::json!({ "labels": [label] })),
        )
        .await?;
        Ok(())
    }

    async fn update_issue_body(&self, repo: &str, issue: &str, body: &str) -> Result<()> {
        let url = self.url(repo, &format!("issues/{}", issue));
        self.send(
            self.request(reqwest::Method::PATCH, &url)
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn close_issue(&self, repo: &str, issue: &str) -> Result<()> {
        let url = self.url(repo, &format!("issues/{}", issue));
        self.send(
            self.request(reqwest::Method::PATCH, &url)
                .json(&serde_json::json!({ "state": "closed" })),
        )
        .await?;
        Ok(())
    }
}
