//! HTTP adapter to an external coding-agent/forge executor: a sandboxed
//! service that owns repository checkout, tool invocation, and PR creation.
//! The core only hands it `(task, context)` and records the outcome
//! (spec §4.5); everything past the wire call is out of scope here.

use async_trait::async_trait;
use darwin_core::Task;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fix_runner::{FixContext, FixOutcome, ForgeAgent};

#[derive(Serialize)]
struct RunFixRequest<'a> {
    task_id: uuid::Uuid,
    product: &'a str,
    title: &'a str,
    summary: &'a str,
    suggested_action: &'a str,
    similar_fixes: Vec<SimilarFixWire<'a>>,
    rules: Vec<&'a str>,
    reviewer_feedback: Option<&'a str>,
}

#[derive(Serialize)]
struct SimilarFixWire<'a> {
    pr_title: &'a str,
    pr_url: &'a str,
    files_changed: &'a [String],
}

#[derive(Deserialize)]
struct RunFixResponse {
    branch: String,
    pr_url: String,
    pr_title: String,
    files_changed: Vec<String>,
}

#[derive(Serialize)]
struct CreateIssueRequest<'a> {
    repo: &'a str,
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct CreateIssueResponse {
    issue_url: String,
    issue_number: u64,
}

/// Forge client speaking a small REST contract: `POST {base_url}/runs` to
/// invoke the agent, `POST {base_url}/issues` to open a tracking issue.
pub struct HttpForgeAgent {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    product_repos: Vec<(String, String)>,
}

impl HttpForgeAgent {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, product_repos: Vec<(String, String)>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            product_repos,
        }
    }

    fn repo_for(&self, product: &str) -> anyhow::Result<&str> {
        self.product_repos
            .iter()
            .find(|(p, _)| p == product)
            .map(|(_, r)| r.as_str())
            .ok_or_else(|| anyhow::anyhow!("no forge repo configured for product {product}"))
    }

    fn auth_header(&self) -> anyhow::Result<HeaderValue> {
        Ok(HeaderValue::from_str(&format!("Bearer {}", self.api_key))?)
    }
}

#[async_trait]
impl ForgeAgent for HttpForgeAgent {
    async fn run_fix(&self, task: &Task, context: &FixContext) -> anyhow::Result<FixOutcome> {
        let repo = self.repo_for(&task.product)?;
        let url = format!("{}/runs", self.base_url);
        debug!(task_id = %task.id, repo, "invoking coding agent");

        let body = RunFixRequest {
            task_id: task.id,
            product: &task.product,
            title: &task.title,
            summary: &task.summary,
            suggested_action: &task.suggested_action,
            similar_fixes: context
                .similar_fixes
                .iter()
                .map(|f| SimilarFixWire {
                    pr_title: &f.pr_title,
                    pr_url: &f.pr_url,
                    files_changed: &f.files_changed,
                })
                .collect(),
            rules: context.rules.iter().map(|r| r.content.as_str()).collect(),
            reviewer_feedback: context.reviewer_feedback.as_deref(),
        };

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.auth_header()?)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("coding agent run failed ({status}): {text}");
        }

        let parsed: RunFixResponse = response.json().await?;
        Ok(FixOutcome {
            branch: parsed.branch,
            pr_url: parsed.pr_url,
            pr_title: parsed.pr_title,
            files_changed: parsed.files_changed,
        })
    }

    async fn create_issue(&self, task: &Task) -> anyhow::Result<(String, u64)> {
        let repo = self.repo_for(&task.product)?;
        let url = format!("{}/issues", self.base_url);

        let body = CreateIssueRequest {
            repo,
            title: &task.title,
            body: &task.summary,
        };

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.auth_header()?)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("issue creation failed ({status}): {text}");
        }

        let parsed: CreateIssueResponse = response.json().await?;
        Ok((parsed.issue_url, parsed.issue_number))
    }
}
