//! Claude-backed [`LlmProvider`]. Grounded on the teacher's `ai-client`
//! Claude HTTP client: `x-api-key`/`anthropic-version` headers, a forced
//! tool-use call to extract structured JSON from the model's response.

use async_trait::async_trait;
use darwin_core::{DarwinError, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::provider::LlmProvider;
use crate::types::{ClassificationOutput, RuleExtractionOutput, SignalSample};
use crate::wire::{ChatRequest, ChatResponse, ToolDefinitionWire, WireMessage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl ClaudeProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| DarwinError::Llm(e.to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = %request.model, "claude chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| DarwinError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DarwinError::Llm(format!("claude api error ({status}): {body}")));
        }

        response.json().await.map_err(|e| DarwinError::Llm(e.to_string()))
    }

    async fn extract<T: DeserializeOwned + JsonSchema>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T> {
        let schema = serde_json::to_value(schema_for!(T)).map_err(|e| DarwinError::Llm(e.to_string()))?;

        let request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .tool_forced(ToolDefinitionWire {
                name: "structured_response".to_string(),
                description: "Return the extracted structured data.".to_string(),
                input_schema: schema,
            });

        let response = self.chat(&request).await?;
        extract_structured::<T>(&response).map_err(|e| DarwinError::LlmSchema(e.to_string()))
    }
}

/// Pulls the tool-use input out of a chat response and deserializes it.
/// Split out from [`ClaudeProvider::extract`] so it's testable without a
/// live network call.
fn extract_structured<T: DeserializeOwned>(response: &ChatResponse) -> Result<T> {
    let input = response
        .tool_use_input()
        .ok_or_else(|| DarwinError::Llm("no structured output in claude response".to_string()))?;
    serde_json::from_value(input.clone()).map_err(|e| DarwinError::Llm(e.to_string()))
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn classify(
        &self,
        topic_title: &str,
        topic_summary: &str,
        samples: &[SignalSample],
        rules: &[String],
    ) -> Result<ClassificationOutput> {
        let sample_block = samples
            .iter()
            .map(|s| format!("- ({}) {}", s.source, s.text))
            .collect::<Vec<_>>()
            .join("\n");

        let rules_block = if rules.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nHouse rules to respect when suggesting an action:\n{}",
                rules.iter().map(|r| format!("- {r}")).collect::<Vec<_>>().join("\n")
            )
        };

        let user_prompt = format!(
            "Topic: {topic_title}\nSummary: {topic_summary}\n\nRepresentative feedback:\n{sample_block}{rules_block}"
        );

        self.extract(
            "You triage user feedback for a software product. Classify the topic below as \
             BUG, FEATURE, UX, or OTHER, decide whether it's worth turning into an engineering \
             task, and propose a concrete next step.",
            &user_prompt,
        )
        .await
    }

    async fn extract_rules(&self, review_comments: &[String], diff_summary: &str) -> Result<RuleExtractionOutput> {
        let comments_block = review_comments
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");

        let user_prompt = format!(
            "A code reviewer left the following comments on an automated fix:\n{comments_block}\n\n\
             Diff summary:\n{diff_summary}\n\n\
             Extract zero or more reusable rules a future automated fix should follow."
        );

        self.extract(
            "You distill durable engineering rules from one-off code review feedback. Only \
             extract guidance that generalizes beyond this specific change.",
            &user_prompt,
        )
        .await
    }
}
