use async_trait::async_trait;
use darwin_core::Result;

use crate::types::{ClassificationOutput, RuleExtractionOutput, SignalSample};

/// The two structured LLM calls the pipeline makes (spec §4.4 classification,
/// §4.8 rule extraction). Kept narrow and dyn-compatible rather than a
/// generic `extract<T>` — the concrete teacher client's `Claude::extract<T>`
/// can't be boxed, and the pipeline only ever needs these two shapes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn classify(
        &self,
        topic_title: &str,
        topic_summary: &str,
        samples: &[SignalSample],
        rules: &[String],
    ) -> Result<ClassificationOutput>;

    async fn extract_rules(
        &self,
        review_comments: &[String],
        diff_summary: &str,
    ) -> Result<RuleExtractionOutput>;
}
