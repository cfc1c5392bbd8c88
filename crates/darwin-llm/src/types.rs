use darwin_core::{Category, RuleCategory};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One user-facing signal text, trimmed for the classification prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SignalSample {
    pub text: String,
    pub source: String,
}

/// Structured output of the classification call (spec §4.4).
#[derive(Debug, Clone, Deserialize, JsonSchema, PartialEq)]
pub struct ClassificationOutput {
    /// Whether this topic is worth turning into a Task at all.
    pub actionable: bool,
    /// BUG, FEATURE, UX, or OTHER.
    pub category: Category,
    /// Short human-readable title for the resulting task.
    pub title: String,
    /// One-paragraph summary of the underlying problem or request.
    pub summary: String,
    /// low, medium, high, or critical.
    pub severity: String,
    /// A concrete, one-sentence suggested next step for a fix.
    pub suggested_action: String,
    /// The model's confidence in this classification, 0.0-1.0.
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, PartialEq)]
pub struct ExtractedRule {
    /// A single, reusable instruction extracted from review feedback.
    pub content: String,
    pub category: RuleCategory,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, PartialEq)]
pub struct RuleExtractionOutput {
    pub rules: Vec<ExtractedRule>,
}
