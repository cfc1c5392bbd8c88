pub mod claude;
pub mod provider;
pub mod types;
pub mod wire;

pub use claude::ClaudeProvider;
pub use provider::LlmProvider;
pub use types::{ClassificationOutput, ExtractedRule, RuleExtractionOutput, SignalSample};
