use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fixed-dimension unit-norm embedding.
pub type Vector = Vec<f32>;

// ---------------------------------------------------------------------------
// Enumerations (spec §3, §9: "Enumerations ... must be sum types")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Open,
    Closed,
}

impl std::fmt::Display for TopicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicStatus::Open => write!(f, "open"),
            TopicStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TopicStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown TopicStatus: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bug,
    Feature,
    Ux,
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Bug => write!(f, "BUG"),
            Category::Feature => write!(f, "FEATURE"),
            Category::Ux => write!(f, "UX"),
            Category::Other => write!(f, "OTHER"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUG" => Ok(Self::Bug),
            "FEATURE" => Ok(Self::Feature),
            "UX" => Ok(Self::Ux),
            "OTHER" => Ok(Self::Other),
            other => Err(format!("unknown Category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown TaskStatus: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    None,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for FixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixStatus::None => write!(f, "none"),
            FixStatus::Running => write!(f, "running"),
            FixStatus::Completed => write!(f, "completed"),
            FixStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for FixStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown FixStatus: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Style,
    Convention,
    Workflow,
    Constraint,
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleCategory::Style => write!(f, "style"),
            RuleCategory::Convention => write!(f, "convention"),
            RuleCategory::Workflow => write!(f, "workflow"),
            RuleCategory::Constraint => write!(f, "constraint"),
        }
    }
}

impl std::str::FromStr for RuleCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "style" => Ok(Self::Style),
            "convention" => Ok(Self::Convention),
            "workflow" => Ok(Self::Workflow),
            "constraint" => Ok(Self::Constraint),
            other => Err(format!("unknown RuleCategory: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Manual,
    ReviewFeedback,
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSource::Manual => write!(f, "manual"),
            RuleSource::ReviewFeedback => write!(f, "review_feedback"),
        }
    }
}

impl std::str::FromStr for RuleSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "review_feedback" => Ok(Self::ReviewFeedback),
            other => Err(format!("unknown RuleSource: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records (spec §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    /// sha256(normalize(text)) hex digest — the record's identity.
    pub hash: String,
    pub text: String,
    pub normalized: String,
    pub source: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub product: String,
    pub topic_id: Option<Uuid>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Signal {
    pub fn key(&self) -> String {
        format!("signal:{}", self.hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: Uuid,
    pub title: String,
    pub summary: String,
    pub status: TopicStatus,
    pub product: String,
    pub category: Option<Category>,
    pub signal_count: u32,
    pub centroid: Vector,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Topic {
    pub fn key(&self) -> String {
        format!("topic:{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub category: Category,
    pub title: String,
    pub summary: String,
    pub severity: String,
    pub suggested_action: String,
    pub confidence: f32,
    pub product: String,
    pub status: TaskStatus,
    pub issue_url: Option<String>,
    pub issue_number: Option<u64>,
    pub fix_status: FixStatus,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn key(&self) -> String {
        format!("task:{}", self.id)
    }

    /// The text used to compute a task's embedding for fix-retrieval (spec §4.6).
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.title, self.summary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessfulFix {
    pub task_id: Uuid,
    pub topic_id: Uuid,
    pub category: Category,
    pub title: String,
    pub summary: String,
    pub product: String,
    pub pr_title: String,
    pub pr_url: String,
    pub branch: String,
    pub merged_at: DateTime<Utc>,
    pub files_changed: Vec<String>,
    pub embedding: Vector,
}

impl SuccessfulFix {
    pub fn key(&self) -> String {
        format!("fix:success:{}", self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    pub product: String,
    pub content: String,
    pub category: RuleCategory,
    pub source: RuleSource,
    pub source_task_id: Option<Uuid>,
    pub reviewer: Option<String>,
    pub times_applied: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn key(&self) -> String {
        format!("rule:{}:{}", self.product, self.id)
    }

    /// Normalized content used for dedup (spec §4.6).
    pub fn normalized_content(&self) -> String {
        normalize(&self.content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub key: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Wire types (spec §6.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalInput {
    pub id: Option<String>,
    pub text: String,
    pub source: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub product: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Queued,
    Duplicate,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub queued: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub outcomes: Vec<IngestOutcome>,
    pub delayed: bool,
}

// ---------------------------------------------------------------------------
// Normalization & content hashing (spec §4.1)
// ---------------------------------------------------------------------------

/// `normalize(text) = collapse_whitespace(strip(lowercase(text)))`
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `sha256(normalize(text))`, hex-encoded.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let normalized = normalize(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_lowercases() {
        assert_eq!(normalize("  Sync   Fails\n\tNow  "), "sync fails now");
    }

    #[test]
    fn content_hash_is_stable_across_whitespace_variants() {
        assert_eq!(content_hash("Sync fails"), content_hash("  sync   fails  "));
    }

    #[test]
    fn content_hash_differs_for_different_text() {
        assert_ne!(content_hash("Sync fails"), content_hash("Sync works"));
    }

    #[test]
    fn category_round_trips_through_display_and_from_str() {
        for c in [Category::Bug, Category::Feature, Category::Ux, Category::Other] {
            let s = c.to_string();
            let parsed: Category = s.to_lowercase().parse().unwrap();
            assert_eq!(parsed, c);
        }
    }
}
