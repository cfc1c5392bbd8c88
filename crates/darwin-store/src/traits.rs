use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use darwin_core::{DeadLetter, Result, Rule, Signal, SuccessfulFix, Task, Topic, TopicStatus, Vector};
use uuid::Uuid;

/// Filters accepted by [`Store::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<darwin_core::TaskStatus>,
    pub category: Option<darwin_core::Category>,
    pub product: Option<String>,
    pub limit: usize,
}

/// The storage contract spec.md §2.1 names: structured records, FIFO queues,
/// and an ANN vector index over each of `idx:topics` / `idx:successful_fixes`.
///
/// Implementations: [`crate::memory::MemoryStore`] (in-process, used by every
/// test in the workspace) and `darwin_store::postgres::SqlStore` (production,
/// behind the `postgres` feature).
#[async_trait]
pub trait Store: Send + Sync {
    // --- Signals -----------------------------------------------------------

    /// Atomically insert a signal iff its hash is absent ("set-if-absent",
    /// spec §4.1 step 2). Returns `true` if this call performed the insert.
    async fn put_signal_if_absent(&self, signal: Signal) -> Result<bool>;

    async fn get_signal(&self, hash: &str) -> Result<Option<Signal>>;

    /// Bump `last_seen` on a duplicate ingest without touching other fields.
    async fn touch_signal_last_seen(&self, hash: &str, now: DateTime<Utc>) -> Result<()>;

    /// Set a signal's `topic_id` once it has been clustered.
    async fn set_signal_topic(&self, hash: &str, topic_id: Uuid) -> Result<()>;

    async fn list_signals(&self, product: Option<&str>, limit: usize) -> Result<Vec<Signal>>;

    // --- Topics --------------------------------------------------------------

    async fn get_topic(&self, id: Uuid) -> Result<Option<Topic>>;

    async fn put_topic(&self, topic: Topic) -> Result<()>;

    /// Attach a signal to a topic: recompute centroid, bump signal_count,
    /// conditioned on the caller's observed `expected_signal_count` (the
    /// optimistic-concurrency version token from spec §4.3/§9). Returns
    /// `false` on a version conflict — the caller should re-read and retry.
    async fn attach_signal_to_topic(
        &self,
        topic_id: Uuid,
        expected_signal_count: u32,
        new_centroid: Vector,
    ) -> Result<bool>;

    /// Update topic classification fields without creating a Task
    /// (spec §4.4 "non-actionable" path).
    async fn update_topic_classification(
        &self,
        topic_id: Uuid,
        title: String,
        summary: String,
        category: darwin_core::Category,
    ) -> Result<()>;

    async fn list_topics(&self) -> Result<Vec<Topic>>;

    /// ANN lookup against `idx:topics`, filtered by status and product,
    /// returning `(topic_id, cosine_similarity)` pairs. Ties within 1e-6
    /// break on lowest `created_at` then lexicographically smallest id
    /// (spec §4.3 tie-breaking), handled by the caller using
    /// [`Store::get_topic`] metadata since the index itself is similarity-only.
    async fn topics_knn(
        &self,
        product: &str,
        status: TopicStatus,
        query: &Vector,
        k: usize,
    ) -> Result<Vec<(Uuid, f32)>>;

    // --- Tasks ---------------------------------------------------------------

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// A non-`done` task for this topic, if one exists (task uniqueness,
    /// spec §4.4 / §8).
    async fn get_open_task_by_topic(&self, topic_id: Uuid) -> Result<Option<Task>>;

    async fn put_task(&self, task: Task) -> Result<()>;

    async fn update_task(&self, task: Task) -> Result<()>;

    /// Compare-and-swap `fix_status`. Returns `false` if the current value
    /// didn't match `expected` (fix at-most-once, spec §4.5/§8).
    async fn cas_fix_status(
        &self,
        task_id: Uuid,
        expected: darwin_core::FixStatus,
        new: darwin_core::FixStatus,
    ) -> Result<bool>;

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>>;

    // --- Learning: successful fixes & rules -----------------------------------

    async fn put_successful_fix(&self, fix: SuccessfulFix) -> Result<()>;

    async fn get_successful_fix(&self, task_id: Uuid) -> Result<Option<SuccessfulFix>>;

    /// ANN lookup against `idx:successful_fixes`, filtered by product,
    /// cosine similarity >= `min_similarity`.
    async fn fixes_knn(
        &self,
        product: &str,
        query: &Vector,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SuccessfulFix>>;

    async fn list_rules(&self, product: &str) -> Result<Vec<Rule>>;

    async fn find_rule_by_normalized_content(
        &self,
        product: &str,
        normalized_content: &str,
    ) -> Result<Option<Rule>>;

    async fn put_rule(&self, rule: Rule) -> Result<()>;

    /// Atomically increment `times_applied` and bump `last_applied_at`.
    async fn bump_rule_applied(&self, rule_id: Uuid, product: &str, at: DateTime<Utc>) -> Result<()>;

    async fn delete_rule(&self, rule_id: Uuid, product: &str) -> Result<()>;

    // --- Queues (spec §3, §9: durable FIFO, backed by the store) --------------

    async fn queue_push(&self, queue: &str, item: String) -> Result<()>;

    /// Blocking pop with a timeout. Returns `None` on timeout (caller loops).
    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    async fn queue_len(&self, queue: &str) -> Result<u64>;

    async fn dead_letter_push(&self, queue: &str, item: DeadLetter) -> Result<()>;

    async fn dead_letter_list(&self, queue: &str) -> Result<Vec<DeadLetter>>;
}

pub const QUEUE_TO_EMBED: &str = "queue:to-embed";
pub const QUEUE_TO_EMBED_DEAD: &str = "queue:to-embed:dead";
pub const QUEUE_TO_CLASSIFY: &str = "queue:to-classify";
pub const QUEUE_TO_CLASSIFY_DEAD: &str = "queue:to-classify:dead";
pub const QUEUE_TRIAGE: &str = "queue:triage";
