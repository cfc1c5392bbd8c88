use std::sync::Arc;

use dashmap::DashMap;
use darwin_core::{FixStatus, TaskStatus};
use darwin_llm::LlmProvider;
use darwin_store::Store;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::fix_runner::FixRunner;
use crate::learning::LearningStore;

type HmacSha256 = Hmac<Sha256>;

/// A code-forge webhook event (spec §4.7). Payload shape mirrors what a
/// forge provider would deliver for PR/review lifecycle notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    PrOpened { task_id: Uuid },
    PrMerged { task_id: Uuid, pr_url: String, pr_title: String, files_changed: Vec<String> },
    PrClosed { task_id: Uuid },
    ChangesRequested { task_id: Uuid, body: String, reviewer: Option<String> },
    Approved { task_id: Uuid },
    Commented { task_id: Uuid },
}

impl WebhookEvent {
    fn task_id(&self) -> Uuid {
        match self {
            WebhookEvent::PrOpened { task_id }
            | WebhookEvent::PrMerged { task_id, .. }
            | WebhookEvent::PrClosed { task_id }
            | WebhookEvent::ChangesRequested { task_id, .. }
            | WebhookEvent::Approved { task_id }
            | WebhookEvent::Commented { task_id } => *task_id,
        }
    }
}

/// Consumes forge webhook events and drives the Task/fix state machine
/// (spec §4.7), extracting rules from review feedback (§4.8).
pub struct ReviewHandler {
    store: Arc<dyn Store>,
    learning: Arc<LearningStore>,
    llm: Arc<dyn LlmProvider>,
    fix_runner: Arc<FixRunner>,
    webhook_secret: String,
    fix_auto_iter_max: u32,
    /// In-process iteration counter per task, reset when a fresh fix run
    /// starts. Not persisted: bounding auto-iteration is an operational
    /// concern scoped to the lifetime of a single review conversation, not
    /// part of the durable Task record (spec §3 names no such field).
    iterations: DashMap<Uuid, u32>,
}

impl ReviewHandler {
    pub fn new(
        store: Arc<dyn Store>,
        learning: Arc<LearningStore>,
        llm: Arc<dyn LlmProvider>,
        fix_runner: Arc<FixRunner>,
        webhook_secret: String,
        fix_auto_iter_max: u32,
    ) -> Self {
        Self {
            store,
            learning,
            llm,
            fix_runner,
            webhook_secret,
            fix_auto_iter_max,
            iterations: DashMap::new(),
        }
    }

    /// Verifies `HMAC-SHA256(secret, raw_body)` against the hex-encoded
    /// signature header, constant-time (spec §6.3). Returns `false` on any
    /// mismatch — callers must reject with 401 and perform no mutation.
    pub fn verify_signature(&self, raw_body: &[u8], signature_hex: &str) -> bool {
        let mut mac = match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(raw_body);
        let expected = hex::encode(mac.finalize().into_bytes());
        constant_time_eq(expected.as_bytes(), signature_hex.as_bytes())
    }

    pub async fn handle(&self, event: WebhookEvent) {
        let task_id = event.task_id();
        let task = match self.store.get_task(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                warn!(%task_id, "webhook for unknown task, discarding");
                return;
            }
            Err(e) => {
                warn!(%task_id, error = %e, "store error loading task for webhook, discarding");
                return;
            }
        };

        match event {
            WebhookEvent::PrOpened { .. } => {
                if task.fix_status == FixStatus::Running && matches!(task.status, TaskStatus::Open | TaskStatus::InProgress) {
                    let mut updated = task;
                    updated.status = TaskStatus::InProgress;
                    updated.updated_at = chrono::Utc::now();
                    if let Err(e) = self.store.update_task(updated).await {
                        warn!(%task_id, error = %e, "failed to mark task in_progress on PR open");
                    }
                }
            }

            WebhookEvent::PrMerged { pr_url, pr_title, files_changed, .. } => {
                if task.status != TaskStatus::InProgress || task.fix_status != FixStatus::Running {
                    info!(%task_id, status = %task.status, fix_status = %task.fix_status, "merge event for task not in_progress/running, ignoring");
                    return;
                }
                let branch = task.branch.clone().unwrap_or_default();
                let mut updated = task.clone();
                updated.status = TaskStatus::Done;
                updated.fix_status = FixStatus::Completed;
                updated.pr_url = Some(pr_url.clone());
                updated.updated_at = chrono::Utc::now();
                if let Err(e) = self.store.update_task(updated.clone()).await {
                    warn!(%task_id, error = %e, "failed to mark task done on merge");
                    return;
                }
                if let Err(e) = self.learning.store_success(&updated, &pr_title, &pr_url, &branch, files_changed).await {
                    warn!(%task_id, error = %e, "failed to store successful fix");
                }
                self.iterations.remove(&task_id);
            }

            WebhookEvent::PrClosed { .. } => {
                if task.status != TaskStatus::InProgress {
                    return;
                }
                let mut updated = task;
                updated.fix_status = FixStatus::Failed;
                updated.status = TaskStatus::Open;
                updated.updated_at = chrono::Utc::now();
                if let Err(e) = self.store.update_task(updated).await {
                    warn!(%task_id, error = %e, "failed to mark task failed on PR close");
                }
                self.iterations.remove(&task_id);
            }

            WebhookEvent::ChangesRequested { body, reviewer, .. } => {
                if task.status != TaskStatus::InProgress {
                    return;
                }
                self.extract_and_apply_rules(&task.product, &body, task_id, reviewer.clone()).await;

                let iteration = {
                    let mut entry = self.iterations.entry(task_id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if iteration <= self.fix_auto_iter_max {
                    info!(%task_id, iteration, "re-entering fix runner with reviewer feedback");
                    let _ = self.fix_runner.start_fix(task_id, Some(body)).await;
                } else {
                    info!(%task_id, iteration, max = self.fix_auto_iter_max, "auto-iteration cap reached, not re-entering fix runner");
                }
            }

            WebhookEvent::Approved { .. } | WebhookEvent::Commented { .. } => {
                // no state change (spec §4.7)
            }
        }
    }

    async fn extract_and_apply_rules(&self, product: &str, feedback_text: &str, task_id: Uuid, reviewer: Option<String>) {
        let output = match self.llm.extract_rules(&[feedback_text.to_string()], "").await {
            Ok(o) => o,
            Err(e) => {
                warn!(%task_id, error = %e, "rule extraction call failed");
                return;
            }
        };

        for rule in output.rules {
            if let Err(e) = self
                .learning
                .upsert_rule(
                    product,
                    &rule.content,
                    rule.category,
                    darwin_core::RuleSource::ReviewFeedback,
                    Some(task_id),
                    reviewer.clone(),
                )
                .await
            {
                warn!(%task_id, error = %e, "failed to upsert extracted rule");
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use darwin_core::{Category, Result as DarwinResult, Task};
    use darwin_embed::HashEmbedder;
    use darwin_llm::{ClassificationOutput, ExtractedRule, RuleExtractionOutput, SignalSample};
    use darwin_store::MemoryStore;
    use std::time::Duration;

    struct StubForge;

    #[async_trait]
    impl crate::fix_runner::ForgeAgent for StubForge {
        async fn run_fix(&self, task: &Task, _context: &crate::fix_runner::FixContext) -> anyhow::Result<crate::fix_runner::FixOutcome> {
            Ok(crate::fix_runner::FixOutcome {
                branch: format!("fix/{}", task.id),
                pr_url: "https://example.com/pr/2".to_string(),
                pr_title: "follow-up".to_string(),
                files_changed: vec![],
            })
        }
        async fn create_issue(&self, _task: &Task) -> anyhow::Result<(String, u64)> {
            Ok(("https://example.com/issues/2".to_string(), 2))
        }
    }

    struct StubLlm {
        rules: Vec<ExtractedRule>,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        async fn classify(&self, _: &str, _: &str, _: &[SignalSample], _: &[String]) -> DarwinResult<ClassificationOutput> {
            unimplemented!()
        }
        async fn extract_rules(&self, _review_comments: &[String], _diff_summary: &str) -> DarwinResult<RuleExtractionOutput> {
            Ok(RuleExtractionOutput { rules: self.rules.clone() })
        }
    }

    fn in_progress_task(product: &str) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            category: Category::Bug,
            title: "Sync fails".to_string(),
            summary: "sync drops".to_string(),
            severity: "high".to_string(),
            suggested_action: "retry".to_string(),
            confidence: 0.9,
            product: product.to_string(),
            status: TaskStatus::InProgress,
            issue_url: None,
            issue_number: None,
            fix_status: FixStatus::Running,
            pr_url: None,
            branch: Some("fix/sync".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    fn handler(store: Arc<MemoryStore>, rules: Vec<ExtractedRule>) -> ReviewHandler {
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = Arc::new(LearningStore::new(store.clone(), embedder));
        let forge = Arc::new(StubForge);
        let fix_runner = Arc::new(FixRunner::new(store.clone(), learning.clone(), forge, Duration::from_secs(5)));
        let llm = Arc::new(StubLlm { rules });
        ReviewHandler::new(store, learning, llm, fix_runner, "shh".to_string(), 3)
    }

    #[test]
    fn signature_verification_rejects_tampered_body() {
        let store = Arc::new(MemoryStore::default());
        let handler = handler(store, vec![]);
        let body = b"{\"event\":\"pr_opened\"}";
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(handler.verify_signature(body, &sig));
        assert!(!handler.verify_signature(b"tampered", &sig));
    }

    #[tokio::test]
    async fn merge_event_completes_task_and_indexes_successful_fix() {
        let store = Arc::new(MemoryStore::default());
        let task = in_progress_task("joplin");
        let task_id = task.id;
        store.put_task(task.clone()).await.unwrap();
        let h = handler(store.clone(), vec![]);

        h.handle(WebhookEvent::PrMerged {
            task_id,
            pr_url: "https://example.com/pr/1".to_string(),
            pr_title: "Fix sync".to_string(),
            files_changed: vec!["src/sync.rs".to_string()],
        })
        .await;

        let updated = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Done);
        assert_eq!(updated.fix_status, FixStatus::Completed);
        assert!(store.get_successful_fix(task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_not_merged_reopens_task_for_retry() {
        let store = Arc::new(MemoryStore::default());
        let task = in_progress_task("joplin");
        let task_id = task.id;
        store.put_task(task.clone()).await.unwrap();
        let h = handler(store.clone(), vec![]);

        h.handle(WebhookEvent::PrClosed { task_id }).await;

        let updated = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Open);
        assert_eq!(updated.fix_status, FixStatus::Failed);
    }

    #[tokio::test]
    async fn changes_requested_extracts_rule_once_despite_repeated_identical_feedback() {
        let store = Arc::new(MemoryStore::default());
        let task = in_progress_task("joplin");
        let task_id = task.id;
        store.put_task(task.clone()).await.unwrap();
        let h = handler(
            store.clone(),
            vec![ExtractedRule {
                content: "Use early returns".to_string(),
                category: darwin_core::RuleCategory::Style,
            }],
        );

        h.handle(WebhookEvent::ChangesRequested {
            task_id,
            body: "use early returns".to_string(),
            reviewer: Some("alice".to_string()),
        })
        .await;
        h.handle(WebhookEvent::ChangesRequested {
            task_id,
            body: "use early returns".to_string(),
            reviewer: Some("bob".to_string()),
        })
        .await;

        let rules = store.list_rules("joplin").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].times_applied, 1);
    }

    #[tokio::test]
    async fn approved_event_is_a_no_op() {
        let store = Arc::new(MemoryStore::default());
        let task = in_progress_task("joplin");
        let task_id = task.id;
        store.put_task(task.clone()).await.unwrap();
        let h = handler(store.clone(), vec![]);

        h.handle(WebhookEvent::Approved { task_id }).await;

        let unchanged = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::InProgress);
        assert_eq!(unchanged.fix_status, FixStatus::Running);
    }

    #[tokio::test]
    async fn unknown_task_id_is_discarded_without_panic() {
        let store = Arc::new(MemoryStore::default());
        let h = handler(store, vec![]);
        h.handle(WebhookEvent::Approved { task_id: Uuid::new_v4() }).await;
    }
}
