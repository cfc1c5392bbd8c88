use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use darwin_core::{Category, DarwinError, DeadLetter, Task, TaskStatus};
use darwin_llm::{LlmProvider, SignalSample};
use darwin_store::{Store, TaskFilter, QUEUE_TO_CLASSIFY, QUEUE_TO_CLASSIFY_DEAD};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backoff::sleep_for_attempt;

const MAX_SIGNAL_SAMPLES: usize = 10;
const EXCERPT_CHARS: usize = 500;
const TOTAL_EXCERPT_CAP: usize = 4_000;
const SCHEMA_ERROR_MAX_RETRIES: u32 = 1;

/// Drains `queue:to-classify`: calls the LLM with a structured schema and
/// materializes a Task for actionable outcomes (spec §4.4).
pub struct ClassifyWorker {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmProvider>,
    confidence_min: f32,
    poll_timeout: Duration,
    max_retries: u32,
}

impl ClassifyWorker {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmProvider>, confidence_min: f32, poll_timeout: Duration, max_retries: u32) -> Self {
        Self {
            store,
            llm,
            confidence_min,
            poll_timeout,
            max_retries,
        }
    }

    pub async fn run(&self, shutdown: &tokio::sync::Notify) {
        loop {
            tokio::select! {
                popped = self.store.queue_pop(QUEUE_TO_CLASSIFY, self.poll_timeout) => {
                    match popped {
                        Ok(Some(raw)) => self.process(&raw).await,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(error = %e, "store error popping to-classify queue");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("classify worker shutting down");
                    return;
                }
            }
        }
    }

    pub async fn process(&self, raw_topic_id: &str) {
        let topic_id = match raw_topic_id.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => {
                warn!(raw_topic_id, "malformed topic id in to-classify queue, dropping");
                return;
            }
        };

        let topic = match self.store.get_topic(topic_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                warn!(%topic_id, "topic missing, dropping");
                return;
            }
            Err(e) => {
                error!(%topic_id, error = %e, "store error loading topic");
                return;
            }
        };

        let signals = match self.store.list_signals(Some(&topic.product), 1000).await {
            Ok(s) => s,
            Err(e) => {
                error!(%topic_id, error = %e, "store error loading signals for classification");
                return;
            }
        };

        let samples: Vec<SignalSample> = signals
            .into_iter()
            .filter(|s| s.topic_id == Some(topic_id))
            .take(MAX_SIGNAL_SAMPLES)
            .map(|s| SignalSample {
                text: truncate_chars(&s.text, EXCERPT_CHARS),
                source: s.source,
            })
            .collect();

        let samples = cap_total_chars(samples, TOTAL_EXCERPT_CAP);

        let rules = match self.store.list_rules(&topic.product).await {
            Ok(rules) => rules.into_iter().map(|r| r.content).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };

        match self.classify_with_retry(&topic.title, &topic.summary, &samples, &rules).await {
            Ok(output) => self.materialize(topic_id, &topic.product, output).await,
            Err(reason) => {
                self.dead_letter(&topic_id.to_string(), &reason).await;
            }
        }
    }

    /// Transport errors retry on the embedding backoff schedule; a
    /// schema-validation error (the model's output didn't conform) gets one
    /// retry before the topic is dead-lettered (spec §4.4 "Failure").
    async fn classify_with_retry(
        &self,
        topic_title: &str,
        topic_summary: &str,
        samples: &[SignalSample],
        rules: &[String],
    ) -> Result<darwin_llm::ClassificationOutput, String> {
        let mut schema_retries = 0u32;
        let mut attempt = 0u32;
        loop {
            match self.llm.classify(topic_title, topic_summary, samples, rules).await {
                Ok(output) => return Ok(output),
                Err(DarwinError::LlmSchema(reason)) => {
                    if schema_retries >= SCHEMA_ERROR_MAX_RETRIES {
                        warn!(reason = %reason, "classification schema error, retries exhausted");
                        return Err(reason);
                    }
                    schema_retries += 1;
                    warn!(reason = %reason, "classification schema error, retrying once");
                    sleep_for_attempt(0).await;
                }
                Err(e) => {
                    if attempt + 1 >= self.max_retries {
                        warn!(error = %e, attempt, "classification transport error, retries exhausted");
                        return Err(e.to_string());
                    }
                    warn!(error = %e, attempt, "classification transport error, retrying");
                    sleep_for_attempt(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn materialize(&self, topic_id: Uuid, product: &str, output: darwin_llm::ClassificationOutput) {
        if let Err(e) = self
            .store
            .update_topic_classification(topic_id, output.title.clone(), output.summary.clone(), output.category)
            .await
        {
            error!(%topic_id, error = %e, "failed to update topic classification");
            return;
        }

        if !output.actionable || output.category == Category::Other || output.confidence < self.confidence_min {
            info!(%topic_id, category = %output.category, confidence = output.confidence, "topic classified as non-actionable");
            return;
        }

        let existing = match self.store.get_open_task_by_topic(topic_id).await {
            Ok(t) => t,
            Err(e) => {
                error!(%topic_id, error = %e, "store error checking task uniqueness");
                return;
            }
        };

        let now = Utc::now();
        let task = match existing {
            Some(mut task) => {
                task.category = output.category;
                task.title = output.title;
                task.summary = output.summary;
                task.severity = output.severity;
                task.suggested_action = output.suggested_action;
                task.confidence = output.confidence;
                task.updated_at = now;
                task
            }
            None => Task {
                id: Uuid::new_v4(),
                topic_id,
                category: output.category,
                title: output.title,
                summary: output.summary,
                severity: output.severity,
                suggested_action: output.suggested_action,
                confidence: output.confidence,
                product: product.to_string(),
                status: TaskStatus::Open,
                issue_url: None,
                issue_number: None,
                fix_status: darwin_core::FixStatus::None,
                pr_url: None,
                branch: None,
                created_at: now,
                updated_at: now,
            },
        };

        if let Err(e) = self.store.update_task(task).await {
            error!(%topic_id, error = %e, "failed to materialize task");
        }
    }

    async fn dead_letter(&self, topic_id: &str, reason: &str) {
        let _ = self
            .store
            .dead_letter_push(
                QUEUE_TO_CLASSIFY_DEAD,
                DeadLetter {
                    key: topic_id.to_string(),
                    reason: reason.to_string(),
                    failed_at: Utc::now(),
                },
            )
            .await;
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn cap_total_chars(samples: Vec<SignalSample>, cap: usize) -> Vec<SignalSample> {
    let mut out = Vec::new();
    let mut total = 0;
    for sample in samples {
        let len = sample.text.chars().count();
        if total + len > cap {
            break;
        }
        total += len;
        out.push(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use darwin_core::{Result as DarwinResult, Topic, TopicStatus};
    use darwin_llm::{ClassificationOutput, RuleExtractionOutput};
    use darwin_store::MemoryStore;

    struct StubLlm {
        output: ClassificationOutput,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        async fn classify(
            &self,
            _topic_title: &str,
            _topic_summary: &str,
            _samples: &[SignalSample],
            _rules: &[String],
        ) -> DarwinResult<ClassificationOutput> {
            Ok(self.output.clone())
        }

        async fn extract_rules(&self, _review_comments: &[String], _diff_summary: &str) -> DarwinResult<RuleExtractionOutput> {
            Ok(RuleExtractionOutput { rules: vec![] })
        }
    }

    async fn seed_topic(store: &MemoryStore, product: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        store
            .put_topic(Topic {
                id,
                title: "login crashes".to_string(),
                summary: String::new(),
                status: TopicStatus::Open,
                product: product.to_string(),
                category: None,
                signal_count: 1,
                centroid: vec![1.0, 0.0],
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn actionable_output_creates_a_task() {
        let store = Arc::new(MemoryStore::default());
        let topic_id = seed_topic(&store, "joplin").await;

        let llm = Arc::new(StubLlm {
            output: ClassificationOutput {
                actionable: true,
                category: Category::Bug,
                title: "Login crashes on cold start".to_string(),
                summary: "Users report a crash.".to_string(),
                severity: "high".to_string(),
                suggested_action: "Add a null check.".to_string(),
                confidence: 0.9,
            },
        });

        let worker = ClassifyWorker::new(store.clone(), llm, 0.5, Duration::from_millis(10), 3);
        worker.process(&topic_id.to_string()).await;

        let tasks = store
            .list_tasks(TaskFilter {
                status: None,
                category: None,
                product: Some("joplin".to_string()),
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].category, Category::Bug);

        let topic = store.get_topic(topic_id).await.unwrap().unwrap();
        assert_eq!(topic.category, Some(Category::Bug));
    }

    #[tokio::test]
    async fn non_actionable_output_does_not_create_a_task() {
        let store = Arc::new(MemoryStore::default());
        let topic_id = seed_topic(&store, "joplin").await;

        let llm = Arc::new(StubLlm {
            output: ClassificationOutput {
                actionable: true,
                category: Category::Other,
                title: "Miscellaneous".to_string(),
                summary: "Not actionable.".to_string(),
                severity: "low".to_string(),
                suggested_action: "None.".to_string(),
                confidence: 0.9,
            },
        });

        let worker = ClassifyWorker::new(store.clone(), llm, 0.5, Duration::from_millis(10), 3);
        worker.process(&topic_id.to_string()).await;

        let tasks = store
            .list_tasks(TaskFilter {
                status: None,
                category: None,
                product: Some("joplin".to_string()),
                limit: 0,
            })
            .await
            .unwrap();
        assert!(tasks.is_empty());
        let topic = store.get_topic(topic_id).await.unwrap().unwrap();
        assert_eq!(topic.category, Some(Category::Other));
    }

    #[tokio::test]
    async fn reclassifying_an_open_topic_updates_rather_than_duplicates() {
        let store = Arc::new(MemoryStore::default());
        let topic_id = seed_topic(&store, "joplin").await;

        let llm = Arc::new(StubLlm {
            output: ClassificationOutput {
                actionable: true,
                category: Category::Bug,
                title: "first pass".to_string(),
                summary: "s".to_string(),
                severity: "medium".to_string(),
                suggested_action: "a".to_string(),
                confidence: 0.9,
            },
        });
        let worker = ClassifyWorker::new(store.clone(), llm, 0.5, Duration::from_millis(10), 3);
        worker.process(&topic_id.to_string()).await;
        worker.process(&topic_id.to_string()).await;

        let tasks = store
            .list_tasks(TaskFilter {
                status: None,
                category: None,
                product: Some("joplin".to_string()),
                limit: 0,
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
