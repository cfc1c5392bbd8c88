use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use darwin_core::{content_hash, Category, FixStatus, Result as DarwinResult, RuleCategory, SignalInput, TaskStatus};
use darwin_embed::{Embedder, HashEmbedder};
use darwin_llm::{ClassificationOutput, ExtractedRule, LlmProvider, RuleExtractionOutput, SignalSample};
use darwin_pipeline::fix_runner::{FixContext, FixOutcome, ForgeAgent};
use darwin_pipeline::{ClassifyWorker, ClusterDecision, Clusterer, EmbedWorker, FixRunner, IngestService, LearningStore, ReviewHandler, WebhookEvent};
use darwin_store::{MemoryStore, Store, TaskFilter, QUEUE_TO_CLASSIFY, QUEUE_TO_EMBED, QUEUE_TRIAGE};

struct ScriptedLlm {
    classification: ClassificationOutput,
    extracted_rules: Vec<ExtractedRule>,
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn classify(&self, _: &str, _: &str, _: &[SignalSample], _: &[String]) -> DarwinResult<ClassificationOutput> {
        Ok(self.classification.clone())
    }

    async fn extract_rules(&self, _review_comments: &[String], _diff_summary: &str) -> DarwinResult<RuleExtractionOutput> {
        Ok(RuleExtractionOutput {
            rules: self.extracted_rules.clone(),
        })
    }
}

struct ScriptedForge;

#[async_trait]
impl ForgeAgent for ScriptedForge {
    async fn run_fix(&self, task: &darwin_core::Task, _context: &FixContext) -> anyhow::Result<FixOutcome> {
        Ok(FixOutcome {
            branch: format!("fix/{}", task.id),
            pr_url: format!("https://example.com/pr/{}", task.id),
            pr_title: format!("Fix: {}", task.title),
            files_changed: vec!["src/lib.rs".to_string()],
        })
    }

    async fn create_issue(&self, task: &darwin_core::Task) -> anyhow::Result<(String, u64)> {
        Ok((format!("https://example.com/issues/{}", task.id), 1))
    }
}

fn bug_classification() -> ClassificationOutput {
    ClassificationOutput {
        actionable: true,
        category: Category::Bug,
        title: "Login crashes on cold start".to_string(),
        summary: "Multiple users report a crash on the first launch after install.".to_string(),
        severity: "high".to_string(),
        suggested_action: "Guard against a null session on first launch.".to_string(),
        confidence: 0.9,
    }
}

fn signal_input(text: &str, product: &str) -> SignalInput {
    SignalInput {
        id: None,
        text: text.to_string(),
        source: "forum".to_string(),
        url: None,
        title: None,
        author: None,
        product: product.to_string(),
        timestamp: None,
    }
}

/// Scenario 1: duplicate ingestion yields one Signal, one queued, one duplicate.
#[tokio::test]
async fn duplicate_ingestion() {
    let store = Arc::new(MemoryStore::default());
    let ingest = IngestService::new(store.clone(), 10_000);

    let result = ingest
        .ingest(vec![signal_input("Sync fails", "joplin"), signal_input("Sync fails", "joplin")])
        .await
        .unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.queued, 1);
    assert_eq!(result.duplicates, 1);
    assert_eq!(store.queue_len(QUEUE_TO_EMBED).await.unwrap(), 1);
    assert!(store.get_signal(&content_hash("Sync fails")).await.unwrap().is_some());
}

/// Scenario 2: a signal embedding close to an existing topic's centroid
/// attaches rather than creating a new topic, and updates signal_count/centroid.
#[tokio::test]
async fn attach_to_existing_topic() {
    let store = Arc::new(MemoryStore::default());
    let embedder = Arc::new(HashEmbedder::new(64));

    let seed_text = "the sync button spins forever and never finishes";
    let seed_v = embedder.embed(seed_text).await.unwrap();
    let clusterer = Clusterer::new(store.clone(), 0.75, 0.60);
    let topic_id = match clusterer.assign(&seed_v, "joplin", seed_text).await.unwrap() {
        ClusterDecision::New { topic_id } => topic_id,
        other => panic!("expected New, got {other:?}"),
    };

    let near_text = "the sync button spins forever and rarely finishes";
    let near_v = embedder.embed(near_text).await.unwrap();
    let decision = clusterer.assign(&near_v, "joplin", near_text).await.unwrap();

    assert_eq!(decision, ClusterDecision::Attach { topic_id });
    let topic = store.get_topic(topic_id).await.unwrap().unwrap();
    assert_eq!(topic.signal_count, 2);
}

/// Scenario 3: an ambiguous-similarity signal is triaged, not attached or promoted.
#[tokio::test]
async fn triage_ambiguous_signal() {
    let store = Arc::new(MemoryStore::default());
    let clusterer = Clusterer::new(store.clone(), 0.75, 0.60);

    let seed = unit_vec(vec![1.0, 0.0]);
    clusterer.assign(&seed, "joplin", "existing topic").await.unwrap();

    let ambiguous = unit_vec(vec![0.65, 0.76]); // cosine(seed, ambiguous) ~= 0.65
    let decision = clusterer.assign(&ambiguous, "joplin", "ambiguous report").await.unwrap();

    assert_eq!(decision, ClusterDecision::Triage);
}

fn unit_vec(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in v.iter_mut() {
        *x /= norm;
    }
    v
}

/// Scenario 4: an actionable classification materializes a Task.
#[tokio::test]
async fn classify_to_task() {
    let store = Arc::new(MemoryStore::default());
    let topic_id = seed_topic(&store, "joplin", "login crashes").await;

    let llm = Arc::new(ScriptedLlm {
        classification: bug_classification(),
        extracted_rules: vec![],
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
    assert_eq!(tasks[0].status, TaskStatus::Open);
    assert_eq!(tasks[0].category, Category::Bug);
    let topic = store.get_topic(topic_id).await.unwrap().unwrap();
    assert_eq!(topic.category, Some(Category::Bug));
}

/// Scenario 5: a non-actionable classification updates the topic but
/// creates no Task.
#[tokio::test]
async fn non_actionable_classification() {
    let store = Arc::new(MemoryStore::default());
    let topic_id = seed_topic(&store, "joplin", "random chatter").await;

    let llm = Arc::new(ScriptedLlm {
        classification: ClassificationOutput {
            actionable: true,
            category: Category::Other,
            title: "Miscellaneous".to_string(),
            summary: "Not actionable.".to_string(),
            severity: "low".to_string(),
            suggested_action: "none".to_string(),
            confidence: 0.9,
        },
        extracted_rules: vec![],
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

/// Scenario 6: a signed "PR merged" webhook completes the task and indexes
/// a SuccessfulFix retrievable by a later similar_fixes query.
#[tokio::test]
async fn webhook_merge_stores_successful_fix() {
    let (store, review, embedder) = wired_review_handler();

    let task = in_progress_task("joplin");
    let task_id = task.id;
    store.put_task(task.clone()).await.unwrap();

    review
        .handle(WebhookEvent::PrMerged {
            task_id,
            pr_url: "https://example.com/pr/9".to_string(),
            pr_title: "Fix cold-start crash".to_string(),
            files_changed: vec!["src/session.rs".to_string()],
        })
        .await;

    let updated = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Done);
    assert_eq!(updated.fix_status, FixStatus::Completed);

    let learning = LearningStore::new(store.clone(), embedder.clone());
    let query = embedder.embed(&updated.embedding_text()).await.unwrap();
    let found = learning.similar_fixes(&query, "joplin").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].task_id, task_id);
}

/// Scenario 7: review feedback extracts a rule once; a repeated identical
/// event increments times_applied instead of duplicating it.
#[tokio::test]
async fn review_feedback_extracts_rule_idempotently() {
    let store = Arc::new(MemoryStore::default());
    let embedder = Arc::new(HashEmbedder::new(64));
    let learning = Arc::new(LearningStore::new(store.clone(), embedder.clone()));
    let forge = Arc::new(ScriptedForge);
    let fix_runner = Arc::new(FixRunner::new(store.clone(), learning.clone(), forge, Duration::from_secs(5)));
    let llm = Arc::new(ScriptedLlm {
        classification: bug_classification(),
        extracted_rules: vec![ExtractedRule {
            content: "Use early returns".to_string(),
            category: RuleCategory::Style,
        }],
    });
    let review = ReviewHandler::new(store.clone(), learning, llm, fix_runner, "secret".to_string(), 0);

    let task = in_progress_task("joplin");
    let task_id = task.id;
    store.put_task(task.clone()).await.unwrap();

    review
        .handle(WebhookEvent::ChangesRequested {
            task_id,
            body: "use early returns".to_string(),
            reviewer: Some("alice".to_string()),
        })
        .await;
    review
        .handle(WebhookEvent::ChangesRequested {
            task_id,
            body: "use early returns".to_string(),
            reviewer: Some("bob".to_string()),
        })
        .await;

    let rules = store.list_rules("joplin").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].times_applied, 1);
    assert_eq!(rules[0].source, darwin_core::RuleSource::ReviewFeedback);
}

/// Scenario 8: two concurrent fix requests on the same task — exactly one
/// observes a fresh `running` transition.
#[tokio::test]
async fn concurrent_fix_attempt_has_one_winner() {
    let store = Arc::new(MemoryStore::default());
    let embedder = Arc::new(HashEmbedder::new(64));
    let learning = Arc::new(LearningStore::new(store.clone(), embedder));
    let forge = Arc::new(ScriptedForge);
    let fix_runner = Arc::new(FixRunner::new(store.clone(), learning, forge, Duration::from_secs(5)));

    let mut task = in_progress_task("joplin");
    task.fix_status = FixStatus::None;
    let task_id = task.id;
    store.put_task(task).await.unwrap();

    let (a, b) = tokio::join!(fix_runner.start_fix(task_id, None), fix_runner.start_fix(task_id, None));
    let winners = [a.unwrap(), b.unwrap()].into_iter().filter(|x| *x).count();
    assert_eq!(winners, 1);
}

/// End-to-end: ingest -> embed worker -> classify worker -> a materialized
/// Task, driven entirely through the queue rather than calling process()
/// methods directly.
#[tokio::test]
async fn full_pipeline_ingest_through_task_materialization() {
    let store = Arc::new(MemoryStore::default());
    let embedder = Arc::new(HashEmbedder::new(64));
    let ingest = IngestService::new(store.clone(), 10_000);
    let embed_worker = EmbedWorker::new(store.clone(), embedder, 0.75, 0.60, Duration::from_millis(50), 3);
    let llm = Arc::new(ScriptedLlm {
        classification: bug_classification(),
        extracted_rules: vec![],
    });
    let classify_worker = ClassifyWorker::new(store.clone(), llm, 0.5, Duration::from_millis(50), 3);

    ingest
        .ingest(vec![signal_input("the app crashes immediately after login", "joplin")])
        .await
        .unwrap();

    let hash = store.queue_pop(QUEUE_TO_EMBED, Duration::from_millis(100)).await.unwrap().unwrap();
    embed_worker.process(&hash).await;

    let topic_id_raw = store.queue_pop(QUEUE_TO_CLASSIFY, Duration::from_millis(100)).await.unwrap().unwrap();
    classify_worker.process(&topic_id_raw).await;

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
    assert_eq!(store.queue_len(QUEUE_TRIAGE).await.unwrap(), 0);
}

async fn seed_topic(store: &MemoryStore, product: &str, title: &str) -> uuid::Uuid {
    let id = uuid::Uuid::new_v4();
    let now = chrono::Utc::now();
    store
        .put_topic(darwin_core::Topic {
            id,
            title: title.to_string(),
            summary: String::new(),
            status: darwin_core::TopicStatus::Open,
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

fn in_progress_task(product: &str) -> darwin_core::Task {
    let now = chrono::Utc::now();
    darwin_core::Task {
        id: uuid::Uuid::new_v4(),
        topic_id: uuid::Uuid::new_v4(),
        category: Category::Bug,
        title: "Login crashes on cold start".to_string(),
        summary: "Multiple users report a crash.".to_string(),
        severity: "high".to_string(),
        suggested_action: "Guard against a null session.".to_string(),
        confidence: 0.9,
        product: product.to_string(),
        status: TaskStatus::InProgress,
        issue_url: None,
        issue_number: None,
        fix_status: FixStatus::Running,
        pr_url: None,
        branch: Some("fix/login-crash".to_string()),
        created_at: now,
        updated_at: now,
    }
}

fn wired_review_handler() -> (Arc<MemoryStore>, ReviewHandler, Arc<HashEmbedder>) {
    let store = Arc::new(MemoryStore::default());
    let embedder = Arc::new(HashEmbedder::new(64));
    let learning = Arc::new(LearningStore::new(store.clone(), embedder.clone()));
    let forge = Arc::new(ScriptedForge);
    let fix_runner = Arc::new(FixRunner::new(store.clone(), learning.clone(), forge, Duration::from_secs(5)));
    let llm = Arc::new(ScriptedLlm {
        classification: bug_classification(),
        extracted_rules: vec![],
    });
    let review = ReviewHandler::new(store.clone(), learning, llm, fix_runner, "secret".to_string(), 3);
    (store, review, embedder)
}
