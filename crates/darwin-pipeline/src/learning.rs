use std::sync::Arc;

use chrono::Utc;
use darwin_core::{normalize, Result, Rule, RuleCategory, RuleSource, SuccessfulFix, Task, Vector};
use darwin_embed::Embedder;
use darwin_store::Store;
use uuid::Uuid;

const SIMILAR_FIXES_K: usize = 3;
const SIMILAR_FIXES_MIN_SIMILARITY: f32 = 0.5;
const TOP_RULES_K: usize = 20;
const MAX_RULE_CONTENT_CHARS: usize = 500;

/// Retrieval and ingestion for past fixes and extracted rules (spec §4.6).
pub struct LearningStore {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
}

impl LearningStore {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub async fn similar_fixes(&self, task_embedding: &Vector, product: &str) -> Result<Vec<SuccessfulFix>> {
        self.store
            .fixes_knn(product, task_embedding, SIMILAR_FIXES_K, SIMILAR_FIXES_MIN_SIMILARITY)
            .await
    }

    /// Embeds a task's title/summary for fix retrieval (spec §4.6 `store_success`).
    pub async fn similar_fixes_embedding(&self, task: &Task) -> Result<Vector> {
        self.embedder.embed(&task.embedding_text()).await
    }

    /// Rules for `product`, ranked `times_applied desc, last_applied_at desc, created_at asc`.
    pub async fn top_rules(&self, product: &str) -> Result<Vec<Rule>> {
        let mut rules = self.store.list_rules(product).await?;
        rules.sort_by(|a, b| {
            b.times_applied
                .cmp(&a.times_applied)
                .then(b.last_applied_at.cmp(&a.last_applied_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        rules.truncate(TOP_RULES_K);
        Ok(rules)
    }

    pub async fn store_success(&self, task: &Task, pr_title: &str, pr_url: &str, branch: &str, files_changed: Vec<String>) -> Result<()> {
        if self.store.get_successful_fix(task.id).await?.is_some() {
            return Ok(()); // re-delivery of a merge event is a no-op (spec §9 open question)
        }

        let embedding = self.embedder.embed(&task.embedding_text()).await?;

        let fix = SuccessfulFix {
            task_id: task.id,
            topic_id: task.topic_id,
            category: task.category,
            title: task.title.clone(),
            summary: task.summary.clone(),
            product: task.product.clone(),
            pr_title: pr_title.to_string(),
            pr_url: pr_url.to_string(),
            branch: branch.to_string(),
            merged_at: Utc::now(),
            files_changed,
            embedding,
        };
        self.store.put_successful_fix(fix).await
    }

    /// Rules are deduplicated by normalized content per product: an upsert
    /// whose normalized content matches an existing rule bumps
    /// `times_applied`/`last_applied_at` instead of inserting a duplicate.
    /// Rejects content exceeding 500 chars after strip (spec §4.8).
    pub async fn upsert_rule(
        &self,
        product: &str,
        content: &str,
        category: RuleCategory,
        source: RuleSource,
        source_task_id: Option<Uuid>,
        reviewer: Option<String>,
    ) -> Result<Option<Rule>> {
        let trimmed = content.trim();
        if trimmed.chars().count() > MAX_RULE_CONTENT_CHARS {
            return Ok(None);
        }

        let normalized_content = normalize(trimmed);
        let now = Utc::now();

        if let Some(existing) = self
            .store
            .find_rule_by_normalized_content(product, &normalized_content)
            .await?
        {
            self.store.bump_rule_applied(existing.id, product, now).await?;
            let mut updated = existing;
            updated.times_applied += 1;
            updated.last_applied_at = Some(now);
            return Ok(Some(updated));
        }

        let rule = Rule {
            id: Uuid::new_v4(),
            product: product.to_string(),
            content: trimmed.to_string(),
            category,
            source,
            source_task_id,
            reviewer,
            times_applied: 0,
            last_applied_at: None,
            created_at: now,
        };
        self.store.put_rule(rule.clone()).await?;
        Ok(Some(rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darwin_core::{Category, FixStatus, TaskStatus};
    use darwin_embed::HashEmbedder;
    use darwin_store::MemoryStore;

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            category: Category::Bug,
            title: "Sync fails on startup".to_string(),
            summary: "Cold start drops the handshake.".to_string(),
            severity: "high".to_string(),
            suggested_action: "Add a retry".to_string(),
            confidence: 0.9,
            product: "joplin".to_string(),
            status: TaskStatus::InProgress,
            issue_url: None,
            issue_number: None,
            fix_status: FixStatus::Running,
            pr_url: None,
            branch: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn store_success_then_similar_fixes_finds_it() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = LearningStore::new(store, embedder.clone());

        let t = task();
        learning
            .store_success(&t, "Fix sync handshake", "https://example.com/pr/1", "fix/sync", vec!["src/sync.rs".to_string()])
            .await
            .unwrap();

        let query = embedder.embed(&t.embedding_text()).await.unwrap();
        let found = learning.similar_fixes(&query, "joplin").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, t.id);
    }

    #[tokio::test]
    async fn repeated_merge_event_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = LearningStore::new(store, embedder);

        let t = task();
        learning.store_success(&t, "title", "url", "branch", vec![]).await.unwrap();
        learning.store_success(&t, "title", "url", "branch", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_rule_dedups_by_normalized_content() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = LearningStore::new(store, embedder);

        let r1 = learning
            .upsert_rule("joplin", "Use early returns", RuleCategory::Style, RuleSource::ReviewFeedback, None, Some("alice".to_string()))
            .await
            .unwrap()
            .unwrap();
        let r2 = learning
            .upsert_rule("joplin", "  use   EARLY returns  ", RuleCategory::Style, RuleSource::ReviewFeedback, None, Some("bob".to_string()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(r1.id, r2.id);
        assert_eq!(r2.times_applied, 1);

        let rules = learning.top_rules("joplin").await.unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn upsert_rule_rejects_overlong_content() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = LearningStore::new(store, embedder);

        let too_long = "x".repeat(501);
        let result = learning
            .upsert_rule("joplin", &too_long, RuleCategory::Style, RuleSource::Manual, None, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn top_rules_orders_by_times_applied_then_recency() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let learning = LearningStore::new(store, embedder);

        let low = learning
            .upsert_rule("joplin", "rule A", RuleCategory::Convention, RuleSource::Manual, None, None)
            .await
            .unwrap()
            .unwrap();
        let high = learning
            .upsert_rule("joplin", "rule B", RuleCategory::Convention, RuleSource::Manual, None, None)
            .await
            .unwrap()
            .unwrap();
        // apply "rule B" twice more so it outranks "rule A"
        learning
            .upsert_rule("joplin", "rule B", RuleCategory::Convention, RuleSource::Manual, None, None)
            .await
            .unwrap();
        learning
            .upsert_rule("joplin", "rule B", RuleCategory::Convention, RuleSource::Manual, None, None)
            .await
            .unwrap();

        let ranked = learning.top_rules("joplin").await.unwrap();
        assert_eq!(ranked[0].id, high.id);
        assert_eq!(ranked[1].id, low.id);
    }
}
