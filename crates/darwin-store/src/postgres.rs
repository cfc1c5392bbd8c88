//! PostgreSQL-backed `Store`. The production backend — durable queues and
//! records that survive process restart, per spec §9's durability note.
//!
//! Vectors are stored as JSONB arrays rather than via the `pgvector`
//! extension: ANN lookups fetch the filtered candidate set and score cosine
//! similarity in Rust. This keeps the schema free of an extra extension
//! dependency at the cost of O(n) scans per product — acceptable at Darwin's
//! scale (a handful of open topics per product), matching the teacher's
//! annotation in `rootsignal-common`'s design notes that vector *storage*
//! duality is not required, only a canonical encoding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use darwin_core::{
    cosine_similarity, normalized, Category, DarwinError, DeadLetter, FixStatus, Result, Rule,
    RuleCategory, RuleSource, Signal, SuccessfulFix, Task, TaskStatus, Topic, TopicStatus, Vector,
};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::traits::{Store, TaskFilter};

#[derive(Clone)]
pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> DarwinError {
    DarwinError::Store(e.to_string())
}

fn vec_to_json(v: &Vector) -> serde_json::Value {
    serde_json::to_value(v).expect("Vec<f32> always serializes")
}

fn json_to_vec(v: serde_json::Value) -> Vector {
    serde_json::from_value(v).unwrap_or_default()
}

#[async_trait]
impl Store for SqlStore {
    async fn put_signal_if_absent(&self, signal: Signal) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (hash, text, normalized, source, url, title, author, product, topic_id, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(&signal.hash)
        .bind(&signal.text)
        .bind(&signal.normalized)
        .bind(&signal.source)
        .bind(&signal.url)
        .bind(&signal.title)
        .bind(&signal.author)
        .bind(&signal.product)
        .bind(signal.topic_id)
        .bind(signal.first_seen)
        .bind(signal.last_seen)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_signal(&self, hash: &str) -> Result<Option<Signal>> {
        let row = sqlx::query(
            "SELECT hash, text, normalized, source, url, title, author, product, topic_id, first_seen, last_seen FROM signals WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| Signal {
            hash: r.get("hash"),
            text: r.get("text"),
            normalized: r.get("normalized"),
            source: r.get("source"),
            url: r.get("url"),
            title: r.get("title"),
            author: r.get("author"),
            product: r.get("product"),
            topic_id: r.get("topic_id"),
            first_seen: r.get("first_seen"),
            last_seen: r.get("last_seen"),
        }))
    }

    async fn touch_signal_last_seen(&self, hash: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE signals SET last_seen = $2 WHERE hash = $1")
            .bind(hash)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_signal_topic(&self, hash: &str, topic_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE signals SET topic_id = $2 WHERE hash = $1")
            .bind(hash)
            .bind(topic_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_signals(&self, product: Option<&str>, limit: usize) -> Result<Vec<Signal>> {
        let limit = if limit == 0 { 1000 } else { limit as i64 };
        let rows = sqlx::query(
            "SELECT hash, text, normalized, source, url, title, author, product, topic_id, first_seen, last_seen
             FROM signals WHERE ($1::text IS NULL OR product = $1) ORDER BY last_seen DESC LIMIT $2",
        )
        .bind(product)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Signal {
                hash: r.get("hash"),
                text: r.get("text"),
                normalized: r.get("normalized"),
                source: r.get("source"),
                url: r.get("url"),
                title: r.get("title"),
                author: r.get("author"),
                product: r.get("product"),
                topic_id: r.get("topic_id"),
                first_seen: r.get("first_seen"),
                last_seen: r.get("last_seen"),
            })
            .collect())
    }

    async fn get_topic(&self, id: Uuid) -> Result<Option<Topic>> {
        let row = sqlx::query(
            "SELECT id, title, summary, status, product, category, signal_count, centroid, created_at, updated_at
             FROM topics WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_topic))
    }

    async fn put_topic(&self, topic: Topic) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO topics (id, title, summary, status, product, category, signal_count, centroid, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title, summary = EXCLUDED.summary, status = EXCLUDED.status,
                category = EXCLUDED.category, signal_count = EXCLUDED.signal_count,
                centroid = EXCLUDED.centroid, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(topic.id)
        .bind(&topic.title)
        .bind(&topic.summary)
        .bind(topic.status.to_string())
        .bind(&topic.product)
        .bind(topic.category.map(|c| c.to_string()))
        .bind(topic.signal_count as i32)
        .bind(vec_to_json(&topic.centroid))
        .bind(topic.created_at)
        .bind(topic.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn attach_signal_to_topic(
        &self,
        topic_id: Uuid,
        expected_signal_count: u32,
        new_centroid: Vector,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE topics SET centroid = $3, signal_count = signal_count + 1, updated_at = now()
            WHERE id = $1 AND signal_count = $2
            "#,
        )
        .bind(topic_id)
        .bind(expected_signal_count as i32)
        .bind(vec_to_json(&normalized(&new_centroid)))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_topic_classification(
        &self,
        topic_id: Uuid,
        title: String,
        summary: String,
        category: Category,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE topics SET title = $2, summary = $3, category = $4, updated_at = now() WHERE id = $1",
        )
        .bind(topic_id)
        .bind(title)
        .bind(summary)
        .bind(category.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        let rows = sqlx::query(
            "SELECT id, title, summary, status, product, category, signal_count, centroid, created_at, updated_at FROM topics",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(row_to_topic).collect())
    }

    async fn topics_knn(
        &self,
        product: &str,
        status: TopicStatus,
        query: &Vector,
        k: usize,
    ) -> Result<Vec<(Uuid, f32)>> {
        let rows = sqlx::query(
            "SELECT id, centroid, created_at FROM topics WHERE product = $1 AND status = $2",
        )
        .bind(product)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut scored: Vec<(Uuid, f32, DateTime<Utc>)> = rows
            .into_iter()
            .map(|r| {
                let id: Uuid = r.get("id");
                let centroid = json_to_vec(r.get("centroid"));
                let created_at: DateTime<Utc> = r.get("created_at");
                (id, cosine_similarity(&centroid, query), created_at)
            })
            .collect();

        scored.sort_by(|a, b| {
            let sim_cmp = b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal);
            if sim_cmp != std::cmp::Ordering::Equal && (a.1 - b.1).abs() >= 1e-6 {
                return sim_cmp;
            }
            a.2.cmp(&b.2).then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, sim, _)| (id, sim)).collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, topic_id, category, title, summary, severity, suggested_action, confidence,
                    product, status, issue_url, issue_number, fix_status, pr_url, branch, created_at, updated_at
             FROM tasks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_task))
    }

    async fn get_open_task_by_topic(&self, topic_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, topic_id, category, title, summary, severity, suggested_action, confidence,
                    product, status, issue_url, issue_number, fix_status, pr_url, branch, created_at, updated_at
             FROM tasks WHERE topic_id = $1 AND status != 'done' LIMIT 1",
        )
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_task))
    }

    async fn put_task(&self, task: Task) -> Result<()> {
        self.update_task(task).await
    }

    async fn update_task(&self, task: Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, topic_id, category, title, summary, severity, suggested_action, confidence,
                                product, status, issue_url, issue_number, fix_status, pr_url, branch, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                category = EXCLUDED.category, title = EXCLUDED.title, summary = EXCLUDED.summary,
                severity = EXCLUDED.severity, suggested_action = EXCLUDED.suggested_action,
                confidence = EXCLUDED.confidence, status = EXCLUDED.status, issue_url = EXCLUDED.issue_url,
                issue_number = EXCLUDED.issue_number, fix_status = EXCLUDED.fix_status,
                pr_url = EXCLUDED.pr_url, branch = EXCLUDED.branch, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task.id)
        .bind(task.topic_id)
        .bind(task.category.to_string())
        .bind(&task.title)
        .bind(&task.summary)
        .bind(&task.severity)
        .bind(&task.suggested_action)
        .bind(task.confidence)
        .bind(&task.product)
        .bind(task.status.to_string())
        .bind(&task.issue_url)
        .bind(task.issue_number.map(|n| n as i64))
        .bind(task.fix_status.to_string())
        .bind(&task.pr_url)
        .bind(&task.branch)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn cas_fix_status(&self, task_id: Uuid, expected: FixStatus, new: FixStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET fix_status = $3, updated_at = now() WHERE id = $1 AND fix_status = $2",
        )
        .bind(task_id)
        .bind(expected.to_string())
        .bind(new.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let limit = if filter.limit == 0 { 1000 } else { filter.limit as i64 };
        let rows = sqlx::query(
            r#"
            SELECT id, topic_id, category, title, summary, severity, suggested_action, confidence,
                   product, status, issue_url, issue_number, fix_status, pr_url, branch, created_at, updated_at
            FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR category = $2)
              AND ($3::text IS NULL OR product = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.category.map(|c| c.to_string()))
        .bind(filter.product)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(row_to_task).collect())
    }

    async fn put_successful_fix(&self, fix: SuccessfulFix) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO successful_fixes (task_id, topic_id, category, title, summary, product, pr_title, pr_url, branch, merged_at, files_changed, embedding)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(fix.task_id)
        .bind(fix.topic_id)
        .bind(fix.category.to_string())
        .bind(&fix.title)
        .bind(&fix.summary)
        .bind(&fix.product)
        .bind(&fix.pr_title)
        .bind(&fix.pr_url)
        .bind(&fix.branch)
        .bind(fix.merged_at)
        .bind(serde_json::to_value(&fix.files_changed).unwrap())
        .bind(vec_to_json(&fix.embedding))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_successful_fix(&self, task_id: Uuid) -> Result<Option<SuccessfulFix>> {
        let row = sqlx::query(
            "SELECT task_id, topic_id, category, title, summary, product, pr_title, pr_url, branch, merged_at, files_changed, embedding
             FROM successful_fixes WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_fix))
    }

    async fn fixes_knn(
        &self,
        product: &str,
        query: &Vector,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SuccessfulFix>> {
        let rows = sqlx::query(
            "SELECT task_id, topic_id, category, title, summary, product, pr_title, pr_url, branch, merged_at, files_changed, embedding
             FROM successful_fixes WHERE product = $1",
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut scored: Vec<(f32, SuccessfulFix)> = rows
            .into_iter()
            .map(row_to_fix)
            .map(|f| (cosine_similarity(&f.embedding, query), f))
            .filter(|(sim, _)| *sim >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, f)| f).collect())
    }

    async fn list_rules(&self, product: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            "SELECT id, product, content, category, source, source_task_id, reviewer, times_applied, last_applied_at, created_at
             FROM rules WHERE product = $1",
        )
        .bind(product)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(row_to_rule).collect())
    }

    async fn find_rule_by_normalized_content(
        &self,
        product: &str,
        normalized_content: &str,
    ) -> Result<Option<Rule>> {
        let rules = self.list_rules(product).await?;
        Ok(rules
            .into_iter()
            .find(|r| r.normalized_content() == normalized_content))
    }

    async fn put_rule(&self, rule: Rule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rules (id, product, content, category, source, source_task_id, reviewer, times_applied, last_applied_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                times_applied = EXCLUDED.times_applied, last_applied_at = EXCLUDED.last_applied_at
            "#,
        )
        .bind(rule.id)
        .bind(&rule.product)
        .bind(&rule.content)
        .bind(rule.category.to_string())
        .bind(rule.source.to_string())
        .bind(rule.source_task_id)
        .bind(&rule.reviewer)
        .bind(rule.times_applied as i64)
        .bind(rule.last_applied_at)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn bump_rule_applied(&self, rule_id: Uuid, _product: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE rules SET times_applied = times_applied + 1, last_applied_at = $2 WHERE id = $1")
            .bind(rule_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_rule(&self, rule_id: Uuid, _product: &str) -> Result<()> {
        sqlx::query("DELETE FROM rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn queue_push(&self, queue: &str, item: String) -> Result<()> {
        sqlx::query("INSERT INTO queues (queue, item) VALUES ($1, $2)")
            .bind(queue)
            .bind(item)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Polls for a row at a fixed interval up to `timeout`, matching the
    /// teacher's fallback polling pattern in `rootsignal-events`'s
    /// `EventStore::subscribe` (LISTEN/NOTIFY is a wake-up nudge, not a
    /// delivery guarantee — the poll is what's actually correct).
    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut tx = self.pool.begin().await.map_err(store_err)?;
            let row = sqlx::query(
                "SELECT seq, item FROM queues WHERE queue = $1 ORDER BY seq ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .bind(queue)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

            if let Some(row) = row {
                let seq: i64 = row.get("seq");
                let item: String = row.get("item");
                sqlx::query("DELETE FROM queues WHERE queue = $1 AND seq = $2")
                    .bind(queue)
                    .bind(seq)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                tx.commit().await.map_err(store_err)?;
                return Ok(Some(item));
            }
            tx.rollback().await.map_err(store_err)?;

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100).min(timeout)).await;
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let row = sqlx::query("SELECT count(*) AS n FROM queues WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn dead_letter_push(&self, queue: &str, item: DeadLetter) -> Result<()> {
        sqlx::query("INSERT INTO dead_letters (queue, item_key, reason, failed_at) VALUES ($1, $2, $3, $4)")
            .bind(queue)
            .bind(&item.key)
            .bind(&item.reason)
            .bind(item.failed_at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn dead_letter_list(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT item_key, reason, failed_at FROM dead_letters WHERE queue = $1")
            .bind(queue)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|r| DeadLetter {
                key: r.get("item_key"),
                reason: r.get("reason"),
                failed_at: r.get("failed_at"),
            })
            .collect())
    }
}

fn row_to_topic(r: sqlx::postgres::PgRow) -> Topic {
    Topic {
        id: r.get("id"),
        title: r.get("title"),
        summary: r.get("summary"),
        status: TopicStatus::from_str(r.get::<String, _>("status").as_str()).unwrap_or(TopicStatus::Open),
        product: r.get("product"),
        category: r
            .get::<Option<String>, _>("category")
            .and_then(|c| Category::from_str(&c).ok()),
        signal_count: r.get::<i32, _>("signal_count") as u32,
        centroid: json_to_vec(r.get("centroid")),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_task(r: sqlx::postgres::PgRow) -> Task {
    Task {
        id: r.get("id"),
        topic_id: r.get("topic_id"),
        category: Category::from_str(r.get::<String, _>("category").as_str()).unwrap_or(Category::Other),
        title: r.get("title"),
        summary: r.get("summary"),
        severity: r.get("severity"),
        suggested_action: r.get("suggested_action"),
        confidence: r.get("confidence"),
        product: r.get("product"),
        status: TaskStatus::from_str(r.get::<String, _>("status").as_str()).unwrap_or(TaskStatus::Open),
        issue_url: r.get("issue_url"),
        issue_number: r.get::<Option<i64>, _>("issue_number").map(|n| n as u64),
        fix_status: FixStatus::from_str(r.get::<String, _>("fix_status").as_str()).unwrap_or(FixStatus::None),
        pr_url: r.get("pr_url"),
        branch: r.get("branch"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_fix(r: sqlx::postgres::PgRow) -> SuccessfulFix {
    SuccessfulFix {
        task_id: r.get("task_id"),
        topic_id: r.get("topic_id"),
        category: Category::from_str(r.get::<String, _>("category").as_str()).unwrap_or(Category::Other),
        title: r.get("title"),
        summary: r.get("summary"),
        product: r.get("product"),
        pr_title: r.get("pr_title"),
        pr_url: r.get("pr_url"),
        branch: r.get("branch"),
        merged_at: r.get("merged_at"),
        files_changed: serde_json::from_value(r.get("files_changed")).unwrap_or_default(),
        embedding: json_to_vec(r.get("embedding")),
    }
}

fn row_to_rule(r: sqlx::postgres::PgRow) -> Rule {
    Rule {
        id: r.get("id"),
        product: r.get("product"),
        content: r.get("content"),
        category: RuleCategory::from_str(r.get::<String, _>("category").as_str()).unwrap_or(RuleCategory::Convention),
        source: RuleSource::from_str(r.get::<String, _>("source").as_str()).unwrap_or(RuleSource::Manual),
        source_task_id: r.get("source_task_id"),
        reviewer: r.get("reviewer"),
        times_applied: r.get::<i64, _>("times_applied") as u64,
        last_applied_at: r.get("last_applied_at"),
        created_at: r.get("created_at"),
    }
}
