//! In-process `Store` implementation. Backs every test in the workspace and
//! is a legitimate small-deployment backend on its own — durability across
//! process restarts is the only thing it gives up relative to `SqlStore`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use darwin_core::{
    cosine_similarity, normalized, DarwinError, DeadLetter, Result, Rule, Signal, SuccessfulFix,
    Task, Topic, TopicStatus, Vector,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::traits::{Store, TaskFilter};

struct QueueInner {
    deque: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// An in-memory `Store`. Cheap to clone (everything behind `Arc`).
#[derive(Clone, Default)]
pub struct MemoryStore {
    signals: Arc<DashMap<String, Signal>>,
    topics: Arc<DashMap<Uuid, Topic>>,
    tasks: Arc<DashMap<Uuid, Task>>,
    fixes: Arc<DashMap<Uuid, SuccessfulFix>>,
    rules: Arc<DashMap<Uuid, Rule>>,
    queues: Arc<DashMap<String, Arc<QueueInner>>>,
    dead_letters: Arc<DashMap<String, Mutex<Vec<DeadLetter>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueInner> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueInner::new()))
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_signal_if_absent(&self, signal: Signal) -> Result<bool> {
        match self.signals.entry(signal.hash.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(signal);
                Ok(true)
            }
        }
    }

    async fn get_signal(&self, hash: &str) -> Result<Option<Signal>> {
        Ok(self.signals.get(hash).map(|s| s.clone()))
    }

    async fn touch_signal_last_seen(&self, hash: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut s) = self.signals.get_mut(hash) {
            s.last_seen = now;
        }
        Ok(())
    }

    async fn set_signal_topic(&self, hash: &str, topic_id: Uuid) -> Result<()> {
        if let Some(mut s) = self.signals.get_mut(hash) {
            s.topic_id = Some(topic_id);
        }
        Ok(())
    }

    async fn list_signals(&self, product: Option<&str>, limit: usize) -> Result<Vec<Signal>> {
        let mut out: Vec<Signal> = self
            .signals
            .iter()
            .filter(|s| product.map(|p| p == s.product).unwrap_or(true))
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.last_seen));
        out.truncate(if limit == 0 { out.len() } else { limit });
        Ok(out)
    }

    async fn get_topic(&self, id: Uuid) -> Result<Option<Topic>> {
        Ok(self.topics.get(&id).map(|t| t.clone()))
    }

    async fn put_topic(&self, topic: Topic) -> Result<()> {
        self.topics.insert(topic.id, topic);
        Ok(())
    }

    async fn attach_signal_to_topic(
        &self,
        topic_id: Uuid,
        expected_signal_count: u32,
        new_centroid: Vector,
    ) -> Result<bool> {
        let mut entry = match self.topics.get_mut(&topic_id) {
            Some(e) => e,
            None => return Err(DarwinError::Store(format!("topic {topic_id} not found"))),
        };
        if entry.signal_count != expected_signal_count {
            return Ok(false);
        }
        entry.centroid = normalized(&new_centroid);
        entry.signal_count += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_topic_classification(
        &self,
        topic_id: Uuid,
        title: String,
        summary: String,
        category: darwin_core::Category,
    ) -> Result<()> {
        let mut entry = match self.topics.get_mut(&topic_id) {
            Some(e) => e,
            None => return Err(DarwinError::Store(format!("topic {topic_id} not found"))),
        };
        entry.title = title;
        entry.summary = summary;
        entry.category = Some(category);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        Ok(self.topics.iter().map(|t| t.clone()).collect())
    }

    async fn topics_knn(
        &self,
        product: &str,
        status: TopicStatus,
        query: &Vector,
        k: usize,
    ) -> Result<Vec<(Uuid, f32)>> {
        let mut scored: Vec<(Uuid, f32, DateTime<Utc>)> = self
            .topics
            .iter()
            .filter(|t| t.product == product && t.status == status)
            .map(|t| (t.id, cosine_similarity(&t.centroid, query), t.created_at))
            .collect();
        // Highest similarity first; ties broken by earliest created_at, then id
        // (spec §4.3 tie-breaking), applied here so callers get a deterministic order.
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
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn get_open_task_by_topic(&self, topic_id: Uuid) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .iter()
            .find(|t| t.topic_id == topic_id && t.status != darwin_core::TaskStatus::Done)
            .map(|t| t.clone()))
    }

    async fn put_task(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn update_task(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn cas_fix_status(
        &self,
        task_id: Uuid,
        expected: darwin_core::FixStatus,
        new: darwin_core::FixStatus,
    ) -> Result<bool> {
        let mut entry = match self.tasks.get_mut(&task_id) {
            Some(e) => e,
            None => return Err(DarwinError::Store(format!("task {task_id} not found"))),
        };
        if entry.fix_status != expected {
            return Ok(false);
        }
        entry.fix_status = new;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let mut out: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| filter.category.map(|c| c == t.category).unwrap_or(true))
            .filter(|t| filter.product.as_deref().map(|p| p == t.product).unwrap_or(true))
            .map(|t| t.clone())
            .collect();
        out.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        if filter.limit > 0 {
            out.truncate(filter.limit);
        }
        Ok(out)
    }

    async fn put_successful_fix(&self, fix: SuccessfulFix) -> Result<()> {
        self.fixes.insert(fix.task_id, fix);
        Ok(())
    }

    async fn get_successful_fix(&self, task_id: Uuid) -> Result<Option<SuccessfulFix>> {
        Ok(self.fixes.get(&task_id).map(|f| f.clone()))
    }

    async fn fixes_knn(
        &self,
        product: &str,
        query: &Vector,
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SuccessfulFix>> {
        let mut scored: Vec<(f32, SuccessfulFix)> = self
            .fixes
            .iter()
            .filter(|f| f.product == product)
            .map(|f| (cosine_similarity(&f.embedding, query), f.clone()))
            .filter(|(sim, _)| *sim >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, f)| f).collect())
    }

    async fn list_rules(&self, product: &str) -> Result<Vec<Rule>> {
        Ok(self
            .rules
            .iter()
            .filter(|r| r.product == product)
            .map(|r| r.clone())
            .collect())
    }

    async fn find_rule_by_normalized_content(
        &self,
        product: &str,
        normalized_content: &str,
    ) -> Result<Option<Rule>> {
        Ok(self
            .rules
            .iter()
            .find(|r| r.product == product && r.normalized_content() == normalized_content)
            .map(|r| r.clone()))
    }

    async fn put_rule(&self, rule: Rule) -> Result<()> {
        self.rules.insert(rule.id, rule);
        Ok(())
    }

    async fn bump_rule_applied(&self, rule_id: Uuid, _product: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut r) = self.rules.get_mut(&rule_id) {
            r.times_applied += 1;
            r.last_applied_at = Some(at);
        }
        Ok(())
    }

    async fn delete_rule(&self, rule_id: Uuid, _product: &str) -> Result<()> {
        self.rules.remove(&rule_id);
        Ok(())
    }

    async fn queue_push(&self, queue: &str, item: String) -> Result<()> {
        let q = self.queue(queue);
        q.deque.lock().push_back(item);
        q.notify.notify_one();
        Ok(())
    }

    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let q = self.queue(queue);
        if let Some(item) = q.deque.lock().pop_front() {
            return Ok(Some(item));
        }
        let notified = q.notify.notified();
        match tokio::time::timeout(timeout, notified).await {
            Ok(_) => Ok(q.deque.lock().pop_front()),
            Err(_) => Ok(None),
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        Ok(self.queue(queue).deque.lock().len() as u64)
    }

    async fn dead_letter_push(&self, queue: &str, item: DeadLetter) -> Result<()> {
        self.dead_letters
            .entry(queue.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(item);
        Ok(())
    }

    async fn dead_letter_list(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        Ok(self
            .dead_letters
            .get(queue)
            .map(|v| v.lock().clone())
            .unwrap_or_default())
    }
}
