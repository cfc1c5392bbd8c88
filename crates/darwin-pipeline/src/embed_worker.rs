use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use darwin_core::{DeadLetter, Vector};
use darwin_embed::Embedder;
use darwin_store::{Store, QUEUE_TO_CLASSIFY, QUEUE_TO_EMBED, QUEUE_TO_EMBED_DEAD};
use tracing::{error, info, warn};

use crate::backoff::sleep_for_attempt;
use crate::clusterer::{ClusterDecision, Clusterer};

/// Drains `queue:to-embed`: embeds the signal text, assigns it to a topic,
/// and on new-topic promotion enqueues the topic for classification
/// (spec §4.2).
pub struct EmbedWorker {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    clusterer: Clusterer,
    poll_timeout: Duration,
    max_retries: u32,
}

impl EmbedWorker {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        threshold_high: f32,
        threshold_low: f32,
        poll_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let clusterer = Clusterer::new(store.clone(), threshold_high, threshold_low);
        Self {
            store,
            embedder,
            clusterer,
            poll_timeout,
            max_retries,
        }
    }

    /// Runs until `shutdown` resolves, draining any in-flight item first.
    pub async fn run(&self, shutdown: &tokio::sync::Notify) {
        loop {
            tokio::select! {
                popped = self.store.queue_pop(QUEUE_TO_EMBED, self.poll_timeout) => {
                    match popped {
                        Ok(Some(hash)) => self.process(&hash).await,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(error = %e, "store error popping to-embed queue");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("embed worker shutting down");
                    return;
                }
            }
        }
    }

    /// One iteration, exposed directly for tests and for a single-shot CLI mode.
    pub async fn process(&self, hash: &str) {
        let signal = match self.load_signal_with_retry(hash).await {
            Some(s) => s,
            None => return,
        };

        if signal.topic_id.is_some() {
            info!(hash, "signal already clustered, skipping");
            return;
        }

        let embedding = match self.embed_with_retry(&signal.normalized).await {
            Some(v) => v,
            None => {
                self.dead_letter(hash, "embedding retries exhausted").await;
                return;
            }
        };

        match self.assign_with_retry(&embedding, &signal.product, &signal.text).await {
            Some(ClusterDecision::Attach { topic_id }) => {
                if let Err(e) = self.store.set_signal_topic(hash, topic_id).await {
                    error!(hash, error = %e, "failed to set signal topic after attach");
                }
            }
            Some(ClusterDecision::Triage) => {
                if let Err(e) = self.store.queue_push(darwin_store::QUEUE_TRIAGE, hash.to_string()).await {
                    error!(hash, error = %e, "failed to enqueue triage signal");
                }
            }
            Some(ClusterDecision::New { topic_id }) => {
                if let Err(e) = self.store.set_signal_topic(hash, topic_id).await {
                    error!(hash, error = %e, "failed to set signal topic after new-topic");
                }
                if let Err(e) = self.store.queue_push(QUEUE_TO_CLASSIFY, topic_id.to_string()).await {
                    error!(hash, error = %e, "failed to enqueue new topic for classification");
                }
            }
            None => {
                self.dead_letter(hash, "cluster assignment retries exhausted").await;
            }
        }
    }

    async fn load_signal_with_retry(&self, hash: &str) -> Option<darwin_core::Signal> {
        for attempt in 0..3 {
            match self.store.get_signal(hash).await {
                Ok(Some(signal)) => return Some(signal),
                Ok(None) if attempt + 1 < 3 => sleep_for_attempt(attempt).await,
                Ok(None) => {
                    warn!(hash, "signal missing after retries, dropping");
                    return None;
                }
                Err(e) => {
                    warn!(hash, error = %e, "store error loading signal, retrying indefinitely");
                    sleep_for_attempt(attempt.min(6)).await;
                }
            }
        }
        None
    }

    async fn embed_with_retry(&self, text: &str) -> Option<Vector> {
        for attempt in 0..self.max_retries {
            match self.embedder.embed(text).await {
                Ok(v) => return Some(v),
                Err(e) => {
                    warn!(error = %e, attempt, "embedding call failed, retrying");
                    sleep_for_attempt(attempt).await;
                }
            }
        }
        None
    }

    async fn assign_with_retry(&self, v: &Vector, product: &str, title_seed: &str) -> Option<ClusterDecision> {
        for attempt in 0..self.max_retries {
            match self.clusterer.assign(v, product, title_seed).await {
                Ok(decision) => return Some(decision),
                Err(e) => {
                    warn!(error = %e, attempt, "cluster assignment failed, retrying");
                    sleep_for_attempt(attempt).await;
                }
            }
        }
        None
    }

    async fn dead_letter(&self, hash: &str, reason: &str) {
        warn!(hash, reason, "moving signal to dead-letter queue");
        let _ = self
            .store
            .dead_letter_push(
                QUEUE_TO_EMBED_DEAD,
                DeadLetter {
                    key: hash.to_string(),
                    reason: reason.to_string(),
                    failed_at: Utc::now(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darwin_core::{content_hash, normalize};
    use darwin_embed::HashEmbedder;
    use darwin_store::MemoryStore;

    async fn seed_signal(store: &MemoryStore, text: &str, product: &str) -> String {
        let hash = content_hash(text);
        let now = Utc::now();
        store
            .put_signal_if_absent(darwin_core::Signal {
                hash: hash.clone(),
                text: text.to_string(),
                normalized: normalize(text),
                source: "forum".to_string(),
                url: None,
                title: None,
                author: None,
                product: product.to_string(),
                topic_id: None,
                first_seen: now,
                last_seen: now,
            })
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn new_signal_creates_topic_and_enqueues_for_classification() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let worker = EmbedWorker::new(store.clone(), embedder, 0.75, 0.60, Duration::from_millis(50), 3);

        let hash = seed_signal(&store, "the sync button does nothing", "joplin").await;
        worker.process(&hash).await;

        let signal = store.get_signal(&hash).await.unwrap().unwrap();
        assert!(signal.topic_id.is_some());
        assert_eq!(store.queue_len(QUEUE_TO_CLASSIFY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn already_clustered_signal_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let worker = EmbedWorker::new(store.clone(), embedder, 0.75, 0.60, Duration::from_millis(50), 3);

        let hash = seed_signal(&store, "already assigned", "joplin").await;
        let topic_id = uuid::Uuid::new_v4();
        store.set_signal_topic(&hash, topic_id).await.unwrap();

        worker.process(&hash).await;

        assert_eq!(store.queue_len(QUEUE_TO_CLASSIFY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_signal_is_dropped_without_panic() {
        let store = Arc::new(MemoryStore::default());
        let embedder = Arc::new(HashEmbedder::new(64));
        let worker = EmbedWorker::new(store.clone(), embedder, 0.75, 0.60, Duration::from_millis(10), 2);

        worker.process("does-not-exist").await;
    }
}
