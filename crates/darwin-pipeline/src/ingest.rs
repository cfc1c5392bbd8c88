use std::sync::Arc;

use chrono::Utc;
use darwin_core::{content_hash, normalize, BatchResult, IngestOutcome, Result, Signal, SignalInput};
use darwin_store::{Store, QUEUE_TO_EMBED};
use tracing::{info, warn};

/// Normalizes inbound signals, computes a content hash, stores new ones, and
/// enqueues them for embedding (spec §4.1).
pub struct IngestService {
    store: Arc<dyn Store>,
    backpressure_threshold: u64,
}

impl IngestService {
    pub fn new(store: Arc<dyn Store>, backpressure_threshold: u64) -> Self {
        Self {
            store,
            backpressure_threshold,
        }
    }

    pub async fn ingest(&self, inputs: Vec<SignalInput>) -> Result<BatchResult> {
        let total = inputs.len();
        let mut queued = 0;
        let mut duplicates = 0;
        let mut invalid = 0;
        let mut outcomes = Vec::with_capacity(total);

        for input in inputs {
            let outcome = self.ingest_one(input).await;
            match outcome {
                IngestOutcome::Queued => queued += 1,
                IngestOutcome::Duplicate => duplicates += 1,
                IngestOutcome::Invalid => invalid += 1,
            }
            outcomes.push(outcome);
        }

        let queue_len = self.store.queue_len(QUEUE_TO_EMBED).await?;
        let delayed = queue_len > self.backpressure_threshold;
        if delayed {
            warn!(queue_len, threshold = self.backpressure_threshold, "to-embed queue over backpressure threshold");
        }

        Ok(BatchResult {
            total,
            queued,
            duplicates,
            invalid,
            outcomes,
            delayed,
        })
    }

    async fn ingest_one(&self, input: SignalInput) -> IngestOutcome {
        let normalized = normalize(&input.text);
        if normalized.len() < 3 || input.product.trim().is_empty() {
            return IngestOutcome::Invalid;
        }

        let hash = content_hash(&input.text);
        let now = input.timestamp.unwrap_or_else(Utc::now);

        let signal = Signal {
            hash: hash.clone(),
            text: input.text,
            normalized,
            source: input.source,
            url: input.url,
            title: input.title,
            author: input.author,
            product: input.product,
            topic_id: None,
            first_seen: now,
            last_seen: now,
        };

        match self.store.put_signal_if_absent(signal).await {
            Ok(true) => match self.store.queue_push(QUEUE_TO_EMBED, hash.clone()).await {
                Ok(()) => {
                    info!(hash = %hash, "signal queued for embedding");
                    IngestOutcome::Queued
                }
                Err(e) => {
                    warn!(hash = %hash, error = %e, "failed to enqueue signal for embedding");
                    IngestOutcome::Invalid
                }
            },
            Ok(false) => {
                if let Err(e) = self.store.touch_signal_last_seen(&hash, now).await {
                    warn!(hash = %hash, error = %e, "failed to bump last_seen on duplicate");
                }
                IngestOutcome::Duplicate
            }
            Err(e) => {
                warn!(hash = %hash, error = %e, "store write failed during ingest");
                IngestOutcome::Invalid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darwin_store::MemoryStore;

    fn input(text: &str, product: &str) -> SignalInput {
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

    #[tokio::test]
    async fn duplicate_ingestion_yields_one_queued_one_duplicate() {
        let store = Arc::new(MemoryStore::default());
        let svc = IngestService::new(store.clone(), 10_000);

        let result = svc
            .ingest(vec![input("Sync fails", "joplin"), input("Sync fails", "joplin")])
            .await
            .unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.queued, 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.invalid, 0);

        let hash = content_hash("Sync fails");
        assert!(store.get_signal(&hash).await.unwrap().is_some());
        assert_eq!(store.queue_len(QUEUE_TO_EMBED).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_too_short_or_empty_product() {
        let store = Arc::new(MemoryStore::default());
        let svc = IngestService::new(store, 10_000);

        let result = svc
            .ingest(vec![input("hi", "joplin"), input("a real complaint", "")])
            .await
            .unwrap();

        assert_eq!(result.invalid, 2);
        assert_eq!(result.queued, 0);
    }

    #[tokio::test]
    async fn flags_delayed_once_backpressure_threshold_exceeded() {
        let store = Arc::new(MemoryStore::default());
        let svc = IngestService::new(store, 1);

        let result = svc
            .ingest(vec![input("first complaint here", "joplin"), input("second complaint here", "joplin")])
            .await
            .unwrap();

        assert!(result.delayed);
    }
}
