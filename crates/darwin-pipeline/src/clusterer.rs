use std::sync::Arc;

use chrono::Utc;
use darwin_core::{rolling_mean, Result, Topic, TopicStatus, Vector};
use darwin_store::Store;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterDecision {
    Attach { topic_id: Uuid },
    Triage,
    New { topic_id: Uuid },
}

/// ANN-backed assignment of an embedding to a topic (spec §4.3).
pub struct Clusterer {
    store: Arc<dyn Store>,
    threshold_high: f32,
    threshold_low: f32,
}

const KNN_K: usize = 5;
const MAX_CAS_RETRIES: u32 = 5;

impl Clusterer {
    pub fn new(store: Arc<dyn Store>, threshold_high: f32, threshold_low: f32) -> Self {
        Self {
            store,
            threshold_high,
            threshold_low,
        }
    }

    pub async fn assign(&self, v: &Vector, product: &str, title_seed: &str) -> Result<ClusterDecision> {
        let candidates = self
            .store
            .topics_knn(product, TopicStatus::Open, v, KNN_K)
            .await?;

        let best = self.pick_best(candidates).await?;

        match best {
            Some((topic_id, similarity)) if similarity >= self.threshold_high => {
                self.attach(topic_id, v).await?;
                Ok(ClusterDecision::Attach { topic_id })
            }
            Some((_, similarity)) if similarity >= self.threshold_low => Ok(ClusterDecision::Triage),
            _ => {
                let topic_id = self.new_topic(v, product, title_seed).await?;
                Ok(ClusterDecision::New { topic_id })
            }
        }
    }

    /// Resolve ties within 1e-6 by lowest `created_at` then smallest id
    /// (spec §4.3 tie-breaking), since the store's KNN result is
    /// similarity-only.
    async fn pick_best(&self, candidates: Vec<(Uuid, f32)>) -> Result<Option<(Uuid, f32)>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let top_similarity = candidates.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let mut tied: Vec<(Uuid, f32, Topic)> = Vec::new();
        for (id, sim) in candidates {
            if (sim - top_similarity).abs() < 1e-6 {
                if let Some(topic) = self.store.get_topic(id).await? {
                    tied.push((id, sim, topic));
                }
            }
        }
        tied.sort_by(|a, b| a.2.created_at.cmp(&b.2.created_at).then(a.0.cmp(&b.0)));
        Ok(tied.into_iter().next().map(|(id, sim, _)| (id, sim)))
    }

    async fn attach(&self, topic_id: Uuid, v: &Vector) -> Result<()> {
        for attempt in 0..MAX_CAS_RETRIES {
            let topic = match self.store.get_topic(topic_id).await? {
                Some(t) => t,
                None => return Ok(()), // topic vanished (closed/deleted) — nothing to attach to
            };
            let new_centroid = rolling_mean(&topic.centroid, topic.signal_count, v);
            let ok = self
                .store
                .attach_signal_to_topic(topic_id, topic.signal_count, new_centroid)
                .await?;
            if ok {
                return Ok(());
            }
            tracing::debug!(topic_id = %topic_id, attempt, "centroid CAS conflict, retrying");
        }
        Err(darwin_core::DarwinError::Conflict(format!(
            "could not attach to topic {topic_id} after {MAX_CAS_RETRIES} retries"
        )))
    }

    async fn new_topic(&self, v: &Vector, product: &str, title_seed: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let title: String = title_seed
            .lines()
            .next()
            .unwrap_or(title_seed)
            .chars()
            .take(120)
            .collect();

        let topic = Topic {
            id,
            title,
            summary: String::new(),
            status: TopicStatus::Open,
            product: product.to_string(),
            category: None,
            signal_count: 1,
            centroid: darwin_core::normalized(v),
            created_at: now,
            updated_at: now,
        };
        self.store.put_topic(topic).await?;
        Ok(id)
    }
}
