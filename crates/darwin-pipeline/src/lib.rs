pub mod backoff;
pub mod classify_worker;
pub mod clusterer;
pub mod context;
pub mod embed_worker;
pub mod fix_runner;
pub mod forge_http;
pub mod ingest;
pub mod learning;
pub mod review;

pub use classify_worker::ClassifyWorker;
pub use clusterer::{ClusterDecision, Clusterer};
pub use context::AppContext;
pub use embed_worker::EmbedWorker;
pub use fix_runner::{FixContext, FixOutcome, FixRunner, ForgeAgent};
pub use forge_http::HttpForgeAgent;
pub use ingest::IngestService;
pub use learning::LearningStore;
pub use review::{ReviewHandler, WebhookEvent};
