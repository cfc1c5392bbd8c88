use std::sync::Arc;

use darwin_pipeline::{AppContext, FixRunner, IngestService, LearningStore, ReviewHandler};

/// Shared application state handed to every axum handler via `State`
/// (spec §9 "Global mutable state" — an explicit context, not a singleton).
pub struct AppState {
    pub ctx: AppContext,
    pub ingest: IngestService,
    pub learning: Arc<LearningStore>,
    pub fix_runner: Arc<FixRunner>,
    pub review: ReviewHandler,
}
