use std::sync::Arc;

use darwin_core::Config;
use darwin_embed::Embedder;
use darwin_llm::LlmProvider;
use darwin_store::Store;

/// The pipeline's dependency container, passed explicitly to every worker and
/// handler (spec §9 "Global mutable state" — no hidden singletons).
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LlmProvider>,
    pub forge: Arc<dyn crate::fix_runner::ForgeAgent>,
    pub config: Arc<Config>,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmProvider>,
        forge: Arc<dyn crate::fix_runner::ForgeAgent>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            forge,
            config,
        }
    }
}
