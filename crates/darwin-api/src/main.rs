use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use darwin_core::Config;
use darwin_embed::{Embedder, HashEmbedder, RemoteEmbedder};
use darwin_llm::{ClaudeProvider, LlmProvider};
use darwin_pipeline::{AppContext, ClassifyWorker, EmbedWorker, FixRunner, HttpForgeAgent, IngestService, LearningStore, ReviewHandler};
use darwin_store::Store;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod error;
mod handlers;
mod state;
mod telemetry;
mod webhooks;

use state::AppState;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_STORE_UNAVAILABLE: i32 = 2;
const EXIT_PROVIDER_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    telemetry::init();

    match run().await {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "darwin-api exited with an error");
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    if let Some(darwin_core::DarwinError::Store(_)) = e.downcast_ref() {
        return EXIT_STORE_UNAVAILABLE;
    }
    if let Some(
        darwin_core::DarwinError::Llm(_)
        | darwin_core::DarwinError::LlmSchema(_)
        | darwin_core::DarwinError::Embedding(_)
        | darwin_core::DarwinError::Forge(_),
    ) = e.downcast_ref()
    {
        return EXIT_PROVIDER_FAILURE;
    }
    EXIT_CONFIG_ERROR
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    config.log_redacted();

    let store: Arc<dyn Store> = if config.store_url == "memory" {
        info!("using in-memory store (STORE_URL=memory)");
        Arc::new(darwin_store::MemoryStore::default())
    } else {
        let sql = darwin_store::SqlStore::connect(&config.store_url)
            .await
            .map_err(|e| anyhow::anyhow!(darwin_core::DarwinError::Store(e.to_string())))?;
        sql.migrate().await.map_err(|e| anyhow::anyhow!(darwin_core::DarwinError::Store(e.to_string())))?;
        Arc::new(sql)
    };

    let embedder: Arc<dyn Embedder> = if config.embedding_provider == "local" {
        Arc::new(HashEmbedder::new(config.embedding_dim))
    } else {
        let base_url = std::env::var("EMBEDDING_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("EMBEDDING_API_KEY").unwrap_or_default();
        Arc::new(RemoteEmbedder::new(base_url, api_key, config.embedding_provider.clone(), config.embedding_dim))
    };

    let llm: Arc<dyn LlmProvider> = Arc::new(ClaudeProvider::new(config.anthropic_api_key.clone(), config.llm_model.clone()));

    let forge_base_url = std::env::var("FORGE_BASE_URL").unwrap_or_else(|_| "http://localhost:9000".to_string());
    let forge_api_key = std::env::var("FORGE_API_KEY").unwrap_or_default();
    let forge = Arc::new(HttpForgeAgent::new(forge_base_url, forge_api_key, config.product_repos.clone()));

    let ctx = AppContext::new(store.clone(), embedder.clone(), llm.clone(), forge.clone(), config.clone());

    let learning = Arc::new(LearningStore::new(store.clone(), embedder.clone()));
    let fix_runner = Arc::new(FixRunner::new(store.clone(), learning.clone(), forge.clone(), Duration::from_secs(15 * 60)));
    let review = ReviewHandler::new(
        store.clone(),
        learning.clone(),
        llm.clone(),
        fix_runner.clone(),
        config.webhook_secret.clone(),
        config.fix_auto_iter_max,
    );
    let ingest = IngestService::new(store.clone(), config.queue_backpressure_threshold);

    let state = Arc::new(AppState {
        ctx,
        ingest,
        learning,
        fix_runner,
        review,
    });

    let shutdown = Arc::new(tokio::sync::Notify::new());

    let embed_worker = EmbedWorker::new(
        store.clone(),
        embedder.clone(),
        config.cluster_threshold_high,
        config.cluster_threshold_low,
        Duration::from_secs(config.poll_timeout_secs),
        config.embed_retry_max,
    );
    let classify_worker = ClassifyWorker::new(
        store.clone(),
        llm.clone(),
        config.classify_confidence_min,
        Duration::from_secs(config.poll_timeout_secs),
        config.embed_retry_max,
    );

    let embed_shutdown = shutdown.clone();
    let embed_handle = tokio::spawn(async move { embed_worker.run(&embed_shutdown).await });
    let classify_shutdown = shutdown.clone();
    let classify_handle = tokio::spawn(async move { classify_worker.run(&classify_shutdown).await });

    let app = Router::new()
        .route("/ingest", post(handlers::ingest))
        .route("/signals", get(handlers::list_signals))
        .route("/topics", get(handlers::list_topics))
        .route("/topics/{id}", get(handlers::get_topic))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task).patch(handlers::patch_task))
        .route("/tasks/{id}/create-issue", post(handlers::create_issue))
        .route("/tasks/{id}/fix", post(handlers::start_fix))
        .route("/products/{product}/rules", get(handlers::list_rules).post(handlers::create_rule))
        .route("/products/{product}/rules/{rule_id}", delete(handlers::delete_rule))
        .route("/webhooks/forge", post(webhooks::forge_webhook))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((config.web_host.as_str(), config.web_port)).await?;
    info!(host = %config.web_host, port = config.web_port, "darwin-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(drain(shutdown.clone(), Duration::from_secs(config.drain_timeout_secs)))
        .await?;

    embed_handle.abort();
    classify_handle.abort();
    Ok(())
}

async fn drain(shutdown: Arc<tokio::sync::Notify>, drain_timeout: Duration) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, notifying workers");
    shutdown.notify_waiters();
    tokio::time::sleep(drain_timeout).await;
}
