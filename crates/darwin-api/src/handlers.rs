use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use darwin_core::{Category, SignalInput, TaskStatus};
use darwin_store::TaskFilter;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// --- /ingest ---------------------------------------------------------------

pub async fn ingest(State(state): State<Arc<AppState>>, Json(inputs): Json<Vec<SignalInput>>) -> Result<impl IntoResponse, ApiError> {
    let result = state.ingest.ingest(inputs).await?;
    Ok(Json(result))
}

// --- /signals ----------------------------------------------------------------

#[derive(Deserialize)]
pub struct SignalsQuery {
    product: Option<String>,
    limit: Option<usize>,
}

pub async fn list_signals(State(state): State<Arc<AppState>>, Query(q): Query<SignalsQuery>) -> Result<impl IntoResponse, ApiError> {
    let limit = q.limit.unwrap_or(50).min(500);
    let signals = state.ctx.store.list_signals(q.product.as_deref(), limit).await?;
    Ok(Json(signals))
}

// --- /topics -----------------------------------------------------------------

pub async fn list_topics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let topics = state.ctx.store.list_topics().await?;
    Ok(Json(topics))
}

pub async fn get_topic(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    match state.ctx.store.get_topic(id).await? {
        Some(topic) => Ok(Json(topic)),
        None => Err(ApiError::not_found(format!("topic {id} not found"))),
    }
}

// --- /tasks --------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TasksQuery {
    status: Option<String>,
    category: Option<String>,
    product: Option<String>,
    limit: Option<usize>,
}

pub async fn list_tasks(State(state): State<Arc<AppState>>, Query(q): Query<TasksQuery>) -> Result<impl IntoResponse, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .map_err(ApiError::bad_request)?;
    let category = q
        .category
        .as_deref()
        .map(|s| s.parse::<Category>())
        .transpose()
        .map_err(ApiError::bad_request)?;

    let tasks = state
        .ctx
        .store
        .list_tasks(TaskFilter {
            status,
            category,
            product: q.product,
            limit: q.limit.unwrap_or(0),
        })
        .await?;
    Ok(Json(tasks))
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    match state.ctx.store.get_task(id).await? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::not_found(format!("task {id} not found"))),
    }
}

#[derive(Deserialize)]
pub struct PatchTaskBody {
    status: String,
}

pub async fn patch_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchTaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let new_status: TaskStatus = body.status.parse().map_err(ApiError::bad_request)?;
    let mut task = state
        .ctx
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    task.status = new_status;
    task.updated_at = chrono::Utc::now();
    state.ctx.store.update_task(task.clone()).await?;
    Ok(Json(task))
}

#[derive(Serialize)]
pub struct CreateIssueResponse {
    pub issue_url: String,
    pub issue_number: u64,
}

pub async fn create_issue(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let mut task = state
        .ctx
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    let (issue_url, issue_number) = state.ctx.forge.create_issue(&task).await.map_err(|e| {
        warn!(task_id = %id, error = %e, "forge create_issue failed");
        ApiError {
            status: StatusCode::BAD_GATEWAY,
            code: "external_provider_failure",
            message: "failed to create forge issue".to_string(),
        }
    })?;

    task.issue_url = Some(issue_url.clone());
    task.issue_number = Some(issue_number);
    task.updated_at = chrono::Utc::now();
    state.ctx.store.update_task(task).await?;

    Ok(Json(CreateIssueResponse { issue_url, issue_number }))
}

#[derive(Serialize)]
pub struct FixResponse {
    pub fix_status: String,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
}

pub async fn start_fix(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let started = state.fix_runner.start_fix(id, None).await?;
    if !started {
        return Err(ApiError::conflict("a fix is already running or completed for this task"));
    }
    let task = state
        .ctx
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    Ok(Json(FixResponse {
        fix_status: task.fix_status.to_string(),
        pr_url: task.pr_url,
        branch: task.branch,
    }))
}

// --- /products/{p}/rules --------------------------------------------------------

pub async fn list_rules(State(state): State<Arc<AppState>>, Path(product): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let rules = state.ctx.store.list_rules(&product).await?;
    Ok(Json(rules))
}

#[derive(Deserialize)]
pub struct CreateRuleBody {
    content: String,
    category: String,
    reviewer: Option<String>,
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Path(product): Path<String>,
    Json(body): Json<CreateRuleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let category = body.category.parse().map_err(ApiError::bad_request)?;
    let rule = state
        .learning
        .upsert_rule(&product, &body.content, category, darwin_core::RuleSource::Manual, None, body.reviewer)
        .await?
        .ok_or_else(|| ApiError::bad_request("rule content exceeds 500 characters"))?;
    Ok(Json(rule))
}

pub async fn delete_rule(State(state): State<Arc<AppState>>, Path((product, rule_id)): Path<(String, Uuid)>) -> Result<impl IntoResponse, ApiError> {
    state.ctx.store.delete_rule(rule_id, &product).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- /health -------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    ok: bool,
    store_ok: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.ctx.store.queue_len(darwin_store::QUEUE_TO_EMBED).await.is_ok();
    Json(HealthResponse { ok: true, store_ok })
}
