/*!
HTTP surface: submission endpoint, provider webhook, snapshot debug
passthrough, health/readiness checks and metrics exposition.
*/

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::brightdata::BrightdataClient;
use crate::config::Settings;
use crate::database::Database;
use crate::dataforseo::{CallbackBody, CallbackContext};
use crate::dispatch::callback::CallbackHandler;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::notifier::Notifier;
use crate::queue::Queue;
use crate::selector::ProviderSelector;
use crate::submission::{self, EnqueueRequest};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub settings: Arc<Settings>,
    pub selector: ProviderSelector,
    pub queue: Queue,
    pub notifier: Notifier,
    pub callback_handler: CallbackHandler,
    pub brightdata: Option<BrightdataClient>,
    pub metrics: Metrics,
}

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(export_metrics))
        .route("/enqueue", post(enqueue))
        .route("/batches/:job_batch_id", get(batch_status))
        .route("/snapshot-data/:snapshot_id", get(snapshot_data))
        .route("/api/dataforseo/callback", post(provider_callback))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    ok: bool,
    service: String,
    version: String,
    database_ready: bool,
}

/// Health check - always returns 200 if the process is up
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.requests_total.inc();
    let db_ready = state.db.health_check().await;

    Json(HealthStatus {
        ok: true,
        service: "prompt-runner".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database_ready: db_ready,
    })
}

/// Readiness check - 503 until the store and a provider are reachable
async fn readiness_check(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    state.metrics.requests_total.inc();

    let db_ready = state.db.health_check().await;
    if !db_ready {
        return Err(Error::NotReady("database unreachable".to_string()));
    }

    let health = state.selector.snapshot().await;
    let provider = health.and_then(|h| h.active);
    if provider.is_none() {
        return Err(Error::NotReady("no scraping provider healthy".to_string()));
    }

    Ok(Json(json!({
        "ready": true,
        "active_provider": provider,
        "checked_at": health.map(|h| h.checked_at),
    })))
}

async fn export_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.export()
}

/// Accept a prompt job submission
async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse> {
    state.metrics.requests_total.inc();

    let response = submission::enqueue(
        &state.db,
        &state.selector,
        &state.queue,
        &state.settings.default_openai_model,
        request,
    )
    .await?;

    state.metrics.submissions_total.inc();
    Ok(Json(response))
}

/// Progress of one submission
async fn batch_status(
    State(state): State<Arc<AppState>>,
    Path(job_batch_id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse> {
    state.metrics.requests_total.inc();

    let batch = state
        .db
        .get_job_batch(job_batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job batch {job_batch_id}")))?;

    Ok(Json(json!({
        "id": batch.id,
        "status": batch.status,
        "total_prompts": batch.total_prompts,
        "total_batches": batch.total_batches,
        "completed_batches": batch.completed_batches,
        "failed_batches": batch.failed_batches,
        "created_at": batch.created_at,
        "completed_at": batch.completed_at,
        "error_message": batch.error_message,
    })))
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    prompt: String,
}

/// Debug passthrough into provider A's snapshot store
async fn snapshot_data(
    State(state): State<Arc<AppState>>,
    Path(snapshot_id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Result<impl IntoResponse> {
    state.metrics.requests_total.inc();

    let client = state
        .brightdata
        .as_ref()
        .ok_or_else(|| Error::NotReady("Bright Data is not configured".to_string()))?;

    let entry = client
        .snapshot_entry_for_prompt(&snapshot_id, &query.prompt)
        .await?;

    Ok(Json(entry))
}

/// DataForSEO webhook. Returns 200 for every successfully recorded
/// outcome, including logical scrape failures; only unexpected faults
/// surface as errors.
async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Query(ctx): Query<CallbackContext>,
    Json(body): Json<CallbackBody>,
) -> Result<impl IntoResponse> {
    state.metrics.requests_total.inc();
    state.metrics.callbacks_total.inc();

    info!(user_id = %ctx.user_id, nightly = ctx.is_nightly, "callback received");

    match state.callback_handler.handle(&ctx, &body).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => {
            if !matches!(e, Error::InvalidRequest(_)) {
                warn!(error = %e, "callback processing failed");
            }
            Err(e)
        }
    }
}
