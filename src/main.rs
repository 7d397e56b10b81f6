//! Quote Extractor - AI bill-of-materials extraction, reconciliation and commit server.

mod commit;
mod config;
mod error;
mod extractor;
#[cfg(test)]
mod memory_store;
mod openrouter;
mod prompt;
mod reconcile;
mod records;
mod schema;
mod storage;
mod supabase;
mod usage;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use commit::{CommitPipeline, CommitRequest};
use config::{PricingTable, Settings};
use error::{ExtractionError, RetrievalError};
use extractor::Extractor;
use openrouter::OpenRouterClient;
use reconcile::{ReconcileRequest, ReconciliationSummary};
use records::CommitOutcome;
use schema::ExtractionResult;
use storage::SupabaseStorage;
use supabase::SupabaseClient;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage::{UsageRecorder, UsageReport};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    extractor: Arc<Extractor>,
    commits: Arc<CommitPipeline>,
    recorder: UsageRecorder,
    pricing: Arc<PricingTable>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "quote_extractor=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let pricing = PricingTable::load_from_dir(&settings.pricing_dir)?;
    info!(
        "Loaded settings: model={}, timeout={:?}, max_attempts={}, strict={}, {} priced models",
        settings.model,
        settings.model_timeout,
        settings.retry.max_attempts,
        settings.strict_reconciliation,
        pricing.len()
    );

    // Collaborators
    let database = Arc::new(SupabaseClient::new(&settings));
    let recorder = UsageRecorder::new(database.clone());
    let extractor = Extractor::new(
        Arc::new(SupabaseStorage::new(&settings)),
        Arc::new(OpenRouterClient::from_settings(&settings)),
        recorder.clone(),
    )
    .configured(&settings);

    let state = AppState {
        extractor: Arc::new(extractor),
        commits: Arc::new(CommitPipeline::new(database)),
        recorder,
        pricing: Arc::new(pricing),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/prompt", get(prompt_info))
        .route("/extract", post(extract_work_items))
        .route("/reconcile", post(reconcile_items))
        .route("/commit", post(commit_items))
        .route("/usage", get(usage_report))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptInfo {
    flow_name: &'static str,
    version: &'static str,
}

async fn prompt_info() -> Json<PromptInfo> {
    Json(PromptInfo {
        flow_name: prompt::EXTRACTION_FLOW_NAME,
        version: prompt::EXTRACTION_PROMPT_VERSION,
    })
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest {
    storage_path: String,
}

/// Extract work items from a stored document.
async fn extract_work_items(
    State(state): State<AppState>,
    Json(request): Json<ExtractRequest>,
) -> Result<Json<ExtractionResult>, (StatusCode, String)> {
    state
        .extractor
        .extract(&request.storage_path)
        .await
        .map(Json)
        .map_err(|e| (extraction_status(&e), e.to_string()))
}

/// Replay reviewer edits, then recompute line totals and the mismatch flag.
async fn reconcile_items(
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ReconciliationSummary>, (StatusCode, String)> {
    request
        .resolve()
        .map(Json)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}

/// Commit approved work items as a project and contract.
async fn commit_items(
    State(state): State<AppState>,
    Json(request): Json<CommitRequest>,
) -> (StatusCode, Json<CommitOutcome>) {
    let outcome = state
        .commits
        .commit(request.doc_details, request.work_items)
        .await;
    let status = if outcome.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(outcome))
}

#[derive(serde::Deserialize)]
struct UsageQuery {
    days: Option<u32>,
}

/// Aggregate usage over the last `days` days (default 30).
async fn usage_report(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageReport>, (StatusCode, String)> {
    let days = query.days.unwrap_or(30);
    state
        .recorder
        .report(days, &state.pricing)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Usage report failed: {}", e);
            (StatusCode::BAD_GATEWAY, format!("Usage report failed: {}", e))
        })
}

fn extraction_status(err: &ExtractionError) -> StatusCode {
    match err {
        ExtractionError::Retrieval(RetrievalError::NotFound(_)) => StatusCode::NOT_FOUND,
        ExtractionError::Retrieval(RetrievalError::AccessDenied(_)) => StatusCode::FORBIDDEN,
        ExtractionError::Retrieval(RetrievalError::Transport(_)) => StatusCode::BAD_GATEWAY,
        ExtractionError::ModelInvocation(error::ModelError::Timeout(_)) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ExtractionError::ModelInvocation(_) | ExtractionError::SchemaValidation(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}
