//! HTTP API for health checks and action inspection
//!
//! Operator-facing only; the relay itself never depends on it.

use crate::chain::ChainAdapter;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, IdempotencyKey};
use crate::relay::{ActionState, ActionTransition, PendingAction};
use crate::state::{ActionLog, ActionStats, CursorStore};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub actions: Arc<dyn ActionLog>,
    pub cursors: Arc<dyn CursorStore>,
    pub chains: Vec<Arc<dyn ChainAdapter>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/cursors", get(get_cursors))
        .route("/actions", get(list_actions))
        .route("/actions/:key", get(get_action))
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Error body returned by the API
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        warn!("API request failed: {}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - database and both chains
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = readiness(&state).await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn readiness(state: &AppState) -> ReadinessResponse {
    let database = state.actions.health_check().await.is_ok();

    let mut details = Vec::with_capacity(state.chains.len());
    for chain in &state.chains {
        details.push(ChainHealth {
            chain: chain.chain(),
            healthy: chain.health_check().await,
        });
    }
    let chains = details.iter().all(|c| c.healthy);

    ReadinessResponse {
        ready: database && chains,
        database,
        chains,
        details,
    }
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<ActionStats>, ApiError> {
    Ok(Json(state.actions.stats().await?))
}

async fn get_cursors(State(state): State<AppState>) -> Result<Json<Vec<CursorResponse>>, ApiError> {
    let cursors = state
        .cursors
        .list()
        .await?
        .into_iter()
        .map(|(chain, position)| CursorResponse { chain, position })
        .collect();
    Ok(Json(cursors))
}

/// Actions in one state, `failed` by default
async fn list_actions(
    State(state): State<AppState>,
    Query(query): Query<ActionsQuery>,
) -> Result<Json<Vec<PendingAction>>, ApiError> {
    let wanted = match query.state.as_deref() {
        Some(s) => s
            .parse::<ActionState>()
            .map_err(|_| ApiError::bad_request(format!("unknown state {}", s)))?,
        None => ActionState::Failed,
    };
    let mut actions = state.actions.list_by_state(wanted).await?;
    if let Some(limit) = query.limit {
        actions.truncate(limit);
    }
    Ok(Json(actions))
}

/// One action with its full transition history
async fn get_action(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ActionDetail>, ApiError> {
    let key: IdempotencyKey = key
        .parse()
        .map_err(|_| ApiError::bad_request("idempotency key must be 64 hex characters"))?;

    let action = state
        .actions
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no action {}", key)))?;
    let history = state.actions.history(&key).await?;

    Ok(Json(ActionDetail { action, history }))
}

// Request and response types

#[derive(Debug, Deserialize)]
struct ActionsQuery {
    state: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainId,
    healthy: bool,
}

#[derive(Serialize)]
struct CursorResponse {
    chain: ChainId,
    position: u64,
}

#[derive(Serialize)]
struct ActionDetail {
    action: PendingAction,
    history: Vec<ActionTransition>,
}
