//! HTTP API for health checks, status, and monitoring

use crate::chain::{ChainKind, SwapId};
use crate::config::ApiConfig;
use crate::error::{DeputyError, DeputyResult};
use crate::service::{DeputyService, EngineState};
use crate::store::{TxRecord, TxStats};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DeputyService>,
}

pub fn router(service: Arc<DeputyService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/swaps/:swap_id", get(get_swap))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(AppState { service })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, service: Arc<DeputyService>) -> DeputyResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DeputyError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, router(service))
        .await
        .map_err(|e| DeputyError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.service.ledger().health_check().await.is_ok();

    let chain_health = state.service.chains().health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.service;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: service.settings().deputy.instance_id.clone(),
        uptime_seconds: (chrono::Utc::now() - service.started_at())
            .num_seconds()
            .max(0) as u64,
        connected_chains: service.chains().connected_chains(),
        pairs: service
            .engines()
            .iter()
            .map(|engine| PairStatus {
                origin: engine.origin_chain(),
                destination: engine.dest_chain(),
                held_swaps: engine.held_count(),
            })
            .collect(),
    })
}

/// Transaction record counts by status
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.ledger().stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(TxStats::default())),
    }
}

/// Transactions and local relay state for one origin or mirror swap
async fn get_swap(
    State(state): State<AppState>,
    Path(swap_id): Path<String>,
) -> Result<Json<SwapResponse>, (StatusCode, String)> {
    let swap_id: SwapId = swap_id
        .parse()
        .map_err(|e: DeputyError| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let transactions = state
        .service
        .ledger()
        .records_for_swap(&swap_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let relay = state.service.relay_states(&swap_id);
    if transactions.is_empty() && relay.is_empty() {
        return Err((StatusCode::NOT_FOUND, format!("swap {} not known", swap_id)));
    }

    Ok(Json(SwapResponse {
        swap_id: swap_id.to_hex(),
        relay,
        transactions,
    }))
}

// Response types

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
    chain: ChainKind,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    instance_id: String,
    uptime_seconds: u64,
    connected_chains: Vec<ChainKind>,
    pairs: Vec<PairStatus>,
}

#[derive(Serialize)]
struct PairStatus {
    origin: ChainKind,
    destination: ChainKind,
    held_swaps: usize,
}

#[derive(Serialize)]
struct SwapResponse {
    swap_id: String,
    relay: Vec<EngineState>,
    transactions: Vec<TxRecord>,
}
