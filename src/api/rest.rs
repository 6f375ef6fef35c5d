// =============================================================================
// REST API (C10) — strategy lifecycle, trade journal, and analytics toggles.
// =============================================================================
//
// Every route except `/health` requires a bearer token (see `api::auth`).
// Mounted under the crate root by `main.rs` alongside the `/ws` and
// `/ws/logs` upgrades.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::api::{ws::ws_handler, ws_logs::ws_logs_handler};
use crate::app_state::AppState;
use crate::strategy_config::StrategyConfig;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/strategies", get(list_strategies).post(create_strategy))
        .route("/strategies/:id/start", post(start_strategy))
        .route("/strategies/:id/stop", post(stop_strategy))
        .route("/strategies/:id", put(update_strategy))
        .route("/strategies/:id/trades", get(strategy_trades))
        .route("/strategies/:id/stats", get(strategy_stats))
        .route("/strategies/:id/drawdown-analysis", get(strategy_drawdown))
        .route("/trades/all", get(all_trades))
        .route("/stats/all", get(all_stats))
        .route("/analytics/spx/start", post(start_spx_analytics))
        .route("/analytics/spx/stop", post(stop_spx_analytics))
        .route("/ws", get(ws_handler))
        .route("/ws/logs", get(ws_logs_handler))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_strategies(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.get_all_strategies_status())
}

async fn create_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(config): Json<StrategyConfig>,
) -> impl IntoResponse {
    let id = config.id.clone();
    let auto_start = config.enabled;
    match state.manager.create_strategy(config, auto_start).await {
        Ok(()) => {
            state.increment_version();
            (StatusCode::CREATED, Json(json!({"status": "created", "id": id}))).into_response()
        }
        Err(e) => {
            warn!(strategy_id = %id, error = %e, "failed to create strategy");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn start_strategy(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.start_strategy(&id).await {
        Ok(()) => {
            state.increment_version();
            Json(json!({"status": "started", "id": id})).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn stop_strategy(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.stop_strategy(&id).await {
        Ok(()) => {
            state.increment_version();
            Json(json!({"status": "stopped", "id": id})).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn update_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> impl IntoResponse {
    match state.manager.update_strategy_config(&id, &patch).await {
        Ok(config) => {
            state.increment_version();
            Json(config).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<u32>,
}

async fn strategy_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<TradesQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).min(1000);
    Json(state.trading_data.list_trades(Some(&id), limit))
}

async fn strategy_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    Json(state.trading_data.get_strategy_stats(&id))
}

async fn strategy_drawdown(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    Json(state.trading_data.get_drawdown_analysis(&id))
}

async fn all_trades(_auth: AuthBearer, State(state): State<Arc<AppState>>, Query(q): Query<TradesQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(100).min(1000);
    Json(state.trading_data.list_trades(None, limit))
}

async fn all_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trading_data.get_all_strategy_stats())
}

const SPX_STREAMER_ID: &str = "spx-streamer-default";

async fn start_spx_analytics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.manager.get_strategy_config(SPX_STREAMER_ID).is_none() {
        let config = StrategyConfig {
            id: SPX_STREAMER_ID.to_string(),
            name: "SPX Streamer".to_string(),
            enabled: true,
            instrument_id: "SPX.CBOE".to_string(),
            strategy_type: "SpxStreamer".to_string(),
            order_size: 0,
            parameters: Map::new(),
        };
        if let Err(e) = state.manager.create_strategy(config, true).await {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
        }
    } else if let Err(e) = state.manager.start_strategy(SPX_STREAMER_ID).await {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response();
    }
    state.increment_version();
    info!("SPX analytics streamer started");
    Json(json!({"status": "started", "id": SPX_STREAMER_ID})).into_response()
}

async fn stop_spx_analytics(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.stop_strategy(SPX_STREAMER_ID).await {
        Ok(()) => {
            state.increment_version();
            Json(json!({"status": "stopped", "id": SPX_STREAMER_ID})).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}
