// =============================================================================
// SPX Strategy Runtime — Main Entry Point
// =============================================================================
//
// The engine starts in Paper + Paused mode for safety. The dashboard or API
// must explicitly switch to Live trading.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod bus;
mod cache;
mod clock;
mod greeks;
mod indicators;
mod logging;
mod manager;
mod option_search;
mod persistence;
mod strategy;
mod strategy_config;
mod trading_data;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app_state::AppState;
use crate::broker::client::{BrokerClient, IbClient};
use crate::bus::Bus;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::manager::StrategyManager;
use crate::persistence::PersistenceStore;
use crate::trading_data::TradingDataStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let log_dir = std::env::var("LOG_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./logs"));
    let _log_guard = logging::init(&log_dir)?;

    info!("SPX strategy runtime starting up — Paper + Paused by default");

    // ── 1. Environment contract ───────────────────────────────────────────
    let broker_host = std::env::var("BROKER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let broker_port: u16 = std::env::var("BROKER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(4002);
    let account_id = std::env::var("ACCOUNT_ID").unwrap_or_default();
    if account_id.is_empty() {
        warn!("ACCOUNT_ID is not set — broker requests will be submitted without an account routing hint");
    }

    let data_dir = std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./data"));
    let db_path = data_dir.join("trading_data.sqlite3");

    // ── 2. Build shared subsystems (C1-C6) ────────────────────────────────
    let broker = IbClient::new(broker_host.clone(), broker_port);
    let cache = Arc::new(Cache::new());
    let clock = Clock::new();
    let persistence = Arc::new(PersistenceStore::new(&data_dir)?);
    let trading_data = Arc::new(TradingDataStore::open(&db_path)?);
    let bus = Arc::new(Bus::new());

    // ── 3. Strategy manager (C9) + rehydrate persisted configs ────────────
    let manager = StrategyManager::new(broker.clone(), cache.clone(), clock.clone(), persistence.clone(), trading_data.clone(), bus.clone());
    manager.initialize().await;

    let state = Arc::new(AppState::new(
        broker.clone(),
        cache.clone(),
        clock.clone(),
        persistence.clone(),
        trading_data.clone(),
        bus.clone(),
        manager.clone(),
        log_dir.clone(),
    ));

    // ── 4. Connect to the broker gateway (reconnect-with-backoff loop) ────
    {
        let broker = broker.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                broker.connect().await;
                *state.broker_connected.write() = true;
                state.increment_version();

                let mut events = broker.subscribe_events();
                loop {
                    match events.recv().await {
                        Ok(crate::broker::events::BrokerEvent::Disconnected { reason }) => {
                            warn!(reason, "broker disconnected");
                            *state.broker_connected.write() = false;
                            *state.last_disconnect_reason.write() = Some(reason);
                            state.increment_version();
                            break;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }

    // ── 5. API server ──────────────────────────────────────────────────────
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server stopped");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    info!("SPX strategy runtime shut down complete.");
    Ok(())
}
