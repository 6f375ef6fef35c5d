// =============================================================================
// Central Application State — SPX Strategy Runtime
// =============================================================================
//
// The single source of truth for the entire process. All subsystems hold Arc
// references to their own state; AppState ties them together and provides a
// unified snapshot for the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::client::IbClient;
use crate::bus::Bus;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::manager::StrategyManager;
use crate::persistence::PersistenceStore;
use crate::trading_data::TradingDataStore;
use crate::types::{AccountMode, BalanceInfo, TradingMode};
use std::path::PathBuf;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation. The WebSocket feed uses this to decide when to push.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub trading_mode: RwLock<TradingMode>,
    pub account_mode: RwLock<AccountMode>,

    pub broker: Arc<IbClient>,
    pub cache: Arc<Cache>,
    pub clock: Arc<Clock>,
    pub persistence: Arc<PersistenceStore>,
    pub trading_data: Arc<TradingDataStore>,
    pub bus: Arc<Bus>,
    pub manager: Arc<StrategyManager>,

    pub balances: RwLock<Vec<BalanceInfo>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub broker_connected: RwLock<bool>,
    pub last_disconnect_reason: RwLock<Option<String>>,
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<std::time::Instant>,

    pub log_dir: PathBuf,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        broker: Arc<IbClient>,
        cache: Arc<Cache>,
        clock: Arc<Clock>,
        persistence: Arc<PersistenceStore>,
        trading_data: Arc<TradingDataStore>,
        bus: Arc<Bus>,
        manager: Arc<StrategyManager>,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            trading_mode: RwLock::new(TradingMode::default()),
            account_mode: RwLock::new(AccountMode::default()),

            broker,
            cache,
            clock,
            persistence,
            trading_data,
            bus,
            manager,

            balances: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),

            broker_connected: RwLock::new(false),
            last_disconnect_reason: RwLock::new(None),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(std::time::Instant::now()),

            log_dir,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Build a complete, serialisable snapshot of the entire engine state.
    /// This is the payload sent on `GET /strategies` neighbors and pushed by
    /// the WebSocket feed whenever the version advances.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let version = self.current_state_version();
        let ws_user_event_age_ms = self.last_ws_user_event.read().elapsed().as_millis() as u64;

        let truth = TruthHeader {
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: ws_user_event_age_ms,
            broker_connected: *self.broker_connected.read(),
            last_disconnect_reason: self.last_disconnect_reason.read().clone(),
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_mode: self.trading_mode.read().to_string(),
            account_mode: self.account_mode.read().to_string(),
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            positions: self.cache.open_positions(),
            strategies: self.manager.get_all_strategies_status(),
            balances: self.balances.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub positions: Vec<crate::types::Position>,
    pub strategies: Vec<serde_json::Value>,
    pub balances: Vec<BalanceInfo>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Operational truth header — the dashboard's primary status banner.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub broker_connected: bool,
    pub last_disconnect_reason: Option<String>,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub server_time: i64,
    pub uptime_seconds: u64,
}
