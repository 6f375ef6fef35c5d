// =============================================================================
// Strategy Manager (C9) — registry, lifecycle, and config patching for every
// running strategy instance.
// =============================================================================
//
// One `StrategyCore` + concrete `StrategyHandler` pair per registered id.
// `create_strategy` looks `strategy_type` up in a fixed constructor table —
// unknown types are rejected rather than silently ignored, so a typo in a
// config document surfaces immediately instead of producing a strategy that
// never does anything.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::client::{BrokerClient, IbClient};
use crate::bus::Bus;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::option_search::OptionSearchEngine;
use crate::persistence::PersistenceStore;
use crate::strategy::interval::{IntervalTrader, IntervalTraderConfig};
use crate::strategy::orb::{OrbConfig, OrbStrategy, PremiumOrDelta, Product};
use crate::strategy::scalper::{ScalperConfig, ScalperStrategy};
use crate::strategy::spx_1dte::{Spx1dteConfig, Spx1dteStrategy};
use crate::strategy::spx_range::{SpxRangeConfig, SpxRangeStrategy};
use crate::strategy::streamer::SpxStreamer;
use crate::strategy::{run_event_loop, StrategyCore, StrategyHandler};
use crate::strategy_config::StrategyConfig;
use crate::trading_data::TradingDataStore;
use crate::types::{OptionKind, OrderSide};

#[derive(Debug, Clone)]
pub enum ManagerError {
    UnknownType(String),
    NotFound(String),
    AlreadyExists(String),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown strategy type: {t}"),
            Self::NotFound(id) => write!(f, "strategy not found: {id}"),
            Self::AlreadyExists(id) => write!(f, "strategy id already registered: {id}"),
        }
    }
}

impl std::error::Error for ManagerError {}

struct StrategyHandle {
    core: Arc<StrategyCore>,
    handler: Arc<dyn StrategyHandler>,
    config: StrategyConfig,
    event_task: JoinHandle<()>,
}

pub struct StrategyManager {
    broker: Arc<IbClient>,
    cache: Arc<Cache>,
    clock: Arc<Clock>,
    persistence: Arc<PersistenceStore>,
    trading_data: Arc<TradingDataStore>,
    bus: Arc<Bus>,
    search: Arc<OptionSearchEngine<IbClient>>,
    handles: RwLock<HashMap<String, StrategyHandle>>,
}

impl StrategyManager {
    pub fn new(
        broker: Arc<IbClient>,
        cache: Arc<Cache>,
        clock: Arc<Clock>,
        persistence: Arc<PersistenceStore>,
        trading_data: Arc<TradingDataStore>,
        bus: Arc<Bus>,
    ) -> Arc<Self> {
        let search = OptionSearchEngine::new(broker.clone(), clock.clone());
        Arc::new(Self {
            broker,
            cache,
            clock,
            persistence,
            trading_data,
            bus,
            search,
            handles: RwLock::new(HashMap::new()),
        })
    }

    /// Loads every persisted config from C2 and creates (but does not
    /// necessarily start) each strategy — enabled strategies auto-start,
    /// matching the reference runtime's startup behavior.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) {
        for config in self.persistence.list_configs() {
            let enabled = config.enabled;
            let id = config.id.clone();
            if let Err(e) = self.create_strategy(config, enabled).await {
                warn!(strategy_id = %id, error = %e, "failed to recreate persisted strategy");
            }
        }
    }

    #[tracing::instrument(skip(self, config))]
    pub async fn create_strategy(self: &Arc<Self>, config: StrategyConfig, auto_start: bool) -> anyhow::Result<()> {
        if self.handles.read().contains_key(&config.id) {
            return Err(ManagerError::AlreadyExists(config.id).into());
        }
        let handler = self.build_handler(&config)?;
        let core = Arc::new(StrategyCore::new(
            config.id.clone(),
            config.instrument_id.clone(),
            self.broker.clone() as Arc<dyn BrokerClient>,
            self.cache.clone(),
            self.clock.clone(),
            self.persistence.clone(),
            self.trading_data.clone(),
        ));

        let instrument_id = config.instrument_id.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut broker_events = self.broker.subscribe_events();
        let task_core = core.clone();
        let event_task = tokio::spawn(async move {
            loop {
                match broker_events.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(strategy_id = %task_core.strategy_id, instrument_id, skipped = n, "broker event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let loop_core = core.clone();
        let loop_handler = handler.clone();
        tokio::spawn(run_event_loop(loop_core, loop_handler, rx));

        self.persistence.save_config(&config)?;

        if auto_start {
            core.start(handler.as_ref()).await;
        }

        self.handles.write().insert(
            config.id.clone(),
            StrategyHandle {
                core,
                handler,
                config,
                event_task,
            },
        );
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_strategy(self: &Arc<Self>, id: &str) -> anyhow::Result<()> {
        let (core, handler) = {
            let handles = self.handles.read();
            let handle = handles.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            (handle.core.clone(), handle.handler.clone())
        };
        core.start(handler.as_ref()).await;
        info!(strategy_id = id, "strategy started");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn stop_strategy(self: &Arc<Self>, id: &str) -> anyhow::Result<()> {
        let (core, handler) = {
            let handles = self.handles.read();
            let handle = handles.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            (handle.core.clone(), handle.handler.clone())
        };
        core.stop(handler.as_ref()).await;
        info!(strategy_id = id, "strategy stopped");
        Ok(())
    }

    /// Removes a strategy entirely: stops it, tears down its event-forwarding
    /// task, and deletes its persisted config/state.
    #[tracing::instrument(skip(self))]
    pub async fn delete_strategy(self: &Arc<Self>, id: &str) -> anyhow::Result<()> {
        let handle = self
            .handles
            .write()
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        handle.core.stop(handle.handler.as_ref()).await;
        handle.event_task.abort();
        self.persistence.delete_config(id)?;
        self.persistence.delete_state(id)?;
        Ok(())
    }

    /// Merges `patch` into the live config (accepting either a full document
    /// or a flat legacy parameter bag, per [`StrategyConfig::merge`]),
    /// persists it, and rebuilds the handler in place so parameter changes
    /// take effect without a restart.
    #[tracing::instrument(skip(self, patch))]
    pub async fn update_strategy_config(self: &Arc<Self>, id: &str, patch: &Map<String, Value>) -> anyhow::Result<StrategyConfig> {
        let mut config = {
            let handles = self.handles.read();
            let handle = handles.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            handle.config.clone()
        };
        config.merge(patch);
        let new_handler = self.build_handler(&config)?;
        self.persistence.save_config(&config)?;

        let mut handles = self.handles.write();
        if let Some(handle) = handles.get_mut(id) {
            handle.config = config.clone();
            handle.handler = new_handler;
        }
        Ok(config)
    }

    pub fn get_all_strategies_status(&self) -> Vec<Value> {
        let handles = self.handles.read();
        handles
            .values()
            .map(|handle| {
                let stats = self.trading_data.get_strategy_stats(&handle.config.id);
                json!({
                    "id": handle.config.id,
                    "name": handle.config.name,
                    "strategy_type": handle.config.strategy_type,
                    "instrument_id": handle.config.instrument_id,
                    "enabled": handle.config.enabled,
                    "state": format!("{:?}", handle.core.state()),
                    "active_trade_id": handle.core.active_trade_id.read().clone(),
                    "stats": stats,
                })
            })
            .collect()
    }

    pub fn get_strategy_config(&self, id: &str) -> Option<StrategyConfig> {
        self.handles.read().get(id).map(|h| h.config.clone())
    }

    fn build_handler(&self, config: &StrategyConfig) -> anyhow::Result<Arc<dyn StrategyHandler>> {
        let handler: Arc<dyn StrategyHandler> = match config.strategy_type.as_str() {
            "OrbLongCall" | "OrbLongPut" | "OrbFutures" => {
                let direction = if config.strategy_type == "OrbLongPut" {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                let kind = if direction == OrderSide::Sell { OptionKind::Put } else { OptionKind::Call };
                let product = if config.strategy_type == "OrbFutures" {
                    Product::Underlying
                } else {
                    Product::Option
                };
                let target = if config.param_f64("delta_target", 0.0) > 0.0 {
                    PremiumOrDelta::Delta
                } else {
                    PremiumOrDelta::Premium
                };
                let orb_config = OrbConfig {
                    direction,
                    kind,
                    target,
                    product,
                    premium_target: config.param_f64("premium_target", 2.5),
                    delta_target: config.param_f64("delta_target", 0.3),
                    range_minutes: config.param_u32("range_minutes", 15) as i64,
                    cutoff_hour: config.param_u32("cutoff_hour", 11),
                    sl_pct: config.param_f64("sl_pct", 50.0),
                    tp_dollars: config.param_f64("tp_dollars", 100.0),
                    order_size: config.order_size as f64,
                    strike_step: config.param_f64("strike_step", 5.0),
                };
                Arc::new(OrbStrategy::new(orb_config, self.search.clone()))
            }
            "SpxRangeBreakout" => {
                let spx_config = SpxRangeConfig {
                    range_minutes: config.param_u32("range_minutes", 15) as i64,
                    strike_step: config.param_f64("strike_step", 5.0),
                    strike_width: config.param_f64("strike_width", 20.0),
                    min_credit_amount: config.param_f64("min_credit_amount", 50.0),
                    fixed_sl_dollars: config.param_f64("fixed_sl_dollars", 100.0),
                    fixed_tp_dollars: config.param_f64("fixed_tp_dollars", 30.0),
                    signal_max_age_seconds: config.param_u32("signal_max_age_seconds", 30) as i64,
                    max_price_deviation: config.param_f64("max_price_deviation", 2.0),
                    entry_cutoff_hour: config.param_u32("entry_cutoff_hour", 15),
                    fill_timeout_seconds: config.param_u32("fill_timeout_seconds", 60) as u64,
                    order_size: config.order_size as f64,
                };
                Arc::new(SpxRangeStrategy::new(spx_config, self.broker.clone()))
            }
            "Spx1dteBullPutSpread" => {
                let spx_config = Spx1dteConfig {
                    short_delta: config.param_f64("short_delta", 0.25),
                    long_delta: config.param_f64("long_delta", 0.14),
                    sl_pct_of_credit: config.param_f64("sl_pct_of_credit", 180.0),
                    tp_pct_of_credit: config.param_f64("tp_pct_of_credit", 40.0),
                    order_size: config.order_size as f64,
                    require_strong_reclaim: config.param_bool("require_strong_reclaim", false),
                    require_two_day_confirmation: config.param_bool("require_two_day_confirmation", false),
                    macro_event_dates: parse_macro_event_dates(config),
                    block_day_before_macro_event: config.param_bool("block_day_before_macro_event", true),
                };
                let es_instrument_id = config.param_str("es_instrument_id", "ES.CME");
                Arc::new(Spx1dteStrategy::new(spx_config, es_instrument_id, self.broker.clone(), self.search.clone()))
            }
            "ZeroDteScalper" => {
                let scalper_config = ScalperConfig {
                    range_minutes: config.param_u32("range_minutes", 5) as i64,
                    tick_size: config.param_f64("tick_size", 0.25),
                    exit_ticks: config.param_u32("exit_ticks", 4),
                    sl_ticks: config.param_u32("sl_ticks", 2),
                    order_size: config.order_size as f64,
                };
                Arc::new(ScalperStrategy::new(scalper_config))
            }
            "SpxStreamer" => Arc::new(SpxStreamer::new(self.bus.clone())),
            "IntervalTrader" => {
                let interval_config = IntervalTraderConfig {
                    interval: std::time::Duration::from_secs(config.param_u32("interval_seconds", 60) as u64),
                    order_size: config.order_size as f64,
                    sl_pct: config.param_f64("sl_pct", 1.0),
                    tp_pct: config.param_f64("tp_pct", 2.0),
                };
                Arc::new(IntervalTrader::new(interval_config))
            }
            other => return Err(ManagerError::UnknownType(other.to_string()).into()),
        };
        Ok(handler)
    }
}

fn parse_macro_event_dates(config: &StrategyConfig) -> std::collections::HashSet<chrono::NaiveDate> {
    let Some(Value::Array(dates)) = config.parameters.get("macro_event_dates") else {
        return std::collections::HashSet::new();
    };
    dates
        .iter()
        .filter_map(|v| v.as_str())
        .filter_map(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn manager() -> Arc<StrategyManager> {
        let broker = IbClient::new("127.0.0.1", 4002);
        let cache = Arc::new(Cache::new());
        let clock = Clock::new();
        let tmp = std::env::temp_dir().join(format!("manager-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(TradingDataStore::open(":memory:").unwrap());
        let bus = Arc::new(Bus::new());
        StrategyManager::new(broker, cache, clock, persistence, trading_data, bus)
    }

    fn sample_config(strategy_type: &str) -> StrategyConfig {
        StrategyConfig {
            id: format!("{strategy_type}-1"),
            name: strategy_type.into(),
            enabled: false,
            instrument_id: "SPX.CBOE".into(),
            strategy_type: strategy_type.into(),
            order_size: 1,
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn unknown_strategy_type_is_rejected() {
        let manager = manager();
        let err = manager.create_strategy(sample_config("NotARealType"), false).await.unwrap_err();
        assert!(err.to_string().contains("unknown strategy type"));
    }

    #[tokio::test]
    async fn create_then_start_then_stop_round_trips() {
        let manager = manager();
        manager.create_strategy(sample_config("SpxStreamer"), false).await.unwrap();
        manager.start_strategy("SpxStreamer-1").await.unwrap();
        manager.stop_strategy("SpxStreamer-1").await.unwrap();
        let statuses = manager.get_all_strategies_status();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager = manager();
        manager.create_strategy(sample_config("SpxStreamer"), false).await.unwrap();
        let err = manager.create_strategy(sample_config("SpxStreamer"), false).await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn update_config_merges_and_persists() {
        let manager = manager();
        manager.create_strategy(sample_config("IntervalTrader"), false).await.unwrap();
        let mut patch = Map::new();
        patch.insert("sl_pct".into(), Value::from(3.5));
        let updated = manager.update_strategy_config("IntervalTrader-1", &patch).await.unwrap();
        assert_eq!(updated.param_f64("sl_pct", 0.0), 3.5);
    }
}
