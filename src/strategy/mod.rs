// =============================================================================
// Strategy Runtime Base (C7)
// =============================================================================
//
// The reference codebase's inheritance chain (Strategy -> BaseStrategy ->
// product-specific base -> concrete) is flattened here into composition:
// every concrete strategy embeds a `StrategyCore` by value and implements
// `StrategyHandler`. `StrategyCore`'s dispatch loop is the safe envelope —
// it calls into the handler and turns any `Err` into a logged, non-fatal
// event so one strategy's bug can never take down another.

pub mod interval;
pub mod orb;
pub mod range;
pub mod recorder;
pub mod scalper;
pub mod spx_1dte;
pub mod spx_range;
pub mod streamer;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::broker::client::BrokerClient;
use crate::broker::events::BrokerEvent;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::persistence::PersistenceStore;
use crate::strategy::recorder::TradeRecorder;
use crate::trading_data::TradingDataStore;
use crate::types::{Bar, Order, OrderSide, OrderStatus, OrderType, Quote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    New,
    Ready,
    Running,
    Stopping,
    Stopped,
    Resetting,
}

/// One callback per broker event kind, default-implemented as a no-op so a
/// concrete strategy only overrides what it actually cares about.
#[async_trait]
pub trait StrategyHandler: Send + Sync {
    async fn on_start(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_stop(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_reset(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_resume(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_quote(&self, _core: &StrategyCore, _quote: &Quote) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_bar(&self, _core: &StrategyCore, _bar: &Bar) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_submitted(&self, _core: &StrategyCore, _order: &Order) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_accepted(&self, _core: &StrategyCore, _order: &Order) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_filled(&self, _core: &StrategyCore, _order: &Order, _fill_qty: f64, _fill_price: f64) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_canceled(&self, _core: &StrategyCore, _order: &Order) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_rejected(&self, _core: &StrategyCore, _order: &Order, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_order_expired(&self, _core: &StrategyCore, _order: &Order) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Concurrency guards + bracket/software-SL helpers shared by every concrete
/// strategy, embedded by value rather than inherited.
pub struct StrategyCore {
    pub strategy_id: String,
    pub instrument_id: String,
    pub broker: Arc<dyn BrokerClient>,
    pub cache: Arc<Cache>,
    pub clock: Arc<Clock>,
    pub persistence: Arc<PersistenceStore>,
    pub trading_data: Arc<TradingDataStore>,
    pub recorder: TradeRecorder,

    pub state: RwLock<LifecycleState>,
    pub active_trade_id: RwLock<Option<String>>,
    pub entry_order_id: RwLock<Option<String>>,
    pub closing_in_progress: RwLock<bool>,
    pub sl_triggered: RwLock<bool>,
    pub processed_executions: RwLock<HashSet<String>>,

    pub software_sl_enabled: RwLock<bool>,
    pub software_sl_price: RwLock<Option<f64>>,
    pub software_tp_enabled: RwLock<bool>,
    pub software_tp_price: RwLock<Option<f64>>,

    pub position_side: RwLock<Option<OrderSide>>,
    pub position_qty: RwLock<Option<f64>>,
}

impl StrategyCore {
    pub fn new(
        strategy_id: impl Into<String>,
        instrument_id: impl Into<String>,
        broker: Arc<dyn BrokerClient>,
        cache: Arc<Cache>,
        clock: Arc<Clock>,
        persistence: Arc<PersistenceStore>,
        trading_data: Arc<TradingDataStore>,
    ) -> Self {
        let strategy_id = strategy_id.into();
        Self {
            recorder: TradeRecorder::new(strategy_id.clone()),
            strategy_id,
            instrument_id: instrument_id.into(),
            broker,
            cache,
            clock,
            persistence,
            trading_data,
            state: RwLock::new(LifecycleState::New),
            active_trade_id: RwLock::new(None),
            entry_order_id: RwLock::new(None),
            closing_in_progress: RwLock::new(false),
            sl_triggered: RwLock::new(false),
            processed_executions: RwLock::new(HashSet::new()),
            software_sl_enabled: RwLock::new(false),
            software_sl_price: RwLock::new(None),
            software_tp_enabled: RwLock::new(false),
            software_tp_price: RwLock::new(None),
            position_side: RwLock::new(None),
            position_qty: RwLock::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), LifecycleState::Stopped)
    }

    #[instrument(skip(self, handler))]
    pub async fn start(self: &Arc<Self>, handler: &dyn StrategyHandler) {
        let current = self.state();
        if current == LifecycleState::Running {
            return;
        }
        if self.is_terminal() {
            *self.state.write() = LifecycleState::Resetting;
            self.dispatch(handler.on_reset(self)).await;
            *self.state.write() = LifecycleState::Ready;
        }
        if matches!(self.state(), LifecycleState::Ready | LifecycleState::New) {
            self.load_state();
            *self.state.write() = LifecycleState::Running;
            self.dispatch(handler.on_start(self)).await;
        }
    }

    #[instrument(skip(self, handler))]
    pub async fn stop(self: &Arc<Self>, handler: &dyn StrategyHandler) {
        if self.state() == LifecycleState::Stopped {
            return;
        }
        *self.state.write() = LifecycleState::Stopping;
        let _ = self.broker.cancel_all_orders(&self.instrument_id).await;
        self.dispatch(handler.on_stop(self)).await;
        self.save_state();
        *self.state.write() = LifecycleState::Stopped;
    }

    /// Runs a handler future through the safe envelope: logs on error with
    /// full context, never propagates.
    pub async fn dispatch(&self, fut: impl std::future::Future<Output = anyhow::Result<()>>) {
        if let Err(e) = fut.await {
            error!(strategy_id = %self.strategy_id, error = %format!("{e:#}"), "strategy callback failed");
        }
    }

    pub fn save_state(&self) {
        let state = serde_json::json!({
            "active_trade_id": *self.active_trade_id.read(),
            "lifecycle_state": format!("{:?}", self.state()),
        });
        if let Err(e) = self.persistence.save_state(&self.strategy_id, state) {
            error!(strategy_id = %self.strategy_id, error = %e, "failed to save strategy state");
        }
    }

    pub fn load_state(&self) {
        if let Some(state) = self.persistence.load_state(&self.strategy_id) {
            if let Some(trade_id) = state.get("active_trade_id").and_then(|v| v.as_str()) {
                *self.active_trade_id.write() = Some(trade_id.to_string());
            }
        }
    }

    /// Submits a market/limit entry and records the client order id as the
    /// pending entry so concurrent exit signals can't race it.
    pub async fn submit_entry_order(&self, order: Order) -> anyhow::Result<()> {
        *self.entry_order_id.write() = Some(order.client_order_id.clone());
        self.broker.submit_order(order).await
    }

    /// Submits entry then arms both SL and TP as software-checked price
    /// thresholds — there is no broker-side bracket order for either leg,
    /// so every caller must poll `check_software_stop_loss`/
    /// `check_software_take_profit` on subsequent price ticks and submit
    /// the close itself via `close_strategy_position`/`close_spread_smart`.
    pub async fn submit_bracket_order(&self, entry: Order, sl_price: f64, tp_price: f64) -> anyhow::Result<()> {
        *self.software_sl_price.write() = Some(sl_price);
        *self.software_sl_enabled.write() = true;
        *self.software_tp_price.write() = Some(tp_price);
        *self.software_tp_enabled.write() = true;
        self.submit_entry_order(entry).await
    }

    /// Records the side and filled quantity of the position a strategy just
    /// opened, so `close_strategy_position` knows how to flatten it later.
    pub fn record_position_open(&self, side: OrderSide, qty: f64) {
        *self.position_side.write() = Some(side);
        *self.position_qty.write() = Some(qty);
    }

    /// Checks a price observation against the armed software stop-loss.
    /// Returns true and disarms if the price has crossed against the
    /// position; the caller is responsible for submitting the close.
    pub fn check_software_stop_loss(&self, price: f64, is_long: bool) -> bool {
        if !*self.software_sl_enabled.read() {
            return false;
        }
        let Some(sl) = *self.software_sl_price.read() else {
            return false;
        };
        let breached = if is_long { price <= sl } else { price >= sl };
        if breached {
            *self.software_sl_enabled.write() = false;
        }
        breached
    }

    /// Checks a price observation against the armed software take-profit.
    /// Returns true and disarms if the price has crossed in the position's
    /// favor past the target; the caller is responsible for submitting the
    /// close.
    pub fn check_software_take_profit(&self, price: f64, is_long: bool) -> bool {
        if !*self.software_tp_enabled.read() {
            return false;
        }
        let Some(tp) = *self.software_tp_price.read() else {
            return false;
        };
        let breached = if is_long { price >= tp } else { price <= tp };
        if breached {
            *self.software_tp_enabled.write() = false;
        }
        breached
    }

    /// Closes the strategy's position, guarding against double-close via
    /// `closing_in_progress`. Cancels any resting orders on the instrument,
    /// then — if a position was recorded via `record_position_open` —
    /// submits an offsetting market order sized to the recorded quantity so
    /// an already-filled single-leg position actually gets flattened, not
    /// just its resting orders cancelled. Returns `false` if a close is
    /// already underway. Multi-leg spreads must use `close_spread_smart`
    /// instead, since a single offsetting market order can't unwind a combo.
    pub async fn close_strategy_position(&self, reason: &str, override_instrument_id: Option<&str>) -> anyhow::Result<bool> {
        {
            let mut closing = self.closing_in_progress.write();
            if *closing {
                return Ok(false);
            }
            *closing = true;
        }
        let instrument_id = override_instrument_id.unwrap_or(&self.instrument_id);
        tracing::info!(strategy_id = %self.strategy_id, instrument_id, reason, "closing strategy position");
        self.broker.cancel_all_orders(instrument_id).await?;

        let side = self.position_side.write().take();
        let qty = self.position_qty.write().take();
        if let (Some(side), Some(qty)) = (side, qty) {
            if qty > 0.0 {
                let close_side = match side {
                    OrderSide::Buy => OrderSide::Sell,
                    OrderSide::Sell => OrderSide::Buy,
                };
                let order = Order {
                    client_order_id: format!("{}-{}-close", self.strategy_id, reason.to_lowercase()),
                    exchange_order_id: None,
                    instrument_id: instrument_id.to_string(),
                    side: close_side,
                    order_type: OrderType::Market,
                    quantity: qty,
                    limit_price: None,
                    time_in_force: "DAY".into(),
                    status: OrderStatus::Submitted,
                    filled_qty: 0.0,
                    avg_fill_price: None,
                    commission: 0.0,
                    submitted_at: chrono::Utc::now(),
                };
                self.broker.submit_order(order).await?;
            }
        }
        *self.software_sl_enabled.write() = false;
        *self.software_tp_enabled.write() = false;
        Ok(true)
    }

    /// Closes a multi-leg spread position by submitting an offsetting combo
    /// order through the broker's `create_spread`. `legs` carries
    /// `(instrument_id, signed_quantity)` pairs for the unwind — positive
    /// means buy-to-close that leg, negative means sell-to-close. `limit`
    /// is accepted for callers that track a marketable price but is
    /// currently advisory only: `create_spread` always works the combo at
    /// the broker's smart-routed price. Shares the same double-close guard
    /// as `close_strategy_position`.
    pub async fn close_spread_smart(&self, legs: &[(String, i32)], limit: Option<f64>) -> anyhow::Result<bool> {
        {
            let mut closing = self.closing_in_progress.write();
            if *closing {
                return Ok(false);
            }
            *closing = true;
        }
        tracing::info!(strategy_id = %self.strategy_id, ?legs, ?limit, "closing spread position via combo order");
        self.broker.create_spread(legs).await?;
        Ok(true)
    }

    /// Clears the closing flag so SL/TP monitoring can re-arm, e.g. after a
    /// close order ends CANCELED/REJECTED/EXPIRED while the position is
    /// still non-flat.
    pub fn clear_closing_in_progress(&self) {
        *self.closing_in_progress.write() = false;
    }

    pub fn mark_execution_processed(&self, execution_id: &str) -> bool {
        self.processed_executions.write().insert(execution_id.to_string())
    }
}

/// Drives `BrokerEvent`s into a `StrategyHandler` through the safe
/// envelope — one `tokio::task` per strategy consumes this from a filtered
/// `mpsc` receiver subscribed off C5's broadcast bus.
pub async fn run_event_loop(
    core: Arc<StrategyCore>,
    handler: Arc<dyn StrategyHandler>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<BrokerEvent>,
) {
    while let Some(event) = events.recv().await {
        if core.state() != LifecycleState::Running {
            continue;
        }
        match event {
            BrokerEvent::QuoteTick { quote } if quote.instrument_id == core.instrument_id => {
                core.dispatch(handler.on_quote(&core, &quote)).await;
            }
            BrokerEvent::Bar { bar } if bar.instrument_id == core.instrument_id => {
                core.dispatch(handler.on_bar(&core, &bar)).await;
            }
            BrokerEvent::OrderSubmitted { order } => {
                core.dispatch(handler.on_order_submitted(&core, &order)).await;
            }
            BrokerEvent::OrderAccepted { order } => {
                core.dispatch(handler.on_order_accepted(&core, &order)).await;
            }
            BrokerEvent::OrderPartiallyFilled { order, fill_qty, fill_price }
            | BrokerEvent::OrderFilled { order, fill_qty, fill_price } => {
                core.dispatch(handler.on_order_filled(&core, &order, fill_qty, fill_price)).await;
            }
            BrokerEvent::OrderCanceled { order } => {
                if *core.closing_in_progress.read() {
                    core.clear_closing_in_progress();
                }
                core.dispatch(handler.on_order_canceled(&core, &order)).await;
            }
            BrokerEvent::OrderRejected { order, reason } => {
                if *core.closing_in_progress.read() {
                    core.clear_closing_in_progress();
                }
                core.dispatch(handler.on_order_rejected(&core, &order, &reason)).await;
            }
            BrokerEvent::OrderExpired { order } => {
                if *core.closing_in_progress.read() {
                    core.clear_closing_in_progress();
                }
                core.dispatch(handler.on_order_expired(&core, &order)).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_stop_loss_disarms_after_breach() {
        let clock = Clock::new();
        let cache = Arc::new(Cache::new());
        let tmp = std::env::temp_dir().join(format!("strategy-core-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(PersistenceStore::new(&tmp).unwrap());
        struct NullBroker;
        #[async_trait::async_trait]
        impl BrokerClient for NullBroker {
            fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<BrokerEvent> {
                tokio::sync::broadcast::channel(1).1
            }
            async fn subscribe_quotes(&self, _: &str) {}
            async fn unsubscribe_quotes(&self, _: &str) {}
            async fn subscribe_bars(&self, _: &str) {}
            async fn unsubscribe_bars(&self, _: &str) {}
            async fn request_instrument(&self, _: &str) {}
            async fn request_instruments(&self, _: &str, _: &str) {}
            async fn submit_order(&self, _: Order) -> anyhow::Result<()> {
                Ok(())
            }
            async fn cancel_order(&self, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn cancel_all_orders(&self, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn create_spread(&self, _: &[(String, i32)]) -> anyhow::Result<()> {
                Ok(())
            }
            fn last_quote(&self, _: &str) -> Option<Quote> {
                None
            }
            fn instrument(&self, _: &str) -> Option<crate::types::Instrument> {
                None
            }
        }
        let trading_data = Arc::new(TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new("s1", "SPX.CBOE", Arc::new(NullBroker), cache, clock, persistence, trading_data);
        *core.software_sl_enabled.write() = true;
        *core.software_sl_price.write() = Some(4490.0);
        assert!(!core.check_software_stop_loss(4495.0, true));
        assert!(core.check_software_stop_loss(4489.0, true));
        assert!(!*core.software_sl_enabled.read());
    }

    #[test]
    fn software_take_profit_disarms_after_breach() {
        let clock = Clock::new();
        let cache = Arc::new(Cache::new());
        let tmp = std::env::temp_dir().join(format!("strategy-core-tp-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(PersistenceStore::new(&tmp).unwrap());
        struct NullBroker;
        #[async_trait::async_trait]
        impl BrokerClient for NullBroker {
            fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<BrokerEvent> {
                tokio::sync::broadcast::channel(1).1
            }
            async fn subscribe_quotes(&self, _: &str) {}
            async fn unsubscribe_quotes(&self, _: &str) {}
            async fn subscribe_bars(&self, _: &str) {}
            async fn unsubscribe_bars(&self, _: &str) {}
            async fn request_instrument(&self, _: &str) {}
            async fn request_instruments(&self, _: &str, _: &str) {}
            async fn submit_order(&self, _: Order) -> anyhow::Result<()> {
                Ok(())
            }
            async fn cancel_order(&self, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn cancel_all_orders(&self, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn create_spread(&self, _: &[(String, i32)]) -> anyhow::Result<()> {
                Ok(())
            }
            fn last_quote(&self, _: &str) -> Option<Quote> {
                None
            }
            fn instrument(&self, _: &str) -> Option<crate::types::Instrument> {
                None
            }
        }
        let trading_data = Arc::new(TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new("s1", "SPX.CBOE", Arc::new(NullBroker), cache, clock, persistence, trading_data);
        *core.software_tp_enabled.write() = true;
        *core.software_tp_price.write() = Some(4510.0);
        assert!(!core.check_software_take_profit(4505.0, true));
        assert!(core.check_software_take_profit(4511.0, true));
        assert!(!*core.software_tp_enabled.read());
    }

    struct RecordingBroker {
        submitted: parking_lot::Mutex<Vec<Order>>,
    }

    #[async_trait::async_trait]
    impl BrokerClient for RecordingBroker {
        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<BrokerEvent> {
            tokio::sync::broadcast::channel(1).1
        }
        async fn subscribe_quotes(&self, _: &str) {}
        async fn unsubscribe_quotes(&self, _: &str) {}
        async fn subscribe_bars(&self, _: &str) {}
        async fn unsubscribe_bars(&self, _: &str) {}
        async fn request_instrument(&self, _: &str) {}
        async fn request_instruments(&self, _: &str, _: &str) {}
        async fn submit_order(&self, order: Order) -> anyhow::Result<()> {
            self.submitted.lock().push(order);
            Ok(())
        }
        async fn cancel_order(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_all_orders(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn create_spread(&self, _: &[(String, i32)]) -> anyhow::Result<()> {
            Ok(())
        }
        fn last_quote(&self, _: &str) -> Option<Quote> {
            None
        }
        fn instrument(&self, _: &str) -> Option<crate::types::Instrument> {
            None
        }
    }

    #[tokio::test]
    async fn close_strategy_position_submits_an_offsetting_market_order_for_a_recorded_position() {
        let tmp = std::env::temp_dir().join(format!("strategy-core-close-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(TradingDataStore::open(":memory:").unwrap());
        let broker = Arc::new(RecordingBroker { submitted: parking_lot::Mutex::new(Vec::new()) });
        let core = StrategyCore::new(
            "s1",
            "SPX.CBOE",
            broker.clone(),
            Arc::new(Cache::new()),
            Clock::new(),
            persistence,
            trading_data,
        );
        core.record_position_open(OrderSide::Buy, 3.0);
        assert!(core.close_strategy_position("STOP_LOSS", None).await.unwrap());

        let submitted = broker.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].side, OrderSide::Sell);
        assert_eq!(submitted[0].quantity, 3.0);
        assert_eq!(submitted[0].order_type, OrderType::Market);
        assert!(core.position_side.read().is_none());
    }

    #[tokio::test]
    async fn close_strategy_position_is_a_pure_cancel_with_no_recorded_position() {
        let tmp = std::env::temp_dir().join(format!("strategy-core-close-noop-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(TradingDataStore::open(":memory:").unwrap());
        let broker = Arc::new(RecordingBroker { submitted: parking_lot::Mutex::new(Vec::new()) });
        let core = StrategyCore::new("s1", "SPX.CBOE", broker.clone(), Arc::new(Cache::new()), Clock::new(), persistence, trading_data);
        assert!(core.close_strategy_position("STOP_LOSS", None).await.unwrap());
        assert!(broker.submitted.lock().is_empty());
    }
}
