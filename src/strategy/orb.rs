// =============================================================================
// Opening-Range Breakout — long call / long put (C8.4.8.2)
// =============================================================================
//
// Folds three source siblings (premium-targeted option, delta-targeted
// option, MES-futures direct) into one module: `OrbConfig` picks the
// target and product, everything else is shared.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Timelike};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::client::BrokerClient;
use crate::option_search::{OptionSearchEngine, SearchParams, SearchTarget};
use crate::strategy::range::RangeEngine;
use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::{Bar, Order, OrderSide, OrderStatus, OrderType, OptionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PremiumOrDelta {
    Premium,
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Product {
    Underlying,
    Option,
}

#[derive(Debug, Clone)]
pub struct OrbConfig {
    pub direction: OrderSide,
    pub kind: OptionKind,
    pub target: PremiumOrDelta,
    pub product: Product,
    pub premium_target: f64,
    pub delta_target: f64,
    pub range_minutes: i64,
    pub cutoff_hour: u32,
    pub sl_pct: f64,
    pub tp_dollars: f64,
    pub order_size: f64,
    pub strike_step: f64,
}

pub struct OrbStrategy<B: BrokerClient> {
    config: OrbConfig,
    range: RangeEngine,
    search: Arc<OptionSearchEngine<B>>,
    entry_attempted_today: RwLock<bool>,
    sl_price: RwLock<Option<f64>>,
    tp_price: RwLock<Option<f64>>,
    exit_alerted: RwLock<bool>,
    active_option_id: RwLock<Option<String>>,
}

impl<B: BrokerClient + 'static> OrbStrategy<B> {
    pub fn new(config: OrbConfig, search: Arc<OptionSearchEngine<B>>) -> Self {
        let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let close = open + chrono::Duration::minutes(config.range_minutes);
        Self {
            config,
            range: RangeEngine::new(open, close),
            search,
            entry_attempted_today: RwLock::new(false),
            sl_price: RwLock::new(None),
            tp_price: RwLock::new(None),
            exit_alerted: RwLock::new(false),
            active_option_id: RwLock::new(None),
        }
    }

    fn triggered(&self, close: f64) -> bool {
        match self.config.direction {
            OrderSide::Buy => self.range.high().is_some_and(|h| close > h),
            OrderSide::Sell => self.range.low().is_some_and(|l| close < l),
        }
    }

    async fn launch_entry(&self, core: &StrategyCore) {
        {
            let mut attempted = self.entry_attempted_today.write();
            if *attempted {
                return;
            }
            *attempted = true;
        }

        if core.recorder.has_active_trade() {
            return;
        }

        if self.config.product == Product::Underlying {
            self.submit_underlying_entry(core).await;
            return;
        }

        let target = match self.config.target {
            PremiumOrDelta::Premium => SearchTarget::Premium(self.config.premium_target),
            PremiumOrDelta::Delta => SearchTarget::Delta(self.config.delta_target),
        };
        let params = SearchParams {
            target,
            kind: self.config.kind,
            underlying: core.instrument_id.clone(),
            expiry: Some(core.clock.now().date_naive()),
            strike_range: 10,
            strike_step: self.config.strike_step,
            max_spread: 0.5,
            delay: std::time::Duration::from_secs(3),
            risk_free_rate: 0.04,
            dividend_yield: 0.015,
        };

        let strategy_id = core.strategy_id.clone();
        let sl_pct = self.config.sl_pct;
        let tp_dollars = self.config.tp_dollars;
        let order_size = self.config.order_size;

        let (_search_id, rx) = self.search.find_option(params).await;
        let Ok(Some(result)) = rx.await else {
            warn!(strategy_id, "orb option search found no candidate, skipping today");
            return;
        };

        let entry_price = (result.ask * 100.0).round() / 100.0;
        let sl_price = entry_price * (1.0 - sl_pct / 100.0);
        let tp_price = entry_price + tp_dollars / 100.0;
        let order = Order {
            client_order_id: format!("{strategy_id}-entry"),
            exchange_order_id: None,
            instrument_id: result.instrument_id,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: order_size,
            limit_price: Some(entry_price),
            time_in_force: "DAY".into(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: chrono::Utc::now(),
        };
        if let Err(e) = core.submit_bracket_order(order, sl_price, tp_price).await {
            warn!(strategy_id, error = %e, "failed to submit orb entry order");
        }
    }

    async fn submit_underlying_entry(&self, core: &StrategyCore) {
        let Some(quote) = core.broker.last_quote(&core.instrument_id) else {
            return;
        };
        let entry_price = quote.mid();
        let sl = entry_price * (1.0 - self.config.sl_pct / 100.0);
        let tp = entry_price + self.config.tp_dollars / 100.0;
        let order = Order {
            client_order_id: format!("{}-entry", core.strategy_id),
            exchange_order_id: None,
            instrument_id: core.instrument_id.clone(),
            side: self.config.direction,
            order_type: OrderType::Market,
            quantity: self.config.order_size,
            limit_price: None,
            time_in_force: "DAY".into(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: chrono::Utc::now(),
        };
        *self.sl_price.write() = Some(sl);
        *self.tp_price.write() = Some(tp);
        let _ = core.submit_bracket_order(order, sl, tp).await;
    }
}

#[async_trait]
impl<B: BrokerClient + 'static> StrategyHandler for OrbStrategy<B> {
    async fn on_start(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        *self.entry_attempted_today.write() = false;
        *self.exit_alerted.write() = false;
        Ok(())
    }

    async fn on_bar(&self, core: &StrategyCore, bar: &Bar) -> anyhow::Result<()> {
        if bar.instrument_id != core.instrument_id || !bar.is_closed {
            return Ok(());
        }
        self.range.roll_day(bar.close_time);
        self.range.observe(bar.close_time, bar.close);

        let now_local = bar.close_time.with_timezone(&crate::clock::tz::EASTERN);
        if now_local.time().hour() >= self.config.cutoff_hour {
            return Ok(());
        }

        if self.range.is_locked() && self.triggered(bar.close) {
            self.launch_entry(core).await;
        }

        if *self.exit_alerted.read() {
            return Ok(());
        }
        let is_long = self.config.direction == OrderSide::Buy;
        // For an options product the filled contract, not the strategy's
        // configured underlying, is what must be closed.
        let target = self.active_option_id.read().clone();
        if self.sl_price.read().is_some() && core.check_software_stop_loss(bar.close, is_long) {
            *self.exit_alerted.write() = true;
            let sl = self.sl_price.read().unwrap_or(bar.close);
            info!(strategy_id = %core.strategy_id, sl, "software stop-loss breached");
            if core.close_strategy_position("STOP_LOSS", target.as_deref()).await.unwrap_or(false) {
                let _ = core.recorder.close_trade(&core.trading_data, sl, "STOP_LOSS", chrono::Utc::now(), 0.0);
            }
        } else if self.tp_price.read().is_some() && core.check_software_take_profit(bar.close, is_long) {
            *self.exit_alerted.write() = true;
            let tp = self.tp_price.read().unwrap_or(bar.close);
            info!(strategy_id = %core.strategy_id, tp, "software take-profit reached");
            if core.close_strategy_position("TAKE_PROFIT", target.as_deref()).await.unwrap_or(false) {
                let _ = core.recorder.close_trade(&core.trading_data, tp, "TAKE_PROFIT", chrono::Utc::now(), 0.0);
            }
        }
        Ok(())
    }

    async fn on_order_filled(&self, core: &StrategyCore, order: &Order, fill_qty: f64, fill_price: f64) -> anyhow::Result<()> {
        if order.client_order_id.ends_with("-entry") {
            let sl = fill_price * (1.0 - self.config.sl_pct / 100.0);
            let tp = fill_price + self.config.tp_dollars / 100.0;
            *self.sl_price.write() = Some(sl);
            *self.tp_price.write() = Some(tp);
            *self.exit_alerted.write() = false;
            *self.active_option_id.write() = match self.config.product {
                Product::Option => Some(order.instrument_id.clone()),
                Product::Underlying => None,
            };
            core.record_position_open(order.side, fill_qty);
            let trade_id = format!("{}-{}", core.strategy_id, core.clock.now().timestamp_millis());
            let trade_type = match self.config.product {
                Product::Option => "OPTION",
                Product::Underlying => "UNDERLYING",
            };
            let _ = core.recorder.start_trade(
                &core.trading_data,
                &trade_id,
                &order.instrument_id,
                Some(trade_type),
                fill_price,
                fill_qty,
                Some(&order.side.to_string()),
                core.clock.now(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggered_requires_strict_breakout_above_range_high() {
        let config = OrbConfig {
            direction: OrderSide::Buy,
            kind: OptionKind::Call,
            target: PremiumOrDelta::Premium,
            product: Product::Option,
            premium_target: 2.5,
            delta_target: 0.3,
            range_minutes: 15,
            cutoff_hour: 11,
            sl_pct: 50.0,
            tp_dollars: 100.0,
            order_size: 1.0,
            strike_step: 5.0,
        };
        let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let range = RangeEngine::new(open, open + chrono::Duration::minutes(15));
        let ts = crate::clock::tz::EASTERN
            .with_ymd_and_hms(2026, 3, 10, 9, 35, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        range.roll_day(ts);
        range.observe(ts, 4500.0);
        let strat = OrbStrategy::<crate::broker::client::IbClient> {
            config,
            range,
            search: OptionSearchEngine::new(crate::broker::client::IbClient::new("127.0.0.1", 4002), crate::clock::Clock::new()),
            entry_attempted_today: RwLock::new(false),
            sl_price: RwLock::new(None),
            tp_price: RwLock::new(None),
            exit_alerted: RwLock::new(false),
            active_option_id: RwLock::new(None),
        };
        let lock_ts = crate::clock::tz::EASTERN
            .with_ymd_and_hms(2026, 3, 10, 9, 46, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        strat.range.observe(lock_ts, 4500.0);
        assert!(strat.range.is_locked());
        assert!(!strat.triggered(4500.0));
        assert!(strat.triggered(4500.01));
    }

    #[tokio::test]
    async fn entry_attempted_today_latches_even_when_the_attempt_finds_no_quote() {
        let config = OrbConfig {
            direction: OrderSide::Buy,
            kind: OptionKind::Call,
            target: PremiumOrDelta::Premium,
            product: Product::Underlying,
            premium_target: 2.5,
            delta_target: 0.3,
            range_minutes: 15,
            cutoff_hour: 11,
            sl_pct: 50.0,
            tp_dollars: 100.0,
            order_size: 1.0,
            strike_step: 5.0,
        };
        let broker = crate::broker::client::IbClient::new("127.0.0.1", 4002);
        let strat = OrbStrategy::<crate::broker::client::IbClient> {
            search: OptionSearchEngine::new(broker.clone(), crate::clock::Clock::new()),
            range: RangeEngine::new(
                chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(9, 45, 0).unwrap(),
            ),
            config,
            entry_attempted_today: RwLock::new(false),
            sl_price: RwLock::new(None),
            tp_price: RwLock::new(None),
            exit_alerted: RwLock::new(false),
            active_option_id: RwLock::new(None),
        };
        let tmp = std::env::temp_dir().join(format!("orb-latch-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(crate::persistence::PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(crate::trading_data::TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new(
            "orb-latch-test",
            "SPX.CBOE",
            broker,
            Arc::new(crate::cache::Cache::new()),
            crate::clock::Clock::new(),
            persistence,
            trading_data,
        );

        assert!(!*strat.entry_attempted_today.read());
        // No quote is cached for the instrument, so this attempt cannot
        // produce an order — the latch must still flip.
        strat.launch_entry(&core).await;
        assert!(*strat.entry_attempted_today.read());

        strat.launch_entry(&core).await;
        assert!(*strat.entry_attempted_today.read());
    }

    struct SpyBroker {
        closed_instrument: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl BrokerClient for SpyBroker {
        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::broker::events::BrokerEvent> {
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
        async fn cancel_all_orders(&self, instrument_id: &str) -> anyhow::Result<()> {
            *self.closed_instrument.lock() = Some(instrument_id.to_string());
            Ok(())
        }
        async fn create_spread(&self, _: &[(String, i32)]) -> anyhow::Result<()> {
            Ok(())
        }
        fn last_quote(&self, _: &str) -> Option<crate::types::Quote> {
            None
        }
        fn instrument(&self, _: &str) -> Option<crate::types::Instrument> {
            None
        }
    }

    #[tokio::test]
    async fn software_stop_loss_closes_the_filled_option_not_the_underlying() {
        let config = OrbConfig {
            direction: OrderSide::Buy,
            kind: OptionKind::Call,
            target: PremiumOrDelta::Premium,
            product: Product::Option,
            premium_target: 2.5,
            delta_target: 0.3,
            range_minutes: 15,
            cutoff_hour: 11,
            sl_pct: 50.0,
            tp_dollars: 100.0,
            order_size: 1.0,
            strike_step: 5.0,
        };
        let broker = Arc::new(SpyBroker { closed_instrument: parking_lot::Mutex::new(None) });
        let strat = OrbStrategy::<SpyBroker> {
            search: OptionSearchEngine::new(broker.clone(), crate::clock::Clock::new()),
            range: RangeEngine::new(
                chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(9, 45, 0).unwrap(),
            ),
            config,
            entry_attempted_today: RwLock::new(false),
            sl_price: RwLock::new(None),
            tp_price: RwLock::new(None),
            exit_alerted: RwLock::new(false),
            active_option_id: RwLock::new(None),
        };
        let tmp = std::env::temp_dir().join(format!("orb-option-sl-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(crate::persistence::PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(crate::trading_data::TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new(
            "orb-option-sl-test",
            "SPX.CBOE",
            broker.clone(),
            Arc::new(crate::cache::Cache::new()),
            crate::clock::Clock::new(),
            persistence,
            trading_data,
        );

        // Simulate the fill of an option contract entry — distinct from the
        // strategy's configured underlying instrument id.
        let filled_option = "SPX.CBOE 4505C";
        let fill_order = Order {
            client_order_id: "orb-option-sl-test-entry".into(),
            exchange_order_id: None,
            instrument_id: filled_option.into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 1.0,
            limit_price: Some(2.5),
            time_in_force: "DAY".into(),
            status: OrderStatus::Filled,
            filled_qty: 1.0,
            avg_fill_price: Some(2.5),
            commission: 0.0,
            submitted_at: chrono::Utc::now(),
        };
        strat.on_order_filled(&core, &fill_order, 1.0, 2.5).await.unwrap();
        assert_eq!(strat.active_option_id.read().as_deref(), Some(filled_option));

        // Arm and breach the software stop-loss directly, as `on_bar` would.
        *core.software_sl_enabled.write() = true;
        *core.software_sl_price.write() = Some(1.0);
        assert!(core.check_software_stop_loss(0.5, true));
        let target = strat.active_option_id.read().clone();
        core.close_strategy_position("STOP_LOSS", target.as_deref()).await.unwrap();

        assert_eq!(broker.closed_instrument.lock().as_deref(), Some(filled_option));
    }

    #[tokio::test]
    async fn take_profit_reached_closes_position_and_records_a_win_trade() {
        let config = OrbConfig {
            direction: OrderSide::Buy,
            kind: OptionKind::Call,
            target: PremiumOrDelta::Premium,
            product: Product::Underlying,
            premium_target: 2.5,
            delta_target: 0.3,
            range_minutes: 15,
            cutoff_hour: 16,
            sl_pct: 50.0,
            tp_dollars: 100.0,
            order_size: 2.0,
            strike_step: 5.0,
        };
        let broker = crate::broker::client::IbClient::new("127.0.0.1", 4002);
        let strat = OrbStrategy::<crate::broker::client::IbClient> {
            search: OptionSearchEngine::new(broker.clone(), crate::clock::Clock::new()),
            range: RangeEngine::new(
                chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(9, 45, 0).unwrap(),
            ),
            config,
            entry_attempted_today: RwLock::new(false),
            sl_price: RwLock::new(None),
            tp_price: RwLock::new(None),
            exit_alerted: RwLock::new(false),
            active_option_id: RwLock::new(None),
        };
        let tmp = std::env::temp_dir().join(format!("orb-tp-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(crate::persistence::PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(crate::trading_data::TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new(
            "orb-tp-test",
            "SPX.CBOE",
            broker,
            Arc::new(crate::cache::Cache::new()),
            crate::clock::Clock::new(),
            persistence,
            trading_data,
        );

        let fill_order = Order {
            client_order_id: "orb-tp-test-entry".into(),
            exchange_order_id: None,
            instrument_id: "SPX.CBOE".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 2.0,
            limit_price: None,
            time_in_force: "DAY".into(),
            status: OrderStatus::Filled,
            filled_qty: 2.0,
            avg_fill_price: Some(4500.0),
            commission: 0.0,
            submitted_at: chrono::Utc::now(),
        };
        strat.on_order_filled(&core, &fill_order, 2.0, 4500.0).await.unwrap();
        assert!(core.recorder.has_active_trade());
        assert_eq!(*strat.tp_price.read(), Some(4501.0));

        let ts = crate::clock::tz::EASTERN
            .with_ymd_and_hms(2026, 3, 10, 10, 0, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        let bar = Bar {
            instrument_id: "SPX.CBOE".into(),
            period: "1m".into(),
            open_time: ts,
            close_time: ts,
            open: 4500.0,
            high: 4502.0,
            low: 4500.0,
            close: 4501.5,
            volume: 100.0,
            is_closed: true,
        };
        strat.on_bar(&core, &bar).await.unwrap();

        assert!(!core.recorder.has_active_trade());
        let rows = core.trading_data.list_trades(Some("orb-tp-test"), 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "CLOSED");
        assert_eq!(rows[0].result.as_deref(), Some("WIN"));
    }
}
