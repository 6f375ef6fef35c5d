// =============================================================================
// SPX 15-Minute Range Breakout — bidirectional credit spread (C8.4.8.3)
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::client::BrokerClient;
use crate::strategy::range::RangeEngine;
use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::{Bar, Order, OrderSide, OrderStatus, OrderType};

#[derive(Debug, Clone)]
pub struct SpxRangeConfig {
    pub range_minutes: i64,
    pub strike_step: f64,
    pub strike_width: f64,
    pub min_credit_amount: f64,
    pub fixed_sl_dollars: f64,
    pub fixed_tp_dollars: f64,
    pub signal_max_age_seconds: i64,
    pub max_price_deviation: f64,
    pub entry_cutoff_hour: u32,
    pub fill_timeout_seconds: u64,
    pub order_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpreadDirection {
    Bearish,
    Bullish,
}

struct OpenSpread {
    direction: SpreadDirection,
    entry_credit: f64,
    short_leg: String,
    long_leg: String,
}

pub struct SpxRangeStrategy<B: BrokerClient> {
    config: SpxRangeConfig,
    range: RangeEngine,
    broker: Arc<B>,
    high_breached: RwLock<bool>,
    low_breached: RwLock<bool>,
    traded_today: RwLock<bool>,
    entry_in_progress: RwLock<bool>,
    last_break_signal: RwLock<Option<(SpreadDirection, f64, chrono::DateTime<chrono::Utc>)>>,
    open_spread: RwLock<Option<OpenSpread>>,
}

impl<B: BrokerClient + 'static> SpxRangeStrategy<B> {
    pub fn new(config: SpxRangeConfig, broker: Arc<B>) -> Self {
        let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let close = open + chrono::Duration::minutes(config.range_minutes);
        Self {
            config,
            range: RangeEngine::new(open, close),
            broker,
            high_breached: RwLock::new(false),
            low_breached: RwLock::new(false),
            traded_today: RwLock::new(false),
            entry_in_progress: RwLock::new(false),
            last_break_signal: RwLock::new(None),
            open_spread: RwLock::new(None),
        }
    }

    fn evaluate_breakout(&self, close: f64, now: chrono::DateTime<chrono::Utc>) {
        let (Some(high), Some(low)) = (self.range.high(), self.range.low()) else {
            return;
        };
        if close > high && !*self.high_breached.read() {
            *self.high_breached.write() = true;
        }
        if close < low && !*self.low_breached.read() {
            *self.low_breached.write() = true;
        }

        if *self.traded_today.read() || *self.entry_in_progress.read() {
            return;
        }

        if close < low && !*self.high_breached.read() {
            *self.last_break_signal.write() = Some((SpreadDirection::Bearish, close, now));
        } else if close > high && !*self.low_breached.read() {
            *self.last_break_signal.write() = Some((SpreadDirection::Bullish, close, now));
        }
    }

    async fn try_enter(&self, core: &StrategyCore, now: chrono::DateTime<chrono::Utc>) {
        let Some((direction, break_level, signal_at)) = *self.last_break_signal.read() else {
            return;
        };
        let age = (now - signal_at).num_seconds();
        if age > self.config.signal_max_age_seconds {
            *self.last_break_signal.write() = None;
            return;
        }
        let local_hour = now.with_timezone(&crate::clock::tz::EASTERN).time().hour();
        if local_hour >= self.config.entry_cutoff_hour {
            *self.last_break_signal.write() = None;
            return;
        }
        let Some(quote) = self.broker.last_quote(&core.instrument_id) else {
            return;
        };
        if (quote.mid() - break_level).abs() > self.config.max_price_deviation {
            *self.last_break_signal.write() = None;
            return;
        }

        *self.entry_in_progress.write() = true;
        *self.traded_today.write() = true;
        *self.last_break_signal.write() = None;

        let step = self.config.strike_step;
        let atm = (quote.mid() / step).round() * step;
        let (short_strike, long_strike, short_suffix) = match direction {
            SpreadDirection::Bearish => (atm + step, atm + step + self.config.strike_width, "C"),
            SpreadDirection::Bullish => (atm - step, atm - step - self.config.strike_width, "P"),
        };
        let short_leg = format!("{} {}{}", core.instrument_id, short_strike, short_suffix);
        let long_leg = format!("{} {}{}", core.instrument_id, long_strike, short_suffix);

        self.broker.request_instrument(&short_leg).await;
        self.broker.request_instrument(&long_leg).await;
        self.broker.subscribe_quotes(&short_leg).await;
        self.broker.subscribe_quotes(&long_leg).await;

        if self.broker.create_spread(&[(long_leg.clone(), 1), (short_leg.clone(), -1)]).await.is_err() {
            warn!(strategy_id = %core.strategy_id, "failed to request spread instrument");
            *self.entry_in_progress.write() = false;
            *self.traded_today.write() = false;
            return;
        }

        let limit_price = -self.config.min_credit_amount / 100.0;
        let order = Order {
            client_order_id: format!("{}-spread-entry", core.strategy_id),
            exchange_order_id: None,
            instrument_id: format!("{short_leg}/{long_leg}"),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: self.config.order_size,
            limit_price: Some(limit_price),
            time_in_force: "DAY".into(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: now,
        };

        let entry_credit = self.config.min_credit_amount / 100.0;
        *self.open_spread.write() = Some(OpenSpread {
            direction,
            entry_credit,
            short_leg: short_leg.clone(),
            long_leg: long_leg.clone(),
        });

        let trade_id = format!("{}-{}", core.strategy_id, now.timestamp_millis());
        let direction_tag = match direction {
            SpreadDirection::Bearish => "CREDIT_CALL",
            SpreadDirection::Bullish => "CREDIT_PUT",
        };
        let _ = core.recorder.start_trade(
            &core.trading_data,
            &trade_id,
            &core.instrument_id,
            Some("SPREAD"),
            -entry_credit,
            self.config.order_size,
            Some(direction_tag),
            now,
        );

        let _ = core.submit_entry_order(order).await;

        if self.config.fill_timeout_seconds > 0 {
            let strategy_id = core.strategy_id.clone();
            let broker = self.broker.clone();
            let entry_order_id = format!("{}-spread-entry", core.strategy_id);
            let at = now + chrono::Duration::seconds(self.config.fill_timeout_seconds as i64);
            core.clock.set_alert(format!("{strategy_id}-fill-timeout"), at, move || async move {
                info!(strategy_id, "fill timeout fired, cancelling unfilled spread entry");
                let _ = broker.cancel_order(&entry_order_id).await;
            });
        }
    }

    async fn manage_open_spread(&self, core: &StrategyCore) {
        let (short_leg, long_leg, entry_credit) = {
            let guard = self.open_spread.read();
            let Some(spread) = guard.as_ref() else { return };
            (spread.short_leg.clone(), spread.long_leg.clone(), spread.entry_credit)
        };
        let (Some(short_q), Some(long_q)) = (self.broker.last_quote(&short_leg), self.broker.last_quote(&long_leg)) else {
            return;
        };
        let mid = long_q.mid() - short_q.mid();
        let pnl = (entry_credit - mid.abs()) * 100.0;
        core.recorder.update_metrics(&core.trading_data, pnl);

        let stop = -(entry_credit + self.config.fixed_sl_dollars / 100.0);
        let take_profit = -(entry_credit - self.config.fixed_tp_dollars / 100.0).max(0.05);

        // The combo was opened as [(long_leg, +qty), (short_leg, -qty)] —
        // buy the long leg, sell the short leg. Closing flips both: buy to
        // close the short leg, sell to close the long leg.
        let order_size = self.config.order_size.round() as i32;
        let close_legs = [(short_leg.clone(), order_size), (long_leg.clone(), -order_size)];

        if mid <= stop && !*core.sl_triggered.read() {
            *core.sl_triggered.write() = true;
            if core.close_spread_smart(&close_legs, Some(-stop)).await.unwrap_or(false) {
                let _ = core.recorder.close_trade(&core.trading_data, mid, "STOP_LOSS", chrono::Utc::now(), 0.0);
                self.open_spread.write().take();
            }
        } else if mid >= take_profit && !*core.closing_in_progress.read() {
            if core.close_spread_smart(&close_legs, Some(-take_profit)).await.unwrap_or(false) {
                let _ = core.recorder.close_trade(&core.trading_data, mid, "TAKE_PROFIT", chrono::Utc::now(), 0.0);
                self.open_spread.write().take();
            }
        }
    }
}

#[async_trait]
impl<B: BrokerClient + 'static> StrategyHandler for SpxRangeStrategy<B> {
    async fn on_start(&self, _core: &StrategyCore) -> anyhow::Result<()> {
        *self.traded_today.write() = false;
        *self.high_breached.write() = false;
        *self.low_breached.write() = false;
        Ok(())
    }

    async fn on_bar(&self, core: &StrategyCore, bar: &Bar) -> anyhow::Result<()> {
        if bar.instrument_id != core.instrument_id || !bar.is_closed {
            return Ok(());
        }
        self.range.roll_day(bar.close_time);
        self.range.observe(bar.close_time, bar.close);
        if self.range.is_locked() {
            self.evaluate_breakout(bar.close, bar.close_time);
            self.try_enter(core, bar.close_time).await;
        }
        self.manage_open_spread(core).await;
        Ok(())
    }

    async fn on_order_canceled(&self, core: &StrategyCore, order: &Order) -> anyhow::Result<()> {
        *self.entry_in_progress.write() = false;
        if !order.client_order_id.ends_with("-spread-entry") {
            return Ok(());
        }
        core.clock.cancel(&format!("{}-fill-timeout", core.strategy_id));
        let Some(trade_id) = core.recorder.active_trade_id() else {
            return Ok(());
        };
        if order.filled_qty <= 0.0 {
            warn!(strategy_id = %core.strategy_id, trade_id, "spread entry cancelled with zero fill, dropping tracked trade");
            core.recorder.cancel(&core.trading_data);
            core.trading_data.delete_trade(&trade_id);
            self.open_spread.write().take();
            *self.traded_today.write() = false;
        } else if order.filled_qty < order.quantity {
            warn!(strategy_id = %core.strategy_id, trade_id, filled_qty = order.filled_qty, "spread entry partially filled before cancellation, rescaling tracked size");
            if let Err(e) = core.trading_data.update_trade_quantity(&trade_id, order.filled_qty) {
                warn!(strategy_id = %core.strategy_id, trade_id, error = %e, "failed to rescale partially-filled trade");
            }
        }
        Ok(())
    }

    async fn on_order_rejected(&self, _core: &StrategyCore, _order: &Order, _reason: &str) -> anyhow::Result<()> {
        *self.entry_in_progress.write() = false;
        *self.traded_today.write() = false;
        self.open_spread.write().take();
        Ok(())
    }

    async fn on_order_filled(&self, core: &StrategyCore, order: &Order, fill_qty: f64, _fill_price: f64) -> anyhow::Result<()> {
        if order.client_order_id.ends_with("-spread-entry") {
            *self.entry_in_progress.write() = false;
            core.clock.cancel(&format!("{}-fill-timeout", core.strategy_id));
            if fill_qty < order.quantity && fill_qty > 0.0 {
                warn!(strategy_id = %core.strategy_id, fill_qty, "partial fill on spread entry");
            } else if fill_qty == 0.0 {
                self.open_spread.write().take();
                *self.traded_today.write() = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakout_sets_opposing_latch_and_blocks_same_direction_reentry() {
        let config = SpxRangeConfig {
            range_minutes: 15,
            strike_step: 5.0,
            strike_width: 20.0,
            min_credit_amount: 50.0,
            fixed_sl_dollars: 100.0,
            fixed_tp_dollars: 30.0,
            signal_max_age_seconds: 30,
            max_price_deviation: 2.0,
            entry_cutoff_hour: 15,
            fill_timeout_seconds: 0,
            order_size: 1.0,
        };
        let strat = SpxRangeStrategy {
            range: {
                let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
                RangeEngine::new(open, open + chrono::Duration::minutes(config.range_minutes))
            },
            broker: crate::broker::client::IbClient::new("127.0.0.1", 4002),
            high_breached: RwLock::new(false),
            low_breached: RwLock::new(false),
            traded_today: RwLock::new(false),
            entry_in_progress: RwLock::new(false),
            last_break_signal: RwLock::new(None),
            open_spread: RwLock::new(None),
            config,
        };
        let now = chrono::Utc::now();
        *strat.high_breached.write() = false;
        *strat.low_breached.write() = false;
        strat.evaluate_breakout(4495.0, now);
        // Simulate a populated range for the breakout check.
        strat.range.roll_day(now);
        strat.range.observe(now - chrono::Duration::minutes(1), 4500.0);
        strat.range.observe(now - chrono::Duration::minutes(1), 4510.0);
        strat.evaluate_breakout(4520.0, now);
        assert!(*strat.low_breached.read());
        // A bearish signal after a bullish breach must not be latched.
        strat.evaluate_breakout(4490.0, now);
        assert!(strat.last_break_signal.read().is_none() || matches!(strat.last_break_signal.read().as_ref().unwrap().0, SpreadDirection::Bullish));
    }

    fn test_config() -> SpxRangeConfig {
        SpxRangeConfig {
            range_minutes: 15,
            strike_step: 5.0,
            strike_width: 20.0,
            min_credit_amount: 50.0,
            fixed_sl_dollars: 100.0,
            fixed_tp_dollars: 30.0,
            signal_max_age_seconds: 30,
            max_price_deviation: 2.0,
            entry_cutoff_hour: 15,
            fill_timeout_seconds: 30,
            order_size: 4.0,
        }
    }

    fn strat_and_core(config: SpxRangeConfig, strategy_id: &str) -> (SpxRangeStrategy<crate::broker::client::IbClient>, StrategyCore) {
        let broker = crate::broker::client::IbClient::new("127.0.0.1", 4002);
        let strat = SpxRangeStrategy {
            range: {
                let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
                RangeEngine::new(open, open + chrono::Duration::minutes(config.range_minutes))
            },
            broker: broker.clone(),
            high_breached: RwLock::new(false),
            low_breached: RwLock::new(false),
            traded_today: RwLock::new(true),
            entry_in_progress: RwLock::new(true),
            last_break_signal: RwLock::new(None),
            open_spread: RwLock::new(Some(OpenSpread {
                direction: SpreadDirection::Bearish,
                entry_credit: -0.5,
                short_leg: "SPXW 5005C".into(),
                long_leg: "SPXW 5010C".into(),
            })),
            config,
        };
        let tmp = std::env::temp_dir().join(format!("spx-range-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(crate::persistence::PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(crate::trading_data::TradingDataStore::open(":memory:").unwrap());
        let core = StrategyCore::new(
            strategy_id.to_string(),
            "SPX.CBOE",
            broker,
            Arc::new(crate::cache::Cache::new()),
            crate::clock::Clock::new(),
            persistence,
            trading_data,
        );
        core.recorder
            .start_trade(&core.trading_data, "t1", "SPXW 5005C", Some("CALL_CREDIT_SPREAD"), -0.5, 4.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        (strat, core)
    }

    fn cancelled_entry_order(client_order_id: &str, quantity: f64, filled_qty: f64) -> Order {
        Order {
            client_order_id: client_order_id.to_string(),
            exchange_order_id: None,
            instrument_id: "SPXW 5005C".into(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(-0.5),
            time_in_force: "DAY".into(),
            status: OrderStatus::Canceled,
            filled_qty,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn fill_timeout_partial_rescales_tracked_trade_to_filled_quantity() {
        let (strat, core) = strat_and_core(test_config(), "spx-range-s4");
        let order = cancelled_entry_order("spx-range-s4-spread-entry", 4.0, 2.0);
        strat.on_order_canceled(&core, &order).await.unwrap();
        let row = core.trading_data.get_trade("t1").unwrap();
        assert_eq!(row.quantity, 2.0);
        assert!(core.recorder.has_active_trade());
    }

    #[tokio::test]
    async fn fill_timeout_zero_drops_the_tracked_trade_and_resets_for_reentry() {
        let (strat, core) = strat_and_core(test_config(), "spx-range-s5");
        let order = cancelled_entry_order("spx-range-s5-spread-entry", 4.0, 0.0);
        strat.on_order_canceled(&core, &order).await.unwrap();
        assert!(core.trading_data.get_trade("t1").is_none());
        assert!(!core.recorder.has_active_trade());
        assert!(strat.open_spread.read().is_none());
        assert!(!*strat.traded_today.read());
    }
}
