// =============================================================================
// 0DTE Scalper (C8.4.8.6, supplement)
// =============================================================================
//
// Opening-range-based like the long-call/put ORB strategy but with a
// tighter range window, no `entry_attempted_today` latch — deliberately
// the other semantic named in the design notes, since this strategy's
// source never adopted the attempt-latching fix — and a fixed-tick-count
// exit instead of a price target.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::strategy::range::RangeEngine;
use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::{Bar, Order, OrderSide, OrderStatus, OrderType};

#[derive(Debug, Clone)]
pub struct ScalperConfig {
    pub range_minutes: i64,
    pub tick_size: f64,
    pub exit_ticks: u32,
    pub sl_ticks: u32,
    pub order_size: f64,
}

pub struct ScalperStrategy {
    config: ScalperConfig,
    range: RangeEngine,
    entry_price: RwLock<Option<f64>>,
    direction: RwLock<Option<OrderSide>>,
}

impl ScalperStrategy {
    pub fn new(config: ScalperConfig) -> Self {
        let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let close = open + chrono::Duration::minutes(config.range_minutes);
        Self {
            config,
            range: RangeEngine::new(open, close),
            entry_price: RwLock::new(None),
            direction: RwLock::new(None),
        }
    }

    fn ticks_from_entry(&self, price: f64) -> Option<f64> {
        let entry = (*self.entry_price.read())?;
        let direction = (*self.direction.read())?;
        let delta = match direction {
            OrderSide::Buy => price - entry,
            OrderSide::Sell => entry - price,
        };
        Some(delta / self.config.tick_size)
    }
}

#[async_trait]
impl StrategyHandler for ScalperStrategy {
    async fn on_bar(&self, core: &StrategyCore, bar: &Bar) -> anyhow::Result<()> {
        if bar.instrument_id != core.instrument_id || !bar.is_closed {
            return Ok(());
        }
        self.range.roll_day(bar.close_time);
        self.range.observe(bar.close_time, bar.close);

        if self.entry_price.read().is_some() {
            if let Some(ticks) = self.ticks_from_entry(bar.close) {
                if ticks >= self.config.exit_ticks as f64 {
                    if core.close_strategy_position("TAKE_PROFIT", None).await.unwrap_or(false) {
                        *self.entry_price.write() = None;
                    }
                } else if ticks <= -(self.config.sl_ticks as f64) {
                    if core.close_strategy_position("STOP_LOSS", None).await.unwrap_or(false) {
                        *self.entry_price.write() = None;
                    }
                }
            }
            return Ok(());
        }

        if !self.range.is_locked() {
            return Ok(());
        }

        // No `entry_attempted_today` latch: every range-qualified bar may
        // trigger a fresh entry once the prior position is flat, allowing
        // multiple re-entries in a single session.
        let side = if self.range.high().is_some_and(|h| bar.close > h) {
            Some(OrderSide::Buy)
        } else if self.range.low().is_some_and(|l| bar.close < l) {
            Some(OrderSide::Sell)
        } else {
            None
        };
        let Some(side) = side else {
            return Ok(());
        };

        let order = Order {
            client_order_id: format!("{}-scalp-{}", core.strategy_id, bar.close_time.timestamp_millis()),
            exchange_order_id: None,
            instrument_id: core.instrument_id.clone(),
            side,
            order_type: OrderType::Market,
            quantity: self.config.order_size,
            limit_price: None,
            time_in_force: "DAY".into(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: bar.close_time,
        };
        *self.direction.write() = Some(side);
        let _ = core.submit_entry_order(order).await;
        Ok(())
    }

    async fn on_order_filled(&self, core: &StrategyCore, order: &Order, fill_qty: f64, fill_price: f64) -> anyhow::Result<()> {
        if order.client_order_id.contains("-scalp-") {
            *self.entry_price.write() = Some(fill_price);
            core.record_position_open(order.side, fill_qty);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_from_entry_is_signed_by_direction() {
        let strat = ScalperStrategy::new(ScalperConfig {
            range_minutes: 5,
            tick_size: 0.25,
            exit_ticks: 4,
            sl_ticks: 2,
            order_size: 1.0,
        });
        *strat.entry_price.write() = Some(4500.0);
        *strat.direction.write() = Some(OrderSide::Buy);
        assert_eq!(strat.ticks_from_entry(4501.0), Some(4.0));
        *strat.direction.write() = Some(OrderSide::Sell);
        assert_eq!(strat.ticks_from_entry(4501.0), Some(-4.0));
    }

    #[test]
    fn no_entry_attempted_latch_means_repeated_triggers_allowed() {
        // There is no `entry_attempted_today`-style field on this strategy
        // at all — the absence itself is the behavior under test.
        let strat = ScalperStrategy::new(ScalperConfig {
            range_minutes: 5,
            tick_size: 0.25,
            exit_ticks: 4,
            sl_ticks: 2,
            order_size: 1.0,
        });
        assert!(strat.entry_price.read().is_none());
    }
}
