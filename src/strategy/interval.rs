// =============================================================================
// Simple Interval Trader (C8.4.8.6, supplement)
// =============================================================================
//
// Long-only, enters on a periodic timer tick when flat, exits on a fixed
// percentage SL/TP from entry. The minimal `StrategyHandler` implementation
// — mostly useful as the registry's "hello world" strategy type.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::{Order, OrderSide, OrderStatus, OrderType};

#[derive(Debug, Clone)]
pub struct IntervalTraderConfig {
    pub interval: std::time::Duration,
    pub order_size: f64,
    pub sl_pct: f64,
    pub tp_pct: f64,
}

pub struct IntervalTrader {
    config: IntervalTraderConfig,
    entry_price: RwLock<Option<f64>>,
}

impl IntervalTrader {
    pub fn new(config: IntervalTraderConfig) -> Self {
        Self {
            config,
            entry_price: RwLock::new(None),
        }
    }
}

#[async_trait]
impl StrategyHandler for IntervalTrader {
    async fn on_start(&self, core: &StrategyCore) -> anyhow::Result<()> {
        let strategy_id = core.strategy_id.clone();
        let instrument_id = core.instrument_id.clone();
        let order_size = self.config.order_size;
        let broker = core.broker.clone();
        core.clock.set_periodic(format!("{strategy_id}-tick"), self.config.interval, move || {
            let instrument_id = instrument_id.clone();
            let strategy_id = strategy_id.clone();
            let broker = broker.clone();
            async move {
                if broker.last_quote(&instrument_id).is_none() {
                    return;
                }
                let order = Order {
                    client_order_id: format!("{strategy_id}-entry"),
                    exchange_order_id: None,
                    instrument_id,
                    side: OrderSide::Buy,
                    order_type: OrderType::Market,
                    quantity: order_size,
                    limit_price: None,
                    time_in_force: "DAY".into(),
                    status: OrderStatus::Submitted,
                    filled_qty: 0.0,
                    avg_fill_price: None,
                    commission: 0.0,
                    submitted_at: chrono::Utc::now(),
                };
                let _ = broker.submit_order(order).await;
            }
        });
        Ok(())
    }

    async fn on_stop(&self, core: &StrategyCore) -> anyhow::Result<()> {
        core.clock.cancel(&format!("{}-tick", core.strategy_id));
        Ok(())
    }

    async fn on_order_filled(&self, core: &StrategyCore, order: &Order, fill_qty: f64, fill_price: f64) -> anyhow::Result<()> {
        if order.client_order_id.ends_with("-entry") && self.entry_price.read().is_none() {
            *self.entry_price.write() = Some(fill_price);
            core.clock.cancel(&format!("{}-tick", core.strategy_id));
            core.record_position_open(order.side, fill_qty);
        }
        Ok(())
    }

    async fn on_quote(&self, core: &StrategyCore, quote: &crate::types::Quote) -> anyhow::Result<()> {
        let Some(entry) = *self.entry_price.read() else {
            return Ok(());
        };
        let sl = entry * (1.0 - self.config.sl_pct / 100.0);
        let tp = entry * (1.0 + self.config.tp_pct / 100.0);
        let price = quote.mid();
        if price <= sl || price >= tp {
            let reason = if price <= sl { "STOP_LOSS" } else { "TAKE_PROFIT" };
            if core.close_strategy_position(reason, None).await.unwrap_or(false) {
                *self.entry_price.write() = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_trader_has_no_entry_price() {
        let trader = IntervalTrader::new(IntervalTraderConfig {
            interval: std::time::Duration::from_secs(60),
            order_size: 1.0,
            sl_pct: 1.0,
            tp_pct: 2.0,
        });
        assert!(trader.entry_price.read().is_none());
    }
}
