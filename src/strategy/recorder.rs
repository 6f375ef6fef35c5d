// =============================================================================
// Trade Recorder — thin per-strategy wrapper over C3 tracking the single
// active trade id a strategy instance owns at a time.
// =============================================================================

use parking_lot::RwLock;

use crate::trading_data::TradingDataStore;

pub struct TradeRecorder {
    strategy_id: String,
    active_trade_id: RwLock<Option<String>>,
}

impl TradeRecorder {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            active_trade_id: RwLock::new(None),
        }
    }

    pub fn active_trade_id(&self) -> Option<String> {
        self.active_trade_id.read().clone()
    }

    pub fn has_active_trade(&self) -> bool {
        self.active_trade_id.read().is_some()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start_trade(
        &self,
        store: &TradingDataStore,
        trade_id: &str,
        instrument_id: &str,
        trade_type: Option<&str>,
        entry_price: f64,
        quantity: f64,
        direction: Option<&str>,
        entry_time: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        store
            .start_trade(
                trade_id,
                &self.strategy_id,
                instrument_id,
                trade_type,
                entry_price,
                quantity,
                direction,
                entry_time,
            )
            .map_err(|e| anyhow::anyhow!(e))?;
        *self.active_trade_id.write() = Some(trade_id.to_string());
        Ok(())
    }

    pub fn update_metrics(&self, store: &TradingDataStore, current_pnl: f64) {
        let Some(trade_id) = self.active_trade_id() else {
            return;
        };
        store.update_trade_metrics(&trade_id, current_pnl, None);
    }

    pub fn close_trade(
        &self,
        store: &TradingDataStore,
        exit_price: f64,
        exit_reason: &str,
        exit_time: chrono::DateTime<chrono::Utc>,
        commission: f64,
    ) -> anyhow::Result<()> {
        let Some(trade_id) = self.active_trade_id.write().take() else {
            return Ok(());
        };
        store
            .close_trade(&trade_id, exit_price, exit_reason, exit_time, commission)
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub fn cancel(&self, store: &TradingDataStore) {
        if let Some(trade_id) = self.active_trade_id.write().take() {
            store.cancel_trade(&trade_id);
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TradingDataStore {
        TradingDataStore::open(":memory:").unwrap()
    }

    #[test]
    fn start_then_close_clears_active_trade() {
        let store = store();
        let recorder = TradeRecorder::new("orb-1");
        recorder
            .start_trade(&store, "t1", "SPX.CBOE", None, -2.5, 1.0, Some("CREDIT"), chrono::Utc::now())
            .unwrap();
        assert!(recorder.has_active_trade());
        recorder.close_trade(&store, -0.5, "TAKE_PROFIT", chrono::Utc::now(), 1.3).unwrap();
        assert!(!recorder.has_active_trade());
    }

    #[test]
    fn cancel_with_no_active_trade_is_a_no_op() {
        let store = store();
        let recorder = TradeRecorder::new("orb-1");
        recorder.cancel(&store);
        assert!(!recorder.has_active_trade());
    }
}
