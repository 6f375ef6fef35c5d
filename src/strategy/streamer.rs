// =============================================================================
// SPX Streamer — non-trading data actor (C8.4.8.5)
// =============================================================================
//
// Subscribes to the index quote, publishes mid + a log line on bus topics,
// and self-publishes a heartbeat every 30s even absent ticks so the
// dashboard can distinguish "no trades" from "no data feed".

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bus::Bus;
use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::Quote;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

pub struct SpxStreamer {
    bus: Arc<Bus>,
}

impl SpxStreamer {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl StrategyHandler for SpxStreamer {
    async fn on_start(&self, core: &StrategyCore) -> anyhow::Result<()> {
        let bus = self.bus.clone();
        let strategy_id = core.strategy_id.clone();
        core.clock.set_periodic(format!("{strategy_id}-heartbeat"), HEARTBEAT_INTERVAL, move || {
            let bus = bus.clone();
            let strategy_id = strategy_id.clone();
            async move {
                bus.publish(
                    "system_status",
                    json!({"source": strategy_id, "kind": "heartbeat", "ts": chrono::Utc::now().to_rfc3339()}),
                );
            }
        });
        Ok(())
    }

    async fn on_stop(&self, core: &StrategyCore) -> anyhow::Result<()> {
        core.clock.cancel(&format!("{}-heartbeat", core.strategy_id));
        Ok(())
    }

    async fn on_quote(&self, core: &StrategyCore, quote: &Quote) -> anyhow::Result<()> {
        let mid = quote.mid();
        self.bus.publish(
            "spx_stream_price",
            json!({"instrument_id": quote.instrument_id, "mid": mid, "ts": quote.ts.to_rfc3339()}),
        );
        self.bus.publish(
            "spx_stream_log",
            json!({
                "strategy_id": core.strategy_id,
                "msg": format!("{} mid={:.2}", quote.instrument_id, mid),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_quote_publishes_mid_and_log() {
        let bus = Arc::new(Bus::new());
        let mut price_rx = bus.subscribe("spx_stream_price");
        let mut log_rx = bus.subscribe("spx_stream_log");
        let streamer = SpxStreamer::new(bus);

        let cache = Arc::new(crate::cache::Cache::new());
        let clock = crate::clock::Clock::new();
        let tmp = std::env::temp_dir().join(format!("streamer-test-{}", uuid::Uuid::new_v4()));
        let persistence = Arc::new(crate::persistence::PersistenceStore::new(&tmp).unwrap());
        let trading_data = Arc::new(crate::trading_data::TradingDataStore::open(":memory:").unwrap());
        let broker = crate::broker::client::IbClient::new("127.0.0.1", 4002);
        let core = StrategyCore::new("streamer-1", "SPX.CBOE", broker, cache, clock, persistence, trading_data);

        let quote = Quote {
            instrument_id: "SPX.CBOE".into(),
            bid: 4500.0,
            ask: 4501.0,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: chrono::Utc::now(),
        };
        streamer.on_quote(&core, &quote).await.unwrap();

        let price_msg = price_rx.recv().await.unwrap();
        assert_eq!(price_msg.payload["mid"], 4500.5);
        assert!(log_rx.recv().await.is_ok());
    }
}
