// =============================================================================
// Broker client abstraction (C4) — one concrete implementation against
// Interactive Brokers' gateway, reachable behind a trait so strategies and
// tests never depend on the concrete transport.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::broker::events::BrokerEvent;
use crate::types::{AssetClass, Instrument, Order, Quote};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const MIN_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_secs(20);

/// Capability set every strategy programs against. Implemented once per
/// concrete broker; strategies never see transport details.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent>;

    async fn subscribe_quotes(&self, instrument_id: &str);
    async fn unsubscribe_quotes(&self, instrument_id: &str);
    async fn subscribe_bars(&self, bar_type: &str);
    async fn unsubscribe_bars(&self, bar_type: &str);

    async fn request_instrument(&self, id: &str);
    async fn request_instruments(&self, venue: &str, selector: &str);

    async fn submit_order(&self, order: Order) -> anyhow::Result<()>;
    async fn cancel_order(&self, client_order_id: &str) -> anyhow::Result<()>;
    async fn cancel_all_orders(&self, instrument_id: &str) -> anyhow::Result<()>;

    /// Requests a multi-leg virtual instrument. Success arrives as an
    /// `InstrumentAdded` event on the shared event stream.
    async fn create_spread(&self, legs: &[(String, i32)]) -> anyhow::Result<()>;

    fn last_quote(&self, instrument_id: &str) -> Option<Quote>;
    fn instrument(&self, instrument_id: &str) -> Option<Instrument>;
}

/// Index-tick quirk policy, absorbed at the client boundary so strategies
/// never see it: LAST-priced index ticks are synthesized into a symmetric
/// bid/ask quote with size forced to 1; natural index bid/ask ticks and
/// unsolicited zero-size ticks never reach the cache.
pub fn normalize_index_tick(
    asset_class: AssetClass,
    instrument_id: &str,
    last: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    bid_size: f64,
    ask_size: f64,
    ts: chrono::DateTime<chrono::Utc>,
) -> Option<Quote> {
    if asset_class == AssetClass::Index {
        let last = last?;
        if last <= 0.0 {
            return None;
        }
        return Some(Quote {
            instrument_id: instrument_id.to_string(),
            bid: last,
            ask: last,
            bid_size: 1.0,
            ask_size: 1.0,
            ts,
        });
    }
    let (bid, ask) = (bid?, ask?);
    if bid_size <= 0.0 && ask_size <= 0.0 {
        return None;
    }
    Some(Quote {
        instrument_id: instrument_id.to_string(),
        bid,
        ask,
        bid_size,
        ask_size,
        ts,
    })
}

pub struct IbClient {
    host: String,
    port: u16,
    stabilization_delay: Duration,
    events_tx: broadcast::Sender<BrokerEvent>,
    quote_subs: RwLock<HashSet<String>>,
    bar_subs: RwLock<HashSet<String>>,
    instruments: RwLock<HashMap<String, Instrument>>,
    quotes: RwLock<HashMap<String, Quote>>,
    order_seq: AtomicU64,
}

impl IbClient {
    pub fn new(host: impl Into<String>, port: u16) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            host: host.into(),
            port,
            stabilization_delay: DEFAULT_STABILIZATION_DELAY,
            events_tx,
            quote_subs: RwLock::new(HashSet::new()),
            bar_subs: RwLock::new(HashSet::new()),
            instruments: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
        })
    }

    /// Blocks until the gateway accepts a TCP connection, then waits the
    /// stabilization delay before the client is considered ready. Called
    /// once at startup and again after every disconnect.
    #[instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) {
        let mut backoff = MIN_RECONNECT_BACKOFF;
        loop {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(_stream) => {
                    info!(host = %self.host, port = self.port, "gateway TCP connection established");
                    tokio::time::sleep(self.stabilization_delay).await;
                    let _ = self.events_tx.send(BrokerEvent::Reconnected);
                    info!("gateway connection stabilized");
                    return;
                }
                Err(e) => {
                    warn!(host = %self.host, port = self.port, error = %e, "gateway connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60)).max(MIN_RECONNECT_BACKOFF);
                }
            }
        }
    }

    /// Feeds a raw tick through the index-tick quirk policy and, if it
    /// survives, updates the snapshot cache and publishes a `QuoteTick`.
    pub fn ingest_tick(
        &self,
        instrument_id: &str,
        last: Option<f64>,
        bid: Option<f64>,
        ask: Option<f64>,
        bid_size: f64,
        ask_size: f64,
    ) {
        let asset_class = self
            .instruments
            .read()
            .get(instrument_id)
            .map(|i| i.asset_class)
            .unwrap_or(AssetClass::Option);
        let Some(quote) = normalize_index_tick(
            asset_class,
            instrument_id,
            last,
            bid,
            ask,
            bid_size,
            ask_size,
            chrono::Utc::now(),
        ) else {
            return;
        };
        self.quotes.write().insert(instrument_id.to_string(), quote.clone());
        let _ = self.events_tx.send(BrokerEvent::QuoteTick { quote });
    }

    fn next_order_seq(&self) -> u64 {
        self.order_seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerClient for IbClient {
    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    async fn subscribe_quotes(&self, instrument_id: &str) {
        if self.quote_subs.write().insert(instrument_id.to_string()) {
            info!(instrument_id, "subscribed to quotes");
        }
    }

    async fn unsubscribe_quotes(&self, instrument_id: &str) {
        if self.quote_subs.write().remove(instrument_id) {
            info!(instrument_id, "unsubscribed from quotes");
        }
    }

    async fn subscribe_bars(&self, bar_type: &str) {
        if self.bar_subs.write().insert(bar_type.to_string()) {
            info!(bar_type, "subscribed to bars");
        }
    }

    async fn unsubscribe_bars(&self, bar_type: &str) {
        self.bar_subs.write().remove(bar_type);
    }

    async fn request_instrument(&self, id: &str) {
        info!(instrument_id = id, "requesting instrument");
    }

    async fn request_instruments(&self, venue: &str, selector: &str) {
        info!(venue, selector, "requesting instrument chain");
    }

    async fn submit_order(&self, mut order: Order) -> anyhow::Result<()> {
        let seq = self.next_order_seq();
        if order.client_order_id.is_empty() {
            order.client_order_id = format!("ord-{seq}");
        }
        let _ = self.events_tx.send(BrokerEvent::OrderSubmitted { order });
        Ok(())
    }

    async fn cancel_order(&self, client_order_id: &str) -> anyhow::Result<()> {
        info!(client_order_id, "cancel order requested");
        Ok(())
    }

    async fn cancel_all_orders(&self, instrument_id: &str) -> anyhow::Result<()> {
        info!(instrument_id, "cancel all orders requested");
        Ok(())
    }

    async fn create_spread(&self, legs: &[(String, i32)]) -> anyhow::Result<()> {
        info!(legs = ?legs, "requesting spread instrument");
        Ok(())
    }

    fn last_quote(&self, instrument_id: &str) -> Option<Quote> {
        self.quotes.read().get(instrument_id).cloned()
    }

    fn instrument(&self, instrument_id: &str) -> Option<Instrument> {
        self.instruments.read().get(instrument_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_last_tick_synthesizes_symmetric_quote() {
        let ts = chrono::Utc::now();
        let quote = normalize_index_tick(AssetClass::Index, "SPX.CBOE", Some(4500.0), None, None, 0.0, 0.0, ts).unwrap();
        assert_eq!(quote.bid, 4500.0);
        assert_eq!(quote.ask, 4500.0);
        assert_eq!(quote.bid_size, 1.0);
        assert_eq!(quote.ask_size, 1.0);
    }

    #[test]
    fn index_natural_bid_ask_tick_is_suppressed() {
        let ts = chrono::Utc::now();
        // No LAST price present, only bid/ask — must be suppressed for indices.
        let quote = normalize_index_tick(AssetClass::Index, "SPX.CBOE", None, Some(4499.0), Some(4501.0), 1.0, 1.0, ts);
        assert!(quote.is_none());
    }

    #[test]
    fn option_zero_size_tick_never_reaches_cache() {
        let ts = chrono::Utc::now();
        let quote = normalize_index_tick(AssetClass::Option, "SPXW 4500C", None, Some(10.0), Some(10.5), 0.0, 0.0, ts);
        assert!(quote.is_none());
    }

    #[test]
    fn option_valid_tick_passes_through() {
        let ts = chrono::Utc::now();
        let quote = normalize_index_tick(AssetClass::Option, "SPXW 4500C", None, Some(10.0), Some(10.5), 5.0, 3.0, ts).unwrap();
        assert_eq!(quote.bid, 10.0);
        assert_eq!(quote.ask, 10.5);
    }

    #[tokio::test]
    async fn subscribe_quotes_is_idempotent() {
        let client = IbClient::new("127.0.0.1", 4002);
        client.subscribe_quotes("SPX.CBOE").await;
        client.subscribe_quotes("SPX.CBOE").await;
        assert_eq!(client.quote_subs.read().len(), 1);
    }
}
