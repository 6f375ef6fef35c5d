// =============================================================================
// Snapshot Cache (C5) — last-known-value lookups, read-shared, write-owned
// by the broker client.
// =============================================================================
//
// All reads are non-blocking point lookups against `RwLock`-guarded maps;
// there is no historical query surface here — that's what C3 and the bar
// ring buffers are for.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{Bar, BarType, Instrument, Order, Position, Quote};

#[derive(Default)]
pub struct Cache {
    quotes: RwLock<HashMap<String, Quote>>,
    bars: RwLock<HashMap<BarType, Bar>>,
    instruments: RwLock<HashMap<String, Instrument>>,
    open_orders: RwLock<HashMap<String, Order>>,
    closed_orders: RwLock<HashMap<String, Order>>,
    open_positions: RwLock<HashMap<String, Position>>,
    closed_positions: RwLock<Vec<Position>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_quote(&self, quote: Quote) {
        self.quotes.write().insert(quote.instrument_id.clone(), quote);
    }

    pub fn quote(&self, instrument_id: &str) -> Option<Quote> {
        self.quotes.read().get(instrument_id).cloned()
    }

    pub fn update_bar(&self, bar: Bar) {
        let key = BarType {
            instrument_id: bar.instrument_id.clone(),
            period: bar.period.clone(),
        };
        self.bars.write().insert(key, bar);
    }

    pub fn bar(&self, bar_type: &BarType) -> Option<Bar> {
        self.bars.read().get(bar_type).cloned()
    }

    pub fn add_instrument(&self, instrument: Instrument) {
        self.instruments.write().insert(instrument.instrument_id.clone(), instrument);
    }

    pub fn instrument(&self, instrument_id: &str) -> Option<Instrument> {
        self.instruments.read().get(instrument_id).cloned()
    }

    pub fn upsert_order(&self, order: Order) {
        if order.is_terminal() {
            self.open_orders.write().remove(&order.client_order_id);
            self.closed_orders.write().insert(order.client_order_id.clone(), order);
        } else {
            self.open_orders.write().insert(order.client_order_id.clone(), order);
        }
    }

    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.open_orders
            .read()
            .get(client_order_id)
            .cloned()
            .or_else(|| self.closed_orders.read().get(client_order_id).cloned())
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.open_orders.read().values().cloned().collect()
    }

    pub fn upsert_position(&self, position: Position) {
        if position.is_flat() {
            self.open_positions.write().remove(&position.instrument_id);
            self.closed_positions.write().push(position);
        } else {
            self.open_positions.write().insert(position.instrument_id.clone(), position);
        }
    }

    pub fn position(&self, instrument_id: &str) -> Option<Position> {
        self.open_positions.read().get(instrument_id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open_positions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;

    fn quote(id: &str, bid: f64, ask: f64) -> Quote {
        Quote {
            instrument_id: id.to_string(),
            bid,
            ask,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: chrono::Utc::now(),
        }
    }

    #[test]
    fn quote_lookup_returns_last_write() {
        let cache = Cache::new();
        cache.update_quote(quote("SPX.CBOE", 4500.0, 4501.0));
        cache.update_quote(quote("SPX.CBOE", 4502.0, 4503.0));
        assert_eq!(cache.quote("SPX.CBOE").unwrap().bid, 4502.0);
    }

    #[test]
    fn position_moves_from_open_to_closed_when_flat() {
        let cache = Cache::new();
        let open = Position {
            instrument_id: "SPX.CBOE".into(),
            side: PositionSide::Long,
            quantity: 1.0,
            avg_entry_price: 4500.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            opened_at: chrono::Utc::now(),
            closed_at: None,
        };
        cache.upsert_position(open);
        assert_eq!(cache.open_positions().len(), 1);

        let flat = Position {
            instrument_id: "SPX.CBOE".into(),
            side: PositionSide::Flat,
            quantity: 0.0,
            avg_entry_price: 4500.0,
            realized_pnl: 25.0,
            unrealized_pnl: 0.0,
            opened_at: chrono::Utc::now(),
            closed_at: Some(chrono::Utc::now()),
        };
        cache.upsert_position(flat);
        assert!(cache.open_positions().is_empty());
        assert!(cache.position("SPX.CBOE").is_none());
    }
}
