// =============================================================================
// Broker event stream — everything C4 fires is modeled here. Strategies and
// C3 subscribe to a cloned `broadcast::Receiver<BrokerEvent>`.
// =============================================================================

use serde::Serialize;

use crate::types::{Instrument, Order, Quote};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum BrokerEvent {
    InstrumentAdded { instrument: Instrument },
    QuoteTick { quote: Quote },
    Bar { bar: crate::types::Bar },
    OrderSubmitted { order: Order },
    OrderAccepted { order: Order },
    OrderRejected { order: Order, reason: String },
    OrderPartiallyFilled { order: Order, fill_qty: f64, fill_price: f64 },
    OrderFilled { order: Order, fill_qty: f64, fill_price: f64 },
    OrderCanceled { order: Order },
    OrderExpired { order: Order },
    Disconnected { reason: String },
    Reconnected,
}

impl BrokerEvent {
    pub fn client_order_id(&self) -> Option<&str> {
        match self {
            BrokerEvent::OrderSubmitted { order }
            | BrokerEvent::OrderAccepted { order }
            | BrokerEvent::OrderRejected { order, .. }
            | BrokerEvent::OrderPartiallyFilled { order, .. }
            | BrokerEvent::OrderFilled { order, .. }
            | BrokerEvent::OrderCanceled { order }
            | BrokerEvent::OrderExpired { order } => Some(&order.client_order_id),
            _ => None,
        }
    }
}
