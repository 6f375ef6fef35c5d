// =============================================================================
// Broker Data/Exec Client (C4)
// =============================================================================

pub mod client;
pub mod events;

pub use client::{BrokerClient, IbClient};
pub use events::BrokerEvent;
