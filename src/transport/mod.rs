//! Transports between the gateway and the outside world
//!
//! Clients are reached over UDP datagrams carrying MQTT-SN; the broker is
//! reached through an MQTT v5 connection.

pub mod broker;
pub mod udp;

pub use broker::{topic_matches, BrokerBridge, BrokerError};
pub use udp::{TransportError, UdpClientTransport};

use crate::protocol::Message;

/// Outbound path from a client session to its MQTT-SN client
///
/// This trait abstracts the datagram socket so sessions can be driven with a
/// recording mock in tests.
#[async_trait::async_trait]
pub trait ClientTransport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode and deliver one message to the client
    async fn send(&self, message: &Message) -> Result<(), Self::Error>;
}
