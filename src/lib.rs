//! MQTT-SN Gateway - Rust Implementation
//!
//! A gateway bridging constrained MQTT-SN clients on UDP to a full MQTT
//! broker.
//!
//! # Overview
//!
//! The heart of the crate is the per-client publish forwarder, which delivers
//! broker publishes to one client strictly in order, registering topic ids,
//! retrying unacknowledged messages and respecting the client's sleep cycle.
//! Around it the crate provides:
//! - MQTT-SN message types and their binary codec
//! - Per-client topic registration with shared pre-defined topics
//! - Session tasks serialising client, broker and timer events
//! - UDP client transport and an MQTT v5 broker bridge
//!
//! # Quick Start
//!
//! ```rust
//! use mqttsn_gateway::protocol::{Message, QoS};
//! use mqttsn_gateway::registry::TopicRegistry;
//! use mqttsn_gateway::session::{
//!     Action, PendingPublish, PublishForwarder, RetryConfig, SessionState,
//! };
//!
//! let mut session = SessionState::new("sensor-7", RetryConfig::default());
//! let mut registry = TopicRegistry::default();
//! let mut forwarder = PublishForwarder::new();
//!
//! session.enqueue(PendingPublish::new("actuators/valve", "open", QoS::AtLeastOnce));
//! let actions = forwarder.check_send(&mut session, &mut registry);
//!
//! // An unseen topic is registered with the client before it is published
//! assert!(actions
//!     .iter()
//!     .any(|action| matches!(action, Action::Send(Message::Register(_)))));
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use registry::{RegistrationCache, TopicMapping, TopicRegistry};
pub use session::{PublishForwarder, SessionDriver, SessionState};
