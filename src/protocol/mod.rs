//! MQTT-SN protocol messages and their wire format
//!
//! This module implements the subset of MQTT-SN v1.2 the gateway exchanges with
//! its constrained clients when forwarding broker publishes.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, CodecError};
pub use messages::*;
