//! Per-client session state shared by the forwarder and the session driver

use crate::protocol::QoS;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;

/// Connectivity of an MQTT-SN client as seen by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Client announced a sleep period and polls with PINGREQ
    Asleep,
    Disconnected,
}

/// Retransmission settings, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Time to wait for an acknowledgment before retransmitting
    pub retry_period: Duration,
    /// Number of transmissions before a publish is abandoned
    pub retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_period: Duration::from_secs(10),
            retry_count: 3,
        }
    }
}

/// A broker publish queued for delivery to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Duplicate flag as received from the broker
    pub dup: bool,
}

impl PendingPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

/// State of one client session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub client_id: String,
    pub status: ConnectionStatus,
    pub retry: RetryConfig,
    /// Broker publishes awaiting delivery, oldest first
    pub broker_pubs: VecDeque<PendingPublish>,
    /// Disconnect the client once all queued publishes are delivered
    pub pending_disconnect: bool,
    next_msg_id: u16,
}

impl SessionState {
    pub fn new(client_id: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            client_id: client_id.into(),
            status: ConnectionStatus::Connected,
            retry,
            broker_pubs: VecDeque::new(),
            pending_disconnect: false,
            next_msg_id: 0,
        }
    }

    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn enqueue(&mut self, publish: PendingPublish) {
        self.broker_pubs.push_back(publish);
    }

    pub fn pop_front(&mut self) -> Option<PendingPublish> {
        self.broker_pubs.pop_front()
    }

    pub fn has_queued(&self) -> bool {
        !self.broker_pubs.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.broker_pubs.len()
    }

    /// Allocate the next message identifier (pre-increment, wraps at 16 bits)
    pub fn alloc_msg_id(&mut self) -> u16 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }
}
