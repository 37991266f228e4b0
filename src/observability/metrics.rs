//! Thread-safe metrics collection system
//!
//! Provides atomic counters for publish forwarding, client datagrams, broker
//! traffic and session lifecycle. Abandoned publishes are only visible here and
//! in the logs, so every forwarder outcome is counted.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Publish forwarding
    publishes_queued: AtomicU64,
    publishes_delivered: AtomicU64,
    publishes_abandoned: AtomicU64,
    registrations_sent: AtomicU64,
    registrations_rejected: AtomicU64,
    retransmissions: AtomicU64,
    stale_acks_dropped: AtomicU64,
    registrations_discarded: AtomicU64,

    // Client side
    datagrams_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_dropped: AtomicU64,

    // Broker side
    broker_connected: AtomicBool,
    broker_publishes_received: AtomicU64,
    broker_reconnects: AtomicU64,

    // Sessions
    sessions_active: AtomicU64,
    sessions_terminated: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            publishes_queued: AtomicU64::new(0),
            publishes_delivered: AtomicU64::new(0),
            publishes_abandoned: AtomicU64::new(0),
            registrations_sent: AtomicU64::new(0),
            registrations_rejected: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            stale_acks_dropped: AtomicU64::new(0),
            registrations_discarded: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            broker_publishes_received: AtomicU64::new(0),
            broker_reconnects: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_terminated: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Publish forwarding metrics
    pub fn publish_queued(&self) {
        self.publishes_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_delivered(&self) {
        self.publishes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_abandoned(&self) {
        self.publishes_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration_sent(&self) {
        self.registrations_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration_rejected(&self) {
        self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_ack_dropped(&self) {
        self.stale_acks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration_discarded(&self) {
        self.registrations_discarded.fetch_add(1, Ordering::Relaxed);
    }

    // Client datagram metrics
    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Broker metrics
    pub fn broker_connection_established(&self) {
        self.broker_connected.store(true, Ordering::Relaxed);
    }

    pub fn broker_connection_lost(&self) {
        if self.broker_connected.swap(false, Ordering::Relaxed) {
            self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn broker_publish_received(&self) {
        self.broker_publishes_received
            .fetch_add(1, Ordering::Relaxed);
    }

    // Session lifecycle metrics
    pub fn session_started(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_terminated(&self) {
        self.sessions_terminated.fetch_add(1, Ordering::Relaxed);
        // Saturating: a session may be reported twice on racing shutdown paths
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.publishes_queued,
            &self.publishes_delivered,
            &self.publishes_abandoned,
            &self.registrations_sent,
            &self.registrations_rejected,
            &self.retransmissions,
            &self.stale_acks_dropped,
            &self.registrations_discarded,
            &self.datagrams_received,
            &self.datagrams_sent,
            &self.datagrams_dropped,
            &self.broker_publishes_received,
            &self.broker_reconnects,
            &self.sessions_active,
            &self.sessions_terminated,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            forwarding: ForwardingMetrics {
                publishes_queued: self.publishes_queued.load(Ordering::Relaxed),
                publishes_delivered: self.publishes_delivered.load(Ordering::Relaxed),
                publishes_abandoned: self.publishes_abandoned.load(Ordering::Relaxed),
                registrations_sent: self.registrations_sent.load(Ordering::Relaxed),
                registrations_rejected: self.registrations_rejected.load(Ordering::Relaxed),
                retransmissions: self.retransmissions.load(Ordering::Relaxed),
                stale_acks_dropped: self.stale_acks_dropped.load(Ordering::Relaxed),
                registrations_discarded: self.registrations_discarded.load(Ordering::Relaxed),
            },
            clients: ClientMetrics {
                datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
                datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
                datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
                sessions_active: self.sessions_active.load(Ordering::Relaxed),
                sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
            },
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                publishes_received: self.broker_publishes_received.load(Ordering::Relaxed),
                reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub forwarding: ForwardingMetrics,
    pub clients: ClientMetrics,
    pub broker: BrokerMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ForwardingMetrics {
    pub publishes_queued: u64,
    pub publishes_delivered: u64,
    pub publishes_abandoned: u64,
    pub registrations_sent: u64,
    pub registrations_rejected: u64,
    pub retransmissions: u64,
    pub stale_acks_dropped: u64,
    pub registrations_discarded: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientMetrics {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub sessions_active: u64,
    pub sessions_terminated: u64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub publishes_received: u64,
    pub reconnects: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_forwarding_metrics() {
        let collector = MetricsCollector::new();

        collector.publish_queued();
        collector.publish_queued();
        collector.publish_delivered();
        collector.publish_abandoned();
        collector.retransmission();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.forwarding.publishes_queued, 2);
        assert_eq!(metrics.forwarding.publishes_delivered, 1);
        assert_eq!(metrics.forwarding.publishes_abandoned, 1);
        assert_eq!(metrics.forwarding.retransmissions, 1);
    }

    #[test]
    fn test_broker_reconnect_counted_once_per_loss() {
        let collector = MetricsCollector::new();

        collector.broker_connection_established();
        collector.broker_connection_lost();
        collector.broker_connection_lost();

        let metrics = collector.get_metrics();
        assert!(!metrics.broker.connected);
        assert_eq!(metrics.broker.reconnects, 1);
    }

    #[test]
    fn test_session_counter_never_underflows() {
        let collector = MetricsCollector::new();

        collector.session_started();
        collector.session_terminated();
        collector.session_terminated();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.clients.sessions_active, 0);
        assert_eq!(metrics.clients.sessions_terminated, 2);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.datagram_received();
        collector.stale_ack_dropped();
        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.clients.datagrams_received, 0);
        assert_eq!(metrics.forwarding.stale_acks_dropped, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let collector = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        collector.datagram_sent();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collector.get_metrics().clients.datagrams_sent, 1000);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let collector = MetricsCollector::new();
        collector.registration_sent();

        let json = serde_json::to_value(collector.get_metrics()).unwrap();
        assert_eq!(json["forwarding"]["registrations_sent"], 1);
        assert!(json["broker"]["connected"].is_boolean());
    }
}
