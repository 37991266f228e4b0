//! Bridge to the MQTT broker
//!
//! Holds one MQTT v5 connection for the whole gateway. Every client's topic
//! filters are subscribed on it, and each broker PUBLISH is handed to the
//! gateway as a [`PendingPublish`] for routing to the matching sessions.

use crate::config::BrokerSection;
use crate::observability::metrics;
use crate::protocol::QoS;
use crate::session::PendingPublish;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Broker topic is not valid UTF-8")]
    InvalidTopic,
    #[error("Broker request failed: {0}")]
    Client(#[from] rumqttc::v5::ClientError),
}

/// Delay schedule between reconnection attempts
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delays in milliseconds for the first attempts
    pub pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay);
        Duration::from_millis(millis)
    }
}

/// Build MQTT options from the broker section
pub fn configure_mqtt_options(
    gateway_id: &str,
    broker: &BrokerSection,
) -> Result<MqttOptions, BrokerError> {
    let url = Url::parse(&broker.broker_url)
        .map_err(|_| BrokerError::InvalidBrokerUrl(broker.broker_url.clone()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(BrokerError::InvalidBrokerUrl(broker.broker_url.clone())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidBrokerUrl(broker.broker_url.clone()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(format!("mqttsn-gw-{gateway_id}"), host, port);
    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials come from the environment, never from the file
    if let Some(username_env) = &broker.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = broker
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

/// MQTT topic filter matching with `+` and `#` wildcards
///
/// ```
/// use mqttsn_gateway::transport::topic_matches;
///
/// assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
/// assert!(topic_matches("sensors/#", "sensors"));
/// assert!(!topic_matches("sensors/+", "sensors/kitchen/temp"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level never match $-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Convert a broker PUBLISH into a queued publish
pub fn pending_from_publish(publish: &Publish) -> Result<PendingPublish, BrokerError> {
    let topic = std::str::from_utf8(&publish.topic).map_err(|_| BrokerError::InvalidTopic)?;
    Ok(PendingPublish::new(topic, publish.payload.clone(), QoS::from(publish.qos))
        .with_retain(publish.retain)
        .with_dup(publish.dup))
}

/// What the bridge does with an event loop event
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerRoute {
    Connected,
    Publish(PendingPublish),
    Disconnected,
    Ignored,
}

/// Route a broker event (pure routing decision)
pub fn route_event(event: &Event) -> BrokerRoute {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => BrokerRoute::Connected,
        Event::Incoming(Packet::Publish(publish)) => match pending_from_publish(publish) {
            Ok(pending) => BrokerRoute::Publish(pending),
            Err(e) => {
                warn!("Dropping broker publish: {}", e);
                BrokerRoute::Ignored
            }
        },
        Event::Incoming(Packet::Disconnect(_)) => BrokerRoute::Disconnected,
        _ => BrokerRoute::Ignored,
    }
}

/// Connection to the broker shared by all client sessions
pub struct BrokerBridge {
    client: AsyncClient,
    event_loop: EventLoop,
    filters: Vec<String>,
    backoff: ReconnectBackoff,
    broker_url: String,
}

impl BrokerBridge {
    pub fn new(
        gateway_id: &str,
        broker: &BrokerSection,
        filters: Vec<String>,
    ) -> Result<Self, BrokerError> {
        let options = configure_mqtt_options(gateway_id, broker)?;
        let (client, event_loop) = AsyncClient::new(options, filters.len() + 10);
        Ok(Self {
            client,
            event_loop,
            filters,
            backoff: ReconnectBackoff::default(),
            broker_url: broker.broker_url.clone(),
        })
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll the broker connection until shutdown, forwarding publishes
    pub async fn run(
        mut self,
        publishes: mpsc::Sender<PendingPublish>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let span = crate::broker_span!(url = %self.broker_url);
        async move {
            info!("Starting broker bridge with {} topic filters", self.filters.len());
            let mut attempts = 0u32;

            loop {
                if *shutdown.borrow() {
                    info!("Shutdown signal received, closing broker connection");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("Broker disconnect request failed: {}", e);
                    }
                    break;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!("Shutdown channel closed");
                            break;
                        }
                    }

                    event = self.event_loop.poll() => match event {
                        Ok(event) => match route_event(&event) {
                            BrokerRoute::Connected => {
                                attempts = 0;
                                metrics().broker_connection_established();
                                info!("Connected to broker");
                                subscribe_all(self.client.clone(), self.filters.clone()).await;
                            }
                            BrokerRoute::Publish(pending) => {
                                metrics().broker_publish_received();
                                debug!(topic = %pending.topic, "Broker publish received");
                                if publishes.send(pending).await.is_err() {
                                    info!("Gateway stopped accepting publishes");
                                    break;
                                }
                            }
                            BrokerRoute::Disconnected => {
                                metrics().broker_connection_lost();
                                warn!("Broker closed the connection");
                            }
                            BrokerRoute::Ignored => {}
                        },
                        Err(e) => {
                            metrics().broker_connection_lost();
                            attempts = attempts.saturating_add(1);
                            let delay = self.backoff.delay(attempts);
                            error!("Broker connection error (attempt {}): {}; retrying in {:?}", attempts, e, delay);
                            // A shutdown cuts the backoff short
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
            }

            info!("Broker bridge stopped");
        }
        .instrument(span)
        .await
    }
}

/// Subscribe to every filter at the highest level; each client caps it on delivery
async fn subscribe_all(client: AsyncClient, filters: Vec<String>) {
    for filter in filters {
        match client
            .subscribe(filter.clone(), rumqttc::v5::mqttbytes::QoS::ExactlyOnce)
            .await
        {
            Ok(()) => debug!("Subscribed to {}", filter),
            Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
        }
    }
}
