//! Gateway runtime
//!
//! Binds the client-facing UDP socket, starts one session per configured
//! client, and routes traffic: datagrams by source address, broker publishes
//! by topic filter. Sessions are static; a client whose session ended gets a
//! fresh one when it sends CONNECT again.

use crate::config::{ClientConfig, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;
use crate::protocol::{decode, QoS};
use crate::registry::{PredefinedTopics, TopicRegistry};
use crate::session::{
    PendingPublish, RetryConfig, SessionDriver, SessionEvent, SessionHandle, SessionState,
};
use crate::transport::{topic_matches, BrokerBridge, UdpClientTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Largest MQTT-SN message (three-byte length header)
const MAX_DATAGRAM: usize = 65_535;
const BROKER_CHANNEL_CAPACITY: usize = 1024;

struct ClientRoute {
    config: ClientConfig,
    max_qos: QoS,
    handle: SessionHandle,
    task: JoinHandle<SessionState>,
}

/// Static client sessions indexed by address
pub struct ClientSessions {
    socket: Arc<UdpSocket>,
    predefined: Arc<PredefinedTopics>,
    retry: RetryConfig,
    by_addr: HashMap<SocketAddr, ClientRoute>,
}

impl ClientSessions {
    pub fn new(socket: Arc<UdpSocket>, predefined: PredefinedTopics, retry: RetryConfig) -> Self {
        Self {
            socket,
            predefined: Arc::new(predefined),
            retry,
            by_addr: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Start (or restart) the session of a configured client
    pub fn start(&mut self, config: ClientConfig) -> GatewayResult<()> {
        let addr = config.socket_addr()?;
        let session = SessionState::new(config.client_id.clone(), self.retry);
        let cache = TopicRegistry::new(self.predefined.clone());
        let transport = UdpClientTransport::new(self.socket.clone(), addr);
        let (driver, handle) = SessionDriver::new(session, cache, transport);

        info!(client_id = %config.client_id, %addr, "Starting client session");
        let route = ClientRoute {
            max_qos: config.max_qos(),
            config,
            handle,
            task: tokio::spawn(driver.run()),
        };
        if let Some(previous) = self.by_addr.insert(addr, route) {
            previous.task.abort();
        }
        Ok(())
    }

    /// Route one datagram from a client
    pub async fn route_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        metrics().datagram_received();

        let message = match decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                warn!(%from, "Dropping undecodable datagram: {}", e);
                metrics().datagram_dropped();
                return;
            }
        };

        let Some(route) = self.by_addr.get(&from) else {
            debug!(%from, "Dropping {} from unknown client", message.name());
            metrics().datagram_dropped();
            return;
        };

        if route.handle.is_closed() {
            if !message.is_connect() {
                debug!(%from, "Dropping {} for ended session", message.name());
                metrics().datagram_dropped();
                return;
            }
            let config = route.config.clone();
            if let Err(e) = self.start(config) {
                error!(%from, "Failed to restart session: {}", e);
                return;
            }
        }

        if let Some(route) = self.by_addr.get(&from) {
            trace!(%from, "Routing {} to {}", message.name(), route.handle.client_id());
            if !route.handle.send(SessionEvent::Client(message)).await {
                metrics().datagram_dropped();
            }
        }
    }

    /// Queue a broker publish on every session subscribed to its topic
    pub async fn route_publish(&self, publish: PendingPublish) {
        for route in self.by_addr.values() {
            if !route
                .config
                .topics
                .iter()
                .any(|filter| topic_matches(filter, &publish.topic))
            {
                continue;
            }

            let mut delivery = publish.clone();
            delivery.qos = delivery.qos.min(route.max_qos);
            if !route.handle.send(SessionEvent::BrokerPublish(delivery)).await {
                trace!(
                    client_id = %route.handle.client_id(),
                    topic = %publish.topic,
                    "Session ended, publish not queued"
                );
            }
        }
    }

    /// Stop every session and wait for them to finish
    pub async fn shutdown(self) {
        for (addr, route) in self.by_addr {
            route.handle.send(SessionEvent::Shutdown).await;
            match route.task.await {
                Ok(state) => debug!(%addr, "Session {} stopped", state.client_id),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(%addr, "Session task failed: {}", e),
            }
        }
    }
}

/// The MQTT-SN gateway
pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bind the client socket, connect to the broker and run until shutdown
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> GatewayResult<()> {
        let address = self.config.bind_addr()?;
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|source| GatewayError::Bind { address, source })?;
        info!("Listening for MQTT-SN clients on {}", socket.local_addr()?);

        let filters = self.broker_filters();
        let bridge = BrokerBridge::new(&self.config.gateway.gateway_id, &self.config.broker, filters)?;
        let (publish_tx, publish_rx) = mpsc::channel(BROKER_CHANNEL_CAPACITY);
        let bridge_task = tokio::spawn(bridge.run(publish_tx, shutdown.clone()));

        let result = self
            .serve(Arc::new(socket), publish_rx, shutdown)
            .await;

        let bridge_result = bridge_task.await;
        result?;
        bridge_result
            .map_err(|e| GatewayError::internal_error(format!("Broker bridge task failed: {e}")))
    }

    /// Serve clients on an already bound socket, taking broker publishes
    /// from a channel
    pub async fn serve(
        &self,
        socket: Arc<UdpSocket>,
        mut broker_publishes: mpsc::Receiver<PendingPublish>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        let mut sessions = ClientSessions::new(
            socket.clone(),
            self.config.predefined(),
            self.config.retry_config(),
        );
        for client in &self.config.clients {
            sessions.start(client.clone())?;
        }
        info!("Gateway {} serving {} clients", self.config.gateway.gateway_id, sessions.len());

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut broker_open = true;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping sessions");
                        break;
                    }
                }

                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => sessions.route_datagram(from, &buf[..len]).await,
                    Err(e) => warn!("UDP receive failed: {}", e),
                },

                publish = broker_publishes.recv(), if broker_open => match publish {
                    Some(publish) => sessions.route_publish(publish).await,
                    None => {
                        warn!("Broker bridge stopped delivering publishes");
                        broker_open = false;
                    }
                },
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    fn broker_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .config
            .clients
            .iter()
            .flat_map(|client| client.topics.iter().cloned())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }
}
