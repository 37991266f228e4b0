//! Session driver
//!
//! Runs one client session as a task. Client messages, broker publishes and
//! retry timer expiry are serialised through a single loop, so the forwarder
//! and session state are never touched concurrently.

use super::forwarder::{Action, PublishForwarder};
use super::state::{ConnectionStatus, PendingPublish, SessionState};
use super::timer::RetryTimer;
use crate::observability::metrics;
use crate::protocol::{Connack, Disconnect, Message, ReturnCode};
use crate::registry::RegistrationCache;
use crate::transport::ClientTransport;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Input to a client session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Decoded message from the client
    Client(Message),
    /// Broker publish routed to this client
    BrokerPublish(PendingPublish),
    StatusChanged(ConnectionStatus),
    /// Disconnect the client once its queue is drained
    DisconnectRequested,
    Shutdown,
}

/// Cloneable sender feeding a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: String,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Deliver an event; returns false if the session has ended
    pub async fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Owns one client session and applies the forwarder's actions
pub struct SessionDriver<T, C> {
    session: SessionState,
    forwarder: PublishForwarder,
    cache: C,
    transport: T,
    timer: RetryTimer,
    events: mpsc::Receiver<SessionEvent>,
}

impl<T, C> SessionDriver<T, C>
where
    T: ClientTransport,
    C: RegistrationCache + Send,
{
    pub fn new(session: SessionState, cache: C, transport: T) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = SessionHandle {
            client_id: session.client_id.clone(),
            events: tx,
        };
        let driver = Self {
            session,
            forwarder: PublishForwarder::new(),
            cache,
            transport,
            timer: RetryTimer::new(),
            events: rx,
        };
        (driver, handle)
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn forwarder(&self) -> &PublishForwarder {
        &self.forwarder
    }

    /// Process events until shutdown or session termination
    ///
    /// Returns the final session state.
    pub async fn run(mut self) -> SessionState {
        let span = crate::session_span!(client_id = %self.session.client_id);
        async move {
            metrics().session_started();
            debug!("Session started");

            // Anything queued before the task started
            let actions = self.forwarder.check_send(&mut self.session, &mut self.cache);
            let mut running = self.apply(actions).await;

            while running {
                let actions = tokio::select! {
                    event = self.events.recv() => match event {
                        Some(SessionEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event),
                    },
                    _ = self.timer.expired() => {
                        self.forwarder.handle_timeout(&mut self.session, &mut self.cache)
                    }
                };
                running = self.apply(actions).await;
            }

            metrics().session_terminated();
            info!(
                queued = self.session.queued(),
                "Session ended with status {:?}", self.session.status
            );
            self.session
        }
        .instrument(span)
        .await
    }

    fn handle_event(&mut self, event: SessionEvent) -> Vec<Action> {
        match event {
            SessionEvent::Client(message) => self.handle_client(message),
            SessionEvent::BrokerPublish(publish) => {
                metrics().publish_queued();
                self.session.enqueue(publish);
                self.forwarder.handle_other(&mut self.session, &mut self.cache)
            }
            SessionEvent::StatusChanged(status) => {
                self.session.status = status;
                self.forwarder.check_send(&mut self.session, &mut self.cache)
            }
            SessionEvent::DisconnectRequested => {
                self.session.pending_disconnect = true;
                self.forwarder.check_send(&mut self.session, &mut self.cache)
            }
            SessionEvent::Shutdown => Vec::new(),
        }
    }

    fn handle_client(&mut self, message: Message) -> Vec<Action> {
        match &message {
            Message::Disconnect(Disconnect {
                duration: Some(duration),
            }) => {
                info!("Client going to sleep for {}s", duration);
                self.session.status = ConnectionStatus::Asleep;
                let mut actions = vec![Action::Send(Message::Disconnect(Disconnect::default()))];
                actions.extend(self.forwarder.handle_other(&mut self.session, &mut self.cache));
                actions
            }
            Message::Disconnect(Disconnect { duration: None }) => {
                info!("Client disconnected");
                self.session.status = ConnectionStatus::Disconnected;
                vec![
                    Action::CancelTimer,
                    Action::Send(Message::Disconnect(Disconnect::default())),
                    Action::Terminate,
                ]
            }
            Message::Pingreq(_) if self.session.status == ConnectionStatus::Connected => {
                // Keep-alive from an awake client
                vec![Action::Send(Message::Pingresp)]
            }
            message if message.is_connect() => {
                info!("Client (re)connected");
                self.session.status = ConnectionStatus::Connected;
                let mut actions = vec![Action::Send(Message::Connack(Connack {
                    return_code: ReturnCode::Accepted,
                }))];
                actions.extend(self.forwarder.handle_other(&mut self.session, &mut self.cache));
                actions
            }
            message => {
                self.forwarder
                    .handle_message(&mut self.session, &mut self.cache, message)
            }
        }
    }

    /// Apply actions in order; returns false once the session must end
    async fn apply(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::Send(message) => match self.transport.send(&message).await {
                    Ok(()) => metrics().datagram_sent(),
                    Err(e) => warn!("Failed to send {} to client: {}", message.name(), e),
                },
                Action::ArmTimer(period) => self.timer.arm(period),
                Action::CancelTimer => self.timer.cancel(),
                Action::Terminate => {
                    self.timer.cancel();
                    self.session.status = ConnectionStatus::Disconnected;
                    return false;
                }
            }
        }
        true
    }
}
