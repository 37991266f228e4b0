//! Publish forwarder
//!
//! Drives broker publishes queued for one client through topic registration,
//! transmission, retry and acknowledgment, one publish at a time and strictly
//! in queue order.
//!
//! The forwarder performs no I/O. Every entry point mutates the session state
//! and the registration cache and returns the ordered side effects the caller
//! must apply: messages to send, retry timer (re)arms and cancellations, and a
//! request to terminate the session.
//!
//! Exactly-once deliveries complete through PUBREC, PUBREL and PUBCOMP only. An
//! accepted PUBACK for an exactly-once publish is ignored, which assumes a
//! client never acknowledges one message both ways.

use super::state::{ConnectionStatus, PendingPublish, SessionState};
use crate::observability::metrics;
use crate::protocol::{
    translate_qos_for_client, Disconnect, Flags, Message, Pingreq, Puback, Pubcomp, Publish,
    Pubrec, Pubrel, QoS, Regack, Register, ReturnCode, TopicIdType,
};
use crate::registry::{RegistrationCache, TopicMapping};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Side effect requested by the forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to the client
    Send(Message),
    /// Arm the retry timer, replacing any previous deadline
    ArmTimer(Duration),
    /// Cancel the retry timer
    CancelTimer,
    /// The session is finished and should be torn down
    Terminate,
}

/// Handshake stage of the publish in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// REGISTER sent, waiting for REGACK
    AwaitingRegistration,
    /// PUBLISH sent, waiting for PUBACK or PUBREC
    AwaitingAck,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingCompletion,
}

/// The publish currently being delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub publish: PendingPublish,
    pub mapping: TopicMapping,
    /// Message id of the last REGISTER or PUBLISH sent
    pub msg_id: u16,
    /// Transmissions in the current phase
    pub attempt: u32,
    /// Accepted registrations for this publish
    pub register_count: u32,
    /// Topic id confirmed by REGACK
    pub registered: bool,
    pub phase: Phase,
}

impl InFlight {
    fn needs_registration(&self) -> bool {
        self.mapping.new_insertion && !self.mapping.predefined && !self.registered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForwarderState {
    #[default]
    Idle,
    InFlight(InFlight),
}

/// Per-client publish forwarding state machine
#[derive(Debug, Default)]
pub struct PublishForwarder {
    state: ForwarderState,
    ping_pending: bool,
    draining: bool,
    actions: Vec<Action>,
}

impl PublishForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ForwarderState {
        &self.state
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        match &self.state {
            ForwarderState::InFlight(flight) => Some(flight),
            ForwarderState::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ForwarderState::Idle)
    }

    /// A sleeping client polled and has not been answered yet
    pub fn ping_pending(&self) -> bool {
        self.ping_pending
    }

    /// Re-evaluate after the session state changed
    pub fn check_send<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
    ) -> Vec<Action> {
        self.evaluate(session, cache);
        self.take_actions()
    }

    /// Retry timer expired
    pub fn handle_timeout<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
    ) -> Vec<Action> {
        let retry = session.retry;
        match &mut self.state {
            ForwarderState::Idle => self.evaluate(session, cache),
            ForwarderState::InFlight(flight) if flight.phase == Phase::AwaitingCompletion => {
                if flight.attempt >= retry.retry_count {
                    self.abandon(session, cache, "no PUBCOMP within retry limit");
                } else {
                    flight.attempt += 1;
                    let msg_id = flight.msg_id;
                    debug!(client_id = %session.client_id, msg_id, "Retransmitting PUBREL");
                    metrics().retransmission();
                    self.send_pubrel(msg_id, retry.retry_period);
                }
            }
            ForwarderState::InFlight(_) => self.do_send(session, cache),
        }
        self.take_actions()
    }

    pub fn handle_regack<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        regack: &Regack,
    ) -> Vec<Action> {
        let matched = matches!(
            &self.state,
            ForwarderState::InFlight(flight)
                if flight.mapping.topic_id == regack.topic_id && flight.msg_id == regack.msg_id
        );
        if !matched {
            self.drop_stale("REGACK", regack.msg_id);
            return self.take_actions();
        }

        self.actions.push(Action::CancelTimer);
        if regack.return_code != ReturnCode::Accepted {
            metrics().registration_rejected();
            warn!(
                client_id = %session.client_id,
                topic_id = regack.topic_id,
                "Client rejected topic registration: {:?}",
                regack.return_code
            );
            self.abandon_registration(session, cache, "registration rejected");
            return self.take_actions();
        }

        if let ForwarderState::InFlight(flight) = &mut self.state {
            flight.attempt = 0;
            flight.registered = true;
            flight.register_count += 1;
            flight.msg_id = session.alloc_msg_id();
        }
        self.do_send(session, cache);
        self.take_actions()
    }

    pub fn handle_puback<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        puback: &Puback,
    ) -> Vec<Action> {
        // Stale registrations are dropped even when the ack is not ours
        if puback.return_code == ReturnCode::InvalidTopicId {
            debug!(
                client_id = %session.client_id,
                topic_id = puback.topic_id,
                "Client reported invalid topic id, discarding registration"
            );
            cache.discard(puback.topic_id);
            metrics().registration_discarded();
        }

        let qos = match &self.state {
            ForwarderState::InFlight(flight)
                if flight.mapping.topic_id == puback.topic_id && flight.msg_id == puback.msg_id =>
            {
                flight.publish.qos
            }
            _ => {
                self.drop_stale("PUBACK", puback.msg_id);
                return self.take_actions();
            }
        };

        if puback.return_code == ReturnCode::Accepted && qos == QoS::ExactlyOnce {
            trace!(msg_id = puback.msg_id, "PUBREC expected instead of PUBACK");
            return self.take_actions();
        }

        self.actions.push(Action::CancelTimer);
        match puback.return_code {
            ReturnCode::InvalidTopicId => self.restart(session, cache),
            ReturnCode::Accepted => self.complete(session, cache),
            code => {
                warn!(
                    client_id = %session.client_id,
                    msg_id = puback.msg_id,
                    "Client rejected publish: {:?}",
                    code
                );
                self.abandon(session, cache, "publish rejected");
            }
        }
        self.take_actions()
    }

    pub fn handle_pubrec(&mut self, session: &SessionState, pubrec: &Pubrec) -> Vec<Action> {
        let retry_period = session.retry.retry_period;
        match &mut self.state {
            ForwarderState::InFlight(flight) if flight.msg_id == pubrec.msg_id => {
                flight.phase = Phase::AwaitingCompletion;
                flight.attempt = 0;
                self.actions.push(Action::CancelTimer);
                self.send_pubrel(pubrec.msg_id, retry_period);
            }
            _ => self.drop_stale("PUBREC", pubrec.msg_id),
        }
        self.take_actions()
    }

    pub fn handle_pubcomp<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        pubcomp: &Pubcomp,
    ) -> Vec<Action> {
        match &self.state {
            ForwarderState::InFlight(flight) if flight.msg_id == pubcomp.msg_id => {
                self.actions.push(Action::CancelTimer);
                self.complete(session, cache);
            }
            _ => self.drop_stale("PUBCOMP", pubcomp.msg_id),
        }
        self.take_actions()
    }

    /// Poll from a sleeping client
    pub fn handle_pingreq<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        pingreq: &Pingreq,
    ) -> Vec<Action> {
        if session.status != ConnectionStatus::Asleep {
            return self.take_actions();
        }
        if pingreq.client_id.as_deref().unwrap_or_default() != session.client_id {
            debug!(
                client_id = %session.client_id,
                "Ignoring PINGREQ for {:?}",
                pingreq.client_id
            );
            return self.take_actions();
        }

        self.ping_pending = true;
        self.evaluate(session, cache);
        self.take_actions()
    }

    /// Any other client or broker event
    pub fn handle_other<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
    ) -> Vec<Action> {
        self.check_send(session, cache)
    }

    /// Dispatch a client message to its handler
    pub fn handle_message<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        message: &Message,
    ) -> Vec<Action> {
        match message {
            Message::Regack(regack) => self.handle_regack(session, cache, regack),
            Message::Puback(puback) => self.handle_puback(session, cache, puback),
            Message::Pubrec(pubrec) => self.handle_pubrec(session, pubrec),
            Message::Pubcomp(pubcomp) => self.handle_pubcomp(session, cache, pubcomp),
            Message::Pingreq(pingreq) => self.handle_pingreq(session, cache, pingreq),
            _ => self.handle_other(session, cache),
        }
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn evaluate<C: RegistrationCache>(&mut self, session: &mut SessionState, cache: &mut C) {
        // A running drain picks up whatever this call would have started
        if self.draining || !self.is_idle() {
            return;
        }

        match session.status {
            ConnectionStatus::Asleep if self.ping_pending => self.new_sends(session, cache),
            ConnectionStatus::Connected if session.has_queued() || session.pending_disconnect => {
                self.new_sends(session, cache)
            }
            _ => {}
        }
    }

    fn new_sends<C: RegistrationCache>(&mut self, session: &mut SessionState, cache: &mut C) {
        self.actions.push(Action::CancelTimer);

        self.draining = true;
        while self.is_idle() {
            let Some(publish) = session.pop_front() else {
                break;
            };
            self.send_current(session, cache, publish, 0);
        }
        self.draining = false;

        if session.has_queued() {
            return;
        }

        if session.pending_disconnect {
            session.pending_disconnect = false;
            info!(client_id = %session.client_id, "Queue drained, disconnecting client");
            self.actions
                .push(Action::Send(Message::Disconnect(Disconnect::default())));
            self.actions.push(Action::Terminate);
            return;
        }

        if self.ping_pending {
            self.ping_pending = false;
            debug!(client_id = %session.client_id, "Answering poll with PINGRESP");
            self.actions.push(Action::Send(Message::Pingresp));
        }
    }

    fn send_current<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        publish: PendingPublish,
        register_count: u32,
    ) {
        let mapping = cache.resolve(&publish.topic);
        assert!(
            mapping.topic_id != 0,
            "registration cache returned topic id 0 for '{}'",
            publish.topic
        );

        trace!(
            client_id = %session.client_id,
            topic = %publish.topic,
            topic_id = mapping.topic_id,
            "Starting delivery"
        );
        self.state = ForwarderState::InFlight(InFlight {
            publish,
            mapping,
            msg_id: session.alloc_msg_id(),
            attempt: 0,
            register_count,
            registered: false,
            phase: Phase::AwaitingAck,
        });
        self.do_send(session, cache);
    }

    fn do_send<C: RegistrationCache>(&mut self, session: &mut SessionState, cache: &mut C) {
        let retry = session.retry;
        let ForwarderState::InFlight(flight) = &mut self.state else {
            return;
        };

        if flight.attempt >= retry.retry_count {
            if flight.phase == Phase::AwaitingRegistration {
                self.abandon_registration(session, cache, "no REGACK within retry limit");
            } else {
                self.abandon(session, cache, "retry limit reached");
            }
            return;
        }
        flight.attempt += 1;
        if flight.attempt > 1 {
            metrics().retransmission();
        }

        if flight.needs_registration() {
            if flight.register_count >= retry.retry_count {
                self.abandon_registration(session, cache, "registration limit reached");
                return;
            }

            flight.msg_id = session.alloc_msg_id();
            flight.phase = Phase::AwaitingRegistration;
            debug!(
                client_id = %session.client_id,
                topic = %flight.publish.topic,
                topic_id = flight.mapping.topic_id,
                msg_id = flight.msg_id,
                attempt = flight.attempt,
                "Sending REGISTER"
            );
            metrics().registration_sent();
            let register = Register {
                topic_id: flight.mapping.topic_id,
                msg_id: flight.msg_id,
                topic_name: flight.publish.topic.clone(),
            };
            self.actions.push(Action::Send(Message::Register(register)));
            self.actions.push(Action::ArmTimer(retry.retry_period));
            return;
        }

        let flags = Flags {
            dup: flight.publish.dup || flight.attempt > 1,
            qos_bits: translate_qos_for_client(flight.publish.qos),
            retain: flight.publish.retain,
            topic_id_type: if flight.mapping.predefined {
                TopicIdType::PreDefined
            } else {
                TopicIdType::Normal
            },
            ..Default::default()
        };
        flight.phase = Phase::AwaitingAck;
        debug!(
            client_id = %session.client_id,
            topic_id = flight.mapping.topic_id,
            msg_id = flight.msg_id,
            qos = flight.publish.qos.level(),
            attempt = flight.attempt,
            "Sending PUBLISH"
        );
        let publish = Publish {
            flags,
            topic_id: flight.mapping.topic_id,
            msg_id: flight.msg_id,
            data: flight.publish.payload.clone(),
        };
        let qos = flight.publish.qos;
        self.actions.push(Action::Send(Message::Publish(publish)));

        if qos == QoS::AtMostOnce {
            // No acknowledgment will follow
            self.complete(session, cache);
            return;
        }
        self.actions.push(Action::ArmTimer(retry.retry_period));
    }

    fn restart<C: RegistrationCache>(&mut self, session: &mut SessionState, cache: &mut C) {
        if let ForwarderState::InFlight(flight) = std::mem::take(&mut self.state) {
            self.send_current(session, cache, flight.publish, flight.register_count);
        }
    }

    fn send_pubrel(&mut self, msg_id: u16, retry_period: Duration) {
        self.actions
            .push(Action::Send(Message::Pubrel(Pubrel { msg_id })));
        self.actions.push(Action::ArmTimer(retry_period));
    }

    fn complete<C: RegistrationCache>(&mut self, session: &mut SessionState, cache: &mut C) {
        if let ForwarderState::InFlight(flight) = std::mem::take(&mut self.state) {
            trace!(
                client_id = %session.client_id,
                topic = %flight.publish.topic,
                "Publish delivered"
            );
            metrics().publish_delivered();
        }
        self.evaluate(session, cache);
    }

    fn abandon<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        reason: &str,
    ) {
        if let ForwarderState::InFlight(flight) = std::mem::take(&mut self.state) {
            warn!(
                client_id = %session.client_id,
                topic = %flight.publish.topic,
                attempt = flight.attempt,
                register_count = flight.register_count,
                "Abandoning publish: {}",
                reason
            );
            metrics().publish_abandoned();
        }
        self.evaluate(session, cache);
    }

    /// Abandon a publish whose topic id the client never accepted
    ///
    /// The id is discarded so the next publish on the topic registers it
    /// again instead of publishing an id unknown to the client.
    fn abandon_registration<C: RegistrationCache>(
        &mut self,
        session: &mut SessionState,
        cache: &mut C,
        reason: &str,
    ) {
        if let ForwarderState::InFlight(flight) = &self.state {
            if !flight.mapping.predefined {
                cache.discard(flight.mapping.topic_id);
            }
        }
        self.abandon(session, cache, reason);
    }

    fn drop_stale(&self, kind: &str, msg_id: u16) {
        trace!(msg_id, "Dropping unmatched {}", kind);
        metrics().stale_ack_dropped();
    }
}
