//! Mock implementations for testing
//!
//! Provides a recording client transport and a scripted registration cache so
//! sessions can be driven without sockets or real topic tables.

use crate::protocol::Message;
use crate::registry::{RegistrationCache, TopicMapping, TopicRegistry};
use crate::transport::ClientTransport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
#[error("Mock send failure")]
pub struct MockTransportError;

/// Mock transport recording every message sent to the client
#[derive(Debug, Clone, Default)]
pub struct MockClientTransport {
    pub sent: Arc<Mutex<Vec<Message>>>,
    pub should_fail: bool,
}

impl MockClientTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_sent(&self) -> Vec<Message> {
        self.sent.lock().await.clone()
    }

    /// Remove and return everything recorded so far
    pub async fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    pub async fn clear_history(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl ClientTransport for MockClientTransport {
    type Error = MockTransportError;

    async fn send(&self, message: &Message) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MockTransportError);
        }

        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Registration cache with scripted answers that records every call
///
/// Topics without a scripted mapping are resolved by an inner
/// [`TopicRegistry`].
#[derive(Debug, Default)]
pub struct MockRegistrationCache {
    pub scripted: HashMap<String, TopicMapping>,
    pub resolved: Vec<String>,
    pub discarded: Vec<u16>,
    inner: TopicRegistry,
}

impl MockRegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `topic` with `mapping`
    pub fn with_mapping(mut self, topic: impl Into<String>, mapping: TopicMapping) -> Self {
        self.scripted.insert(topic.into(), mapping);
        self
    }

    /// Script `topic` as a pre-defined topic id
    pub fn with_predefined(self, topic: impl Into<String>, topic_id: u16) -> Self {
        self.with_mapping(
            topic,
            TopicMapping {
                topic_id,
                predefined: true,
                new_insertion: false,
            },
        )
    }

    /// Script `topic` as already registered with the client
    pub fn with_registered(self, topic: impl Into<String>, topic_id: u16) -> Self {
        self.with_mapping(
            topic,
            TopicMapping {
                topic_id,
                predefined: false,
                new_insertion: false,
            },
        )
    }
}

impl RegistrationCache for MockRegistrationCache {
    fn resolve(&mut self, topic: &str) -> TopicMapping {
        self.resolved.push(topic.to_string());
        match self.scripted.get(topic) {
            Some(mapping) => *mapping,
            None => self.inner.resolve(topic),
        }
    }

    fn discard(&mut self, topic_id: u16) {
        self.discarded.push(topic_id);
        self.scripted.retain(|_, mapping| mapping.topic_id != topic_id);
        self.inner.discard(topic_id);
    }
}
