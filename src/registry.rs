//! Topic registration cache
//!
//! Maps topic names to the short numeric topic identifiers used on the
//! MQTT-SN wire. Each client session owns a [`TopicRegistry`]; the
//! pre-defined table is shared by all sessions and never changes at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Result of resolving a topic name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicMapping {
    /// Numeric topic identifier, always non-zero for a valid mapping
    pub topic_id: u16,
    /// Identifier is known to both ends out-of-band; never registered
    pub predefined: bool,
    /// Identifier was assigned by this resolution and must be registered
    /// with the client before the first PUBLISH
    pub new_insertion: bool,
}

/// Narrow interface the publish forwarder uses to look up topic identifiers
pub trait RegistrationCache {
    /// Resolve a topic name, assigning a fresh identifier if needed
    fn resolve(&mut self, topic: &str) -> TopicMapping;

    /// Forget a registered identifier so the next resolve re-registers it
    fn discard(&mut self, topic_id: u16);
}

/// Guarded sharing of a cache between tasks
impl<C: RegistrationCache> RegistrationCache for Arc<Mutex<C>> {
    fn resolve(&mut self, topic: &str) -> TopicMapping {
        let mut cache = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.resolve(topic)
    }

    fn discard(&mut self, topic_id: u16) {
        let mut cache = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.discard(topic_id)
    }
}

/// Pre-defined topic table shared by every session of a gateway
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredefinedTopics {
    by_name: HashMap<String, u16>,
    ids: HashSet<u16>,
}

impl PredefinedTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-defined topic; returns false if the name is already present
    pub fn insert(&mut self, topic: impl Into<String>, topic_id: u16) -> bool {
        let topic = topic.into();
        if self.by_name.contains_key(&topic) {
            return false;
        }
        self.by_name.insert(topic, topic_id);
        self.ids.insert(topic_id);
        true
    }

    pub fn get(&self, topic: &str) -> Option<u16> {
        self.by_name.get(topic).copied()
    }

    pub fn contains_id(&self, topic_id: u16) -> bool {
        self.ids.contains(&topic_id)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u16)> for PredefinedTopics {
    fn from_iter<I: IntoIterator<Item = (S, u16)>>(iter: I) -> Self {
        let mut topics = Self::new();
        for (topic, topic_id) in iter {
            topics.insert(topic, topic_id);
        }
        topics
    }
}

/// Per-client registration table
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    predefined: Arc<PredefinedTopics>,
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    /// Logical time each dynamic id was last resolved
    last_resolved: HashMap<u16, u64>,
    clock: u64,
    last_id: u16,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PredefinedTopics::new()))
    }
}

impl TopicRegistry {
    pub fn new(predefined: Arc<PredefinedTopics>) -> Self {
        Self {
            predefined,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            last_resolved: HashMap::new(),
            clock: 0,
            last_id: 0,
        }
    }

    /// Identifier currently registered for a topic, if any
    pub fn registered_id(&self, topic: &str) -> Option<u16> {
        self.by_name.get(topic).copied()
    }

    /// Number of dynamically registered topics
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn touch(&mut self, topic_id: u16) {
        self.clock += 1;
        self.last_resolved.insert(topic_id, self.clock);
    }

    /// Scan at most one full wrap of the id space for an unused id
    fn next_free_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                self.last_id = 1;
            }
            if !self.by_id.contains_key(&self.last_id) && !self.predefined.contains_id(self.last_id)
            {
                return Some(self.last_id);
            }
        }
        None
    }

    /// Free the id of the least recently resolved topic
    ///
    /// Topics are resolved when their publish starts, so the publish in
    /// flight always holds the most recent entry and is never chosen while
    /// any other registration exists.
    fn evict_least_recent(&mut self) -> Option<u16> {
        let topic_id = self
            .by_id
            .keys()
            .copied()
            .min_by_key(|id| self.last_resolved.get(id).copied().unwrap_or(0))?;
        if let Some(topic) = self.by_id.remove(&topic_id) {
            self.by_name.remove(&topic);
            warn!(
                "Topic id space exhausted, evicting '{}' (topic id {})",
                topic, topic_id
            );
        }
        self.last_resolved.remove(&topic_id);
        Some(topic_id)
    }
}

impl RegistrationCache for TopicRegistry {
    fn resolve(&mut self, topic: &str) -> TopicMapping {
        if let Some(topic_id) = self.predefined.get(topic) {
            return TopicMapping {
                topic_id,
                predefined: true,
                new_insertion: false,
            };
        }

        if let Some(topic_id) = self.by_name.get(topic).copied() {
            self.touch(topic_id);
            return TopicMapping {
                topic_id,
                predefined: false,
                new_insertion: false,
            };
        }

        let Some(topic_id) = self
            .next_free_id()
            .or_else(|| self.evict_least_recent())
        else {
            // Every id is pre-defined; id 0 is rejected by the forwarder
            warn!("No topic id available for '{}'", topic);
            return TopicMapping {
                topic_id: 0,
                predefined: false,
                new_insertion: true,
            };
        };
        self.by_name.insert(topic.to_string(), topic_id);
        self.by_id.insert(topic_id, topic.to_string());
        self.touch(topic_id);
        debug!("Assigned topic id {} to '{}'", topic_id, topic);

        TopicMapping {
            topic_id,
            predefined: false,
            new_insertion: true,
        }
    }

    fn discard(&mut self, topic_id: u16) {
        if let Some(topic) = self.by_id.remove(&topic_id) {
            self.by_name.remove(&topic);
            self.last_resolved.remove(&topic_id);
            debug!("Discarded registration of topic id {} ('{}')", topic_id, topic);
        }
    }
}
