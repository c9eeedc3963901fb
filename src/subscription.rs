use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::agv_id::AgvSubject;
use crate::error::ClientError;
use crate::topic::{Topic, TopicFormat};

/// Opaque 128-bit random subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn fresh() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key of one trie level; `None` is the wildcard.
type LevelKey = Option<String>;

struct Leaf<H> {
    broker_topic: String,
    handlers: Vec<(SubscriptionId, H)>,
}

/// Outcome of registering a subscription.
pub struct Subscribed {
    pub id: SubscriptionId,
    pub broker_topic: String,
    /// True when this is the first subscription materializing the broker
    /// topic, i.e. a broker SUBSCRIBE is required.
    pub requires_subscribe: bool,
}

/// Outcome of deregistering a subscription.
pub struct Unsubscribed {
    pub broker_topic: String,
    /// True when the last subscription on the broker topic is gone, i.e. a
    /// broker UNSUBSCRIBE is required.
    pub requires_unsubscribe: bool,
}

/// Wildcard-aware registry of subscriptions, keyed in reverse path order
/// `(topic, serialNumber, manufacturer)` so that lookups can descend from the
/// most selective level. Any level may be unset, generalizing over all
/// concrete values; a message matches every subscription whose path is a
/// generalization of the message's path.
pub struct SubscriptionManager<H> {
    format: TopicFormat,
    interface: String,
    major_level: &'static str,
    tree: HashMap<LevelKey, HashMap<LevelKey, HashMap<LevelKey, Leaf<H>>>>,
    paths: HashMap<SubscriptionId, (LevelKey, LevelKey, LevelKey)>,
}

impl<H: Clone> SubscriptionManager<H> {
    pub fn new(format: TopicFormat, interface: impl Into<String>, major_level: &'static str) -> Self {
        SubscriptionManager {
            format,
            interface: interface.into(),
            major_level,
            tree: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    pub fn add(
        &mut self,
        topic: &Topic,
        subject: &AgvSubject,
        handler: H,
    ) -> Result<Subscribed, ClientError> {
        let broker_topic =
            self.format
                .broker_topic(&self.interface, self.major_level, subject, topic)?;
        let id = SubscriptionId::fresh();
        let path = (
            Some(topic.name().to_string()),
            subject.serial_number.clone(),
            subject.manufacturer.clone(),
        );

        let leaf = self
            .tree
            .entry(path.0.clone())
            .or_default()
            .entry(path.1.clone())
            .or_default()
            .entry(path.2.clone())
            .or_insert_with(|| Leaf {
                broker_topic: broker_topic.clone(),
                handlers: Vec::new(),
            });
        let requires_subscribe = leaf.handlers.is_empty();
        leaf.handlers.push((id, handler));
        self.paths.insert(id, path);

        Ok(Subscribed {
            id,
            broker_topic,
            requires_subscribe,
        })
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Unsubscribed> {
        let (topic_key, serial_key, manufacturer_key) = self.paths.remove(&id)?;
        let serials = self.tree.get_mut(&topic_key)?;
        let manufacturers = serials.get_mut(&serial_key)?;
        let leaf = manufacturers.get_mut(&manufacturer_key)?;

        leaf.handlers.retain(|(handler_id, _)| *handler_id != id);
        let broker_topic = leaf.broker_topic.clone();
        let requires_unsubscribe = leaf.handlers.is_empty();
        if requires_unsubscribe {
            manufacturers.remove(&manufacturer_key);
            if manufacturers.is_empty() {
                serials.remove(&serial_key);
            }
            if self.tree.get(&topic_key).is_some_and(HashMap::is_empty) {
                self.tree.remove(&topic_key);
            }
        }
        Some(Unsubscribed {
            broker_topic,
            requires_unsubscribe,
        })
    }

    /// All subscriptions matching a concrete message path, i.e. every
    /// registration whose levels are each either equal to the concrete value
    /// or the wildcard. Handlers come back in registration order per leaf;
    /// the order across leaves is unspecified.
    pub fn find(
        &self,
        topic_name: &str,
        manufacturer: &str,
        serial_number: &str,
    ) -> Vec<(SubscriptionId, H)> {
        let mut matches = Vec::new();
        for topic_key in [Some(topic_name), None] {
            let Some(serials) = self.tree.get(&topic_key.map(str::to_string)) else {
                continue;
            };
            for serial_key in [Some(serial_number), None] {
                let Some(manufacturers) = serials.get(&serial_key.map(str::to_string)) else {
                    continue;
                };
                for manufacturer_key in [Some(manufacturer), None] {
                    if let Some(leaf) = manufacturers.get(&manufacturer_key.map(str::to_string)) {
                        matches.extend(leaf.handlers.iter().cloned());
                    }
                }
            }
        }
        matches
    }

    /// Every distinct broker topic currently materialized; used for the batch
    /// resubscribe after a reconnect.
    pub fn broker_topics(&self) -> Vec<String> {
        let mut topics = Vec::new();
        for serials in self.tree.values() {
            for manufacturers in serials.values() {
                for leaf in manufacturers.values() {
                    topics.push(leaf.broker_topic.clone());
                }
            }
        }
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.paths.clear();
    }
}
