//! Broker context: the explicit root object of the message daemon
//!
//! Owns the topic map, the message id sequence and the registration event
//! stream consumed by the lookup peer tasks. Passed around as an `Arc`
//! instead of living in a process-wide global.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use super::message::{IdFactory, Message};
use super::topic::{Topic, TopicStats};
use crate::core::config::BrokerConfig;
use crate::core::shutdown::ShutdownService;

/// Capacity of the registration event stream; a lagging lookup peer resyncs
/// from a snapshot instead of replaying missed events.
const REGISTRATION_EVENT_CAPACITY: usize = 1024;

/// Topic/channel lifecycle changes forwarded to the lookup daemons.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    TopicCreate { topic: String },
    TopicDelete { topic: String },
    ChannelCreate { topic: String, channel: String },
    ChannelDelete { topic: String, channel: String },
}

pub struct Broker {
    pub config: BrokerConfig,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    id_factory: IdFactory,
    client_seq: AtomicU64,
    notifier: broadcast::Sender<RegistrationEvent>,
    shutdown: ShutdownService,
}

impl Broker {
    pub fn new(config: BrokerConfig, shutdown: ShutdownService) -> Arc<Self> {
        let (notifier, _) = broadcast::channel(REGISTRATION_EVENT_CAPACITY);
        Arc::new(Self {
            config,
            topics: RwLock::new(HashMap::new()),
            id_factory: IdFactory::new(),
            client_seq: AtomicU64::new(1),
            notifier,
            shutdown,
        })
    }

    /// Stream of topic/channel lifecycle events for the lookup peers.
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.notifier.subscribe()
    }

    pub fn shutdown_rx(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stamp a new message with the next identifier.
    pub fn new_message(&self, body: Bytes) -> Message {
        Message::new(self.id_factory.next_id(), body)
    }

    pub fn next_client_id(&self) -> u64 {
        self.client_seq.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Topics
    // =========================================================================

    pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    pub fn get_or_create_topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }

        let mut topics = self.topics.write();
        // Double-check after acquiring write lock
        if let Some(topic) = topics.get(name) {
            return Arc::clone(topic);
        }

        let topic = Topic::new(
            name,
            &self.config,
            self.notifier.clone(),
            self.shutdown.subscribe(),
        );
        topics.insert(name.to_string(), Arc::clone(&topic));
        drop(topics);

        tracing::info!(topic = name, "Topic created");
        let _ = self.notifier.send(RegistrationEvent::TopicCreate {
            topic: name.to_string(),
        });
        topic
    }

    /// Remove a topic and all of its channels.
    pub fn delete_topic(&self, name: &str) -> bool {
        let removed = self.topics.write().remove(name);
        match removed {
            Some(topic) => {
                topic.delete();
                tracing::info!(topic = name, "Topic deleted");
                let _ = self.notifier.send(RegistrationEvent::TopicDelete {
                    topic: name.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Events reconstructing the current registration state, used when a
    /// lookup peer (re)connects.
    pub fn registration_snapshot(&self) -> Vec<RegistrationEvent> {
        let mut events = Vec::new();
        for topic in self.topics() {
            events.push(RegistrationEvent::TopicCreate {
                topic: topic.name.clone(),
            });
            for channel in topic.channel_names() {
                events.push(RegistrationEvent::ChannelCreate {
                    topic: topic.name.clone(),
                    channel,
                });
            }
        }
        events
    }

    pub fn stats(&self) -> BrokerStats {
        let mut topics: Vec<TopicStats> = self.topics().iter().map(|t| t.stats()).collect();
        topics.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        BrokerStats { topics }
    }
}

/// Point-in-time view of the whole broker, exposed by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub topics: Vec<TopicStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_broker() -> Arc<Broker> {
        Broker::new(BrokerConfig::default(), ShutdownService::new())
    }

    #[tokio::test]
    async fn test_get_or_create_topic_reuses_existing() {
        let broker = make_broker();
        let a = broker.get_or_create_topic("events");
        let b = broker.get_or_create_topic("events");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_delete_topic() {
        let broker = make_broker();
        broker.get_or_create_topic("events");
        assert!(broker.delete_topic("events"));
        assert!(broker.get_topic("events").is_none());
        assert!(!broker.delete_topic("events"));
    }

    #[tokio::test]
    async fn test_registration_events_emitted() {
        let broker = make_broker();
        let mut rx = broker.subscribe_registrations();

        broker.get_or_create_topic("events");
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistrationEvent::TopicCreate { .. }
        ));

        broker
            .get_or_create_topic("events")
            .get_or_create_channel("archive");
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistrationEvent::ChannelCreate { .. }
        ));
    }

    #[tokio::test]
    async fn test_registration_snapshot_covers_existing_state() {
        let broker = make_broker();
        let topic = broker.get_or_create_topic("events");
        topic.get_or_create_channel("archive");
        topic.get_or_create_channel("audit");

        let snapshot = broker.registration_snapshot();
        let channels = snapshot
            .iter()
            .filter(|e| matches!(e, RegistrationEvent::ChannelCreate { .. }))
            .count();
        assert_eq!(channels, 2);
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_message_ids_unique() {
        let broker = make_broker();
        let a = broker.new_message(Bytes::from_static(b"a"));
        let b = broker.new_message(Bytes::from_static(b"b"));
        assert_ne!(a.id, b.id);
    }
}
