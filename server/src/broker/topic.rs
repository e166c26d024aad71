//! Topic: named ingress that fans messages out to its channels

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, broadcast, mpsc, watch};

use super::broker::RegistrationEvent;
use super::channel::{Channel, ChannelStats};
use super::message::Message;
use crate::core::config::BrokerConfig;

/// Error raised on the publish path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("queue full")]
    QueueFull,
    #[error("topic is exiting")]
    Exiting,
}

/// A named message ingress.
///
/// Publishes land in the bounded `incoming` queue; the fan-out pump copies
/// each message into every channel. The copies share one immutable body.
pub struct Topic {
    pub name: String,

    incoming_tx: mpsc::Sender<Message>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Wakes the fan-out pump parked on an empty channel set
    channel_added: Notify,
    exiting: AtomicBool,

    mem_queue_size: usize,
    msg_timeout: Duration,
    queue_scan_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    notifier: broadcast::Sender<RegistrationEvent>,
}

impl Topic {
    pub fn new(
        name: &str,
        config: &BrokerConfig,
        notifier: broadcast::Sender<RegistrationEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.mem_queue_size.max(1));
        let topic = Arc::new(Self {
            name: name.to_string(),
            incoming_tx,
            channels: RwLock::new(HashMap::new()),
            channel_added: Notify::new(),
            exiting: AtomicBool::new(false),
            mem_queue_size: config.mem_queue_size,
            msg_timeout: config.msg_timeout,
            queue_scan_interval: config.queue_scan_interval,
            shutdown_rx: shutdown_rx.clone(),
            notifier,
        });

        let pump = Arc::clone(&topic);
        tokio::spawn(async move { pump.fanout_pump(incoming_rx, shutdown_rx).await });

        topic
    }

    /// Enqueue a message for fan-out. Never blocks: a full queue is an error
    /// surfaced to the publisher.
    pub fn put(&self, msg: Message) -> Result<(), TopicError> {
        if self.exiting.load(Ordering::SeqCst) {
            return Err(TopicError::Exiting);
        }
        self.incoming_tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => TopicError::QueueFull,
            TrySendError::Closed(_) => TopicError::Exiting,
        })
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn get_or_create_channel(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.channels.read().get(name) {
            return Arc::clone(channel);
        }

        let mut channels = self.channels.write();
        // Double-check after acquiring write lock
        if let Some(channel) = channels.get(name) {
            return Arc::clone(channel);
        }

        let channel = Channel::new(&self.name, name, self.mem_queue_size, self.msg_timeout);
        channel.start(self.queue_scan_interval, self.shutdown_rx.clone());
        channels.insert(name.to_string(), Arc::clone(&channel));
        drop(channels);

        tracing::debug!(topic = %self.name, channel = name, "Channel created");
        self.channel_added.notify_one();
        let _ = self.notifier.send(RegistrationEvent::ChannelCreate {
            topic: self.name.clone(),
            channel: name.to_string(),
        });

        channel
    }

    /// Remove a channel, dropping its pending and in-flight messages.
    pub fn delete_channel(&self, name: &str) -> bool {
        let removed = self.channels.write().remove(name);
        match removed {
            Some(channel) => {
                channel.close();
                tracing::debug!(topic = %self.name, channel = name, "Channel deleted");
                let _ = self.notifier.send(RegistrationEvent::ChannelDelete {
                    topic: self.name.clone(),
                    channel: name.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Close every channel and stop accepting publishes.
    pub fn delete(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        let channels: Vec<(String, Arc<Channel>)> =
            self.channels.write().drain().collect();
        for (name, channel) in channels {
            channel.close();
            let _ = self.notifier.send(RegistrationEvent::ChannelDelete {
                topic: self.name.clone(),
                channel: name,
            });
        }
        // unpark the fan-out pump so it can observe the exit flag
        self.channel_added.notify_waiters();
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> TopicStats {
        let mut channels: Vec<ChannelStats> =
            self.channels.read().values().map(|c| c.stats()).collect();
        channels.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
        TopicStats {
            topic_name: self.name.clone(),
            channels,
        }
    }

    /// Copy each incoming message into every channel, in publish order.
    ///
    /// Messages arriving before the first channel exists wait; a full channel
    /// queue stalls the pump, which backpressures publishes through the
    /// bounded incoming queue.
    async fn fanout_pump(
        self: Arc<Self>,
        mut incoming_rx: mpsc::Receiver<Message>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let msg = tokio::select! {
                m = incoming_rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            loop {
                if self.exiting.load(Ordering::SeqCst) || *shutdown_rx.borrow() {
                    return;
                }
                let channels = self.channels();
                if channels.is_empty() {
                    tokio::select! {
                        _ = self.channel_added.notified() => {}
                        _ = shutdown_rx.changed() => return,
                    }
                    continue;
                }
                for channel in channels {
                    if let Err(e) = channel.put(msg.clone()).await {
                        tracing::debug!(
                            topic = %self.name,
                            channel = %channel.name,
                            error = %e,
                            "Skipped fan-out to closed channel"
                        );
                    }
                }
                break;
            }
        }
        tracing::debug!(topic = %self.name, "Fan-out pump stopped");
    }
}

/// Point-in-time view of a topic, exposed by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic_name: String,
    pub channels: Vec<ChannelStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message::{IdFactory, Message};
    use bytes::Bytes;
    use std::time::Duration;

    fn make_topic(config: &BrokerConfig) -> Arc<Topic> {
        let (notifier, _) = broadcast::channel(64);
        let (_tx, rx) = watch::channel(false);
        Topic::new("events", config, notifier, rx)
    }

    fn make_message(factory: &IdFactory) -> Message {
        Message::new(factory.next_id(), Bytes::from_static(b"test body"))
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_channels() {
        let config = BrokerConfig::default();
        let topic = make_topic(&config);
        let factory = IdFactory::new();

        let ch1 = topic.get_or_create_channel("ch1");
        let ch2 = topic.get_or_create_channel("ch2");

        let msg = make_message(&factory);
        topic.put(msg).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ch1.depth(), 1);
        assert_eq!(ch2.depth(), 1);
    }

    #[tokio::test]
    async fn test_fanout_waits_for_first_channel() {
        let config = BrokerConfig::default();
        let topic = make_topic(&config);
        let factory = IdFactory::new();

        topic.put(make_message(&factory)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let channel = topic.get_or_create_channel("late");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.depth(), 1);
    }

    #[tokio::test]
    async fn test_put_queue_full_backpressure() {
        let config = BrokerConfig {
            mem_queue_size: 1,
            ..Default::default()
        };
        let topic = make_topic(&config);
        let factory = IdFactory::new();
        // a channel with no consumers: its single pending slot fills and the
        // fan-out pump stalls, so publishes start bouncing
        topic.get_or_create_channel("stuck");

        for _ in 0..3 {
            topic.put(make_message(&factory)).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(
            topic.put(make_message(&factory)),
            Err(TopicError::QueueFull)
        );
    }

    #[tokio::test]
    async fn test_get_or_create_channel_reuses_existing() {
        let config = BrokerConfig::default();
        let topic = make_topic(&config);

        let a = topic.get_or_create_channel("ch");
        let b = topic.get_or_create_channel("ch");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_delete_channel_drops_state() {
        let config = BrokerConfig::default();
        let topic = make_topic(&config);

        topic.get_or_create_channel("ch");
        assert!(topic.delete_channel("ch"));
        assert!(!topic.delete_channel("ch"));
        assert!(topic.get_channel("ch").is_none());
    }
}
