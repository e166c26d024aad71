//! Channel: the per-subscriber-group delivery queue beneath a topic
//!
//! Structural state (pending queue, in-flight map, deferred heap, client set)
//! lives under one mutex held only for map/queue operations, never across
//! I/O. The delivery pump and the timeout/deferred scans run as tasks owned
//! by the channel.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, watch};

use super::client::{ClientSession, ClientStats};
use super::message::{Message, MessageId};
use super::protocol::Frame;

/// Error raised by in-flight bookkeeping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("message not in flight")]
    NotInFlight,
    #[error("message owned by another client")]
    WrongOwner,
    #[error("channel is exiting")]
    Exiting,
}

struct InFlight {
    message: Message,
    client_id: u64,
    deadline: Instant,
}

struct Deferred {
    ready_at: Instant,
    message: Message,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at.cmp(&other.ready_at)
    }
}

struct Inner {
    pending: VecDeque<Message>,
    in_flight: HashMap<MessageId, InFlight>,
    deferred: BinaryHeap<Reverse<Deferred>>,
    clients: Vec<Arc<ClientSession>>,
    rr_cursor: usize,
}

/// A named delivery queue; every subscribed client of the channel competes
/// for its messages.
pub struct Channel {
    pub topic_name: String,
    pub name: String,
    pub ephemeral: bool,

    max_pending: usize,
    msg_timeout: Duration,

    paused: AtomicBool,
    exiting: AtomicBool,
    inner: Mutex<Inner>,
    /// Edge-triggered wakeup for the delivery pump
    pump_notify: Notify,
    /// Wakes a fan-out producer blocked on a full pending queue
    space_notify: Notify,
}

impl Channel {
    pub fn new(
        topic_name: &str,
        name: &str,
        max_pending: usize,
        msg_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            ephemeral: crate::utils::names::is_ephemeral(name),
            max_pending,
            msg_timeout,
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                deferred: BinaryHeap::new(),
                clients: Vec::new(),
                rr_cursor: 0,
            }),
            pump_notify: Notify::new(),
            space_notify: Notify::new(),
        })
    }

    /// Spawn the delivery pump and the timeout/deferred scan tasks.
    pub fn start(
        self: &Arc<Self>,
        scan_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let channel = Arc::clone(self);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { channel.message_pump(rx).await });

        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.scan_pump(shutdown_rx, scan_interval).await });
    }

    // =========================================================================
    // Queue operations
    // =========================================================================

    /// Enqueue a message, waiting for space when the pending queue is full.
    ///
    /// The wait is what backpressures topic fan-out (and with it, publishes).
    pub async fn put(&self, msg: Message) -> Result<(), ChannelError> {
        loop {
            if self.exiting.load(Ordering::SeqCst) {
                return Err(ChannelError::Exiting);
            }
            {
                let mut inner = self.inner.lock();
                if inner.pending.len() < self.max_pending {
                    inner.pending.push_back(msg);
                    drop(inner);
                    self.pump_notify.notify_one();
                    return Ok(());
                }
            }
            self.space_notify.notified().await;
        }
    }

    /// Remove a delivered message from the in-flight set.
    pub fn finish(&self, id: &MessageId, client: &ClientSession) -> Result<(), ChannelError> {
        {
            let mut inner = self.inner.lock();
            match inner.in_flight.get(id) {
                None => return Err(ChannelError::NotInFlight),
                Some(entry) if entry.client_id != client.id => {
                    return Err(ChannelError::WrongOwner);
                }
                Some(_) => {
                    inner.in_flight.remove(id);
                }
            }
        }
        client.finished_message();
        Ok(())
    }

    /// Return a delivered message to the queue.
    ///
    /// Zero delay puts it back at the head of the pending queue; otherwise it
    /// parks in the deferred heap until `now + delay`.
    pub fn requeue(
        &self,
        id: &MessageId,
        client: &ClientSession,
        delay: Duration,
    ) -> Result<(), ChannelError> {
        {
            let mut inner = self.inner.lock();
            match inner.in_flight.get(id) {
                None => return Err(ChannelError::NotInFlight),
                Some(entry) if entry.client_id != client.id => {
                    return Err(ChannelError::WrongOwner);
                }
                Some(_) => {}
            }
            let Some(entry) = inner.in_flight.remove(id) else {
                return Err(ChannelError::NotInFlight);
            };
            if delay.is_zero() {
                inner.pending.push_front(entry.message);
            } else {
                inner.deferred.push(Reverse(Deferred {
                    ready_at: Instant::now() + delay,
                    message: entry.message,
                }));
            }
        }
        client.requeued_message();
        self.pump_notify.notify_one();
        Ok(())
    }

    /// Reset the in-flight deadline of a delivered message.
    pub fn touch(&self, id: &MessageId, client: &ClientSession) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        match inner.in_flight.get_mut(id) {
            None => Err(ChannelError::NotInFlight),
            Some(entry) if entry.client_id != client.id => Err(ChannelError::WrongOwner),
            Some(entry) => {
                entry.deadline = Instant::now() + self.msg_timeout;
                Ok(())
            }
        }
    }

    /// Requeue every in-flight message whose deadline has passed and notify
    /// the owning clients.
    pub fn timeout_scan(&self) {
        let now = Instant::now();
        let mut owners = Vec::new();
        let mut requeued = false;
        {
            let mut inner = self.inner.lock();
            let expired: Vec<MessageId> = inner
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(entry) = inner.in_flight.remove(&id) {
                    if let Some(owner) = inner.clients.iter().find(|c| c.id == entry.client_id) {
                        owners.push(Arc::clone(owner));
                    }
                    inner.pending.push_front(entry.message);
                    requeued = true;
                }
            }
        }
        for owner in owners {
            tracing::debug!(
                topic = %self.topic_name,
                channel = %self.name,
                client = %owner.remote_addr,
                "Message timed out, requeued"
            );
            owner.timed_out_message();
        }
        if requeued {
            self.pump_notify.notify_one();
        }
    }

    /// Move every deferred message whose ready time has arrived to pending.
    pub fn deferred_scan(&self) {
        let now = Instant::now();
        let mut moved = false;
        {
            let mut inner = self.inner.lock();
            while inner
                .deferred
                .peek()
                .is_some_and(|Reverse(d)| d.ready_at <= now)
            {
                if let Some(Reverse(d)) = inner.deferred.pop() {
                    inner.pending.push_back(d.message);
                    moved = true;
                }
            }
        }
        if moved {
            self.pump_notify.notify_one();
        }
    }

    // =========================================================================
    // Pause / clients / teardown
    // =========================================================================

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.pump_notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn add_client(&self, client: Arc<ClientSession>) {
        self.inner.lock().clients.push(client);
        self.pump_notify.notify_one();
    }

    /// Detach a client, requeueing everything it still had in flight.
    ///
    /// Returns the number of clients left so the caller can tear down an
    /// ephemeral channel that just lost its last consumer.
    pub fn remove_client(&self, client_id: u64) -> usize {
        let remaining;
        let mut requeued = false;
        {
            let mut inner = self.inner.lock();
            inner.clients.retain(|c| c.id != client_id);
            if inner.rr_cursor >= inner.clients.len() {
                inner.rr_cursor = 0;
            }
            let owned: Vec<MessageId> = inner
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.client_id == client_id)
                .map(|(id, _)| *id)
                .collect();
            for id in owned {
                if let Some(entry) = inner.in_flight.remove(&id) {
                    inner.pending.push_front(entry.message);
                    requeued = true;
                }
            }
            remaining = inner.clients.len();
        }
        if requeued {
            self.pump_notify.notify_one();
        }
        remaining
    }

    /// Drop all state and stop the pumps. Pending and in-flight messages are
    /// lost by contract.
    pub fn close(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            inner.pending.clear();
            inner.in_flight.clear();
            inner.deferred.clear();
            inner.clients.clear();
        }
        self.pump_notify.notify_waiters();
        self.space_notify.notify_waiters();
    }

    /// Wake the delivery pump; writers never block and wake-ups coalesce.
    pub fn notify_pump(&self) {
        self.pump_notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> ChannelStats {
        let inner = self.inner.lock();
        ChannelStats {
            channel_name: self.name.clone(),
            depth: inner.pending.len(),
            in_flight_count: inner.in_flight.len(),
            deferred_count: inner.deferred.len(),
            paused: self.is_paused(),
            clients: inner.clients.iter().map(|c| c.stats()).collect(),
        }
    }

    // =========================================================================
    // Pumps
    // =========================================================================

    async fn message_pump(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if self.exiting.load(Ordering::SeqCst) || *shutdown_rx.borrow() {
                break;
            }
            match self.next_delivery() {
                Some((client, msg)) => {
                    // A failed send means the client's writer is gone; its
                    // disconnect path requeues whatever it owned.
                    if client.outbound.send(Frame::Message(msg)).await.is_err() {
                        tracing::debug!(
                            topic = %self.topic_name,
                            channel = %self.name,
                            client = %client.remote_addr,
                            "Dropped delivery to disconnecting client"
                        );
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.pump_notify.notified() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
        tracing::debug!(topic = %self.topic_name, channel = %self.name, "Message pump stopped");
    }

    /// Pick the next pending message and an eligible client, round-robin
    /// starting after the last served client. First ready client wins.
    fn next_delivery(&self) -> Option<(Arc<ClientSession>, Message)> {
        if self.is_paused() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() || inner.clients.is_empty() {
            return None;
        }

        let n = inner.clients.len();
        let start = inner.rr_cursor % n;
        let mut chosen = None;
        for i in 0..n {
            let idx = (start + i) % n;
            if inner.clients[idx].is_ready_for_messages() {
                chosen = Some(idx);
                break;
            }
        }
        let idx = chosen?;
        inner.rr_cursor = (idx + 1) % n;

        let mut msg = inner.pending.pop_front()?;
        self.space_notify.notify_one();
        msg.attempts = msg.attempts.saturating_add(1);

        let client = Arc::clone(&inner.clients[idx]);
        inner.in_flight.insert(
            msg.id,
            InFlight {
                message: msg.clone(),
                client_id: client.id,
                deadline: Instant::now() + self.msg_timeout,
            },
        );
        client.sending_message();
        Some((client, msg))
    }

    async fn scan_pump(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        scan_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.exiting.load(Ordering::SeqCst) {
                        break;
                    }
                    self.deferred_scan();
                    self.timeout_scan();
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

/// Point-in-time view of a channel, exposed by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_name: String,
    pub depth: usize,
    pub in_flight_count: usize,
    pub deferred_count: usize,
    pub paused: bool,
    pub clients: Vec<ClientStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::ClientState;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn make_channel() -> Arc<Channel> {
        Channel::new("events", "archive", 100, Duration::from_secs(60))
    }

    fn make_client(id: u64) -> (Arc<ClientSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let client = Arc::new(ClientSession::new(
            id,
            format!("127.0.0.1:4{id:04}").parse().unwrap(),
            tx,
            30_000,
        ));
        client.set_state(ClientState::Subscribed);
        (client, rx)
    }

    fn make_message(id_byte: u8) -> Message {
        let mut id = *b"0000000000000000";
        id[15] = id_byte;
        Message::new(id, Bytes::from_static(b"test body"))
    }

    #[tokio::test]
    async fn test_delivery_increments_attempts_and_counters() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (chosen, msg) = channel.next_delivery().expect("eligible delivery");

        assert_eq!(chosen.id, client.id);
        assert_eq!(msg.attempts, 1);
        assert_eq!(client.stats().in_flight_count, 1);
        assert_eq!(client.stats().ready_count, 0);
        assert!(channel.next_delivery().is_none());
    }

    #[tokio::test]
    async fn test_finish_requires_owner() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        let (other, _rx2) = make_client(2);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (_, msg) = channel.next_delivery().unwrap();

        assert_eq!(
            channel.finish(&msg.id, &other),
            Err(ChannelError::WrongOwner)
        );
        assert!(channel.finish(&msg.id, &client).is_ok());
        assert_eq!(client.stats().in_flight_count, 0);
    }

    #[tokio::test]
    async fn test_finish_after_requeue_fails() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (_, msg) = channel.next_delivery().unwrap();

        channel
            .requeue(&msg.id, &client, Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            channel.finish(&msg.id, &client),
            Err(ChannelError::NotInFlight)
        );
    }

    #[tokio::test]
    async fn test_requeue_zero_goes_to_head() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(2);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        channel.put(make_message(b'b')).await.unwrap();

        let (_, first) = channel.next_delivery().unwrap();
        channel.requeue(&first.id, &client, Duration::ZERO).unwrap();

        // the requeued message is delivered again before message 'b'
        client.set_ready_count(2);
        let (_, redelivered) = channel.next_delivery().unwrap();
        assert_eq!(redelivered.id, first.id);
        assert_eq!(redelivered.attempts, 2);
    }

    #[tokio::test]
    async fn test_deferred_becomes_pending_after_scan() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(2);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (_, msg) = channel.next_delivery().unwrap();
        channel
            .requeue(&msg.id, &client, Duration::from_millis(20))
            .unwrap();

        channel.deferred_scan();
        assert_eq!(channel.depth(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        channel.deferred_scan();
        assert_eq!(channel.depth(), 1);
    }

    #[tokio::test]
    async fn test_timeout_scan_requeues_overdue() {
        let channel = Channel::new("events", "archive", 100, Duration::from_millis(10));
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (_, msg) = channel.next_delivery().unwrap();
        assert_eq!(client.stats().in_flight_count, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.timeout_scan();

        assert_eq!(client.stats().in_flight_count, 0);
        assert_eq!(channel.depth(), 1);
        assert_eq!(
            channel.finish(&msg.id, &client),
            Err(ChannelError::NotInFlight)
        );
    }

    #[tokio::test]
    async fn test_touch_resets_deadline() {
        let channel = Channel::new("events", "archive", 100, Duration::from_millis(40));
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let (_, msg) = channel.next_delivery().unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        channel.touch(&msg.id, &client).unwrap();

        // without the touch the original deadline would have passed by now
        tokio::time::sleep(Duration::from_millis(25)).await;
        channel.timeout_scan();
        assert_eq!(channel.depth(), 0);
        assert!(channel.finish(&msg.id, &client).is_ok());
    }

    #[tokio::test]
    async fn test_pause_blocks_delivery() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.pause();
        channel.put(make_message(b'a')).await.unwrap();
        assert!(channel.next_delivery().is_none());

        channel.unpause();
        assert!(channel.next_delivery().is_some());
    }

    #[tokio::test]
    async fn test_round_robin_rotates_between_ready_clients() {
        let channel = make_channel();
        let (c1, _rx1) = make_client(1);
        let (c2, _rx2) = make_client(2);
        c1.set_ready_count(10);
        c2.set_ready_count(10);
        channel.add_client(Arc::clone(&c1));
        channel.add_client(Arc::clone(&c2));

        for b in [b'a', b'b', b'c', b'd'] {
            channel.put(make_message(b)).await.unwrap();
        }

        let mut served = Vec::new();
        for _ in 0..4 {
            let (client, _) = channel.next_delivery().unwrap();
            served.push(client.id);
        }
        assert_eq!(served, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_remove_client_requeues_in_flight() {
        let channel = make_channel();
        let (client, _rx) = make_client(1);
        client.set_ready_count(1);
        channel.add_client(Arc::clone(&client));

        channel.put(make_message(b'a')).await.unwrap();
        let _ = channel.next_delivery().unwrap();
        assert_eq!(channel.depth(), 0);

        let remaining = channel.remove_client(client.id);
        assert_eq!(remaining, 0);
        assert_eq!(channel.depth(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_matches_client_counters() {
        let channel = make_channel();
        let (c1, _rx1) = make_client(1);
        let (c2, _rx2) = make_client(2);
        c1.set_ready_count(5);
        c2.set_ready_count(5);
        channel.add_client(Arc::clone(&c1));
        channel.add_client(Arc::clone(&c2));

        for b in 0..6u8 {
            channel.put(make_message(b)).await.unwrap();
        }
        for _ in 0..6 {
            channel.next_delivery().unwrap();
        }

        let stats = channel.stats();
        let total: i64 = stats.clients.iter().map(|c| c.in_flight_count).sum();
        assert_eq!(stats.in_flight_count as i64, total);
    }
}
