//! Per-connection consumer state
//!
//! Flow-control counters are plain atomics because the reader task and the
//! channel delivery pump update them concurrently; no lock is ever held
//! across socket I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use super::channel::Channel;
use super::protocol::Frame;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Subscribed,
    Closing,
}

impl ClientState {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => ClientState::Subscribed,
            2 => ClientState::Closing,
            _ => ClientState::Init,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Init => "init",
            ClientState::Subscribed => "subscribed",
            ClientState::Closing => "closing",
        }
    }
}

/// State of one accepted V2 connection.
pub struct ClientSession {
    pub id: u64,
    pub remote_addr: SocketAddr,
    state: AtomicI32,

    ready_count: AtomicI64,
    last_ready_count: AtomicI64,
    in_flight_count: AtomicI64,
    message_count: AtomicU64,
    finish_count: AtomicU64,
    requeue_count: AtomicU64,

    /// Heartbeat interval in milliseconds; 0 disables idle heartbeats
    heartbeat_interval_ms: AtomicU64,
    /// Wakes the heartbeat monitor when the interval changes
    heartbeat_notify: tokio::sync::Notify,
    last_activity: Mutex<Instant>,

    short_id: RwLock<String>,
    long_id: RwLock<String>,
    pub connect_time: chrono::DateTime<chrono::Utc>,

    channel: RwLock<Option<Arc<Channel>>>,
    /// Outbound frame queue drained by the connection's writer task
    pub outbound: mpsc::Sender<Frame>,
}

impl ClientSession {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        heartbeat_interval_ms: u64,
    ) -> Self {
        let identifier = remote_addr.ip().to_string();
        Self {
            id,
            remote_addr,
            state: AtomicI32::new(0),
            ready_count: AtomicI64::new(0),
            last_ready_count: AtomicI64::new(0),
            in_flight_count: AtomicI64::new(0),
            message_count: AtomicU64::new(0),
            finish_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            heartbeat_interval_ms: AtomicU64::new(heartbeat_interval_ms),
            heartbeat_notify: tokio::sync::Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            short_id: RwLock::new(identifier.clone()),
            long_id: RwLock::new(identifier),
            connect_time: chrono::Utc::now(),
            channel: RwLock::new(None),
            outbound,
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> ClientState {
        ClientState::from_i32(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ClientState) {
        self.state.store(state as i32, Ordering::SeqCst);
    }

    pub fn set_identifiers(&self, short_id: &str, long_id: &str) {
        *self.short_id.write() = short_id.to_string();
        *self.long_id.write() = long_id.to_string();
    }

    pub fn short_id(&self) -> String {
        self.short_id.read().clone()
    }

    pub fn long_id(&self) -> String {
        self.long_id.read().clone()
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.read().clone()
    }

    pub fn set_channel(&self, channel: Arc<Channel>) {
        *self.channel.write() = Some(channel);
    }

    // =========================================================================
    // Flow control
    // =========================================================================

    /// Whether the delivery pump may hand this client another message.
    pub fn is_ready_for_messages(&self) -> bool {
        if self.state() != ClientState::Subscribed {
            return false;
        }
        let ready_count = self.ready_count.load(Ordering::SeqCst);
        let last_ready_count = self.last_ready_count.load(Ordering::SeqCst);
        let in_flight_count = self.in_flight_count.load(Ordering::SeqCst);
        in_flight_count < last_ready_count && ready_count > 0
    }

    pub fn set_ready_count(&self, count: i64) {
        self.ready_count.store(count, Ordering::SeqCst);
        self.last_ready_count.store(count, Ordering::SeqCst);
        self.signal_ready_state();
    }

    /// Account one delivery: spends a unit of credit and opens an in-flight slot.
    pub fn sending_message(&self) {
        self.ready_count.fetch_sub(1, Ordering::SeqCst);
        self.in_flight_count.fetch_add(1, Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finished_message(&self) {
        self.finish_count.fetch_add(1, Ordering::SeqCst);
        self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
        self.signal_ready_state();
    }

    pub fn requeued_message(&self) {
        self.requeue_count.fetch_add(1, Ordering::SeqCst);
        self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
        self.signal_ready_state();
    }

    pub fn timed_out_message(&self) {
        self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
        self.signal_ready_state();
    }

    /// Force the client into ready 0 and mark it closing.
    pub fn start_close(&self) {
        self.set_ready_count(0);
        self.set_state(ClientState::Closing);
    }

    /// Kick the delivery pump of the subscribed channel, if any.
    ///
    /// Non-blocking: the pump coalesces wake-ups and re-checks eligibility.
    fn signal_ready_state(&self) {
        if let Some(channel) = self.channel.read().as_ref() {
            channel.notify_pump();
        }
    }

    // =========================================================================
    // Heartbeats
    // =========================================================================

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.load(Ordering::SeqCst)
    }

    pub fn set_heartbeat_interval_ms(&self, ms: u64) {
        self.heartbeat_interval_ms.store(ms, Ordering::SeqCst);
        self.heartbeat_notify.notify_one();
    }

    /// Completes when the heartbeat interval is renegotiated.
    pub async fn heartbeat_changed(&self) {
        self.heartbeat_notify.notified().await;
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_time(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            name: self.short_id(),
            remote_address: self.remote_addr.to_string(),
            state: self.state().as_str(),
            ready_count: self.ready_count.load(Ordering::SeqCst),
            in_flight_count: self.in_flight_count.load(Ordering::SeqCst),
            message_count: self.message_count.load(Ordering::SeqCst),
            finish_count: self.finish_count.load(Ordering::SeqCst),
            requeue_count: self.requeue_count.load(Ordering::SeqCst),
            connect_ts: self.connect_time.timestamp(),
        }
    }
}

/// Point-in-time counters of one client, exposed by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub name: String,
    pub remote_address: String,
    pub state: &'static str,
    pub ready_count: i64,
    pub in_flight_count: i64,
    pub message_count: u64,
    pub finish_count: u64,
    pub requeue_count: u64,
    pub connect_ts: i64,
}
