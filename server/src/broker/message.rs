//! Message type and identifier generation

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rand::Rng;

/// Length of a message identifier on the wire.
pub const MESSAGE_ID_LEN: usize = 16;

/// A message identifier: 16 ASCII hex bytes, unique within a topic.
pub type MessageId = [u8; MESSAGE_ID_LEN];

/// A single queued message.
///
/// Fan-out hands every channel its own `Message` value; the clones share the
/// immutable `body` while each channel advances its own `attempts` counter.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    /// Creation time in nanoseconds since the epoch
    pub timestamp: i64,
    /// Delivery attempts so far; bumped once per delivery
    pub attempts: u16,
}

impl Message {
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self {
            id,
            body,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            attempts: 0,
        }
    }

    /// Wire layout: 8-byte timestamp, 2-byte attempts, 16-byte id, body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(8 + 2 + MESSAGE_ID_LEN + self.body.len());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.attempts.to_be_bytes());
        buf.extend_from_slice(&self.id);
        buf.extend_from_slice(&self.body);
    }
}

/// Generates message identifiers from a randomly seeded sequence.
pub struct IdFactory {
    seq: AtomicU64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(rand::thread_rng().r#gen()),
        }
    }

    pub fn next_id(&self) -> MessageId {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let hex = format!("{n:016x}");
        let mut id = [0u8; MESSAGE_ID_LEN];
        id.copy_from_slice(hex.as_bytes());
        id
    }
}

impl Default for IdFactory {
    fn default() -> Self {
        Self::new()
    }
}
