//! V2 command encoding
//!
//! A command is a space-separated header line terminated by `\n`, optionally
//! followed by a 4-byte big-endian length and that many body bytes.

use serde::Serialize;

use crate::error::ProtocolError;
use crate::frame::MessageId;

/// Connection metadata sent with [`Command::identify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentifyConfig {
    pub short_id: String,
    pub long_id: String,
    /// Heartbeat interval in milliseconds; `None` keeps the server default,
    /// `Some(0)` disables heartbeats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

/// An encodable V2 command.
#[derive(Debug, Clone)]
pub struct Command {
    header: String,
    body: Option<Vec<u8>>,
}

impl Command {
    fn new(header: String) -> Self {
        Self { header, body: None }
    }

    fn with_body(header: String, body: Vec<u8>) -> Self {
        Self {
            header,
            body: Some(body),
        }
    }

    /// `IDENTIFY` — negotiate connection metadata, answered with `OK`.
    pub fn identify(config: &IdentifyConfig) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(config)?;
        Ok(Self::with_body("IDENTIFY".to_string(), body))
    }

    /// `SUB` — subscribe to a channel; no response on success.
    pub fn subscribe(topic: &str, channel: &str, short_id: &str, long_id: &str) -> Self {
        Self::new(format!("SUB {topic} {channel} {short_id} {long_id}"))
    }

    /// `RDY` — grant delivery credit.
    pub fn ready(count: i64) -> Self {
        Self::new(format!("RDY {count}"))
    }

    /// `PUB` — publish a single message, answered with `OK`.
    pub fn publish(topic: &str, body: &[u8]) -> Self {
        Self::with_body(format!("PUB {topic}"), body.to_vec())
    }

    /// `MPUB` — publish a batch atomically, answered with `OK`.
    pub fn mpublish(topic: &str, bodies: &[&[u8]]) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
        for b in bodies {
            body.extend_from_slice(&(b.len() as u32).to_be_bytes());
            body.extend_from_slice(b);
        }
        Self::with_body(format!("MPUB {topic}"), body)
    }

    /// `FIN` — acknowledge a delivered message.
    pub fn finish(id: &MessageId) -> Self {
        Self::new(format!("FIN {}", String::from_utf8_lossy(id)))
    }

    /// `REQ` — return a delivered message to the queue after `timeout_ms`.
    pub fn requeue(id: &MessageId, timeout_ms: u64) -> Self {
        Self::new(format!("REQ {} {timeout_ms}", String::from_utf8_lossy(id)))
    }

    /// `TOUCH` — reset the in-flight deadline of a delivered message.
    pub fn touch(id: &MessageId) -> Self {
        Self::new(format!("TOUCH {}", String::from_utf8_lossy(id)))
    }

    /// `CLS` — begin a clean close, answered with `CLOSE_WAIT`.
    pub fn close() -> Self {
        Self::new("CLS".to_string())
    }

    /// `NOP` — heartbeat acknowledgement; no response.
    pub fn nop() -> Self {
        Self::new("NOP".to_string())
    }

    /// Encode onto the wire.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.header.as_bytes());
        buf.push(b'\n');
        if let Some(body) = &self.body {
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(cmd: &Command) -> Vec<u8> {
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        buf
    }

    #[test]
    fn test_subscribe_encoding() {
        let buf = encoded(&Command::subscribe("events", "archive", "w1", "w1.local"));
        assert_eq!(buf, b"SUB events archive w1 w1.local\n");
    }

    #[test]
    fn test_publish_encoding() {
        let buf = encoded(&Command::publish("events", b"hi"));
        let mut expect = b"PUB events\n".to_vec();
        expect.extend_from_slice(&2u32.to_be_bytes());
        expect.extend_from_slice(b"hi");
        assert_eq!(buf, expect);
    }

    #[test]
    fn test_mpublish_encoding() {
        let buf = encoded(&Command::mpublish("events", &[b"a", b"bc"]));
        let mut expect = b"MPUB events\n".to_vec();
        // total body: count word + (len + "a") + (len + "bc")
        expect.extend_from_slice(&(4 + 5 + 6u32).to_be_bytes());
        expect.extend_from_slice(&2u32.to_be_bytes());
        expect.extend_from_slice(&1u32.to_be_bytes());
        expect.extend_from_slice(b"a");
        expect.extend_from_slice(&2u32.to_be_bytes());
        expect.extend_from_slice(b"bc");
        assert_eq!(buf, expect);
    }

    #[test]
    fn test_finish_encoding() {
        let id = *b"0123456789abcdef";
        let buf = encoded(&Command::finish(&id));
        assert_eq!(buf, b"FIN 0123456789abcdef\n");
    }

    #[test]
    fn test_identify_carries_json_body() {
        let cmd = Command::identify(&IdentifyConfig {
            short_id: "w1".into(),
            long_id: "w1.local".into(),
            heartbeat_interval: Some(30),
        })
        .unwrap();
        let buf = encoded(&cmd);
        assert!(buf.starts_with(b"IDENTIFY\n"));
        let len = u32::from_be_bytes(buf[9..13].try_into().unwrap()) as usize;
        let body: serde_json::Value = serde_json::from_slice(&buf[13..13 + len]).unwrap();
        assert_eq!(body["heartbeat_interval"], 30);
    }
}
