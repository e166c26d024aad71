//! Outbound frame and message decoding
//!
//! Every frame the broker writes is `[4-byte size][4-byte type][data]`, both
//! integers big-endian. The size covers the type word plus the data.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Length of a message identifier on the wire.
pub const MESSAGE_ID_LEN: usize = 16;

/// A message identifier: 16 ASCII bytes, unique within a topic.
pub type MessageId = [u8; MESSAGE_ID_LEN];

/// Frame type word of a broker frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Command acknowledgement or heartbeat
    Response,
    /// Wire-level error (`E_*` body)
    Error,
    /// A delivered message
    Message,
}

impl FrameType {
    pub(crate) fn from_wire(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// A single frame read from the broker.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub data: Bytes,
}

/// A decoded message frame payload.
///
/// Layout: 8-byte nanosecond timestamp, 2-byte attempt counter, 16-byte id,
/// then the opaque body.
#[derive(Debug, Clone)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl Message {
    /// Decode a message from the data section of a [`FrameType::Message`] frame.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        const HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedMessage(format!(
                "payload too short ({} bytes)",
                data.len()
            )));
        }

        let timestamp = i64::from_be_bytes(data[0..8].try_into().unwrap());
        let attempts = u16::from_be_bytes(data[8..10].try_into().unwrap());
        let mut id = [0u8; MESSAGE_ID_LEN];
        id.copy_from_slice(&data[10..HEADER_LEN]);

        Ok(Message {
            timestamp,
            attempts,
            id,
            body: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}
