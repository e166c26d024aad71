//! Client protocol library for the emberq message broker.
//!
//! Speaks both wire protocols of the broker suite: the framed V2 consumer
//! protocol of `emberqd` and the line-oriented V1 discovery protocol of
//! `emberq-lookupd`.
//!
//! ```no_run
//! use emberq::{Command, Connection, FrameType, Message};
//!
//! # async fn example() -> Result<(), emberq::ProtocolError> {
//! let mut conn = Connection::connect("127.0.0.1:4150").await?;
//! conn.send(&Command::subscribe("events", "archive", "worker", "worker.local")).await?;
//! conn.send(&Command::ready(1)).await?;
//!
//! let frame = conn.read_frame().await?;
//! if frame.frame_type == FrameType::Message {
//!     let msg = Message::decode(&frame.data)?;
//!     conn.send(&Command::finish(&msg.id)).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod command;
mod connection;
mod error;
mod frame;
mod lookup;

pub use command::{Command, IdentifyConfig};
pub use connection::Connection;
pub use error::ProtocolError;
pub use frame::{Frame, FrameType, Message, MessageId, MESSAGE_ID_LEN};
pub use lookup::{LookupConnection, PeerInfo};

/// Protocol magic sent by V2 consumer/producer connections.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Protocol magic sent by V1 lookup connections.
pub const MAGIC_V1: &[u8; 4] = b"  V1";
