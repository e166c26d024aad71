//! The message daemon: topics, channels, consumers and the V2 wire protocol

#[allow(clippy::module_inception)]
mod broker;
pub mod channel;
pub mod client;
pub mod lookup_peer;
pub mod message;
pub mod protocol;
pub mod tcp;
pub mod topic;

pub use broker::{Broker, BrokerStats, RegistrationEvent};
pub use channel::{Channel, ChannelError};
pub use client::{ClientSession, ClientState};
pub use message::{IdFactory, Message, MessageId};
pub use topic::{Topic, TopicError};
