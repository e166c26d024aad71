//! The lookup daemon: producer/topic discovery registry and the V1 protocol

pub mod protocol;
pub mod registry;
pub mod tcp;

pub use protocol::{LookupContext, LookupProtocolV1};
pub use registry::{Producer, ProducerInfo, Registration, RegistrationDb};
