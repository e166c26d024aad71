//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use config::{BrokerConfig, LookupConfig};
pub use shutdown::ShutdownService;
