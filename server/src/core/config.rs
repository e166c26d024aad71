//! Runtime configuration for both daemons
//!
//! CLI arguments and environment variables are merged over the defaults in
//! `constants.rs`; the rest of the code only ever sees these structs.

use std::time::Duration;

use super::cli::{BrokerCli, LookupCli};
use super::constants::{
    DEFAULT_BROKER_HTTP_ADDRESS, DEFAULT_BROKER_TCP_ADDRESS, DEFAULT_CLIENT_TIMEOUT_MS,
    DEFAULT_INACTIVE_PRODUCER_TIMEOUT_SECS, DEFAULT_LOOKUP_HTTP_ADDRESS,
    DEFAULT_LOOKUP_TCP_ADDRESS, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_RDY_COUNT,
    DEFAULT_MEM_QUEUE_SIZE, DEFAULT_MSG_TIMEOUT_MS, DEFAULT_QUEUE_SCAN_INTERVAL_MS,
};

/// Configuration of the message daemon
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tcp_address: String,
    pub http_address: String,
    /// Address advertised to lookup daemons; resolved lazily when empty
    pub broadcast_address: Option<String>,
    pub mem_queue_size: usize,
    pub max_rdy_count: i64,
    pub msg_timeout: Duration,
    pub client_timeout: Duration,
    pub max_body_size: usize,
    /// Cadence of the per-channel in-flight/deferred scans
    pub queue_scan_interval: Duration,
    pub lookupd_tcp_addresses: Vec<String>,
    pub verbose: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp_address: DEFAULT_BROKER_TCP_ADDRESS.to_string(),
            http_address: DEFAULT_BROKER_HTTP_ADDRESS.to_string(),
            broadcast_address: None,
            mem_queue_size: DEFAULT_MEM_QUEUE_SIZE,
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            msg_timeout: Duration::from_millis(DEFAULT_MSG_TIMEOUT_MS),
            client_timeout: Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            queue_scan_interval: Duration::from_millis(DEFAULT_QUEUE_SCAN_INTERVAL_MS),
            lookupd_tcp_addresses: Vec::new(),
            verbose: false,
        }
    }
}

impl BrokerConfig {
    /// Merge CLI arguments over the defaults
    pub fn load(cli: &BrokerCli) -> Self {
        let defaults = Self::default();
        Self {
            tcp_address: cli.tcp_address.clone().unwrap_or(defaults.tcp_address),
            http_address: cli.http_address.clone().unwrap_or(defaults.http_address),
            broadcast_address: cli.broadcast_address.clone(),
            mem_queue_size: cli.mem_queue_size.unwrap_or(defaults.mem_queue_size),
            max_rdy_count: cli.max_rdy_count.unwrap_or(defaults.max_rdy_count),
            msg_timeout: cli
                .msg_timeout
                .map(Duration::from_millis)
                .unwrap_or(defaults.msg_timeout),
            client_timeout: cli
                .client_timeout
                .map(Duration::from_millis)
                .unwrap_or(defaults.client_timeout),
            max_body_size: cli.max_body_size.unwrap_or(defaults.max_body_size),
            queue_scan_interval: defaults.queue_scan_interval,
            lookupd_tcp_addresses: cli.lookupd_tcp_address.clone(),
            verbose: cli.verbose,
        }
    }

    /// Default heartbeat interval pushed to clients that do not negotiate one
    pub fn default_heartbeat_interval(&self) -> Duration {
        self.client_timeout / 2
    }
}

/// Configuration of the lookup daemon
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub tcp_address: String,
    pub http_address: String,
    /// Producers silent for longer than this are filtered from query results
    pub inactive_producer_timeout: Duration,
    pub verbose: bool,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            tcp_address: DEFAULT_LOOKUP_TCP_ADDRESS.to_string(),
            http_address: DEFAULT_LOOKUP_HTTP_ADDRESS.to_string(),
            inactive_producer_timeout: Duration::from_secs(
                DEFAULT_INACTIVE_PRODUCER_TIMEOUT_SECS,
            ),
            verbose: false,
        }
    }
}

impl LookupConfig {
    /// Merge CLI arguments over the defaults
    pub fn load(cli: &LookupCli) -> Self {
        let defaults = Self::default();
        Self {
            tcp_address: cli.tcp_address.clone().unwrap_or(defaults.tcp_address),
            http_address: cli.http_address.clone().unwrap_or(defaults.http_address),
            inactive_producer_timeout: cli
                .inactive_producer_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.inactive_producer_timeout),
            verbose: cli.verbose,
        }
    }
}
