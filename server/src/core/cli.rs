use clap::Parser;

use super::constants::{
    ENV_BROADCAST_ADDRESS, ENV_CLIENT_TIMEOUT, ENV_HTTP_ADDRESS, ENV_INACTIVE_PRODUCER_TIMEOUT,
    ENV_LOOKUP_HTTP_ADDRESS, ENV_LOOKUP_TCP_ADDRESS, ENV_LOOKUPD_TCP_ADDRESS, ENV_MAX_BODY_SIZE,
    ENV_MAX_RDY_COUNT, ENV_MEM_QUEUE_SIZE, ENV_MSG_TIMEOUT, ENV_TCP_ADDRESS,
};

/// Command line interface of the message daemon
#[derive(Parser, Debug)]
#[command(name = "emberqd")]
#[command(version, about = "emberq message daemon", long_about = None)]
pub struct BrokerCli {
    /// <addr>:<port> to listen on for TCP clients
    #[arg(long, env = ENV_TCP_ADDRESS)]
    pub tcp_address: Option<String>,

    /// <addr>:<port> to listen on for HTTP clients
    #[arg(long, env = ENV_HTTP_ADDRESS)]
    pub http_address: Option<String>,

    /// Address advertised to lookup daemons (defaults to a local interface)
    #[arg(long, env = ENV_BROADCAST_ADDRESS)]
    pub broadcast_address: Option<String>,

    /// Number of messages kept in memory per topic and per channel
    #[arg(long, env = ENV_MEM_QUEUE_SIZE)]
    pub mem_queue_size: Option<usize>,

    /// Maximum RDY count a client may request
    #[arg(long, env = ENV_MAX_RDY_COUNT)]
    pub max_rdy_count: Option<i64>,

    /// In-flight timeout before automatic requeue (milliseconds)
    #[arg(long, env = ENV_MSG_TIMEOUT)]
    pub msg_timeout: Option<u64>,

    /// Idle timeout before an unresponsive client is disconnected (milliseconds)
    #[arg(long, env = ENV_CLIENT_TIMEOUT)]
    pub client_timeout: Option<u64>,

    /// Maximum command body size in bytes
    #[arg(long, env = ENV_MAX_BODY_SIZE)]
    pub max_body_size: Option<usize>,

    /// <addr>:<port> of a lookup daemon to register with (repeatable)
    #[arg(long = "lookupd-tcp-address", env = ENV_LOOKUPD_TCP_ADDRESS)]
    pub lookupd_tcp_address: Vec<String>,

    /// Enable verbose (debug) logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Command line interface of the lookup daemon
#[derive(Parser, Debug)]
#[command(name = "emberq-lookupd")]
#[command(version, about = "emberq lookup daemon", long_about = None)]
pub struct LookupCli {
    /// <addr>:<port> to listen on for TCP clients
    #[arg(long, env = ENV_LOOKUP_TCP_ADDRESS)]
    pub tcp_address: Option<String>,

    /// <addr>:<port> to listen on for HTTP clients
    #[arg(long, env = ENV_LOOKUP_HTTP_ADDRESS)]
    pub http_address: Option<String>,

    /// Producers silent for longer than this are treated as inactive (seconds)
    #[arg(long, env = ENV_INACTIVE_PRODUCER_TIMEOUT)]
    pub inactive_producer_timeout: Option<u64>,

    /// Enable verbose (debug) logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Parse broker daemon arguments
pub fn parse_broker() -> BrokerCli {
    BrokerCli::parse()
}

/// Parse lookup daemon arguments
pub fn parse_lookup() -> LookupCli {
    LookupCli::parse()
}
