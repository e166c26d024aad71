//! Application-wide constants
//!
//! All defaults and environment variable names live here so the CLI, config
//! and protocol layers agree on a single source of truth.

/// Application name (lowercase, used in logging filters)
pub const APP_NAME: &str = "emberq";

// =============================================================================
// Environment Variables
// =============================================================================

pub const ENV_LOG: &str = "EMBERQ_LOG";
pub const ENV_TCP_ADDRESS: &str = "EMBERQ_TCP_ADDRESS";
pub const ENV_HTTP_ADDRESS: &str = "EMBERQ_HTTP_ADDRESS";
pub const ENV_LOOKUP_TCP_ADDRESS: &str = "EMBERQ_LOOKUP_TCP_ADDRESS";
pub const ENV_LOOKUP_HTTP_ADDRESS: &str = "EMBERQ_LOOKUP_HTTP_ADDRESS";
pub const ENV_BROADCAST_ADDRESS: &str = "EMBERQ_BROADCAST_ADDRESS";
pub const ENV_MEM_QUEUE_SIZE: &str = "EMBERQ_MEM_QUEUE_SIZE";
pub const ENV_MAX_RDY_COUNT: &str = "EMBERQ_MAX_RDY_COUNT";
pub const ENV_MSG_TIMEOUT: &str = "EMBERQ_MSG_TIMEOUT";
pub const ENV_CLIENT_TIMEOUT: &str = "EMBERQ_CLIENT_TIMEOUT";
pub const ENV_MAX_BODY_SIZE: &str = "EMBERQ_MAX_BODY_SIZE";
pub const ENV_LOOKUPD_TCP_ADDRESS: &str = "EMBERQ_LOOKUPD_TCP_ADDRESS";
pub const ENV_INACTIVE_PRODUCER_TIMEOUT: &str = "EMBERQ_INACTIVE_PRODUCER_TIMEOUT";

// =============================================================================
// Network Defaults
// =============================================================================

pub const DEFAULT_BROKER_TCP_ADDRESS: &str = "0.0.0.0:4150";
pub const DEFAULT_BROKER_HTTP_ADDRESS: &str = "0.0.0.0:4151";
pub const DEFAULT_LOOKUP_TCP_ADDRESS: &str = "0.0.0.0:4160";
pub const DEFAULT_LOOKUP_HTTP_ADDRESS: &str = "0.0.0.0:4161";

// =============================================================================
// Broker Defaults
// =============================================================================

/// Messages held in memory per topic and per channel
pub const DEFAULT_MEM_QUEUE_SIZE: usize = 10_000;
/// Upper bound a client may request with RDY
pub const DEFAULT_MAX_RDY_COUNT: i64 = 2500;
/// In-flight deadline before automatic requeue (ms)
pub const DEFAULT_MSG_TIMEOUT_MS: u64 = 60_000;
/// Idle bound after which an unresponsive client is disconnected (ms)
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 60_000;
/// Largest command body accepted on the wire
pub const DEFAULT_MAX_BODY_SIZE: usize = 5 * 1024 * 1024;
/// Cadence of the per-channel in-flight/deferred scans (ms)
pub const DEFAULT_QUEUE_SCAN_INTERVAL_MS: u64 = 100;
/// Longest requeue delay a client may ask for (ms)
pub const MAX_REQUEUE_DELAY_MS: u64 = 60 * 60 * 1000;
/// Outbound frames buffered per client before the pump backs off
pub const CLIENT_OUTPUT_QUEUE_SIZE: usize = 100;

// =============================================================================
// Lookup Defaults
// =============================================================================

/// Producers silent for longer than this are filtered from query results (secs)
pub const DEFAULT_INACTIVE_PRODUCER_TIMEOUT_SECS: u64 = 300;
/// Cadence of broker PINGs to its configured lookup daemons (secs)
pub const LOOKUPD_PING_INTERVAL_SECS: u64 = 15;
/// Delay before a broker retries a failed lookup daemon connection (secs)
pub const LOOKUPD_RECONNECT_DELAY_SECS: u64 = 15;

// =============================================================================
// Wire Protocol
// =============================================================================

pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const MAGIC_V1: &[u8; 4] = b"  V1";
pub const HEARTBEAT_BODY: &[u8] = b"_heartbeat_";
pub const MAX_NAME_LEN: usize = 64;

// =============================================================================
// Shutdown
// =============================================================================

/// How long graceful shutdown waits for background tasks
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;
