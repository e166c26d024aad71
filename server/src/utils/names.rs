//! Topic and channel name validation

use crate::core::constants::MAX_NAME_LEN;

/// Suffix marking a channel for automatic teardown once its last consumer
/// disconnects.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Topics: 1-64 chars of `[A-Za-z0-9._-]`, no ephemeral suffix allowed.
pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

/// Channels: like topics, but may carry a trailing `#ephemeral` marker.
pub fn is_valid_channel_name(name: &str) -> bool {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    is_valid_name(base)
}

/// Whether a channel name carries the ephemeral marker.
pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with(EPHEMERAL_SUFFIX)
}
