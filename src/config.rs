//! Engine configuration and status codes.
//!
//! All tunables live in [`Config`], an immutable value injected at
//! construction. Nothing reads parameters from static storage, so tests can
//! run engines with different settings in parallel.

use std::time::Duration;

use crate::message::MAX_PAYLOAD_SIZE;

/// Tunable parameters for a routing engine instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum peers per bucket (common-prefix partition).
    pub bucket_k: usize,
    /// Size of the close set. Must not exceed `bucket_k`.
    pub closest_set_size: usize,
    /// Replication factor for group delivery.
    pub group_size: usize,
    /// Hard cap on routing table contents.
    pub max_routing_table_size: usize,
    /// Below this size the recovery loop keeps requesting more peers.
    pub routing_table_size_threshold: usize,
    /// Client-table cap on sessions per peer id.
    pub max_clients_per_id: usize,
    /// Initial hop budget on outgoing messages.
    pub hops_to_live: u16,
    /// Largest accepted payload in a single send.
    pub max_payload_size: usize,
    /// Resend interval for the initial discovery loop.
    pub find_close_node_interval: Duration,
    /// Interval of the steady-state recovery loop.
    pub find_node_interval: Duration,
    /// Delay before reacting to a lost close peer.
    pub recovery_lag: Duration,
    /// Delay before retrying a failed bootstrap.
    pub re_bootstrap_lag: Duration,
    /// Discovery attempts before falling back to re-bootstrap.
    pub max_find_close_node_failures: u32,
    /// Client nodes attach to the overlay but never relay.
    pub client: bool,
}

impl Default for Config {
    fn default() -> Self {
        let max_routing_table_size = 64;
        Self {
            bucket_k: 8,
            closest_set_size: 8,
            group_size: 4,
            max_routing_table_size,
            routing_table_size_threshold: max_routing_table_size / 2,
            max_clients_per_id: 8,
            hops_to_live: 30,
            max_payload_size: MAX_PAYLOAD_SIZE,
            find_close_node_interval: Duration::from_secs(3),
            find_node_interval: Duration::from_secs(10),
            recovery_lag: Duration::from_secs(5),
            re_bootstrap_lag: Duration::from_secs(10),
            max_find_close_node_failures: 10,
            client: false,
        }
    }
}

/// Codes delivered through the `network_status` callback.
///
/// Non-negative values passed to `network_status` are routing-table sizes;
/// the named codes here are all negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    NotJoined = -100_001,
    NetworkShuttingDown = -100_002,
    AnonymousSessionEnded = -100_003,
    PartialJoinSessionEnded = -100_004,
    BootstrapConnectionAlreadyExists = -100_005,
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> i32 {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert!(config.closest_set_size <= config.bucket_k);
        assert!(config.group_size <= config.closest_set_size);
        assert!(config.routing_table_size_threshold <= config.max_routing_table_size);
    }

    #[test]
    fn status_codes_are_negative() {
        for code in [
            StatusCode::NotJoined,
            StatusCode::NetworkShuttingDown,
            StatusCode::AnonymousSessionEnded,
            StatusCode::PartialJoinSessionEnded,
            StatusCode::BootstrapConnectionAlreadyExists,
        ] {
            assert!(i32::from(code) < 0);
        }
        assert_eq!(i32::from(StatusCode::Success), 0);
    }
}
