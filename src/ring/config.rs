//! Liveness ring configuration parameters.

use serde::Deserialize;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Number of extra connections kept to every buddy; a buddy is watched
    /// through `1 + redundancy_level` connections.
    pub redundancy_level: u8,

    /// Timeout of an outbound connection attempt in millisecs.
    pub connect_timeout_ms: u64,

    /// Interval between heartbeat passes in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Disable Nagle's algorithm on ring sockets.
    pub tcp_nodelay: bool,

    /// Reset connections on close instead of lingering.
    pub linger_zero: bool,

    /// Backlog of the ring listener.
    pub listen_backlog: u32,

    /// Number of retries when binding the ring listener.
    pub bind_retries: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            redundancy_level: 1,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            tcp_nodelay: true,
            linger_zero: true,
            listen_backlog: 1024,
            bind_retries: 3,
        }
    }
}
