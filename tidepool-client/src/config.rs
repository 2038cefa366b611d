//! Client configuration.

use std::time::Duration;

/// Configuration for a [`StoreClient`](crate::StoreClient) and the channels
/// it manages.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Number of connections to hold per server. Requests are routed across
    /// them by hashing the caller-supplied routing key.
    pub connections_per_server: usize,

    /// Idle-read timeout on a connection, and the deadline applied to every
    /// registered request. An idle read triggers a scan of the completion
    /// tables.
    pub read_timeout: Duration,

    /// Window the authentication handshake must complete within.
    pub auth_timeout: Duration,

    /// Timeout for connection establishment.
    pub connect_timeout: Duration,

    /// Disable Nagle's algorithm on server connections.
    pub tcp_nodelay: bool,

    /// Period of the shared timeout reaper that sweeps completion tables of
    /// every channel for expired requests.
    pub tick_interval: Duration,

    /// Depth of the original timer wheel. Retained as a configuration key
    /// for compatibility; the reaper sweeps every `tick_interval` regardless.
    pub tick_count: usize,

    /// Number of ordered callback workers. Callbacks for the same ledger
    /// always land on the same worker, in submission order.
    pub callback_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections_per_server: 1,
            read_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            tick_interval: Duration::from_millis(100),
            tick_count: 1024,
            callback_workers: 1,
        }
    }
}

impl ClientConfig {
    /// Configuration tuned for low-latency local networks (and tests):
    /// short timeouts, fast reaper ticks.
    pub fn local_network() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            auth_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connections_per_server, 1);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert!(config.tcp_nodelay);
        assert_eq!(config.callback_workers, 1);
    }

    #[test]
    fn test_local_network_is_snappier() {
        let local = ClientConfig::local_network();
        let default = ClientConfig::default();
        assert!(local.read_timeout < default.read_timeout);
        assert!(local.tick_interval < default.tick_interval);
    }
}
