//! Top-level configuration.

use std::time::Duration;

use netbus_bus::BusConfig;
use netbus_transport::SocketManagerConfig;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// NetConfig
// ---------------------------------------------------------------------------

/// Everything a [`NetworkingManager`](crate::NetworkingManager) needs.
///
/// Missing fields take their defaults, so a partial JSON document works:
///
/// ```
/// let config: netbus::NetConfig =
///     serde_json::from_str(r#"{ "bus_capacity": 128 }"#).unwrap();
/// assert_eq!(config.bus_capacity, 128);
/// assert_eq!(config.max_frames_per_poll, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Maximum number of undispatched messages on the bus.
    pub bus_capacity: usize,

    /// Upper bound on one outbound TCP connect.
    pub connect_timeout: Duration,

    /// Longest the socket thread sleeps when nothing happens.
    pub poll_timeout: Duration,

    /// Frames read from one socket per loop iteration.
    pub max_frames_per_poll: usize,
}

impl NetConfig {
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn max_frames_per_poll(mut self, frames: usize) -> Self {
        self.max_frames_per_poll = frames;
        self
    }

    /// The bus half of this configuration.
    pub fn bus(&self) -> BusConfig {
        BusConfig::with_capacity(self.bus_capacity)
    }

    /// The socket-thread half of this configuration.
    pub fn sockets(&self) -> SocketManagerConfig {
        SocketManagerConfig {
            connect_timeout: self.connect_timeout,
            poll_timeout: self.poll_timeout,
            max_frames_per_poll: self.max_frames_per_poll,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        let sockets = SocketManagerConfig::default();
        Self {
            bus_capacity: BusConfig::DEFAULT_CAPACITY,
            connect_timeout: sockets.connect_timeout,
            poll_timeout: sockets.poll_timeout,
            max_frames_per_poll: sockets.max_frames_per_poll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_config_default_values() {
        let config = NetConfig::default();
        assert_eq!(config.bus_capacity, 4096);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.max_frames_per_poll, 64);
    }

    #[test]
    fn test_net_config_split_matches_fields() {
        let config = NetConfig::default()
            .bus_capacity(16)
            .connect_timeout(Duration::from_secs(1))
            .poll_timeout(Duration::from_millis(5))
            .max_frames_per_poll(2);

        assert_eq!(config.bus().capacity, 16);
        let sockets = config.sockets();
        assert_eq!(sockets.connect_timeout, Duration::from_secs(1));
        assert_eq!(sockets.poll_timeout, Duration::from_millis(5));
        assert_eq!(sockets.max_frames_per_poll, 2);
    }

    #[test]
    fn test_net_config_deserialize_partial_json_fills_defaults() {
        let json = r#"{ "poll_timeout": { "secs": 0, "nanos": 10000000 } }"#;
        let config: NetConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.bus_capacity, 4096);
    }
}
