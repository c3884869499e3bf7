//! Configuration module for the device cluster.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::node::PeerAddress;

/// Default cluster RPC port
pub const DEFAULT_PORT: u16 = 7070;

/// Default transport session inactivity threshold in seconds
pub const DEFAULT_SESSION_TIMEOUT: u64 = 300;

/// Default session-timeout sweep interval in seconds
pub const DEFAULT_SESSION_SWEEP_INTERVAL: u64 = 60;

/// Default server-side RPC timeout in seconds
pub const DEFAULT_RPC_TIMEOUT: u64 = 10;

/// Default max concurrent transport sessions per device
pub const DEFAULT_MAX_SESSIONS_PER_DEVICE: usize = 10;

/// Default pending-queue bound per peer
pub const DEFAULT_MAX_PENDING_PER_PEER: usize = 10_000;

/// Default failures tolerated within the retry window
pub const DEFAULT_MAX_FAILURES: usize = 3;

/// Default retry window in seconds
pub const DEFAULT_FAILURE_WINDOW: u64 = 60;

/// Failure budget: at most `max_failures` inside a sliding `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated inside the window
    pub max_failures: usize,
    /// Sliding window length
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_failures: DEFAULT_MAX_FAILURES,
            window: Duration::from_secs(DEFAULT_FAILURE_WINDOW),
        }
    }
}

/// Cluster configuration builder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address other nodes use to reach this node
    pub node_address: PeerAddress,

    /// Inactivity threshold after which a device transport session is evicted
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,

    /// How often each entity actor sweeps its sessions
    #[serde(with = "duration_secs")]
    pub session_sweep_interval: Duration,

    /// How long a device-to-platform RPC waits for the platform to answer
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,

    /// Max concurrent transport sessions bound to a single device
    pub max_sessions_per_device: usize,

    /// Max envelopes buffered per disconnected peer; the oldest is dropped beyond it
    pub max_pending_per_peer: usize,

    /// Retry budget for failing peer sessions
    pub session_retry: RetryPolicy,

    /// Failure budget for entity actors
    pub actor_retry: RetryPolicy,

    /// Delay before a failed outbound session is retried
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,

    /// Number of arbiters running entity actors
    pub entity_pool_size: usize,

    /// Number of arbiters running inbound session callbacks
    pub callback_pool_size: usize,

    /// Virtual nodes per member on the entity routing ring
    pub virtual_nodes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node_address: PeerAddress::new("127.0.0.1", DEFAULT_PORT),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT),
            session_sweep_interval: Duration::from_secs(DEFAULT_SESSION_SWEEP_INTERVAL),
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT),
            max_sessions_per_device: DEFAULT_MAX_SESSIONS_PER_DEVICE,
            max_pending_per_peer: DEFAULT_MAX_PENDING_PER_PEER,
            session_retry: RetryPolicy::default(),
            actor_retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_millis(500),
            entity_pool_size: 2,
            callback_pool_size: 1,
            virtual_nodes: 64,
        }
    }
}

impl ClusterConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> ClusterResult<Self> {
        let config: ClusterConfig = serde_json::from_str(json)
            .map_err(|e| ClusterError::ConfigurationError(e.to_string()))?;
        config.build()
    }

    /// Set this node's address
    pub fn node_address(mut self, address: PeerAddress) -> Self {
        self.node_address = address;
        self
    }

    /// Set the transport session inactivity threshold
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the session sweep interval
    pub fn session_sweep_interval(mut self, interval: Duration) -> Self {
        self.session_sweep_interval = interval;
        self
    }

    /// Set how long device-to-platform RPCs wait for an answer
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the max concurrent sessions per device
    pub fn max_sessions_per_device(mut self, max: usize) -> Self {
        self.max_sessions_per_device = max;
        self
    }

    /// Set the pending-queue bound per peer
    pub fn max_pending_per_peer(mut self, max: usize) -> Self {
        self.max_pending_per_peer = max;
        self
    }

    /// Set the session retry budget
    pub fn session_retry(mut self, policy: RetryPolicy) -> Self {
        self.session_retry = policy;
        self
    }

    /// Set the entity actor failure budget
    pub fn actor_retry(mut self, policy: RetryPolicy) -> Self {
        self.actor_retry = policy;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the entity pool size
    pub fn entity_pool_size(mut self, size: usize) -> Self {
        self.entity_pool_size = size;
        self
    }

    /// Set the callback pool size
    pub fn callback_pool_size(mut self, size: usize) -> Self {
        self.callback_pool_size = size;
        self
    }

    /// Set the virtual node count per ring member
    pub fn virtual_nodes(mut self, count: usize) -> Self {
        self.virtual_nodes = count;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ClusterResult<Self> {
        if self.node_address.host.is_empty() {
            return Err(ClusterError::ConfigurationError(
                "Node address must have a host".to_string(),
            ));
        }

        if self.session_timeout.is_zero() || self.session_sweep_interval.is_zero() {
            return Err(ClusterError::ConfigurationError(
                "Session timeout and sweep interval must be positive".to_string(),
            ));
        }

        if self.max_sessions_per_device == 0 || self.max_pending_per_peer == 0 {
            return Err(ClusterError::ConfigurationError(
                "Session and pending-queue limits must be positive".to_string(),
            ));
        }

        if self.session_retry.max_failures == 0 || self.actor_retry.max_failures == 0 {
            return Err(ClusterError::ConfigurationError(
                "Retry budgets must allow at least one failure".to_string(),
            ));
        }

        if self.entity_pool_size == 0 || self.callback_pool_size == 0 || self.virtual_nodes == 0 {
            return Err(ClusterError::ConfigurationError(
                "Pool sizes and virtual node count must be positive".to_string(),
            ));
        }

        if self.session_sweep_interval > self.session_timeout {
            log::warn!(
                "Session sweep interval {:?} exceeds session timeout {:?}",
                self.session_sweep_interval,
                self.session_timeout
            );
        }

        Ok(self)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.node_address.port, DEFAULT_PORT);
        assert_eq!(config.session_retry.max_failures, 3);
        assert_eq!(config.session_retry.window, Duration::from_secs(60));
        assert!(config.build().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = ClusterConfig::new()
            .node_address(PeerAddress::new("10.0.0.1", 7070))
            .session_timeout(Duration::from_secs(30))
            .session_sweep_interval(Duration::from_secs(5))
            .max_pending_per_peer(16)
            .build()
            .unwrap();

        assert_eq!(config.node_address.host, "10.0.0.1");
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_per_peer, 16);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = ClusterConfig::new().max_pending_per_peer(0).build();
        match config.unwrap_err() {
            ClusterError::ConfigurationError(msg) => assert!(msg.contains("must be positive")),
            other => panic!("Expected ConfigurationError, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = ClusterConfig::from_json(
            r#"{
                "node_address": {"host": "10.0.0.2", "port": 7071, "role": "Core"},
                "session_timeout": 120,
                "reconnect_delay": 250
            }"#,
        )
        .unwrap();

        assert_eq!(config.node_address, PeerAddress::new("10.0.0.2", 7071));
        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.rpc_timeout, Duration::from_secs(DEFAULT_RPC_TIMEOUT));
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(ClusterConfig::from_json("{not json").is_err());
    }
}
