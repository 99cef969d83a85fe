//! Coordination configuration.
//!
//! Quorum, session timing and the node layout under the cluster parent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordination layer configuration.
///
/// Example YAML:
/// ```yaml
/// quorum: "zk1:2181,zk2:2181,zk3:2181"
/// session_timeout_ms: 30000
/// parent_path: "/cluster"
/// heartbeat_interval_ms: 3000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Quorum string handed to the connector (`host:port[,host:port...]`).
    pub quorum: String,

    /// Session timeout; also the upper bound of every round trip.
    /// Default: 30s
    #[serde(rename = "session_timeout_ms", with = "duration_ms")]
    pub session_timeout: Duration,

    /// Parent node all other nodes live under.
    /// Default: `/cluster`
    pub parent_path: String,

    /// Child holding the root-catalog server address.
    pub root_node: String,

    /// Child directory of live region servers.
    pub servers_node: String,

    /// Child used for master election.
    pub master_node: String,

    /// Child whose existence means "cluster up".
    pub state_node: String,

    /// Period of the membership heartbeat chore.
    /// Default: 3s
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Capacity of the watch delivery queue.
    pub watch_queue_capacity: usize,

    /// Capacity of session/leadership event broadcast channels.
    pub event_channel_capacity: usize,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            quorum: "localhost:2181".to_string(),
            session_timeout: Duration::from_secs(30),
            parent_path: "/cluster".to_string(),
            root_node: "root".to_string(),
            servers_node: "servers".to_string(),
            master_node: "master".to_string(),
            state_node: "state".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            watch_queue_capacity: 256,
            event_channel_capacity: 64,
        }
    }
}

impl CoordConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quorum(mut self, quorum: impl Into<String>) -> Self {
        self.quorum = quorum.into();
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_parent_path(mut self, parent: impl Into<String>) -> Self {
        self.parent_path = parent.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum.trim().is_empty() {
            return Err(ConfigError::InvalidValue("quorum must not be empty".into()));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "session_timeout must be > 0".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval must be > 0".into(),
            ));
        }
        if !self.parent_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "parent_path must be absolute: {}",
                self.parent_path
            )));
        }
        for (field, child) in [
            ("root_node", &self.root_node),
            ("servers_node", &self.servers_node),
            ("master_node", &self.master_node),
            ("state_node", &self.state_node),
        ] {
            if child.is_empty() || child.contains('/') {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a single path segment: {:?}",
                    field, child
                )));
            }
        }
        if self.watch_queue_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "channel capacities must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
