//! Server configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use serde::{Deserialize, Serialize};
use tessera_coord::{CoordConfig, ServerAddress};

/// Server configuration.
///
/// Example YAML:
/// ```yaml
/// bind_host: "127.0.0.1"
/// base_port: 16000
/// masters: 2
/// region_servers: 3
/// coord:
///   quorum: "zk1:2181,zk2:2181,zk3:2181"
///   parent_path: "/tessera"
///   session_timeout_ms: 30000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Coordination service settings
    #[serde(default)]
    pub coord: CoordConfig,

    /// Host every local process binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Masters use `base_port + i`, region servers `base_port + 100 + i`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Active master plus standbys
    #[serde(default = "default_masters")]
    pub masters: usize,

    #[serde(default = "default_region_servers")]
    pub region_servers: usize,

    /// Capacity of each process inbox
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

const REGION_SERVER_PORT_OFFSET: u16 = 100;
const INFO_PORT_OFFSET: u16 = 1000;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            coord: CoordConfig::default(),
            bind_host: default_bind_host(),
            base_port: default_base_port(),
            masters: default_masters(),
            region_servers: default_region_servers(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    16000
}

fn default_masters() -> usize {
    1
}

fn default_region_servers() -> usize {
    1
}

fn default_inbox_capacity() -> usize {
    1024
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables (all optional):
    /// - TESSERA_QUORUM
    /// - TESSERA_PARENT
    /// - TESSERA_REGION_SERVERS
    /// - TESSERA_BIND_HOST
    /// - TESSERA_BASE_PORT
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Ok(quorum) = std::env::var("TESSERA_QUORUM") {
            config.coord.quorum = quorum;
        }
        if let Ok(parent) = std::env::var("TESSERA_PARENT") {
            config.coord.parent_path = parent;
        }
        if let Ok(host) = std::env::var("TESSERA_BIND_HOST") {
            config.bind_host = host;
        }
        if let Ok(n) = std::env::var("TESSERA_REGION_SERVERS") {
            config.region_servers = n.parse().map_err(|e| {
                ConfigError::InvalidField(format!("Invalid TESSERA_REGION_SERVERS: {}", e))
            })?;
        }
        if let Ok(port) = std::env::var("TESSERA_BASE_PORT") {
            config.base_port = port.parse().map_err(|e| {
                ConfigError::InvalidField(format!("Invalid TESSERA_BASE_PORT: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coord
            .validate()
            .map_err(|e| ConfigError::InvalidField(e.to_string()))?;

        if self.masters == 0 {
            return Err(ConfigError::InvalidField("masters must be > 0".to_string()));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::InvalidField(
                "inbox_capacity must be > 0".to_string(),
            ));
        }
        if self.masters >= REGION_SERVER_PORT_OFFSET as usize {
            return Err(ConfigError::InvalidField(format!(
                "at most {} masters",
                REGION_SERVER_PORT_OFFSET - 1
            )));
        }
        let highest = self.base_port as usize
            + INFO_PORT_OFFSET as usize
            + REGION_SERVER_PORT_OFFSET as usize
            + self.region_servers;
        if highest > u16::MAX as usize {
            return Err(ConfigError::InvalidField(format!(
                "base_port {} leaves no room for {} region servers",
                self.base_port, self.region_servers
            )));
        }

        ServerAddress::new(self.bind_host.clone(), self.base_port).map_err(|e| {
            ConfigError::InvalidField(format!("Invalid bind_host {}: {}", self.bind_host, e))
        })?;
        Ok(())
    }

    /// Address of the `index`-th master.
    pub fn master_address(&self, index: usize) -> Result<ServerAddress, ConfigError> {
        self.address(self.base_port as usize + index)
    }

    /// Address of the `index`-th region server.
    pub fn region_server_address(&self, index: usize) -> Result<ServerAddress, ConfigError> {
        self.address(self.base_port as usize + REGION_SERVER_PORT_OFFSET as usize + index)
    }

    /// Info port paired with a process port.
    pub fn info_port(port: u16) -> u16 {
        port.saturating_add(INFO_PORT_OFFSET)
    }

    fn address(&self, port: usize) -> Result<ServerAddress, ConfigError> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| p.checked_add(INFO_PORT_OFFSET).is_some())
            .ok_or_else(|| ConfigError::InvalidField(format!("port {} out of range", port)))?;
        ServerAddress::new(self.bind_host.clone(), port)
            .map_err(|e| ConfigError::InvalidField(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.masters, 1);
        assert_eq!(config.coord.parent_path, "/cluster");
        assert_eq!(config.master_address(0).unwrap().port(), 16000);
        assert_eq!(config.region_server_address(2).unwrap().port(), 16102);
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
bind_host: "127.0.0.1"
base_port: 20000
masters: 2
region_servers: 3
coord:
  parent_path: "/tessera"
  session_timeout_ms: 5000
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.masters, 2);
        assert_eq!(config.region_servers, 3);
        assert_eq!(config.coord.parent_path, "/tessera");
        assert_eq!(config.coord.session_timeout.as_millis(), 5000);
        assert_eq!(config.inbox_capacity, 1024);
    }

    #[test]
    fn test_invalid_bind_host() {
        let config = ServerConfig {
            bind_host: "no such host.invalid".to_string(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_range() {
        let config = ServerConfig {
            base_port: 65000,
            region_servers: 10,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_masters() {
        let config = ServerConfig {
            masters: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
