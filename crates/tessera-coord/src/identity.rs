//! Server identity model.
//!
//! Network addresses, server descriptors with their canonical
//! `hostname,port,startcode` names, and region-to-server bindings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoordError, Result};

/// Separator between the fields of a server name.
pub const SERVER_NAME_SEPARATOR: char = ',';

/// A `host:port` pair.
///
/// [`ServerAddress::resolve`] is the constructor for a process's own
/// address and checks the host resolves. [`ServerAddress::new`] and
/// [`ServerAddress::parse`] only check syntax and never block, so addresses
/// read back from the coordination service are taken as registered.
///
/// Equality and ordering follow the canonical `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Build an address from a literal IP or a syntactically valid hostname.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        if host.is_empty() {
            return Err(CoordError::InvalidAddress {
                address: format!(":{}", port),
                reason: "empty host".into(),
            });
        }
        if host.parse::<IpAddr>().is_err() && !is_hostname(&host) {
            return Err(CoordError::InvalidAddress {
                address: format!("{}:{}", host, port),
                reason: "not an IP literal or hostname".into(),
            });
        }
        Ok(Self { host, port })
    }

    /// Build an address whose host must resolve.
    pub async fn resolve(host: impl Into<String>, port: u16) -> Result<Self> {
        let address = Self::new(host, port)?;
        address.lookup().await?;
        Ok(address)
    }

    /// Parse a canonical `host:port` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| CoordError::InvalidAddress {
            address: s.to_string(),
            reason: "expected host:port".into(),
        })?;
        let port = port.parse::<u16>().map_err(|e| CoordError::InvalidAddress {
            address: s.to_string(),
            reason: format!("bad port: {}", e),
        })?;
        Self::new(host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address without blocking the runtime.
    pub async fn lookup(&self) -> Result<SocketAddr> {
        let unresolved = |reason: String| CoordError::InvalidAddress {
            address: self.to_string(),
            reason,
        };
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| unresolved(format!("lookup failed: {}", e)))?;
        addrs
            .next()
            .ok_or_else(|| unresolved("host does not resolve".into()))
    }
}

/// RFC 1123 hostname: dot-separated labels of alphanumerics and inner hyphens.
fn is_hostname(host: &str) -> bool {
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl PartialOrd for ServerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

/// Load a region server reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    /// Requests served since the last report
    pub requests: u32,
    /// Regions currently online
    pub regions: u32,
    pub memstore_size_mb: u32,
    pub used_heap_mb: u32,
    pub max_heap_mb: u32,
}

impl ServerLoad {
    pub fn new(requests: u32, regions: u32) -> Self {
        Self {
            requests,
            regions,
            ..Self::default()
        }
    }

    /// Load value used for balancing: the number of online regions.
    ///
    /// An idle server still counts as 1.
    pub fn load(&self) -> u32 {
        self.regions.max(1)
    }
}

/// Parsed form of a server name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub hostname: String,
    pub port: u16,
    pub start_code: i64,
}

impl ServerName {
    pub fn new(hostname: impl Into<String>, port: u16, start_code: i64) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            start_code,
        }
    }

    /// Parse `hostname,port,startcode`.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |reason: &str| CoordError::InvalidServerName {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let mut fields = name.split(SERVER_NAME_SEPARATOR);
        let (hostname, port, start_code) = match (fields.next(), fields.next(), fields.next()) {
            (Some(h), Some(p), Some(s)) if fields.next().is_none() => (h, p, s),
            _ => return Err(invalid("expected hostname,port,startcode")),
        };
        if hostname.is_empty() {
            return Err(invalid("empty hostname"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        let start_code = start_code
            .parse::<i64>()
            .map_err(|_| invalid("bad start code"))?;
        Ok(Self::new(hostname, port, start_code))
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.hostname,
            self.port,
            self.start_code,
            sep = SERVER_NAME_SEPARATOR
        )
    }
}

/// One run of a server process.
///
/// Created once at process start. Only `load` changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub address: ServerAddress,
    pub start_code: i64,
    pub info_port: u16,
    pub hostname: String,
    pub load: ServerLoad,
}

impl ServerDescriptor {
    /// Descriptor whose hostname is the address host.
    pub fn new(address: ServerAddress, start_code: i64, info_port: u16) -> Self {
        Self {
            hostname: address.host().to_string(),
            address,
            start_code,
            info_port,
            load: ServerLoad::default(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Canonical `hostname,port,startcode` identity.
    pub fn server_name(&self) -> String {
        self.name().to_string()
    }

    pub fn name(&self) -> ServerName {
        ServerName::new(self.hostname.clone(), self.address.port(), self.start_code)
    }

    pub fn set_load(&mut self, load: ServerLoad) {
        self.load = load;
    }

    /// Rebuild a descriptor from a directory registration.
    ///
    /// Load and info port are not part of the registration and come back
    /// zeroed.
    pub fn from_registration(name: &ServerName, address: ServerAddress) -> Self {
        Self {
            address,
            start_code: name.start_code,
            info_port: 0,
            hostname: name.hostname.clone(),
            load: ServerLoad::default(),
        }
    }
}

/// Milliseconds since the epoch, used as a process start code.
pub fn current_start_code() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Opaque region identity supplied by the storage engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionDescriptor(pub Bytes);

impl RegionDescriptor {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    /// Sentinel used by cluster-wide commands.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn name_as_string(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name_as_string())
    }
}

/// A region bound to the server hosting it.
///
/// Ordered by region, then server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionLocation {
    pub region: RegionDescriptor,
    pub server: ServerAddress,
}

impl RegionLocation {
    pub fn new(region: RegionDescriptor, server: ServerAddress) -> Self {
        Self { region, server }
    }
}
