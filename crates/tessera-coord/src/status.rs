//! Cluster status snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoordError, Result};
use crate::identity::ServerDescriptor;

/// Encoding version of [`ClusterStatus`].
pub const CLUSTER_STATUS_VERSION: u8 = 1;

/// Read-only view of the cluster, rebuilt by the master on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub version: u8,
    pub live_servers: Vec<ServerDescriptor>,
    pub dead_server_names: Vec<String>,
    /// Region name to transition state
    pub regions_in_transition: BTreeMap<String, String>,
}

impl ClusterStatus {
    pub fn snapshot(
        live_servers: Vec<ServerDescriptor>,
        dead_server_names: Vec<String>,
        regions_in_transition: BTreeMap<String, String>,
    ) -> Self {
        Self {
            version: CLUSTER_STATUS_VERSION,
            live_servers,
            dead_server_names,
            regions_in_transition,
        }
    }

    pub fn servers_size(&self) -> usize {
        self.live_servers.len()
    }

    pub fn dead_servers_size(&self) -> usize {
        self.dead_server_names.len()
    }

    /// Mean balancing load of the live servers; 0.0 with none.
    pub fn average_load(&self) -> f64 {
        if self.live_servers.is_empty() {
            return 0.0;
        }
        let total: u64 = self
            .live_servers
            .iter()
            .map(|s| s.load.load() as u64)
            .sum();
        total as f64 / self.live_servers.len() as f64
    }

    pub fn regions_count(&self) -> u64 {
        self.live_servers.iter().map(|s| s.load.regions as u64).sum()
    }

    pub fn requests_count(&self) -> u64 {
        self.live_servers
            .iter()
            .map(|s| s.load.requests as u64)
            .sum()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.live_servers.iter().map(|s| s.server_name()).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let status: ClusterStatus = bincode::deserialize(data)?;
        if status.version != CLUSTER_STATUS_VERSION {
            return Err(CoordError::corrupt(format!(
                "unsupported cluster status version {}",
                status.version
            )));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::identity::{ServerAddress, ServerLoad};

    fn server(port: u16, requests: u32, regions: u32) -> ServerDescriptor {
        let mut d = ServerDescriptor::new(
            ServerAddress::parse(&format!("127.0.0.1:{}", port)).unwrap(),
            1,
            port + 10,
        );
        d.set_load(ServerLoad::new(requests, regions));
        d
    }

    #[test]
    fn test_empty_cluster() {
        let status = ClusterStatus::snapshot(vec![], vec![], BTreeMap::new());
        assert_eq!(status.servers_size(), 0);
        assert_eq!(status.average_load(), 0.0);
        assert_eq!(status.regions_count(), 0);
        assert_eq!(status.version, CLUSTER_STATUS_VERSION);
    }

    #[test]
    fn test_derived_metrics() {
        let status = ClusterStatus::snapshot(
            vec![server(16020, 100, 4), server(16021, 50, 0)],
            vec!["gone,1,1".into()],
            BTreeMap::from([("r1".to_string(), "OPENING".to_string())]),
        );
        assert_eq!(status.servers_size(), 2);
        assert_eq!(status.dead_servers_size(), 1);
        assert_eq!(status.regions_count(), 4);
        assert_eq!(status.requests_count(), 150);
        // Idle server counts as load 1.
        assert_eq!(status.average_load(), 2.5);
        assert_eq!(
            status.server_names(),
            vec!["127.0.0.1,16020,1", "127.0.0.1,16021,1"]
        );
    }

    #[test]
    fn test_encoding() {
        let status = ClusterStatus::snapshot(
            vec![server(16020, 1, 1)],
            vec![],
            BTreeMap::from([("r1".to_string(), "CLOSING".to_string())]),
        );
        let decoded = ClusterStatus::decode(&status.encode().unwrap()).unwrap();
        assert_eq!(decoded, status);

        let mut future = status.clone();
        future.version = 2;
        let err = ClusterStatus::decode(&future.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMessage);

        let err = ClusterStatus::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMessage);
    }
}
