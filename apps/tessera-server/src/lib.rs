//! Tessera server library.
//!
//! This library exposes the master, region-server and local-cluster
//! components for testing.

pub mod config;
pub mod error;
pub mod local_cluster;
pub mod master;
pub mod region_server;
pub mod transport;

pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use local_cluster::LocalCluster;
pub use master::MasterHandle;
pub use region_server::RegionServerHandle;
pub use transport::LocalTransport;
