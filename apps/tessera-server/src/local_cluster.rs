//! In-process cluster: masters and region servers sharing one in-memory
//! coordination ensemble.
//!
//! Every process opens its own session, so expiring one session affects
//! exactly one process.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tessera_coord::{ClusterStatus, InMemoryEnsemble};
use tokio::time::Instant;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::master::MasterHandle;
use crate::region_server::RegionServerHandle;
use crate::transport::LocalTransport;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct LocalCluster {
    config: ServerConfig,
    ensemble: InMemoryEnsemble,
    transport: LocalTransport,
    masters: Mutex<Vec<MasterHandle>>,
    servers: Mutex<Vec<RegionServerHandle>>,
    next_server: AtomicUsize,
}

impl LocalCluster {
    /// Build a cluster with `config.masters` masters and
    /// `config.region_servers` region servers. Nothing runs until
    /// [`LocalCluster::start`].
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let transport = LocalTransport::new(config.inbox_capacity);
        Ok(Self {
            config,
            ensemble: InMemoryEnsemble::new(),
            transport,
            masters: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            next_server: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn ensemble(&self) -> &InMemoryEnsemble {
        &self.ensemble
    }

    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    /// Start all masters, then all region servers.
    pub async fn start(&self) -> Result<(), ServerError> {
        for i in 0..self.config.masters {
            let address = self.config.master_address(i)?;
            let master = MasterHandle::start(
                &self.config,
                self.ensemble.connector(),
                self.transport.clone(),
                address,
            )
            .await?;
            self.masters.lock().push(master);
        }
        for _ in 0..self.config.region_servers {
            self.add_region_server().await?;
        }
        info!(
            masters = self.config.masters,
            region_servers = self.config.region_servers,
            "Local cluster started"
        );
        Ok(())
    }

    /// Start one more region server on the next free port.
    pub async fn add_region_server(&self) -> Result<RegionServerHandle, ServerError> {
        let index = self.next_server.fetch_add(1, Ordering::SeqCst);
        let address = self.config.region_server_address(index)?;
        let server = RegionServerHandle::start(
            &self.config,
            self.ensemble.connector(),
            self.transport.clone(),
            address,
        )
        .await?;
        self.servers.lock().push(server.clone());
        Ok(server)
    }

    pub fn masters(&self) -> Vec<MasterHandle> {
        self.masters.lock().clone()
    }

    /// The master currently holding leadership.
    pub fn active_master(&self) -> Option<MasterHandle> {
        self.masters.lock().iter().find(|m| m.is_active()).cloned()
    }

    /// Every region server started so far, running or not.
    pub fn region_servers(&self) -> Vec<RegionServerHandle> {
        self.servers.lock().clone()
    }

    pub fn live_servers(&self) -> Vec<RegionServerHandle> {
        self.servers
            .lock()
            .iter()
            .filter(|s| s.is_running())
            .cloned()
            .collect()
    }

    /// Stop the `index`-th region server and wait for it to exit.
    pub async fn stop_region_server(&self, index: usize) -> Result<String, ServerError> {
        let server = self
            .servers
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| ServerError::UnknownServer(format!("region server #{}", index)))?;
        server.stop();
        server.join().await;
        Ok(server.server_name().to_string())
    }

    pub async fn wait_for_active_master(
        &self,
        timeout: Duration,
    ) -> Result<MasterHandle, ServerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(master) = self.active_master() {
                return Ok(master);
            }
            if Instant::now() >= deadline {
                return Err(ServerError::Timeout("no active master".to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll the active master's status until `accept` holds.
    pub async fn wait_for_status<F>(
        &self,
        timeout: Duration,
        what: &str,
        accept: F,
    ) -> Result<ClusterStatus, ServerError>
    where
        F: Fn(&ClusterStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.active_master().map(|m| m.cluster_status()) {
                if accept(&status) {
                    return Ok(status);
                }
            }
            if Instant::now() >= deadline {
                return Err(ServerError::Timeout(what.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the active master sees `count` live servers.
    pub async fn wait_for_servers(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<ClusterStatus, ServerError> {
        self.wait_for_status(timeout, &format!("{} live servers", count), |s| {
            s.servers_size() >= count
        })
        .await
    }

    /// Stop the standbys, then the active master, which takes the cluster
    /// down. Region servers still running afterwards are stopped directly.
    pub async fn shutdown(&self) {
        info!("Shutting down local cluster");
        let active = self.active_master();
        for master in self.masters() {
            if active.as_ref().map(|a| a.address()) != Some(master.address()) {
                master.stop();
                master.join().await;
            }
        }
        if let Some(master) = active {
            master.stop();
            master.join().await;
        }
        for server in self.region_servers() {
            server.stop();
        }
        self.join().await;
        info!("Local cluster stopped");
    }

    /// Wait for every process to exit.
    pub async fn join(&self) {
        for server in self.region_servers() {
            server.join().await;
        }
        for master in self.masters() {
            master.join().await;
        }
    }
}
