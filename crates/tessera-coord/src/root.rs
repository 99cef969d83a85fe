//! Root-catalog location.
//!
//! The master publishes the address of the server hosting the root region
//! in a persistent node; clients read it to bootstrap catalog lookups.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::client::{CoordinationClient, CreateMode, EventKind};
use crate::error::{CoordError, Result};
use crate::identity::ServerAddress;
use crate::path::PathRegistry;

#[derive(Clone)]
pub struct RootLocationService {
    client: CoordinationClient,
    paths: PathRegistry,
}

impl RootLocationService {
    pub fn new(client: CoordinationClient) -> Self {
        let paths = PathRegistry::new(client.config());
        Self { client, paths }
    }

    /// Publish `address`, creating the node or overwriting its content.
    ///
    /// A create that races another creator, or an update that races a
    /// delete, is retried once from the existence check. Missing parents
    /// are created first.
    pub async fn write(&self, address: &ServerAddress) -> Result<()> {
        let path = self.paths.root_region_server();
        let data = Bytes::from(address.to_string());
        self.client.ensure_path(self.paths.parent()).await?;

        for attempt in 0..2 {
            let retry = attempt == 0;
            let updating = self.client.exists(path, false).await?;
            let outcome = if updating {
                self.client.set_data(path, data.clone(), None).await.map(|_| ())
            } else {
                self.client
                    .create(path, data.clone(), CreateMode::Persistent)
                    .await
            };
            match outcome {
                Ok(()) => {
                    info!(address = %address, "Published root location");
                    return Ok(());
                }
                Err(CoordError::NotFound { .. }) if retry && updating => {
                    debug!(path, "Root location deleted during update, retrying");
                }
                Err(CoordError::AlreadyExists { .. }) if retry => {
                    debug!(path, "Root location created concurrently, retrying");
                }
                Err(CoordError::AlreadyExists { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Err(CoordError::ConflictingWrite {
            path: path.to_string(),
        })
    }

    /// Address currently published.
    pub async fn read(&self, watch: bool) -> Result<ServerAddress> {
        let (data, _) = self
            .client
            .get_data(self.paths.root_region_server(), watch)
            .await?;
        let text = std::str::from_utf8(&data).map_err(|e| CoordError::corrupt(e.to_string()))?;
        ServerAddress::parse(text)
    }

    /// Remove the published address. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        match self
            .client
            .delete(self.paths.root_region_server(), None)
            .await
        {
            Ok(()) => info!("Cleared root location"),
            Err(CoordError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Wait up to `timeout` for an address to be published.
    pub async fn wait_for(&self, timeout: Duration) -> Result<ServerAddress> {
        let path = self.paths.root_region_server();
        let published = Arc::new(Notify::new());
        let signal = published.clone();
        let _watch = self.client.register_watch(path, move |event| {
            if matches!(event.kind, EventKind::NodeCreated | EventKind::NodeDataChanged) {
                signal.notify_one();
            }
        });
        let poll = self.client.config().heartbeat_interval;

        tokio::time::timeout(timeout, self.await_published(&published, poll))
            .await
            .map_err(|_| {
                CoordError::unavailable(format!(
                    "root location not published within {:?}",
                    timeout
                ))
            })?
    }

    async fn await_published(&self, published: &Notify, poll: Duration) -> Result<ServerAddress> {
        let path = self.paths.root_region_server();
        loop {
            if self.client.exists(path, true).await? {
                match self.read(false).await {
                    Ok(address) => return Ok(address),
                    Err(CoordError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            tokio::select! {
                _ = published.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
