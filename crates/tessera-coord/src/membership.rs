//! Region-server directory.
//!
//! Each live region server holds one ephemeral node
//! `{servers}/{hostname,port,startcode}` whose data is its `host:port`.
//! The node vanishes with the owning session, so the directory listing is
//! the set of live servers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_observe::{obs_gauge, CoordEvt, CoordKind, VizEvent};
use tracing::{debug, info, warn};

use crate::chore::{Chore, ChoreError, Duty};
use crate::client::{CoordinationClient, CreateMode, EventKind};
use crate::error::{CoordError, Result};
use crate::identity::{ServerAddress, ServerDescriptor, ServerName};
use crate::path::PathRegistry;
use crate::watcher::WatchTask;

const MEMBERSHIP_EVENTS: &[EventKind] = &[
    EventKind::NodeChildrenChanged,
    EventKind::NodeCreated,
    EventKind::NodeDeleted,
];

/// Registration and discovery of live region servers.
#[derive(Clone)]
pub struct MembershipService {
    client: CoordinationClient,
    paths: PathRegistry,
    registered: Arc<Mutex<Option<ServerDescriptor>>>,
}

impl MembershipService {
    pub fn new(client: CoordinationClient) -> Self {
        let paths = PathRegistry::new(client.config());
        Self {
            client,
            paths,
            registered: Arc::new(Mutex::new(None)),
        }
    }

    pub fn paths(&self) -> &PathRegistry {
        &self.paths
    }

    /// Descriptor passed to the last successful [`register`](Self::register).
    pub fn registered(&self) -> Option<ServerDescriptor> {
        self.registered.lock().clone()
    }

    /// Publish `descriptor` in the directory under the current session.
    ///
    /// A leftover node for the same server name from an earlier session of
    /// this process is replaced.
    pub async fn register(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let server_name = descriptor.server_name();
        let node = self.paths.server_node(&server_name);
        let data = Bytes::from(descriptor.address.to_string());

        self.client.ensure_path(self.paths.servers_dir()).await?;
        match self
            .client
            .create(&node, data.clone(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {}
            Err(CoordError::AlreadyExists { .. }) => {
                let session = self.client.session_id();
                match self.client.stat(&node, false).await? {
                    Some(stat) if stat.ephemeral_owner == Some(session) => {
                        debug!(server = %server_name, "Already registered under this session");
                    }
                    _ => {
                        info!(server = %server_name, "Replacing stale registration");
                        match self.client.delete(&node, None).await {
                            Ok(()) | Err(CoordError::NotFound { .. }) => {}
                            Err(e) => return Err(e),
                        }
                        self.client.create(&node, data, CreateMode::Ephemeral).await?;
                    }
                }
            }
            Err(e) => return Err(e),
        }

        *self.registered.lock() = Some(descriptor.clone());
        info!(
            server = %server_name,
            address = %descriptor.address,
            session = self.client.session_id(),
            "Registered region server"
        );
        self.client.meter().emit(VizEvent::Coord(CoordEvt {
            session: self.client.session_id(),
            kind: CoordKind::ServerRegistered { server_name },
        }));
        Ok(())
    }

    /// Remove one server's registration. Absent nodes are ignored.
    pub async fn unregister(&self, server_name: &str) -> Result<()> {
        match self
            .client
            .delete(&self.paths.server_node(server_name), None)
            .await
        {
            Ok(()) | Err(CoordError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let mut registered = self.registered.lock();
        if registered
            .as_ref()
            .is_some_and(|d| d.server_name() == server_name)
        {
            *registered = None;
        }
        info!(server = %server_name, "Unregistered region server");
        Ok(())
    }

    /// Servers currently in the directory.
    ///
    /// Entries that vanish mid-listing or fail to parse are skipped.
    pub async fn list_live(&self) -> Result<Vec<ServerDescriptor>> {
        self.listing(false).await
    }

    async fn listing(&self, watch: bool) -> Result<Vec<ServerDescriptor>> {
        let dir = self.paths.servers_dir();
        let children = match self.client.list_children(dir, watch).await {
            Ok(children) => children,
            Err(CoordError::NotFound { .. }) => {
                if watch {
                    // Arm creation of the directory itself.
                    self.client.exists(dir, true).await?;
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut live = Vec::with_capacity(children.len());
        for child in children {
            let name = match ServerName::parse(&child) {
                Ok(name) => name,
                Err(e) => {
                    warn!(node = %child, error = %e, "Skipping malformed registration");
                    continue;
                }
            };
            let data = match self
                .client
                .get_data(&self.paths.server_node(&child), false)
                .await
            {
                Ok((data, _)) => data,
                Err(CoordError::NotFound { .. }) => {
                    debug!(node = %child, "Registration vanished while listing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let address = match std::str::from_utf8(&data)
                .map_err(|e| CoordError::corrupt(e.to_string()))
                .and_then(ServerAddress::parse)
            {
                Ok(address) => address,
                Err(e) => {
                    warn!(node = %child, error = %e, "Skipping registration with bad address");
                    continue;
                }
            };
            live.push(ServerDescriptor::from_registration(&name, address));
        }
        obs_gauge!(self.client.meter(), "coord_live_servers", &[], live.len());
        Ok(live)
    }

    /// Deliver the full listing to `callback` now and whenever the
    /// directory changes.
    pub fn watch<F>(&self, callback: F) -> MembershipWatch
    where
        F: Fn(Vec<ServerDescriptor>) + Send + Sync + 'static,
    {
        let service = self.clone();
        let callback = Arc::new(callback);
        let task = WatchTask::spawn(
            &self.client,
            "membership",
            self.paths.servers_dir(),
            MEMBERSHIP_EVENTS,
            move |_| {
                let service = service.clone();
                let callback = callback.clone();
                async move {
                    let live = service.listing(true).await?;
                    service.client.meter().emit(VizEvent::Coord(CoordEvt {
                        session: service.client.session_id(),
                        kind: CoordKind::MembershipChanged { live: live.len() },
                    }));
                    callback(live);
                    Ok(())
                }
            },
        );
        MembershipWatch { task }
    }

    /// Delete every registration. Operator and test tooling only.
    pub async fn unregister_and_clear_all(&self) -> Result<()> {
        let children = match self
            .client
            .list_children(self.paths.servers_dir(), false)
            .await
        {
            Ok(children) => children,
            Err(CoordError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in &children {
            match self
                .client
                .delete(&self.paths.server_node(child), None)
                .await
            {
                Ok(()) | Err(CoordError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        *self.registered.lock() = None;
        info!(removed = children.len(), "Cleared server directory");
        Ok(())
    }

    /// Heartbeat chore keeping `descriptor` registered.
    pub fn heartbeat(&self, descriptor: ServerDescriptor) -> Chore<MembershipHeartbeat> {
        let period = self.client.config().heartbeat_interval;
        Chore::new(
            format!("heartbeat-{}", descriptor.server_name()),
            period,
            MembershipHeartbeat::new(self.clone(), descriptor),
        )
        .with_meter(self.client.meter())
    }
}

/// Live subscription returned by [`MembershipService::watch`].
pub struct MembershipWatch {
    task: WatchTask,
}

impl MembershipWatch {
    pub fn cancel(&mut self) {
        self.task.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Duty that keeps one server registered across session replacement.
pub struct MembershipHeartbeat {
    service: MembershipService,
    descriptor: ServerDescriptor,
    node: String,
}

impl MembershipHeartbeat {
    pub fn new(service: MembershipService, descriptor: ServerDescriptor) -> Self {
        let node = service.paths.server_node(&descriptor.server_name());
        Self {
            service,
            descriptor,
            node,
        }
    }
}

#[async_trait]
impl Duty for MembershipHeartbeat {
    async fn initial_chore(&mut self) -> std::result::Result<bool, ChoreError> {
        self.service
            .register(&self.descriptor)
            .await
            .map_err(|e| ChoreError::Recoverable(e.to_string()))?;
        Ok(true)
    }

    async fn chore(&mut self) -> std::result::Result<(), ChoreError> {
        let client = &self.service.client;
        let stat = client
            .stat(&self.node, false)
            .await
            .map_err(|e| ChoreError::Recoverable(e.to_string()))?;

        if stat.and_then(|s| s.ephemeral_owner) != Some(client.session_id()) {
            info!(node = %self.node, "Registration lost, re-registering");
            self.service
                .register(&self.descriptor)
                .await
                .map_err(|e| ChoreError::Recoverable(e.to_string()))?;
        }
        Ok(())
    }
}
