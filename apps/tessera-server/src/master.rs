//! Master process.
//!
//! Every master contends for leadership; the active one:
//! - bootstraps the node layout and marks the cluster up
//! - tracks live and dead region servers from the membership directory
//! - assigns the root region and publishes its location
//! - answers cluster status requests
//!
//! Standby masters block in the election until the active one goes away.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_coord::{
    ClusterStateFlag, ClusterStatus, Connector, ControlMessage, CoordError, CoordinationClient,
    Direction, LeaderElector, LeadershipEvent, MembershipService, MessageKind, PathRegistry,
    RegionDescriptor, RootLocationService, ServerAddress, ServerDescriptor, ServerLoad,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::transport::{Envelope, LocalTransport};

/// Name of the root catalog region.
pub const ROOT_REGION: &str = "-ROOT-,,0";

pub fn root_region() -> RegionDescriptor {
    RegionDescriptor::new(ROOT_REGION)
}

/// Master-side view of the cluster.
#[derive(Default)]
struct Bookkeeping {
    live: BTreeMap<String, ServerDescriptor>,
    loads: HashMap<String, ServerLoad>,
    /// Servers lost and not seen since; pruned when a name re-registers
    dead: BTreeSet<String>,
    transitions: BTreeMap<String, String>,
    /// Server the root region is assigned to
    root_server: Option<String>,
    /// Root location found in the coordination service on takeover
    adopted_root: Option<ServerAddress>,
}

impl Bookkeeping {
    fn server_lost(&mut self, name: &str, reason: &str) {
        if self.live.remove(name).is_none() {
            return;
        }
        self.loads.remove(name);
        self.dead.insert(name.to_string());
        self.transitions
            .retain(|_, state| !state.ends_with(&format!(" on {}", name)));
        if self.root_server.as_deref() == Some(name) {
            self.root_server = None;
        }
        warn!(server = %name, reason, "Region server lost");
    }

    /// Apply a directory listing: drop servers that left, admit new ones.
    ///
    /// A dead server listed again re-registered after losing its session
    /// and is admitted as live. Returns the names that came back that way.
    fn apply_listing(&mut self, listed: BTreeMap<String, ServerDescriptor>) -> Vec<String> {
        let gone: Vec<String> = self
            .live
            .keys()
            .filter(|name| !listed.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            self.server_lost(&name, "left the directory");
        }

        let mut rejoined = Vec::new();
        for (name, descriptor) in listed {
            if self.live.contains_key(&name) {
                continue;
            }
            if self.dead.remove(&name) {
                info!(server = %name, address = %descriptor.address, "Region server rejoined");
                rejoined.push(name.clone());
            } else {
                info!(server = %name, address = %descriptor.address, "Region server joined");
            }
            self.live.insert(name, descriptor);
        }
        rejoined
    }

    /// Pick a server for the root region if it has none.
    ///
    /// Returns the server to send `RegionOpen` to.
    fn assign_root(&mut self) -> Option<String> {
        if self.root_server.is_some() || self.live.is_empty() {
            return None;
        }
        if let Some(adopted) = self.adopted_root.take() {
            if let Some((name, _)) = self.live.iter().find(|(_, d)| d.address == adopted) {
                info!(server = %name, "Adopted existing root assignment");
                self.root_server = Some(name.clone());
                return None;
            }
        }
        let target = self.live.keys().next()?.clone();
        self.root_server = Some(target.clone());
        self.transitions
            .insert(ROOT_REGION.to_string(), format!("PENDING_OPEN on {}", target));
        Some(target)
    }

    fn adjust_regions(&mut self, name: &str, delta: i32) {
        if !self.live.contains_key(name) {
            return;
        }
        let load = self.loads.entry(name.to_string()).or_default();
        load.regions = load.regions.saturating_add_signed(delta);
        load.requests = load.requests.saturating_add(1);
    }
}

struct MasterInner {
    address: ServerAddress,
    client: CoordinationClient,
    elector: LeaderElector,
    transport: LocalTransport,
    book: Mutex<Bookkeeping>,
    stop: Notify,
    running: AtomicBool,
    /// Set once takeover completed, cleared when stepping down
    active: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Exit {
    Shutdown,
    LostLeadership,
}

/// Handle to a running master. Cloning shares the process.
#[derive(Clone)]
pub struct MasterHandle {
    inner: Arc<MasterInner>,
}

impl MasterHandle {
    /// Open a session and start contending for leadership.
    pub async fn start(
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
        transport: LocalTransport,
        address: ServerAddress,
    ) -> Result<Self, ServerError> {
        address.lookup().await?;
        let client = CoordinationClient::connect(config.coord.clone(), connector).await?;
        let elector = LeaderElector::new(client.clone());
        let inbox = transport.register_master(&address);

        let inner = Arc::new(MasterInner {
            address,
            client,
            elector,
            transport,
            book: Mutex::new(Bookkeeping::default()),
            stop: Notify::new(),
            running: AtomicBool::new(true),
            active: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(inner.clone(), inbox));
        *inner.task.lock() = Some(task);
        Ok(Self { inner })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn session_id(&self) -> u64 {
        self.inner.client.session_id()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// True while this master holds leadership and has finished taking over.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire) && self.inner.elector.is_leader()
    }

    /// Fresh snapshot of the cluster as this master sees it.
    pub fn cluster_status(&self) -> ClusterStatus {
        let book = self.inner.book.lock();
        let live = book
            .live
            .iter()
            .map(|(name, d)| {
                let mut d = d.clone();
                d.set_load(book.loads.get(name).copied().unwrap_or_default());
                d
            })
            .collect();
        ClusterStatus::snapshot(
            live,
            book.dead.iter().cloned().collect(),
            book.transitions.clone(),
        )
    }

    /// Server currently assigned the root region.
    pub fn root_server(&self) -> Option<String> {
        self.inner.book.lock().root_server.clone()
    }

    /// Ask the master to stop. An active master shuts the cluster down.
    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }

    pub async fn join(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(address = %self.inner.address, error = %e, "Master task panicked");
            }
        }
    }
}

async fn run(inner: Arc<MasterInner>, mut inbox: mpsc::Receiver<Envelope>) {
    info!(address = %inner.address, "Master started, waiting for leadership");
    let mut leadership = inner.elector.events();

    if let Err(e) = inner
        .elector
        .wait_for_leadership(&inner.address, &inner.stop)
        .await
    {
        info!(address = %inner.address, reason = %e, "Master stopped while standby");
        inner.finish().await;
        return;
    }

    if let Err(e) = inner.become_active().await {
        error!(address = %inner.address, error = %e, "Failed to take over as active master");
        if let Err(e) = inner.elector.resign().await {
            warn!(error = %e, "Resign after failed takeover failed");
        }
        inner.transport.clear_active_master(&inner.address);
        inner.finish().await;
        return;
    }

    inner.active.store(true, Ordering::Release);

    let (listing_tx, mut listings) = mpsc::unbounded_channel();
    let mut membership_watch = MembershipService::new(inner.client.clone()).watch(move |live| {
        let _ = listing_tx.send(live);
    });

    let exit = loop {
        tokio::select! {
            _ = inner.stop.notified() => break Exit::Shutdown,
            event = leadership.recv() => match event {
                Ok(LeadershipEvent::Lost { .. }) | Err(RecvError::Closed) => break Exit::LostLeadership,
                Ok(LeadershipEvent::Acquired { .. }) => {}
                Err(RecvError::Lagged(_)) => {
                    if !inner.elector.is_leader() {
                        break Exit::LostLeadership;
                    }
                }
            },
            Some(live) = listings.recv() => inner.reconcile(live),
            Some(envelope) = inbox.recv() => inner.handle_report(envelope).await,
        }
    };

    membership_watch.cancel();
    inner.active.store(false, Ordering::Release);
    match exit {
        Exit::Shutdown => inner.shutdown_cluster().await,
        Exit::LostLeadership => {
            warn!(address = %inner.address, "Leadership lost, stepping down");
        }
    }
    inner.transport.clear_active_master(&inner.address);
    inner.finish().await;
}

impl MasterInner {
    async fn become_active(&self) -> Result<(), CoordError> {
        self.transport.set_active_master(&self.address);
        PathRegistry::new(self.client.config())
            .bootstrap(&self.client)
            .await?;
        ClusterStateFlag::new(self.client.clone()).set_up().await?;

        match RootLocationService::new(self.client.clone()).read(false).await {
            Ok(address) => {
                debug!(root = %address, "Found published root location");
                self.book.lock().adopted_root = Some(address);
            }
            Err(CoordError::NotFound { .. }) => {}
            Err(e) => warn!(error = %e, "Could not read root location"),
        }
        info!(address = %self.address, "Active master ready");
        Ok(())
    }

    /// Apply a fresh directory listing.
    fn reconcile(&self, live: Vec<ServerDescriptor>) {
        let (target, stale) = {
            let mut book = self.book.lock();
            let listed: BTreeMap<String, ServerDescriptor> =
                live.into_iter().map(|d| (d.server_name(), d)).collect();
            let rejoined = book.apply_listing(listed);
            let target = book.assign_root();
            // The root may have moved while they were gone.
            let stale: Vec<String> = rejoined
                .into_iter()
                .filter(|name| book.root_server.as_deref() != Some(name.as_str()))
                .collect();
            (target, stale)
        };
        let close = ControlMessage::new(MessageKind::RegionCloseWithoutReport, root_region());
        for server in &stale {
            if let Err(e) = self.transport.send_to_server(server, &close) {
                debug!(server = %server, error = %e, "Stale root close not delivered");
            }
        }
        self.open_root_on(target);
    }

    fn open_root_on(&self, target: Option<String>) {
        let Some(server) = target else { return };
        info!(server = %server, region = ROOT_REGION, "Assigning root region");
        let msg = ControlMessage::new(MessageKind::RegionOpen, root_region());
        if let Err(e) = self.transport.send_to_server(&server, &msg) {
            warn!(server = %server, error = %e, "Root assignment not delivered");
            let mut book = self.book.lock();
            book.root_server = None;
            book.transitions.remove(ROOT_REGION);
        }
    }

    async fn handle_report(&self, envelope: Envelope) {
        let Some(msg) = ControlMessage::decode_or_discard(&envelope.payload) else {
            return;
        };
        if msg.direction() != Direction::ToMaster {
            warn!(from = %envelope.from, msg = %msg, "Ignoring command sent to master");
            return;
        }
        let from = envelope.from.as_str();
        let region = msg.region.name_as_string();
        debug!(from, msg = %msg, "Report received");

        match &msg.kind {
            MessageKind::ReportProcessOpen => {
                self.book
                    .lock()
                    .transitions
                    .insert(region, format!("OPENING on {}", from));
            }
            MessageKind::ReportOpen => {
                let address = {
                    let mut book = self.book.lock();
                    book.transitions.remove(&region);
                    book.adjust_regions(from, 1);
                    book.live.get(from).map(|d| d.address.clone())
                };
                if msg.region == root_region() {
                    match address {
                        Some(address) => {
                            if let Err(e) = RootLocationService::new(self.client.clone())
                                .write(&address)
                                .await
                            {
                                error!(error = %e, "Failed to publish root location");
                            }
                        }
                        None => warn!(from, "Root opened on unknown server"),
                    }
                }
            }
            MessageKind::ReportClose => {
                let target = {
                    let mut book = self.book.lock();
                    book.transitions.remove(&region);
                    book.adjust_regions(from, -1);
                    if msg.region == root_region() && book.root_server.as_deref() == Some(from) {
                        book.root_server = None;
                        book.assign_root()
                    } else {
                        None
                    }
                };
                self.open_root_on(target);
            }
            MessageKind::ReportSplit => {
                info!(from, region = %region, "Region split");
                self.book.lock().transitions.remove(&region);
            }
            MessageKind::ReportSplitIncludesDaughters {
                daughter_a,
                daughter_b,
            } => {
                info!(
                    from,
                    region = %region,
                    daughter_a = %daughter_a,
                    daughter_b = %daughter_b,
                    "Region split into daughters"
                );
                self.book.lock().transitions.remove(&region);
            }
            MessageKind::ReportExiting => {
                let target = {
                    let mut book = self.book.lock();
                    book.server_lost(from, "reported exiting");
                    book.assign_root()
                };
                self.open_root_on(target);
            }
            MessageKind::ReportQuiesced => info!(from, "Region server quiesced"),
            _ => {}
        }
    }

    async fn shutdown_cluster(&self) {
        info!(address = %self.address, "Shutting down cluster");
        if let Err(e) = ClusterStateFlag::new(self.client.clone()).set_down().await {
            warn!(error = %e, "Failed to mark cluster down");
        }

        let servers: Vec<String> = self.book.lock().live.keys().cloned().collect();
        let stop = ControlMessage::region_server_stop();
        for server in &servers {
            if let Err(e) = self.transport.send_to_server(server, &stop) {
                debug!(server = %server, error = %e, "Stop not delivered");
            }
        }

        if let Err(e) = RootLocationService::new(self.client.clone()).clear().await {
            warn!(error = %e, "Failed to clear root location");
        }
        if let Err(e) = self.elector.resign().await {
            warn!(error = %e, "Failed to resign");
        }
    }

    async fn finish(&self) {
        self.transport.unregister_master(&self.address);
        self.client.close().await;
        self.running.store(false, Ordering::Release);
        info!(address = %self.address, "Master stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_coord::ServerName;

    fn descriptor(port: u16) -> ServerDescriptor {
        ServerDescriptor::new(
            ServerAddress::parse(&format!("127.0.0.1:{}", port)).unwrap(),
            1,
            0,
        )
    }

    #[test]
    fn test_root_assigned_once_to_first_server() {
        let mut book = Bookkeeping::default();
        assert_eq!(book.assign_root(), None);

        for port in [16101, 16100] {
            let d = descriptor(port);
            book.live.insert(d.server_name(), d);
        }
        let first = book.assign_root().unwrap();
        assert_eq!(ServerName::parse(&first).unwrap().port, 16100);
        assert!(book.transitions.contains_key(ROOT_REGION));
        assert_eq!(book.assign_root(), None);
    }

    #[test]
    fn test_lost_server_releases_root() {
        let mut book = Bookkeeping::default();
        let d = descriptor(16100);
        let name = d.server_name();
        book.live.insert(name.clone(), d);
        book.assign_root();

        book.server_lost(&name, "test");
        book.server_lost(&name, "test");
        assert_eq!(book.dead.iter().collect::<Vec<_>>(), vec![&name]);
        assert!(book.root_server.is_none());
        assert!(book.transitions.is_empty());
    }

    #[test]
    fn test_listing_readmits_dead_server() {
        let mut book = Bookkeeping::default();
        let a = descriptor(16100);
        let b = descriptor(16101);
        let listing = |ds: &[&ServerDescriptor]| -> BTreeMap<String, ServerDescriptor> {
            ds.iter().map(|d| (d.server_name(), (*d).clone())).collect()
        };

        assert!(book.apply_listing(listing(&[&a, &b])).is_empty());
        assert_eq!(book.live.len(), 2);

        // Session expired: the registration vanished
        assert!(book.apply_listing(listing(&[&a])).is_empty());
        assert!(book.dead.contains(&b.server_name()));
        assert_eq!(book.live.len(), 1);

        // Heartbeat re-registered it under the same name
        let rejoined = book.apply_listing(listing(&[&a, &b]));
        assert_eq!(rejoined, vec![b.server_name()]);
        assert!(book.dead.is_empty());
        assert_eq!(book.live.len(), 2);
        assert!(book.apply_listing(listing(&[&a, &b])).is_empty());
    }

    #[test]
    fn test_adopts_published_root() {
        let mut book = Bookkeeping::default();
        let d = descriptor(16100);
        book.adopted_root = Some(d.address.clone());
        book.live.insert(d.server_name(), d.clone());

        assert_eq!(book.assign_root(), None);
        assert_eq!(book.root_server, Some(d.server_name()));
    }
}
