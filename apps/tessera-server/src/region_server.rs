//! Region server process.
//!
//! Registers in the membership directory, keeps the registration alive with
//! a heartbeat chore and executes the commands the active master sends it.
//! Storage work (flush, compact, split) belongs to the storage engine and is
//! only acknowledged here.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_coord::{
    current_start_code, ClusterStateFlag, Connector, ControlMessage, CoordinationClient,
    Direction, MembershipService, MessageKind, RegionDescriptor, ServerAddress, ServerDescriptor,
    SessionEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::transport::LocalTransport;

struct RegionServerInner {
    descriptor: ServerDescriptor,
    server_name: String,
    client: CoordinationClient,
    membership: MembershipService,
    transport: LocalTransport,
    online: Mutex<BTreeSet<RegionDescriptor>>,
    stop: Notify,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running region server. Cloning shares the process.
#[derive(Clone)]
pub struct RegionServerHandle {
    inner: Arc<RegionServerInner>,
}

impl RegionServerHandle {
    /// Open a session, register in the directory and start serving.
    pub async fn start(
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
        transport: LocalTransport,
        address: ServerAddress,
    ) -> Result<Self, ServerError> {
        address.lookup().await?;
        let client = CoordinationClient::connect(config.coord.clone(), connector).await?;
        let info_port = ServerConfig::info_port(address.port());
        let descriptor = ServerDescriptor::new(address, current_start_code(), info_port);
        let server_name = descriptor.server_name();

        let membership = MembershipService::new(client.clone());
        let inbox = transport.register_server(&server_name);
        if let Err(e) = membership.register(&descriptor).await {
            transport.unregister_server(&server_name);
            client.close().await;
            return Err(e.into());
        }

        let inner = Arc::new(RegionServerInner {
            descriptor,
            server_name,
            client,
            membership,
            transport,
            online: Mutex::new(BTreeSet::new()),
            stop: Notify::new(),
            running: AtomicBool::new(true),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(inner.clone(), inbox));
        *inner.task.lock() = Some(task);
        Ok(Self { inner })
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.inner.descriptor
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.descriptor.address
    }

    pub fn session_id(&self) -> u64 {
        self.inner.client.session_id()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Regions currently served, in order.
    pub fn online_regions(&self) -> Vec<RegionDescriptor> {
        self.inner.online.lock().iter().cloned().collect()
    }

    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }

    pub async fn join(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(server = %self.inner.server_name, error = %e, "Region server task panicked");
            }
        }
    }
}

async fn run(inner: Arc<RegionServerInner>, mut inbox: mpsc::Receiver<Bytes>) {
    info!(
        server = %inner.server_name,
        info_port = inner.descriptor.info_port,
        "Region server started"
    );

    let heartbeat = inner
        .membership
        .heartbeat(inner.descriptor.clone())
        .start();

    let cluster_down = Arc::new(Notify::new());
    let signal = cluster_down.clone();
    let mut state_watch = ClusterStateFlag::new(inner.client.clone()).watch(move |up| {
        if !up {
            signal.notify_one();
        }
    });
    let mut sessions = inner.client.session_events();

    let reason = loop {
        tokio::select! {
            _ = inner.stop.notified() => break "stop requested",
            _ = cluster_down.notified() => break "cluster is shutting down",
            event = sessions.recv() => match event {
                Ok(SessionEvent::Reconnected { .. }) | Err(RecvError::Lagged(_)) => {
                    heartbeat.trigger_now();
                }
                Ok(_) => {}
                Err(RecvError::Closed) => break "session closed",
            },
            bytes = inbox.recv() => match bytes {
                Some(bytes) => {
                    if inner.handle_command(&bytes) {
                        break "stop requested by master";
                    }
                }
                None => break "inbox closed",
            },
        }
    };

    info!(server = %inner.server_name, reason, "Region server stopping");
    state_watch.cancel();
    heartbeat.stop();
    heartbeat.join().await;

    if let Err(e) = inner
        .transport
        .send_to_master(&inner.server_name, &ControlMessage::report_exiting())
    {
        debug!(server = %inner.server_name, error = %e, "Exit report not delivered");
    }
    if let Err(e) = inner.membership.unregister(&inner.server_name).await {
        warn!(server = %inner.server_name, error = %e, "Failed to unregister");
    }
    inner.transport.unregister_server(&inner.server_name);
    inner.client.close().await;
    inner.running.store(false, Ordering::Release);
    info!(server = %inner.server_name, "Region server stopped");
}

impl RegionServerInner {
    /// Execute one command. Returns true when the server should exit.
    fn handle_command(&self, bytes: &[u8]) -> bool {
        let Some(msg) = ControlMessage::decode_or_discard(bytes) else {
            return false;
        };
        if msg.direction() != Direction::ToRegionServer {
            warn!(server = %self.server_name, msg = %msg, "Ignoring report sent to region server");
            return false;
        }
        debug!(server = %self.server_name, msg = %msg, "Command received");

        match msg.kind {
            MessageKind::RegionOpen => {
                self.report(ControlMessage::new(
                    MessageKind::ReportProcessOpen,
                    msg.region.clone(),
                ));
                self.online.lock().insert(msg.region.clone());
                info!(server = %self.server_name, region = %msg.region, "Region opened");
                self.report(ControlMessage::new(MessageKind::ReportOpen, msg.region));
            }
            MessageKind::RegionClose => {
                self.online.lock().remove(&msg.region);
                info!(server = %self.server_name, region = %msg.region, "Region closed");
                self.report(ControlMessage::new(MessageKind::ReportClose, msg.region));
            }
            MessageKind::RegionCloseWithoutReport => {
                self.online.lock().remove(&msg.region);
            }
            MessageKind::RegionSplit
            | MessageKind::RegionCompact
            | MessageKind::RegionMajorCompact
            | MessageKind::RegionFlush => {
                info!(
                    server = %self.server_name,
                    kind = msg.kind.name(),
                    region = %msg.region,
                    "Handing request to storage engine"
                );
            }
            MessageKind::RegionServerStop => return true,
            MessageKind::RegionServerQuiesce => {
                self.report(ControlMessage::report_quiesced());
            }
            _ => {}
        }
        false
    }

    fn report(&self, msg: ControlMessage) {
        if let Err(e) = self.transport.send_to_master(&self.server_name, &msg) {
            warn!(server = %self.server_name, msg = %msg, error = %e, "Report not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_coord::{CoordError, InMemoryEnsemble};

    async fn start_server(
        ensemble: &InMemoryEnsemble,
        transport: &LocalTransport,
    ) -> RegionServerHandle {
        let config = ServerConfig::default();
        let address = config.region_server_address(0).unwrap();
        RegionServerHandle::start(&config, ensemble.connector(), transport.clone(), address)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_report_to_master() {
        let ensemble = InMemoryEnsemble::new();
        let transport = LocalTransport::new(16);
        let master = ServerConfig::default().master_address(0).unwrap();
        let mut reports = transport.register_master(&master);
        transport.set_active_master(&master);

        let server = start_server(&ensemble, &transport).await;
        assert_eq!(server.descriptor().info_port, 17100);

        let region = RegionDescriptor::new("t1,,1");
        transport
            .send_to_server(
                server.server_name(),
                &ControlMessage::new(MessageKind::RegionOpen, region.clone()),
            )
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let envelope = reports.recv().await.unwrap();
            assert_eq!(envelope.from, server.server_name());
            kinds.push(ControlMessage::decode(&envelope.payload).unwrap().kind);
        }
        assert_eq!(
            kinds,
            vec![MessageKind::ReportProcessOpen, MessageKind::ReportOpen]
        );
        assert_eq!(server.online_regions(), vec![region.clone()]);

        transport
            .send_to_server(
                server.server_name(),
                &ControlMessage::new(MessageKind::RegionClose, region),
            )
            .unwrap();
        let envelope = reports.recv().await.unwrap();
        assert_eq!(
            ControlMessage::decode(&envelope.payload).unwrap().kind,
            MessageKind::ReportClose
        );
        assert!(server.online_regions().is_empty());

        server.stop();
        server.join().await;
    }

    #[tokio::test]
    async fn test_unresolvable_address_refused() {
        let ensemble = InMemoryEnsemble::new();
        let transport = LocalTransport::new(16);
        let address = ServerAddress::new("rs9.cluster.invalid", 16100).unwrap();
        let result = RegionServerHandle::start(
            &ServerConfig::default(),
            ensemble.connector(),
            transport,
            address,
        )
        .await;
        assert!(matches!(
            result,
            Err(ServerError::Coord(CoordError::InvalidAddress { .. }))
        ));
        assert!(ensemble.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_command_unregisters() {
        let ensemble = InMemoryEnsemble::new();
        let transport = LocalTransport::new(16);
        let server = start_server(&ensemble, &transport).await;
        let node = format!("/cluster/servers/{}", server.server_name());
        assert!(ensemble.node_exists(&node));

        transport
            .send_raw_to_server(server.server_name(), Bytes::from_static(&[0xff, 0x01]))
            .unwrap();
        transport
            .send_to_server(server.server_name(), &ControlMessage::report_exiting())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_running());

        transport
            .send_to_server(server.server_name(), &ControlMessage::region_server_stop())
            .unwrap();
        server.join().await;
        assert!(!server.is_running());
        assert!(!ensemble.node_exists(&node));
    }
}
