//! In-process control-message transport.
//!
//! Carries encoded [`ControlMessage`] bytes between the processes of a
//! local cluster:
//! - one inbox per master, with reports routed to the active one
//! - one inbox per region server, keyed by server name

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_coord::{ControlMessage, ServerAddress};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ServerError;

/// A report as received by a master.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Server name of the sender
    pub from: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct Routes {
    masters: HashMap<ServerAddress, mpsc::Sender<Envelope>>,
    active_master: Option<ServerAddress>,
    servers: HashMap<String, mpsc::Sender<Bytes>>,
}

/// Shared routing table. Cloning is cheap.
#[derive(Clone)]
pub struct LocalTransport {
    routes: Arc<RwLock<Routes>>,
    capacity: usize,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Routes::default())),
            capacity,
        }
    }

    /// Create the inbox of a master.
    pub fn register_master(&self, address: &ServerAddress) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.write().masters.insert(address.clone(), tx);
        rx
    }

    pub fn unregister_master(&self, address: &ServerAddress) {
        let mut routes = self.routes.write();
        routes.masters.remove(address);
        if routes.active_master.as_ref() == Some(address) {
            routes.active_master = None;
        }
    }

    /// Route reports to `address` from now on.
    pub fn set_active_master(&self, address: &ServerAddress) {
        self.routes.write().active_master = Some(address.clone());
    }

    /// Stop routing to `address` unless another master already took over.
    pub fn clear_active_master(&self, address: &ServerAddress) {
        let mut routes = self.routes.write();
        if routes.active_master.as_ref() == Some(address) {
            routes.active_master = None;
        }
    }

    pub fn active_master(&self) -> Option<ServerAddress> {
        self.routes.read().active_master.clone()
    }

    /// Create the inbox of a region server.
    pub fn register_server(&self, server_name: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.write().servers.insert(server_name.to_string(), tx);
        rx
    }

    pub fn unregister_server(&self, server_name: &str) {
        self.routes.write().servers.remove(server_name);
    }

    /// Send a report from `from` to the active master.
    pub fn send_to_master(&self, from: &str, msg: &ControlMessage) -> Result<(), ServerError> {
        let routes = self.routes.read();
        let tx = routes
            .active_master
            .as_ref()
            .and_then(|a| routes.masters.get(a))
            .ok_or_else(|| ServerError::Transport("no active master".to_string()))?;
        debug!(from, msg = %msg, "Sending report to master");
        tx.try_send(Envelope {
            from: from.to_string(),
            payload: msg.encode(),
        })
        .map_err(|e| ServerError::Transport(format!("master inbox: {}", e)))
    }

    /// Send a command to one region server.
    pub fn send_to_server(
        &self,
        server_name: &str,
        msg: &ControlMessage,
    ) -> Result<(), ServerError> {
        let routes = self.routes.read();
        let tx = routes
            .servers
            .get(server_name)
            .ok_or_else(|| ServerError::UnknownServer(server_name.to_string()))?;
        debug!(to = server_name, msg = %msg, "Sending command to region server");
        tx.try_send(msg.encode())
            .map_err(|e| ServerError::Transport(format!("{} inbox: {}", server_name, e)))
    }

    /// Deliver raw bytes to a region server, bypassing encoding.
    pub fn send_raw_to_server(&self, server_name: &str, bytes: Bytes) -> Result<(), ServerError> {
        let routes = self.routes.read();
        let tx = routes
            .servers
            .get(server_name)
            .ok_or_else(|| ServerError::UnknownServer(server_name.to_string()))?;
        tx.try_send(bytes)
            .map_err(|e| ServerError::Transport(format!("{} inbox: {}", server_name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_coord::{MessageKind, RegionDescriptor};

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::parse(&format!("127.0.0.1:{}", port)).unwrap()
    }

    #[tokio::test]
    async fn test_reports_follow_active_master() {
        let transport = LocalTransport::new(8);
        let mut first = transport.register_master(&addr(16000));
        let mut second = transport.register_master(&addr(16001));

        assert!(transport
            .send_to_master("rs", &ControlMessage::report_exiting())
            .is_err());

        transport.set_active_master(&addr(16000));
        transport
            .send_to_master("rs", &ControlMessage::report_exiting())
            .unwrap();
        let envelope = first.recv().await.unwrap();
        assert_eq!(envelope.from, "rs");
        assert_eq!(
            ControlMessage::decode(&envelope.payload).unwrap(),
            ControlMessage::report_exiting()
        );

        transport.set_active_master(&addr(16001));
        transport.clear_active_master(&addr(16000));
        assert_eq!(transport.active_master(), Some(addr(16001)));
        transport
            .send_to_master("rs", &ControlMessage::report_quiesced())
            .unwrap();
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_server_inbox() {
        let transport = LocalTransport::new(8);
        let mut inbox = transport.register_server("rs1");
        let open = ControlMessage::new(MessageKind::RegionOpen, RegionDescriptor::new("r1"));
        transport.send_to_server("rs1", &open).unwrap();
        assert_eq!(
            ControlMessage::decode(&inbox.recv().await.unwrap()).unwrap(),
            open
        );

        transport.unregister_server("rs1");
        assert!(matches!(
            transport.send_to_server("rs1", &open),
            Err(ServerError::UnknownServer(_))
        ));
    }
}
