//! Master election.
//!
//! The master node is ephemeral: whoever creates it is leader until its
//! session ends or it resigns. Atomic create on the service gives mutual
//! exclusion.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tessera_observe::{CoordEvt, CoordKind, VizEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{CoordinationClient, CreateMode, EventKind, SessionEvent, WatchHandle};
use crate::error::{CoordError, Result};
use crate::identity::ServerAddress;
use crate::path::PathRegistry;

/// Leadership transitions of one elector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    Acquired { address: ServerAddress },
    Lost { address: ServerAddress },
}

struct ElectorInner {
    client: CoordinationClient,
    paths: PathRegistry,
    leading: Mutex<Option<ServerAddress>>,
    event_tx: broadcast::Sender<LeadershipEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ElectorInner {
    fn lose(&self, reason: &str) {
        let Some(address) = self.leading.lock().take() else {
            return;
        };
        warn!(address = %address, reason, "Leadership lost");
        self.client.meter().emit(VizEvent::Coord(CoordEvt {
            session: self.client.session_id(),
            kind: CoordKind::LeadershipLost,
        }));
        let _ = self.event_tx.send(LeadershipEvent::Lost { address });
    }
}

impl Drop for ElectorInner {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
    }
}

/// Contender for the master role.
#[derive(Clone)]
pub struct LeaderElector {
    inner: Arc<ElectorInner>,
}

impl LeaderElector {
    /// Must be called from within a tokio runtime.
    pub fn new(client: CoordinationClient) -> Self {
        let paths = PathRegistry::new(client.config());
        let (event_tx, _) = broadcast::channel(client.config().event_channel_capacity);
        let sessions = client.session_events();
        let inner = Arc::new(ElectorInner {
            client,
            paths,
            leading: Mutex::new(None),
            event_tx,
            monitor: Mutex::new(None),
        });
        let monitor = tokio::spawn(monitor_session(Arc::downgrade(&inner), sessions));
        *inner.monitor.lock() = Some(monitor);
        Self { inner }
    }

    /// Subscribe to leadership transitions.
    pub fn events(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leading.lock().is_some()
    }

    /// Try once to take the master node with `address` as its content.
    pub async fn try_become_leader(&self, address: &ServerAddress) -> Result<bool> {
        let client = &self.inner.client;
        let node = self.inner.paths.master();
        client.ensure_path(self.inner.paths.parent()).await?;

        match client
            .create(node, Bytes::from(address.to_string()), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {}
            Err(CoordError::AlreadyExists { .. }) => {
                // Our own node survives a retried create after reconnect.
                let held = client.get_data(node, false).await;
                match held {
                    Ok((data, stat))
                        if stat.ephemeral_owner == Some(client.session_id())
                            && data == address.to_string().as_bytes() => {}
                    Ok(_) | Err(CoordError::NotFound { .. }) => {
                        debug!(address = %address, "Master node held by another process");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        *self.inner.leading.lock() = Some(address.clone());
        info!(address = %address, session = client.session_id(), "Became active master");
        client.meter().emit(VizEvent::Coord(CoordEvt {
            session: client.session_id(),
            kind: CoordKind::LeaderElected {
                address: address.to_string(),
            },
        }));
        let _ = self.inner.event_tx.send(LeadershipEvent::Acquired {
            address: address.clone(),
        });
        Ok(true)
    }

    /// Call `on_vacancy` when the master node is deleted.
    ///
    /// If the node is already absent the callback runs before this returns.
    pub async fn watch_for_vacancy<F>(&self, on_vacancy: F) -> Result<WatchHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let client = &self.inner.client;
        let node = self.inner.paths.master();
        let on_vacancy = Arc::new(on_vacancy);
        let notify = on_vacancy.clone();
        let handle = client.register_watch(node, move |event| {
            if event.kind == EventKind::NodeDeleted {
                notify();
            }
        });
        if !client.exists(node, true).await? {
            on_vacancy();
        }
        Ok(handle)
    }

    /// Address in the master node, if any.
    pub async fn current_leader(&self) -> Result<Option<ServerAddress>> {
        match self
            .inner
            .client
            .get_data(self.inner.paths.master(), false)
            .await
        {
            Ok((data, _)) => {
                let text =
                    std::str::from_utf8(&data).map_err(|e| CoordError::corrupt(e.to_string()))?;
                ServerAddress::parse(text).map(Some)
            }
            Err(CoordError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block until this process is leader or `stop` is notified.
    ///
    /// Between attempts the follower waits for the master node to vanish,
    /// polling every heartbeat interval in case a watch was lost with a
    /// session.
    pub async fn wait_for_leadership(&self, address: &ServerAddress, stop: &Notify) -> Result<()> {
        let poll = self.inner.client.config().heartbeat_interval;
        loop {
            match self.try_become_leader(address).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(address = %address, error = %e, "Election attempt failed"),
            }

            let vacancy = Arc::new(Notify::new());
            let signal = vacancy.clone();
            let _watch = match self.watch_for_vacancy(move || signal.notify_one()).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Could not watch master node");
                    None
                }
            };
            debug!(address = %address, "Waiting for master vacancy");

            tokio::select! {
                _ = vacancy.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = stop.notified() => {
                    let leader = self.current_leader().await.ok().flatten();
                    return Err(CoordError::NotLeader {
                        leader: leader.map(|a| a.to_string()),
                    });
                }
            }
        }
    }

    /// Give up leadership.
    ///
    /// Deletes the master node only if it still holds this elector's address
    /// under this session.
    pub async fn resign(&self) -> Result<()> {
        let Some(address) = self.inner.leading.lock().clone() else {
            return Ok(());
        };
        let client = &self.inner.client;
        let node = self.inner.paths.master();

        match client.get_data(node, false).await {
            Ok((data, stat))
                if data == address.to_string().as_bytes()
                    && stat.ephemeral_owner == Some(client.session_id()) =>
            {
                match client.delete(node, Some(stat.version)).await {
                    Ok(())
                    | Err(CoordError::NotFound { .. })
                    | Err(CoordError::VersionMismatch { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => warn!(address = %address, "Master node held by a successor, not deleting"),
            Err(CoordError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        info!(address = %address, "Resigned as master");
        self.inner.lose("resigned");
        Ok(())
    }
}

/// Report leadership loss when the session that held it expires.
async fn monitor_session(
    inner: Weak<ElectorInner>,
    mut sessions: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match sessions.recv().await {
            Ok(SessionEvent::Expired { session_id }) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.lose(&format!("session {:#x} expired", session_id));
            }
            Ok(SessionEvent::Reconnected { .. }) => {}
            Err(RecvError::Lagged(_)) => {
                // An expiry may be among the dropped events.
                let Some(inner) = inner.upgrade() else { break };
                let held = inner.leading.lock().is_some();
                if held {
                    let client = inner.client.clone();
                    let node = inner.paths.master().to_string();
                    match client.stat(&node, false).await {
                        Ok(Some(stat)) if stat.ephemeral_owner == Some(client.session_id()) => {}
                        _ => inner.lose("master node no longer owned"),
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordConfig;
    use crate::memory::InMemoryEnsemble;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn elector(ensemble: &InMemoryEnsemble) -> LeaderElector {
        let config = CoordConfig::default().with_heartbeat_interval(Duration::from_millis(50));
        let client = CoordinationClient::connect(config, ensemble.connector())
            .await
            .unwrap();
        LeaderElector::new(client)
    }

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::parse(&format!("127.0.0.1:{}", port)).unwrap()
    }

    #[tokio::test]
    async fn test_single_winner() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let b = elector(&ensemble).await;

        assert!(a.try_become_leader(&addr(16000)).await.unwrap());
        assert!(!b.try_become_leader(&addr(16001)).await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.current_leader().await.unwrap(), Some(addr(16000)));
    }

    #[tokio::test]
    async fn test_retry_by_holder_is_idempotent() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_leader() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        assert_eq!(a.current_leader().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_vacancy_callback_when_already_vacant() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let _watch = a
            .watch_for_vacancy(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resign_hands_over() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let b = elector(&ensemble).await;
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());

        let mut events = a.events();
        let stop = Notify::new();
        let follower = {
            let b = b.clone();
            tokio::spawn(async move { b.wait_for_leadership(&addr(16001), &stop).await })
        };

        a.resign().await.unwrap();
        assert!(!a.is_leader());
        assert_eq!(
            events.recv().await.unwrap(),
            LeadershipEvent::Lost {
                address: addr(16000)
            }
        );

        timeout(Duration::from_secs(2), follower)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(b.is_leader());
        assert_eq!(a.current_leader().await.unwrap(), Some(addr(16001)));
    }

    #[tokio::test]
    async fn test_resign_leaves_successor_node() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let b = elector(&ensemble).await;
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());

        // a's session dies; b takes over before a notices.
        let a_session = a.inner.client.session_id();
        ensemble.expire_session(a_session);
        assert!(b.try_become_leader(&addr(16001)).await.unwrap());

        a.resign().await.unwrap();
        assert_eq!(b.current_leader().await.unwrap(), Some(addr(16001)));
    }

    #[tokio::test]
    async fn test_wait_stopped() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let b = elector(&ensemble).await;
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());

        let stop = Notify::new();
        stop.notify_one();
        let err = b.wait_for_leadership(&addr(16001), &stop).await.unwrap_err();
        match err {
            CoordError::NotLeader { leader } => {
                assert_eq!(leader.as_deref(), Some("127.0.0.1:16000"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_session_expiry_reports_loss() {
        let ensemble = InMemoryEnsemble::new();
        let a = elector(&ensemble).await;
        let mut events = a.events();
        assert!(a.try_become_leader(&addr(16000)).await.unwrap());
        assert!(matches!(
            events.recv().await.unwrap(),
            LeadershipEvent::Acquired { .. }
        ));

        ensemble.expire_session(a.inner.client.session_id());
        let lost = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            lost,
            LeadershipEvent::Lost {
                address: addr(16000)
            }
        );
        assert!(!a.is_leader());
    }
}
