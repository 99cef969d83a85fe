//! In-process coordination ensemble.
//!
//! Implements the service contract the client depends on without any
//! network: hierarchical nodes, persistent and ephemeral creation,
//! versioned writes, one-shot watches and sessions that tests can expire.
//!
//! Useful for:
//! - Unit tests (deterministic, no external service)
//! - The local cluster harness (master and region servers in one process)
//! - Failure tests (session expiry, service outage)

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{Connection, Connector, CreateMode, EventKind, Stat, WatchedEvent};
use crate::config::CoordConfig;
use crate::error::{CoordError, Result};

struct ZNode {
    data: Bytes,
    version: i32,
    ephemeral_owner: Option<u64>,
}

struct EnsembleState {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<u64, mpsc::UnboundedSender<WatchedEvent>>,
    next_session: u64,
    available: bool,
    /// One-shot watches armed by `exists`/`get_data`
    data_watches: HashMap<String, HashSet<u64>>,
    /// One-shot watches armed by `get_children`
    child_watches: HashMap<String, HashSet<u64>>,
}

impl EnsembleState {
    fn check_session(&self, session: u64) -> Result<()> {
        if !self.available || !self.sessions.contains_key(&session) {
            return Err(CoordError::SessionExpired {
                session_id: session,
            });
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| Stat {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children(path).len(),
        })
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(
        watches: &mut HashMap<String, HashSet<u64>>,
        path: &str,
        kind: EventKind,
    ) -> Vec<(u64, WatchedEvent)> {
        watches
            .remove(path)
            .map(|sessions| {
                let mut sessions: Vec<u64> = sessions.into_iter().collect();
                sessions.sort_unstable();
                sessions
                    .into_iter()
                    .map(|s| (s, WatchedEvent::node(kind, path)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn deliver(&self, events: Vec<(u64, WatchedEvent)>) {
        for (session, event) in events {
            if let Some(tx) = self.sessions.get(&session) {
                let _ = tx.send(event);
            }
        }
    }

    fn insert(&mut self, path: &str, data: Bytes, owner: Option<u64>) -> Result<()> {
        if path == "/" || !path.starts_with('/') || path.ends_with('/') {
            return Err(CoordError::NotFound {
                path: path.to_string(),
            });
        }
        if self.nodes.contains_key(path) {
            return Err(CoordError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let parent = parent_of(path);
        match self.nodes.get(parent) {
            None => {
                return Err(CoordError::NotFound {
                    path: parent.to_string(),
                })
            }
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(CoordError::ConflictingWrite {
                    path: path.to_string(),
                })
            }
            Some(_) => {}
        }

        self.nodes.insert(
            path.to_string(),
            ZNode {
                data,
                version: 0,
                ephemeral_owner: owner,
            },
        );

        let mut events = Self::fire(&mut self.data_watches, path, EventKind::NodeCreated);
        events.extend(Self::fire(
            &mut self.child_watches,
            parent,
            EventKind::NodeChildrenChanged,
        ));
        self.deliver(events);
        Ok(())
    }

    fn remove(&mut self, path: &str, version: Option<i32>) -> Result<()> {
        let node = self.nodes.get(path).ok_or_else(|| CoordError::NotFound {
            path: path.to_string(),
        })?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::VersionMismatch {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if !self.children(path).is_empty() {
            return Err(CoordError::NotEmpty {
                path: path.to_string(),
            });
        }
        self.nodes.remove(path);

        let mut events = Self::fire(&mut self.data_watches, path, EventKind::NodeDeleted);
        events.extend(Self::fire(&mut self.child_watches, path, EventKind::NodeDeleted));
        events.extend(Self::fire(
            &mut self.child_watches,
            parent_of(path),
            EventKind::NodeChildrenChanged,
        ));
        self.deliver(events);
        Ok(())
    }

    /// Drop a session, its ephemerals and its pending watches.
    fn end_session(&mut self, session: u64) -> Option<mpsc::UnboundedSender<WatchedEvent>> {
        let tx = self.sessions.remove(&session)?;
        for watchers in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watchers.remove(&session);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            debug!(session, path = %path, "Removing ephemeral node of ended session");
            let _ = self.remove(&path, None);
        }
        Some(tx)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Shared in-memory coordination service.
///
/// Cloning yields another handle to the same ensemble.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
    connects: Arc<AtomicUsize>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnsemble {
    /// Create an ensemble holding only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Bytes::new(),
                version: 0,
                ephemeral_owner: None,
            },
        );
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
                available: true,
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
            })),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connector opening sessions on this ensemble.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(InMemoryConnector {
            ensemble: self.clone(),
        })
    }

    /// Expire a session as the service would after a missed heartbeat.
    ///
    /// Ephemerals vanish (firing watches of other sessions) and the owner is
    /// sent a session-expired notice.
    pub fn expire_session(&self, session: u64) -> bool {
        let mut state = self.state.lock();
        match state.end_session(session) {
            Some(tx) => {
                let _ = tx.send(WatchedEvent {
                    kind: EventKind::SessionExpired,
                    path: None,
                });
                true
            }
            None => false,
        }
    }

    /// Simulate an outage: live sessions fail and new connects are refused.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Number of sessions ever opened.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn node_data(&self, path: &str) -> Option<Bytes> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    pub fn ephemeral_owner(&self, path: &str) -> Option<u64> {
        self.state.lock().nodes.get(path).and_then(|n| n.ephemeral_owner)
    }

    fn open_session(&self, watches: mpsc::UnboundedSender<WatchedEvent>) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(CoordError::unavailable("ensemble unavailable"));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, watches);
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, "Session opened");
        Ok(id)
    }
}

/// Opens sessions on an [`InMemoryEnsemble`].
pub struct InMemoryConnector {
    ensemble: InMemoryEnsemble,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        _config: &CoordConfig,
        watches: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Result<Arc<dyn Connection>> {
        let session_id = self.ensemble.open_session(watches)?;
        Ok(Arc::new(InMemoryConnection {
            ensemble: self.ensemble.clone(),
            session_id,
        }))
    }
}

/// One session on an [`InMemoryEnsemble`].
pub struct InMemoryConnection {
    ensemble: InMemoryEnsemble,
    session_id: u64,
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(state.stat(path))
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session_id),
        };
        state.insert(path, data, owner)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Bytes, Stat)> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        let stat = state.stat(path).ok_or_else(|| CoordError::NotFound {
            path: path.to_string(),
        })?;
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        let data = state.nodes[path].data.clone();
        Ok((data, stat))
    }

    async fn set_data(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        let node = state.nodes.get_mut(path).ok_or_else(|| CoordError::NotFound {
            path: path.to_string(),
        })?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(CoordError::VersionMismatch {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data;
        node.version += 1;

        let events = EnsembleState::fire(&mut state.data_watches, path, EventKind::NodeDataChanged);
        state.deliver(events);
        state.stat(path).ok_or_else(|| CoordError::NotFound {
            path: path.to_string(),
        })
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        state.remove(path, version)
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut state = self.ensemble.state.lock();
        state.check_session(self.session_id)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NotFound {
                path: path.to_string(),
            });
        }
        if watch {
            state
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(state.children(path))
    }

    async fn close(&self) {
        let mut state = self.ensemble.state.lock();
        if state.end_session(self.session_id).is_some() {
            debug!(session = self.session_id, "Session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(
        ensemble: &InMemoryEnsemble,
    ) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ensemble
            .connector()
            .connect(&CoordConfig::default(), tx)
            .await
            .unwrap();
        (conn, rx)
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        let err = conn
            .create("/a/b", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotFound { .. }));

        conn.create("/a", Bytes::new(), CreateMode::Persistent).await.unwrap();
        conn.create("/a/b", Bytes::from("x"), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(conn.get_children("/a", false).await.unwrap(), vec!["b"]);
        assert_eq!(conn.get_children("/", false).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        conn.create("/a", Bytes::new(), CreateMode::Ephemeral).await.unwrap();
        let err = conn
            .create("/a", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_versioned_writes() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        conn.create("/v", Bytes::from("0"), CreateMode::Persistent)
            .await
            .unwrap();
        let stat = conn.set_data("/v", Bytes::from("1"), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = conn.set_data("/v", Bytes::from("2"), Some(0)).await.unwrap_err();
        assert!(matches!(
            err,
            CoordError::VersionMismatch {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        let err = conn.delete("/v", Some(7)).await.unwrap_err();
        assert!(matches!(err, CoordError::VersionMismatch { .. }));
        conn.delete("/v", Some(1)).await.unwrap();
        assert!(conn.exists("/v", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_with_children_rejected() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        conn.create("/p", Bytes::new(), CreateMode::Persistent).await.unwrap();
        conn.create("/p/c", Bytes::new(), CreateMode::Persistent).await.unwrap();
        let err = conn.delete("/p", None).await.unwrap_err();
        assert!(matches!(err, CoordError::NotEmpty { .. }));
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        conn.create("/e", Bytes::new(), CreateMode::Ephemeral).await.unwrap();
        assert!(conn
            .create("/e/c", Bytes::new(), CreateMode::Persistent)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watches_are_one_shot() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, mut rx) = session(&ensemble).await;

        assert!(conn.exists("/w", true).await.unwrap().is_none());
        conn.create("/w", Bytes::new(), CreateMode::Persistent).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::node(EventKind::NodeCreated, "/w")
        );

        // Not re-armed: this write is silent.
        conn.set_data("/w", Bytes::from("x"), None).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_child_watch_fires_on_join_and_leave() {
        let ensemble = InMemoryEnsemble::new();
        let (observer, mut rx) = session(&ensemble).await;
        let (member, _member_rx) = session(&ensemble).await;

        observer
            .create("/dir", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        observer.get_children("/dir", true).await.unwrap();
        member
            .create("/dir/m1", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::node(EventKind::NodeChildrenChanged, "/dir")
        );

        observer.get_children("/dir", true).await.unwrap();
        member.close().await;
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchedEvent::node(EventKind::NodeChildrenChanged, "/dir")
        );
        assert!(!ensemble.node_exists("/dir/m1"));
    }

    #[tokio::test]
    async fn test_expired_session_loses_ephemerals() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, mut rx) = session(&ensemble).await;

        conn.create("/eph", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        conn.create("/per", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(ensemble.ephemeral_owner("/eph"), Some(conn.session_id()));

        assert!(ensemble.expire_session(conn.session_id()));
        assert!(!ensemble.node_exists("/eph"));
        assert!(ensemble.node_exists("/per"));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::SessionExpired);

        let err = conn.exists("/per", false).await.unwrap_err();
        assert!(err.is_session_loss());
    }

    #[tokio::test]
    async fn test_unavailable_ensemble_refuses_connects() {
        let ensemble = InMemoryEnsemble::new();
        let (conn, _rx) = session(&ensemble).await;

        ensemble.set_available(false);
        assert!(conn.exists("/", false).await.unwrap_err().is_session_loss());

        let (tx, _rx2) = mpsc::unbounded_channel();
        let result = ensemble
            .connector()
            .connect(&CoordConfig::default(), tx)
            .await;
        assert!(result.is_err());
        assert_eq!(ensemble.connect_count(), 1);
    }
}
