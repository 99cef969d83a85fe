//! Session handle over the external coordination service.
//!
//! [`Connector`] and [`Connection`] are the seam to the service itself (the
//! in-memory ensemble in tests, a real quorum in production).
//! [`CoordinationClient`] layers the session policy on top:
//! - one transparent reconnect per failed operation, shared by concurrent callers
//! - every round trip bounded by the session timeout
//! - ordered, single-task watch delivery to registered callbacks

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_observe::{obs_count, obs_hist, CoordEvt, CoordKind, Meter, NoopMeter, VizEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoordConfig;
use crate::error::{CoordError, Result};

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Node metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Data version, incremented by every `set_data`
    pub version: i32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

/// Kind of a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session that armed the watches is gone.
    SessionExpired,
}

/// A watch notification.
///
/// Carries only what changed, never the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    /// Affected node; `None` for session-level events
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn node(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session died; its ephemerals and watches are gone.
    Expired { session_id: u64 },
    /// A new session replaced the old one.
    Reconnected { session_id: u64 },
}

/// Opens sessions against the coordination service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new session.
    ///
    /// Watch notifications for the session are delivered on `watches`.
    async fn connect(
        &self,
        config: &CoordConfig,
        watches: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Result<Arc<dyn Connection>>;
}

/// One live session.
///
/// Operations on a dead session fail with [`CoordError::SessionExpired`].
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn session_id(&self) -> u64;

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>>;

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<()>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Bytes, Stat)>;

    /// `version = None` writes unconditionally.
    async fn set_data(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat>;

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// End the session.
    async fn close(&self);
}

/// Callback invoked on the watch dispatch task.
///
/// Must return quickly and must not call back into the client.
pub type WatchCallback = Arc<dyn Fn(&WatchedEvent) + Send + Sync>;

struct Watcher {
    path: String,
    callback: WatchCallback,
}

#[derive(Default)]
struct WatchRegistry {
    next_id: AtomicU64,
    watchers: RwLock<HashMap<u64, Watcher>>,
}

impl WatchRegistry {
    fn add(&self, path: String, callback: WatchCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.write().insert(id, Watcher { path, callback });
        id
    }

    fn remove(&self, id: u64) {
        self.watchers.write().remove(&id);
    }

    fn matching(&self, path: &str) -> Vec<WatchCallback> {
        let mut matched: Vec<(u64, WatchCallback)> = self
            .watchers
            .read()
            .iter()
            .filter(|(_, w)| w.path == path)
            .map(|(id, w)| (*id, w.callback.clone()))
            .collect();
        matched.sort_by_key(|(id, _)| *id);
        matched.into_iter().map(|(_, cb)| cb).collect()
    }
}

/// Subscription returned by [`CoordinationClient::register_watch`].
///
/// Cancelled explicitly or on drop.
pub struct WatchHandle {
    id: u64,
    registry: Weak<WatchRegistry>,
}

impl WatchHandle {
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Outcome of the last reconnect attempt, keyed by the generation it replaced.
struct ReconnectOutcome {
    from_generation: u64,
    error: Option<String>,
}

struct ClientInner {
    config: CoordConfig,
    connector: Arc<dyn Connector>,
    conn: RwLock<(u64, Arc<dyn Connection>)>,
    reconnect_lock: tokio::sync::Mutex<Option<ReconnectOutcome>>,
    watch_tx: mpsc::UnboundedSender<WatchedEvent>,
    registry: Arc<WatchRegistry>,
    session_tx: broadcast::Sender<SessionEvent>,
    meter: Arc<dyn Meter>,
    closed: AtomicBool,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

/// Shared session handle used by every component above it.
///
/// Cloning is cheap; all clones share one session.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("session_id", &self.session_id())
            .field("quorum", &self.inner.config.quorum)
            .finish()
    }
}

impl CoordinationClient {
    /// Open a session with a no-op meter.
    pub async fn connect(config: CoordConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::connect_with_meter(config, connector, Arc::new(NoopMeter)).await
    }

    /// Open a session reporting into `meter`.
    pub async fn connect_with_meter(
        config: CoordConfig,
        connector: Arc<dyn Connector>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config.validate()?;

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let conn = tokio::time::timeout(
            config.session_timeout,
            connector.connect(&config, watch_tx.clone()),
        )
        .await
        .map_err(|_| CoordError::unavailable(format!("connect to {} timed out", config.quorum)))?
        .map_err(|e| CoordError::unavailable(format!("connect to {}: {}", config.quorum, e)))?;

        info!(
            quorum = %config.quorum,
            session = conn.session_id(),
            "Coordination session established"
        );

        let (session_tx, _) = broadcast::channel(config.event_channel_capacity);
        let inner = Arc::new(ClientInner {
            config,
            connector,
            conn: RwLock::new((0, conn)),
            reconnect_lock: tokio::sync::Mutex::new(None),
            watch_tx,
            registry: Arc::new(WatchRegistry::default()),
            session_tx,
            meter,
            closed: AtomicBool::new(false),
            dispatcher: parking_lot::Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            inner.registry.clone(),
            watch_rx,
        ));
        *inner.dispatcher.lock() = Some(dispatcher);

        Ok(Self { inner })
    }

    pub fn config(&self) -> &CoordConfig {
        &self.inner.config
    }

    pub fn meter(&self) -> Arc<dyn Meter> {
        self.inner.meter.clone()
    }

    /// Identifier of the current session.
    pub fn session_id(&self) -> u64 {
        self.inner.conn.read().1.session_id()
    }

    /// Subscribe to session expiry/reconnect notifications.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        Ok(self.stat(path, watch).await?.is_some())
    }

    /// Like [`exists`](Self::exists) but returns the node metadata.
    pub async fn stat(&self, path: &str, watch: bool) -> Result<Option<Stat>> {
        let owned = path.to_string();
        self.run("exists", path, move |conn| {
            let path = owned.clone();
            async move { conn.exists(&path, watch).await }
        })
        .await
    }

    pub async fn create(&self, path: &str, data: impl Into<Bytes>, mode: CreateMode) -> Result<()> {
        let data = data.into();
        let owned = path.to_string();
        self.run("create", path, move |conn| {
            let path = owned.clone();
            let data = data.clone();
            async move { conn.create(&path, data, mode).await }
        })
        .await
    }

    pub async fn get_data(&self, path: &str, watch: bool) -> Result<(Bytes, Stat)> {
        let owned = path.to_string();
        self.run("get_data", path, move |conn| {
            let path = owned.clone();
            async move { conn.get_data(&path, watch).await }
        })
        .await
    }

    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        expected_version: Option<i32>,
    ) -> Result<Stat> {
        let data = data.into();
        let owned = path.to_string();
        self.run("set_data", path, move |conn| {
            let path = owned.clone();
            let data = data.clone();
            async move { conn.set_data(&path, data, expected_version).await }
        })
        .await
    }

    pub async fn delete(&self, path: &str, expected_version: Option<i32>) -> Result<()> {
        let owned = path.to_string();
        self.run("delete", path, move |conn| {
            let path = owned.clone();
            async move { conn.delete(&path, expected_version).await }
        })
        .await
    }

    /// Child names of `path`, sorted.
    pub async fn list_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let owned = path.to_string();
        self.run("list_children", path, move |conn| {
            let path = owned.clone();
            async move { conn.get_children(&path, watch).await }
        })
        .await
    }

    /// Create `path` and any missing ancestors as empty persistent nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            match self.create(&prefix, Bytes::new(), CreateMode::Persistent).await {
                Ok(()) | Err(CoordError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Route notifications for `path` to `callback`.
    ///
    /// Registration only routes; the server-side watch is armed by passing
    /// `watch = true` to a read.
    pub fn register_watch<F>(&self, path: &str, callback: F) -> WatchHandle
    where
        F: Fn(&WatchedEvent) + Send + Sync + 'static,
    {
        let id = self.inner.registry.add(path.to_string(), Arc::new(callback));
        WatchHandle {
            id,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    /// End the session. Only the process shutdown path calls this.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.inner.conn.read().1.clone();
        info!(session = conn.session_id(), "Closing coordination session");
        conn.close().await;
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            handle.abort();
        }
    }

    fn current(&self) -> (u64, Arc<dyn Connection>) {
        let guard = self.inner.conn.read();
        (guard.0, guard.1.clone())
    }

    /// Run one operation with the reconnect-once policy.
    async fn run<T, F, Fut>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_closed() {
            return Err(CoordError::unavailable("client closed"));
        }
        obs_count!(self.inner.meter, "coord_ops_total", &[], 1);

        let (generation, conn) = self.current();
        match self.bounded(op, path, f(conn)).await {
            Err(e) if e.is_session_loss() => {
                warn!(op, path, error = %e, "Session lost, reconnecting");
                let conn = self.reconnect(generation).await.map_err(|reconnect_err| {
                    CoordError::unavailable(format!(
                        "{} {} failed ({}); reconnect failed: {}",
                        op, path, e, reconnect_err
                    ))
                })?;
                match self.bounded(op, path, f(conn)).await {
                    Err(e) if e.is_session_loss() => Err(CoordError::unavailable(format!(
                        "{} {} failed after reconnect: {}",
                        op, path, e
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        path: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.inner.config.session_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::unavailable(format!(
                "{} {} timed out after {:?}",
                op, path, self.inner.config.session_timeout
            ))),
        };
        obs_hist!(
            self.inner.meter,
            "coord_op_ms",
            &[],
            started.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    /// Replace the session observed at `seen_generation`.
    ///
    /// Only one attempt runs at a time. Callers that observed the same dead
    /// session share the outcome of a single attempt.
    async fn reconnect(&self, seen_generation: u64) -> Result<Arc<dyn Connection>> {
        let mut outcome = self.inner.reconnect_lock.lock().await;

        if let Some(last) = outcome.as_ref() {
            if last.from_generation == seen_generation {
                return match &last.error {
                    None => Ok(self.current().1),
                    Some(detail) => Err(CoordError::unavailable(detail.clone())),
                };
            }
        }
        let (generation, old) = self.current();
        if generation != seen_generation {
            // Superseded by a later attempt; retry on whatever is current.
            return Ok(old);
        }
        if self.is_closed() {
            return Err(CoordError::unavailable("client closed"));
        }

        let old_session = old.session_id();
        let _ = self.inner.session_tx.send(SessionEvent::Expired {
            session_id: old_session,
        });
        self.inner.meter.emit(VizEvent::Coord(CoordEvt {
            session: old_session,
            kind: CoordKind::SessionExpired,
        }));
        obs_count!(self.inner.meter, "coord_reconnects_total", &[], 1);

        let attempt = tokio::time::timeout(
            self.inner.config.session_timeout,
            self.inner
                .connector
                .connect(&self.inner.config, self.inner.watch_tx.clone()),
        )
        .await
        .unwrap_or_else(|_| Err(CoordError::unavailable("reconnect timed out")));

        match attempt {
            Ok(conn) => {
                let session_id = conn.session_id();
                *self.inner.conn.write() = (generation + 1, conn.clone());
                *outcome = Some(ReconnectOutcome {
                    from_generation: seen_generation,
                    error: None,
                });
                info!(old_session, session = session_id, "Coordination session re-established");
                let _ = self
                    .inner
                    .session_tx
                    .send(SessionEvent::Reconnected { session_id });
                self.inner.meter.emit(VizEvent::Coord(CoordEvt {
                    session: session_id,
                    kind: CoordKind::Reconnected,
                }));
                Ok(conn)
            }
            Err(e) => {
                let detail = format!("reconnect to {} failed: {}", self.inner.config.quorum, e);
                warn!(old_session, error = %e, "Reconnect failed");
                // Bump the generation so later operations make a fresh attempt.
                self.inner.conn.write().0 = generation + 1;
                *outcome = Some(ReconnectOutcome {
                    from_generation: seen_generation,
                    error: Some(detail.clone()),
                });
                self.inner.meter.emit(VizEvent::Coord(CoordEvt {
                    session: old_session,
                    kind: CoordKind::ReconnectFailed,
                }));
                Err(CoordError::unavailable(detail))
            }
        }
    }
}

/// Deliver watch notifications one at a time, in arrival order.
async fn dispatch_loop(
    client: Weak<ClientInner>,
    registry: Arc<WatchRegistry>,
    mut rx: mpsc::UnboundedReceiver<WatchedEvent>,
) {
    while let Some(event) = rx.recv().await {
        match (&event.kind, &event.path) {
            (EventKind::SessionExpired, _) => {
                let Some(inner) = client.upgrade() else { break };
                let client = CoordinationClient { inner };
                debug!(session = client.session_id(), "Session expiry notice received");
                // A probe round trip drives the normal reconnect path if the
                // current session is the dead one, and is a no-op otherwise.
                tokio::spawn(async move {
                    if let Err(e) = client.exists("/", false).await {
                        warn!(error = %e, "Reconnect after session expiry failed");
                    }
                });
            }
            (_, Some(path)) => {
                for callback in registry.matching(path) {
                    callback(&event);
                }
            }
            (_, None) => {}
        }
    }
    debug!("Watch dispatcher exiting");
}
