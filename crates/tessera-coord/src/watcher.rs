//! Re-armed watch workers.
//!
//! Watches on the service are one-shot. A worker owns one path: the client
//! callback records the event kind and enqueues a wakeup, the worker
//! re-reads (re-arming the watch) and reports. Wakeups that arrive while a
//! refresh is pending coalesce into it; their kinds are handed to the next
//! refresh in arrival order.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{CoordinationClient, EventKind, SessionEvent, WatchHandle};
use crate::error::Result;

/// A running worker. Stops when cancelled or dropped.
pub(crate) struct WatchTask {
    _handle: WatchHandle,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl WatchTask {
    /// Spawn a worker for `path`.
    ///
    /// `refresh` runs once immediately, after every matching event, after
    /// every session reconnect, and every `retry` while the last refresh
    /// failed. It receives the kinds of the events seen since the previous
    /// run, which may be empty.
    pub(crate) fn spawn<R, Fut>(
        client: &CoordinationClient,
        name: &'static str,
        path: &str,
        kinds: &'static [EventKind],
        mut refresh: R,
    ) -> Self
    where
        R: FnMut(Vec<EventKind>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(client.config().watch_queue_capacity);
        let seen: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let handle = client.register_watch(path, move |event| {
            if kinds.contains(&event.kind) {
                recorded.lock().push(event.kind);
                // Full queue: a refresh is already pending.
                let _ = tx.try_send(());
            }
        });

        let mut sessions = client.session_events();
        let retry = client.config().heartbeat_interval;
        let stop = Arc::new(Notify::new());
        let stopped = stop.clone();
        let path = path.to_string();

        let task = tokio::spawn(async move {
            let mut pending = true;
            loop {
                if pending {
                    let events = std::mem::take(&mut *seen.lock());
                    match refresh(events).await {
                        Ok(()) => pending = false,
                        Err(e) => {
                            warn!(worker = name, path = %path, error = %e, "Watch refresh failed")
                        }
                    }
                }

                tokio::select! {
                    _ = stopped.notified() => break,
                    wake = rx.recv() => match wake {
                        Some(()) => pending = true,
                        None => break,
                    },
                    event = sessions.recv() => match event {
                        Ok(SessionEvent::Reconnected { .. }) | Err(RecvError::Lagged(_)) => pending = true,
                        Ok(SessionEvent::Expired { .. }) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::time::sleep(retry_delay(retry)), if pending => {}
                }
            }
            debug!(worker = name, path = %path, "Watch worker exiting");
        });

        Self {
            _handle: handle,
            stop,
            task: Some(task),
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.stop.notify_one();
        self.task.take();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

fn retry_delay(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(10))
}
