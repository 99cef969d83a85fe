//! Cluster up/down flag.
//!
//! The cluster is up while the persistent state node exists.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::client::{CoordinationClient, CreateMode, EventKind};
use crate::error::{CoordError, Result};
use crate::path::PathRegistry;
use crate::watcher::WatchTask;

const STATE_UP: &[u8] = b"up";
const STATE_EVENTS: &[EventKind] = &[EventKind::NodeCreated, EventKind::NodeDeleted];

#[derive(Clone)]
pub struct ClusterStateFlag {
    client: CoordinationClient,
    paths: PathRegistry,
}

impl ClusterStateFlag {
    pub fn new(client: CoordinationClient) -> Self {
        let paths = PathRegistry::new(client.config());
        Self { client, paths }
    }

    /// Mark the cluster up. Idempotent.
    pub async fn set_up(&self) -> Result<()> {
        self.client.ensure_path(self.paths.parent()).await?;
        match self
            .client
            .create(self.paths.cluster_state(), STATE_UP, CreateMode::Persistent)
            .await
        {
            Ok(()) => info!("Cluster marked up"),
            Err(CoordError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Mark the cluster down. Idempotent.
    pub async fn set_down(&self) -> Result<()> {
        match self.client.delete(self.paths.cluster_state(), None).await {
            Ok(()) => info!("Cluster marked down"),
            Err(CoordError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub async fn is_up(&self) -> Result<bool> {
        self.client.exists(self.paths.cluster_state(), false).await
    }

    /// Call `callback` with the new state whenever the flag flips.
    ///
    /// The state at subscription time is recorded but not reported. A delete
    /// and re-create that land before the watch is re-armed still report
    /// both transitions.
    pub fn watch<F>(&self, callback: F) -> StateWatch
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let client = self.client.clone();
        let path = self.paths.cluster_state().to_string();
        let callback = Arc::new(callback);
        let last: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));

        let task = WatchTask::spawn(
            &self.client,
            "cluster-state",
            self.paths.cluster_state(),
            STATE_EVENTS,
            move |events: Vec<EventKind>| {
                let client = client.clone();
                let path = path.clone();
                let callback = callback.clone();
                let last = last.clone();
                async move {
                    for kind in events {
                        match kind {
                            EventKind::NodeCreated => report(&last, &*callback, true),
                            EventKind::NodeDeleted => report(&last, &*callback, false),
                            _ => {}
                        }
                    }
                    let up = client.exists(&path, true).await?;
                    report(&last, &*callback, up);
                    Ok(())
                }
            },
        );
        StateWatch { task }
    }
}

fn report<F: Fn(bool) + ?Sized>(last: &Mutex<Option<bool>>, callback: &F, up: bool) {
    let previous = last.lock().replace(up);
    if previous.is_some_and(|was| was != up) {
        callback(up);
    }
}

/// Live subscription returned by [`ClusterStateFlag::watch`].
pub struct StateWatch {
    task: WatchTask,
}

impl StateWatch {
    pub fn cancel(&mut self) {
        self.task.cancel();
    }
}
