//! Cluster coordination layer.
//!
//! Wraps an external coordination service (hierarchical nodes, ephemeral
//! registrations, one-shot watches) and builds the cluster roles on top of it.
//!
//! # Architecture
//!
//! - One [`CoordinationClient`] session per process, shared via `Arc`
//! - Master election through an ephemeral node
//! - Region-server membership through an ephemeral directory
//! - Cluster up/down flag and root-catalog location as persistent nodes
//! - Periodic background duties on their own tasks
//!
//! # Modules
//!
//! - [`client`]: Session handle, reconnect policy and watch dispatch
//! - [`memory`]: In-process coordination ensemble
//! - [`election`]: Master election
//! - [`membership`]: Region-server directory
//! - [`chore`]: Periodic duties
//! - [`message`]: Master/region-server control messages

pub mod chore;
pub mod client;
pub mod config;
pub mod election;
pub mod error;
pub mod identity;
pub mod membership;
pub mod memory;
pub mod message;
pub mod path;
pub mod root;
pub mod state;
pub mod status;
mod watcher;

pub use chore::{Chore, ChoreError, ChoreHandle, ChoreState, Duty};
pub use client::{
    Connection, Connector, CoordinationClient, CreateMode, EventKind, SessionEvent, Stat,
    WatchHandle, WatchedEvent,
};
pub use config::{ConfigError, CoordConfig};
pub use election::{LeaderElector, LeadershipEvent};
pub use error::{CoordError, ErrorKind, Result};
pub use identity::{
    current_start_code, RegionDescriptor, RegionLocation, ServerAddress, ServerDescriptor,
    ServerLoad, ServerName,
};
pub use membership::{MembershipHeartbeat, MembershipService, MembershipWatch};
pub use memory::InMemoryEnsemble;
pub use message::{ControlMessage, Direction, MessageKind};
pub use path::PathRegistry;
pub use root::RootLocationService;
pub use state::{ClusterStateFlag, StateWatch};
pub use status::{ClusterStatus, CLUSTER_STATUS_VERSION};
