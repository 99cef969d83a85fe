//! Node layout under the cluster parent.

use crate::client::CoordinationClient;
use crate::config::CoordConfig;
use crate::error::Result;

/// Fixed hierarchical node layout computed from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRegistry {
    parent: String,
    root: String,
    servers: String,
    master: String,
    state: String,
}

impl PathRegistry {
    pub fn new(config: &CoordConfig) -> Self {
        let parent = normalize(&config.parent_path);
        Self {
            root: Self::join(&parent, &config.root_node),
            servers: Self::join(&parent, &config.servers_node),
            master: Self::join(&parent, &config.master_node),
            state: Self::join(&parent, &config.state_node),
            parent,
        }
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Node holding the root-catalog server address.
    pub fn root_region_server(&self) -> &str {
        &self.root
    }

    /// Directory of ephemeral region-server registrations.
    pub fn servers_dir(&self) -> &str {
        &self.servers
    }

    /// Registration node of one server.
    pub fn server_node(&self, server_name: &str) -> String {
        Self::join(&self.servers, server_name)
    }

    /// Master election node.
    pub fn master(&self) -> &str {
        &self.master
    }

    /// Cluster-state node.
    pub fn cluster_state(&self) -> &str {
        &self.state
    }

    /// Join a child onto a parent path.
    ///
    /// An absolute child is returned unchanged.
    pub fn join(parent: &str, child: &str) -> String {
        if child.starts_with('/') {
            return child.to_string();
        }
        let parent = parent.trim_end_matches('/');
        format!("{}/{}", parent, child)
    }

    /// Last path segment.
    pub fn basename(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Ensure the persistent parent and server directory exist.
    pub async fn bootstrap(&self, client: &CoordinationClient) -> Result<()> {
        client.ensure_path(&self.parent).await?;
        client.ensure_path(&self.servers).await
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let paths = PathRegistry::new(&CoordConfig::default());
        assert_eq!(paths.parent(), "/cluster");
        assert_eq!(paths.root_region_server(), "/cluster/root");
        assert_eq!(paths.servers_dir(), "/cluster/servers");
        assert_eq!(paths.master(), "/cluster/master");
        assert_eq!(paths.cluster_state(), "/cluster/state");
        assert_eq!(
            paths.server_node("host,60020,1"),
            "/cluster/servers/host,60020,1"
        );
    }

    #[test]
    fn test_trailing_slash_parent() {
        let config = CoordConfig::default().with_parent_path("/hbase/");
        let paths = PathRegistry::new(&config);
        assert_eq!(paths.parent(), "/hbase");
        assert_eq!(paths.master(), "/hbase/master");
    }

    #[test]
    fn test_join_and_basename() {
        assert_eq!(PathRegistry::join("/a/", "b"), "/a/b");
        assert_eq!(PathRegistry::join("/a", "/abs"), "/abs");
        assert_eq!(PathRegistry::join("/", "a"), "/a");
        assert_eq!(PathRegistry::basename("/a/b/c"), "c");
        assert_eq!(PathRegistry::basename("c"), "c");
    }
}
