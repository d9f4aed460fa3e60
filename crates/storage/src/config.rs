//! Configuration for the replicated storage backend.
//!
//! [`ReplicationConfig`] describes the simulated cluster behind a
//! [`ReplicatedBackend`](crate::ReplicatedBackend): how many nodes it has,
//! which node the local process is attached to, how quickly writes reach the
//! remaining replicas and which node answers reads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of cluster nodes.
const DEFAULT_NODES: usize = 3;

/// Default delay before a write reaches non-local replicas.
const DEFAULT_REPLICATION_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field holds a value outside its permitted range.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a new `Invalid` error.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Which node serves reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConsistency {
    /// Read from the local node (may lag behind the primary for keys written
    /// through another node).
    Eventual,
    /// Read from the primary.
    #[default]
    Linearizable,
}

/// Configuration for [`ReplicatedBackend`](crate::ReplicatedBackend).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use sso_ticket_storage::{ReadConsistency, ReplicationConfig};
///
/// let config = ReplicationConfig::builder()
///     .nodes(3)
///     .local_node(1)
///     .replication_interval(Duration::from_millis(10))
///     .read_consistency(ReadConsistency::Eventual)
///     .build()?;
/// assert_eq!(config.nodes(), 3);
/// # Ok::<(), sso_ticket_storage::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Number of nodes in the cluster. Node 0 is the primary.
    #[serde(default = "default_nodes")]
    pub(crate) nodes: usize,

    /// Index of the node this process reads from and writes through.
    #[serde(default)]
    pub(crate) local_node: usize,

    /// Delay before a committed write is applied on non-local replicas.
    #[serde(with = "humantime_serde", default = "default_replication_interval")]
    pub(crate) replication_interval: Duration,

    /// Read consistency level.
    #[serde(default)]
    pub(crate) read_consistency: ReadConsistency,

    /// Simulated round-trip latency added to every request that touches the
    /// primary from a non-primary node.
    #[serde(with = "humantime_serde", default)]
    pub(crate) network_latency: Duration,
}

fn default_nodes() -> usize {
    DEFAULT_NODES
}

fn default_replication_interval() -> Duration {
    DEFAULT_REPLICATION_INTERVAL
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            nodes: DEFAULT_NODES,
            local_node: 0,
            replication_interval: DEFAULT_REPLICATION_INTERVAL,
            read_consistency: ReadConsistency::default(),
            network_latency: Duration::ZERO,
        }
    }
}

#[bon::bon]
impl ReplicationConfig {
    /// Creates a new configuration, validating the node layout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `nodes` is zero or `local_node`
    /// does not name an existing node.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_NODES)] nodes: usize,
        #[builder(default)] local_node: usize,
        #[builder(default = DEFAULT_REPLICATION_INTERVAL)] replication_interval: Duration,
        #[builder(default)] read_consistency: ReadConsistency,
        #[builder(default)] network_latency: Duration,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { nodes, local_node, replication_interval, read_consistency, network_latency };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ReplicationConfig::builder`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::invalid("nodes", "a cluster needs at least one node"));
        }
        if self.local_node >= self.nodes {
            return Err(ConfigError::invalid(
                "local_node",
                format!("node {} does not exist in a {}-node cluster", self.local_node, self.nodes),
            ));
        }
        Ok(())
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Returns the index of the local node.
    #[must_use]
    pub fn local_node(&self) -> usize {
        self.local_node
    }

    /// Returns the replication interval.
    #[must_use]
    pub fn replication_interval(&self) -> Duration {
        self.replication_interval
    }

    /// Returns the read consistency level.
    #[must_use]
    pub fn read_consistency(&self) -> ReadConsistency {
        self.read_consistency
    }

    /// Returns the simulated network latency.
    #[must_use]
    pub fn network_latency(&self) -> Duration {
        self.network_latency
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::builder().build().unwrap();
        assert_eq!(config, ReplicationConfig::default());
        assert_eq!(config.read_consistency(), ReadConsistency::Linearizable);
    }

    #[test]
    fn test_rejects_empty_cluster() {
        let err = ReplicationConfig::builder().nodes(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "nodes", .. }));
    }

    #[test]
    fn test_rejects_unknown_local_node() {
        let err = ReplicationConfig::builder().nodes(2).local_node(2).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "local_node", .. }));
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{
            "nodes": 2,
            "local_node": 1,
            "replication_interval": "250ms",
            "read_consistency": "eventual"
        }"#;
        let config: ReplicationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.replication_interval(), Duration::from_millis(250));
        assert_eq!(config.read_consistency(), ReadConsistency::Eventual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let json = r#"{"nodes":2,"shards":4}"#;
        assert!(serde_json::from_str::<ReplicationConfig>(json).is_err());
    }
}
