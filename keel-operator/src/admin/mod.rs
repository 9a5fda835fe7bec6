//! The administrative query interface of managed Kafka clusters.
//!
//! The operator only ever reads replication metadata through this interface, in order to
//! decide whether a broker may be restarted. See the `roll` module.

#[cfg(feature = "kafka")]
mod kafka;
mod roll;
#[cfg(test)]
pub mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::ClusterIdentity;
use crate::error::AdminError;
#[cfg(feature = "kafka")]
pub use kafka::KafkaAdminConnector;
pub use roll::{can_roll, can_roll_with, min_insync_replicas, replication_snapshot};

/// The topic config holding the minimum in-sync replica count.
pub const MIN_INSYNC_REPLICAS: &str = "min.insync.replicas";
/// The minimum in-sync replica count of topics which do not configure one.
pub const DEFAULT_MIN_INSYNC_REPLICAS: i32 = 1;

/// A topic as returned by a topic listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicListing {
    pub name: String,
    pub internal: bool,
}

/// The replication state of a single partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,
    /// The broker leading the partition, if it currently has a leader.
    pub leader: Option<i32>,
    /// The IDs of all brokers holding a replica of the partition.
    pub replicas: BTreeSet<i32>,
    /// The IDs of the replicas which are in sync with the leader.
    pub isr: BTreeSet<i32>,
}

impl PartitionInfo {
    pub fn new(id: i32, leader: Option<i32>, replicas: impl IntoIterator<Item = i32>, isr: impl IntoIterator<Item = i32>) -> Self {
        Self {
            id,
            leader,
            replicas: replicas.into_iter().collect(),
            isr: isr.into_iter().collect(),
        }
    }
}

/// The description of a topic's partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicDescription {
    pub name: String,
    pub internal: bool,
    pub partitions: Vec<PartitionInfo>,
}

/// The replication state of a topic along with its minimum in-sync replica count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicReplication {
    pub internal: bool,
    pub min_isr: i32,
    pub partitions: Vec<PartitionInfo>,
}

/// The replication state of all topics relevant to a roll decision, keyed by topic name.
///
/// A snapshot is queried right before a decision and never reused for another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub topics: BTreeMap<String, TopicReplication>,
}

/// A connection to the administrative interface of a managed cluster.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// List all topics of the cluster, including internal topics.
    async fn list_topics(&self) -> Result<Vec<TopicListing>, AdminError>;

    /// Describe the partitions of the given topics.
    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>, AdminError>;

    /// Describe the effective config of the given topic.
    async fn describe_config(&self, topic: &str) -> Result<BTreeMap<String, String>, AdminError>;
}

/// A factory of connections to the administrative interface of managed clusters.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Connect to the brokers of the given cluster.
    async fn connect(&self, cluster: &ClusterIdentity) -> Result<Arc<dyn ClusterAdmin>, AdminError>;
}

/// The connector used when the operator is built without an administrative client.
///
/// Every connection attempt fails, which means that guarded restarts never proceed.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledAdminConnector;

#[async_trait]
impl AdminConnector for DisabledAdminConnector {
    async fn connect(&self, cluster: &ClusterIdentity) -> Result<Arc<dyn ClusterAdmin>, AdminError> {
        Err(AdminError::Unavailable(format!(
            "operator built without the kafka feature, can not query brokers of {}",
            cluster
        )))
    }
}

/// The address of the given cluster's brokers, as reachable from within the platform.
pub fn bootstrap_servers(cluster: &ClusterIdentity) -> String {
    let port = cluster.kind.profile().ports.first().map(|(_, port)| *port).unwrap_or(9092);
    format!("{}.{}.svc:{}", cluster.workload_name(), cluster.namespace, port)
}
