//! Keel CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod common;
mod connect;
mod kafka;

use kube::Resource;

pub use common::{ClusterStatus, Condition, HealthCheckSpec, StorageSpec, CONDITION_FALSE, CONDITION_TRUE};
pub use connect::{ConnectBuildSpec, KafkaConnect, KafkaConnectSpec};
pub use kafka::{KafkaCluster, KafkaClusterSpec, KafkaSpec, ZookeeperSpec};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for KafkaCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for KafkaConnect {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

/// Access to the condition-bearing status shared by all Keel CRDs.
pub trait HasClusterStatus {
    /// The status of this object, if it has been written yet.
    fn cluster_status(&self) -> Option<&ClusterStatus>;
}

impl HasClusterStatus for KafkaCluster {
    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }
}

impl HasClusterStatus for KafkaConnect {
    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }
}
