//! KafkaCluster CRD.
//!
//! A KafkaCluster declares a broker cluster along with the Zookeeper ensemble which it uses
//! for coordination. The operator reconciles each of the two as a separate component.

use anyhow::{ensure, Context, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{validate_replicas, ClusterStatus, HealthCheckSpec, StorageSpec};

pub type KafkaCluster = KafkaClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// The upper bound of the replication factors defaulted from the broker count.
const MAX_DEFAULT_REPLICATION_FACTOR: u32 = 3;

/// CRD spec for the KafkaCluster resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "KafkaClusterCRD",
    status = "ClusterStatus",
    group = "keel.rs",
    version = "v1beta1",
    kind = "KafkaCluster",
    namespaced,
    derive = "PartialEq",
    shortname = "kc",
    printcolumn = r#"{"name":"Brokers","type":"number","jsonPath":".spec.kafka.replicas"}"#,
    printcolumn = r#"{"name":"Zookeepers","type":"number","jsonPath":".spec.zookeeper.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaClusterSpec {
    /// The broker component of the cluster.
    pub kafka: KafkaSpec,
    /// The coordination ensemble of the cluster.
    pub zookeeper: ZookeeperSpec,
}

/// The broker component of a KafkaCluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSpec {
    /// The number of brokers.
    ///
    /// Each broker is a pod of the backing StatefulSet, and its broker ID is the pod's ordinal.
    pub replicas: u32,
    /// Force an exact image to be used for the brokers.
    #[serde(default)]
    pub image: Option<String>,
    /// The storage used for broker logs.
    #[serde(default)]
    pub storage: StorageSpec,
    /// Probe timing for the brokers.
    #[serde(default)]
    pub healthcheck: HealthCheckSpec,
    /// Prometheus JMX exporter config; metrics are disabled when unset.
    #[serde(default)]
    #[schemars(with = "Option<std::collections::BTreeMap<String, serde_json::Value>>")]
    pub metrics: Option<serde_json::Value>,
    /// The replication factor of automatically created topics.
    #[serde(default)]
    pub default_replication_factor: Option<u32>,
    /// The replication factor of the consumer offsets topic.
    #[serde(default)]
    pub offsets_topic_replication_factor: Option<u32>,
    /// The replication factor of the transaction state log.
    #[serde(default)]
    pub transaction_state_log_replication_factor: Option<u32>,
}

/// The coordination ensemble of a KafkaCluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperSpec {
    /// The number of ensemble members.
    pub replicas: u32,
    /// Force an exact image to be used for the ensemble.
    #[serde(default)]
    pub image: Option<String>,
    /// The storage used for ensemble snapshots & logs.
    #[serde(default)]
    pub storage: StorageSpec,
    /// Probe timing for the ensemble.
    #[serde(default)]
    pub healthcheck: HealthCheckSpec,
    /// Prometheus JMX exporter config; metrics are disabled when unset.
    #[serde(default)]
    #[schemars(with = "Option<std::collections::BTreeMap<String, serde_json::Value>>")]
    pub metrics: Option<serde_json::Value>,
}

impl KafkaClusterSpec {
    /// Check that this spec can be reconciled.
    pub fn validate(&self) -> Result<()> {
        self.kafka.validate().context("invalid spec.kafka")?;
        self.zookeeper.validate().context("invalid spec.zookeeper")?;
        Ok(())
    }
}

impl KafkaSpec {
    /// Check that this spec can be reconciled.
    pub fn validate(&self) -> Result<()> {
        validate_replicas(self.replicas)?;
        self.storage.validate()?;
        for (name, factor) in [
            ("defaultReplicationFactor", self.default_replication_factor),
            ("offsetsTopicReplicationFactor", self.offsets_topic_replication_factor),
            ("transactionStateLogReplicationFactor", self.transaction_state_log_replication_factor),
        ] {
            if let Some(factor) = factor {
                ensure!(
                    factor >= 1 && factor <= self.replicas,
                    "{} must be between 1 and the number of brokers ({}), got {}",
                    name,
                    self.replicas,
                    factor
                );
            }
        }
        Ok(())
    }

    /// The replication factor used when unset, bounded by the number of brokers.
    pub fn default_factor(&self) -> u32 {
        self.replicas.clamp(1, MAX_DEFAULT_REPLICATION_FACTOR)
    }
}

impl ZookeeperSpec {
    /// Check that this spec can be reconciled.
    pub fn validate(&self) -> Result<()> {
        validate_replicas(self.replicas)?;
        self.storage.validate()?;
        Ok(())
    }
}
