//! KafkaConnect CRD.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{validate_replicas, ClusterStatus, HealthCheckSpec};

pub type KafkaConnect = KafkaConnectCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the KafkaConnect resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "KafkaConnectCRD",
    status = "ClusterStatus",
    group = "keel.rs",
    version = "v1beta1",
    kind = "KafkaConnect",
    namespaced,
    derive = "PartialEq",
    shortname = "kconn",
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Bootstrap Servers","type":"string","jsonPath":".spec.bootstrapServers"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConnectSpec {
    /// The number of Connect workers.
    pub replicas: u32,
    /// Force an exact image to be used for the workers.
    #[serde(default)]
    pub image: Option<String>,
    /// The brokers the workers connect to, as `host:port[,host:port]`.
    pub bootstrap_servers: String,
    /// Probe timing for the workers.
    #[serde(default)]
    pub healthcheck: HealthCheckSpec,
    /// Prometheus JMX exporter config; metrics are disabled when unset.
    #[serde(default)]
    #[schemars(with = "Option<BTreeMap<String, serde_json::Value>>")]
    pub metrics: Option<serde_json::Value>,
    /// Worker settings, e.g. `group.id`, rendered into the worker environment.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Build a worker image with additional plugins on platforms which support image builds.
    #[serde(default)]
    pub build: Option<ConnectBuildSpec>,
}

/// An image build of a Connect worker image.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBuildSpec {
    /// The image tag produced by the build.
    #[serde(default = "ConnectBuildSpec::default_tag")]
    pub tag: String,
}

impl ConnectBuildSpec {
    fn default_tag() -> String {
        "latest".into()
    }
}

impl KafkaConnectSpec {
    /// Check that this spec can be reconciled.
    pub fn validate(&self) -> Result<()> {
        validate_replicas(self.replicas)?;
        ensure!(!self.bootstrap_servers.trim().is_empty(), "bootstrapServers must not be empty");
        if let Some(build) = &self.build {
            ensure!(!build.tag.trim().is_empty(), "build.tag must not be empty");
        }
        Ok(())
    }
}
