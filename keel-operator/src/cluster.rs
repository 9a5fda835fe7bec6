//! Parsed cluster specifications & per-component-kind profiles.
//!
//! A `ClusterSpec` is parsed fresh from a custom resource on every reconciliation pass and is
//! never mutated afterwards. Everything which differs between brokers, the Zookeeper ensemble
//! & Connect workers is captured by the static `KindProfile` of the spec's `ComponentKind`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use derive_more::Display;
use keel_core::crd::{ConnectBuildSpec, HealthCheckSpec, KafkaCluster, KafkaConnect, RequiredMetadata, StorageSpec};
use kube::ResourceExt;

use crate::config::Config;

/// The port on which the JMX exporter serves metrics, when enabled.
pub const METRICS_PORT: i32 = 9404;
/// The name of the metrics port.
pub const METRICS_PORT_NAME: &str = "metrics";

/// The kind of a managed component.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentKind {
    #[display(fmt = "Kafka")]
    Kafka,
    #[display(fmt = "Zookeeper")]
    Zookeeper,
    #[display(fmt = "Connect")]
    Connect,
}

/// The custom resource kind from which a component is declared.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum SourceKind {
    #[display(fmt = "KafkaCluster")]
    KafkaCluster,
    #[display(fmt = "KafkaConnect")]
    KafkaConnect,
}

/// The type of workload backing a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// An ordinal workload rolled one pod at a time by the operator.
    StatefulSet,
    /// A stateless workload rolled by the platform.
    Deployment,
}

/// How the health of a component's containers is probed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Run a command in the container.
    Exec(&'static [&'static str]),
    /// Issue an HTTP GET against the given path & port.
    Http { path: &'static str, port: i32 },
}

/// Static configuration of a component kind.
#[derive(Debug)]
pub struct KindProfile {
    /// The suffix appended to the cluster name for all of the component's resources.
    pub suffix: &'static str,
    /// The name of the component's main container.
    pub container_name: &'static str,
    /// The named ports of the component, the first being the client port.
    pub ports: &'static [(&'static str, i32)],
    /// The path at which the data volume is mounted, if the component is stateful.
    pub data_mount_path: Option<&'static str>,
    /// The env var which carries the metrics enablement flag.
    pub metrics_env: &'static str,
    /// The readiness & liveness probe.
    pub probe: ProbeKind,
    /// Probe timing used when a cluster does not specify one.
    pub default_initial_delay_seconds: i32,
    pub default_timeout_seconds: i32,
    /// The workload type backing the component.
    pub workload: WorkloadKind,
    /// Whether a headless service is generated for stable pod DNS.
    pub headless_service: bool,
}

static KAFKA_PROFILE: KindProfile = KindProfile {
    suffix: "kafka",
    container_name: "kafka",
    ports: &[("clients", 9092), ("replication", 9091)],
    data_mount_path: Some("/var/lib/kafka"),
    metrics_env: "KAFKA_METRICS_ENABLED",
    probe: ProbeKind::Exec(&["/opt/kafka/kafka_healthcheck.sh"]),
    default_initial_delay_seconds: 15,
    default_timeout_seconds: 5,
    workload: WorkloadKind::StatefulSet,
    headless_service: true,
};

static ZOOKEEPER_PROFILE: KindProfile = KindProfile {
    suffix: "zookeeper",
    container_name: "zookeeper",
    ports: &[("clients", 2181), ("clustering", 2888), ("leader-election", 3888)],
    data_mount_path: Some("/var/lib/zookeeper"),
    metrics_env: "ZOOKEEPER_METRICS_ENABLED",
    probe: ProbeKind::Exec(&["/opt/kafka/zookeeper_healthcheck.sh"]),
    default_initial_delay_seconds: 15,
    default_timeout_seconds: 5,
    workload: WorkloadKind::StatefulSet,
    headless_service: true,
};

static CONNECT_PROFILE: KindProfile = KindProfile {
    suffix: "connect",
    container_name: "connect",
    ports: &[("rest-api", 8083)],
    data_mount_path: None,
    metrics_env: "KAFKA_CONNECT_METRICS_ENABLED",
    probe: ProbeKind::Http { path: "/", port: 8083 },
    default_initial_delay_seconds: 60,
    default_timeout_seconds: 5,
    workload: WorkloadKind::Deployment,
    headless_service: false,
};

impl ComponentKind {
    /// All component kinds, in the order in which a full sweep visits them.
    pub const ALL: [ComponentKind; 3] = [ComponentKind::Zookeeper, ComponentKind::Kafka, ComponentKind::Connect];

    /// The static profile of this kind.
    pub fn profile(self) -> &'static KindProfile {
        match self {
            Self::Kafka => &KAFKA_PROFILE,
            Self::Zookeeper => &ZOOKEEPER_PROFILE,
            Self::Connect => &CONNECT_PROFILE,
        }
    }

    /// The value of the `keel.rs/kind` label for this kind.
    pub fn label_value(self) -> &'static str {
        self.profile().suffix
    }

    /// The custom resource kind which declares components of this kind.
    pub fn source(self) -> SourceKind {
        match self {
            Self::Kafka | Self::Zookeeper => SourceKind::KafkaCluster,
            Self::Connect => SourceKind::KafkaConnect,
        }
    }

    /// Whether restarts of this kind's pods are guarded by the roll decision.
    pub fn is_broker(self) -> bool {
        matches!(self, Self::Kafka)
    }
}

/// The identity of one managed component, also used as its lock key.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{}/{}/{}", namespace, name, kind)]
pub struct ClusterIdentity {
    pub namespace: String,
    /// The name of the declaring custom resource.
    pub name: String,
    pub kind: ComponentKind,
}

impl ClusterIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
        }
    }

    /// The name of the workload & client service.
    pub fn workload_name(&self) -> String {
        format!("{}-{}", self.name, self.kind.profile().suffix)
    }

    /// The name of the headless service.
    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.workload_name())
    }

    /// The name of the metrics config map.
    pub fn metrics_config_name(&self) -> String {
        format!("{}-metrics-config", self.workload_name())
    }

    /// The name of the pod with the given ordinal, only meaningful for ordinal workloads.
    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.workload_name(), ordinal)
    }
}

/// Probe timing with defaults applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
}

impl HealthCheck {
    fn resolve(spec: &HealthCheckSpec, kind: ComponentKind) -> Self {
        let profile = kind.profile();
        Self {
            initial_delay_seconds: spec.initial_delay_seconds.unwrap_or(profile.default_initial_delay_seconds),
            timeout_seconds: spec.timeout_seconds.unwrap_or(profile.default_timeout_seconds),
        }
    }
}

/// The images used for clusters which do not specify one.
#[derive(Clone, Debug)]
pub struct ImageDefaults {
    pub kafka: String,
    pub zookeeper: String,
    pub connect: String,
}

impl ImageDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            kafka: config.default_kafka_image.clone(),
            zookeeper: config.default_zookeeper_image.clone(),
            connect: config.default_connect_image.clone(),
        }
    }
}

/// The desired state of one managed component.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSpec {
    pub identity: ClusterIdentity,
    pub image: String,
    pub replicas: i32,
    pub storage: StorageSpec,
    pub healthcheck: HealthCheck,
    /// User labels of the declaring resource, without reserved labels.
    pub labels: BTreeMap<String, String>,
    /// Component configuration, rendered as container env vars.
    pub config: BTreeMap<String, String>,
    /// The JMX exporter config, if metrics are enabled.
    pub metrics: Option<serde_json::Value>,
    /// The image build requested for the component, if any.
    pub build: Option<ConnectBuildSpec>,
}

impl ClusterSpec {
    /// Parse the specs of the Zookeeper ensemble & brokers declared by the given cluster.
    pub fn from_kafka_cluster(cluster: &KafkaCluster, images: &ImageDefaults) -> Result<Vec<Self>> {
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        cluster.spec.validate().with_context(|| format!("invalid KafkaCluster {}/{}", ns, name))?;
        let labels = user_labels(cluster.labels());

        let zk = &cluster.spec.zookeeper;
        let zk_ident = ClusterIdentity::new(ns, name, ComponentKind::Zookeeper);
        let mut zk_config = BTreeMap::new();
        zk_config.insert("ZOOKEEPER_NODE_COUNT".into(), zk.replicas.to_string());
        zk_config.insert(ZOOKEEPER_PROFILE.metrics_env.into(), zk.metrics.is_some().to_string());
        let zookeeper = Self {
            image: zk.image.clone().unwrap_or_else(|| images.zookeeper.clone()),
            replicas: i32::try_from(zk.replicas).context("zookeeper replicas out of range")?,
            storage: zk.storage.clone(),
            healthcheck: HealthCheck::resolve(&zk.healthcheck, ComponentKind::Zookeeper),
            labels: labels.clone(),
            config: zk_config,
            metrics: zk.metrics.clone(),
            build: None,
            identity: zk_ident,
        };

        let kafka = &cluster.spec.kafka;
        let zk_client_port = ZOOKEEPER_PROFILE.ports[0].1;
        let default_factor = kafka.default_factor();
        let mut kafka_config = BTreeMap::new();
        kafka_config.insert("KAFKA_ZOOKEEPER_CONNECT".into(), format!("{}:{}", zookeeper.identity.workload_name(), zk_client_port));
        kafka_config.insert(
            "KAFKA_DEFAULT_REPLICATION_FACTOR".into(),
            kafka.default_replication_factor.unwrap_or(default_factor).to_string(),
        );
        kafka_config.insert(
            "KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR".into(),
            kafka.offsets_topic_replication_factor.unwrap_or(default_factor).to_string(),
        );
        kafka_config.insert(
            "KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR".into(),
            kafka.transaction_state_log_replication_factor.unwrap_or(default_factor).to_string(),
        );
        kafka_config.insert(KAFKA_PROFILE.metrics_env.into(), kafka.metrics.is_some().to_string());
        let brokers = Self {
            identity: ClusterIdentity::new(ns, name, ComponentKind::Kafka),
            image: kafka.image.clone().unwrap_or_else(|| images.kafka.clone()),
            replicas: i32::try_from(kafka.replicas).context("broker replicas out of range")?,
            storage: kafka.storage.clone(),
            healthcheck: HealthCheck::resolve(&kafka.healthcheck, ComponentKind::Kafka),
            labels,
            config: kafka_config,
            metrics: kafka.metrics.clone(),
            build: None,
        };

        Ok(vec![zookeeper, brokers])
    }

    /// Parse the spec of the Connect workers declared by the given resource.
    pub fn from_kafka_connect(connect: &KafkaConnect, images: &ImageDefaults) -> Result<Self> {
        let (ns, name) = (RequiredMetadata::namespace(connect), RequiredMetadata::name(connect));
        connect.spec.validate().with_context(|| format!("invalid KafkaConnect {}/{}", ns, name))?;
        let spec = &connect.spec;

        let mut config = BTreeMap::new();
        config.insert("KAFKA_CONNECT_BOOTSTRAP_SERVERS".into(), spec.bootstrap_servers.clone());
        config.insert(CONNECT_PROFILE.metrics_env.into(), spec.metrics.is_some().to_string());
        if !spec.config.is_empty() {
            let rendered = spec.config.iter().map(|(key, val)| format!("{}={}", key, val)).collect::<Vec<_>>().join("\n");
            config.insert("KAFKA_CONNECT_CONFIGURATION".into(), rendered);
        }

        Ok(Self {
            identity: ClusterIdentity::new(ns, name, ComponentKind::Connect),
            image: spec.image.clone().unwrap_or_else(|| images.connect.clone()),
            replicas: i32::try_from(spec.replicas).context("worker replicas out of range")?,
            storage: StorageSpec::Ephemeral,
            healthcheck: HealthCheck::resolve(&spec.healthcheck, ComponentKind::Connect),
            labels: user_labels(connect.labels()),
            config,
            metrics: spec.metrics.clone(),
            build: spec.build.clone(),
        })
    }

    pub fn kind(&self) -> ComponentKind {
        self.identity.kind
    }
}

/// Filter out labels carrying the reserved prefix.
fn user_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| !key.starts_with(keel_core::RESERVED_LABEL_PREFIX))
        .map(|(key, val)| (key.clone(), val.clone()))
        .collect()
}
