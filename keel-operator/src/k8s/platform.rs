//! The operations the reconciliation flows need from the orchestration platform.
//!
//! Flows only ever talk to the platform through the `Platform` trait, which is implemented
//! against the K8s API by `KubePlatform` and in memory by the test fake.

use async_trait::async_trait;
use derive_more::Display;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use keel_core::crd::{Condition, KafkaCluster, KafkaConnect};

use crate::cluster::{ClusterIdentity, SourceKind, WorkloadKind};
use crate::error::PlatformError;
use crate::k8s::generator::{cluster_selector, AuxiliaryKind, AuxiliaryManifest, Workload};

/// A result type used with platform operations.
pub type PlatformResult<T> = ::std::result::Result<T, PlatformError>;

/// The kinds of platform resources managed by the operator.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    StatefulSet,
    Deployment,
    Service,
    ConfigMap,
    PersistentVolumeClaim,
    Pod,
    ImageStream,
    BuildConfig,
}

impl From<WorkloadKind> for ResourceKind {
    fn from(kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::StatefulSet => Self::StatefulSet,
            WorkloadKind::Deployment => Self::Deployment,
        }
    }
}

impl From<AuxiliaryKind> for ResourceKind {
    fn from(kind: AuxiliaryKind) -> Self {
        match kind {
            AuxiliaryKind::ImageStream => Self::ImageStream,
            AuxiliaryKind::BuildConfig => Self::BuildConfig,
        }
    }
}

/// A resource to be created or replaced on the platform.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    Service(Service),
    ConfigMap(ConfigMap),
    Auxiliary(AuxiliaryManifest),
}

impl Manifest {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::StatefulSet(_) => ResourceKind::StatefulSet,
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::Service(_) => ResourceKind::Service,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Auxiliary(aux) => aux.kind.into(),
        }
    }

    pub fn name(&self) -> &str {
        let name = match self {
            Self::StatefulSet(obj) => obj.metadata.name.as_deref(),
            Self::Deployment(obj) => obj.metadata.name.as_deref(),
            Self::Service(obj) => obj.metadata.name.as_deref(),
            Self::ConfigMap(obj) => obj.metadata.name.as_deref(),
            Self::Auxiliary(aux) => Some(aux.name.as_str()),
        };
        name.unwrap_or_default()
    }
}

impl From<Workload> for Manifest {
    fn from(workload: Workload) -> Self {
        match workload {
            Workload::StatefulSet(sts) => Self::StatefulSet(sts),
            Workload::Deployment(deployment) => Self::Deployment(deployment),
        }
    }
}

/// The operations of the orchestration platform used by the operator.
///
/// Gets of missing resources fail with `PlatformError::NotFound`, deletes of missing resources
/// succeed. Writes are last-writer-wins.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_statefulset(&self, ns: &str, name: &str) -> PlatformResult<StatefulSet>;
    async fn get_deployment(&self, ns: &str, name: &str) -> PlatformResult<Deployment>;
    async fn get_pod(&self, ns: &str, name: &str) -> PlatformResult<Pod>;

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> PlatformResult<Vec<StatefulSet>>;
    async fn list_deployments(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Deployment>>;
    async fn list_services(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Service>>;
    async fn list_config_maps(&self, ns: &str, selector: &str) -> PlatformResult<Vec<ConfigMap>>;
    async fn list_pods(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Pod>>;
    async fn list_pvcs(&self, ns: &str, selector: &str) -> PlatformResult<Vec<PersistentVolumeClaim>>;
    async fn list_auxiliary(&self, ns: &str, kind: AuxiliaryKind, selector: &str) -> PlatformResult<Vec<AuxiliaryManifest>>;

    /// List all declared KafkaClusters of the namespace.
    async fn list_kafka_clusters(&self, ns: &str) -> PlatformResult<Vec<KafkaCluster>>;
    /// List all declared KafkaConnects of the namespace.
    async fn list_kafka_connects(&self, ns: &str) -> PlatformResult<Vec<KafkaConnect>>;

    /// Create the given resource, or replace the fields managed by the operator.
    async fn apply(&self, manifest: &Manifest) -> PlatformResult<()>;
    /// Delete the given resource.
    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<()>;
    /// Set the replica count of the given workload.
    async fn scale(&self, kind: WorkloadKind, ns: &str, name: &str, replicas: i32) -> PlatformResult<()>;
    /// Upsert the given conditions into the status of a declaring resource.
    async fn record_conditions(&self, source: SourceKind, ns: &str, name: &str, conditions: Vec<Condition>) -> PlatformResult<()>;
}

/// The live resources of one managed component.
#[derive(Clone, Debug)]
pub struct LiveState {
    pub workload: Workload,
    pub services: Vec<Service>,
    pub config_maps: Vec<ConfigMap>,
    pub pods: Vec<Pod>,
}

impl LiveState {
    /// Fetch the live state of the given component.
    ///
    /// Fails with `PlatformError::NotFound` when the component's workload does not exist.
    #[tracing::instrument(level = "debug", skip(platform))]
    pub async fn fetch(platform: &dyn Platform, ident: &ClusterIdentity) -> PlatformResult<Self> {
        let (ns, name) = (ident.namespace.as_str(), ident.workload_name());
        let workload = match ident.kind.profile().workload {
            WorkloadKind::StatefulSet => Workload::StatefulSet(platform.get_statefulset(ns, &name).await?),
            WorkloadKind::Deployment => Workload::Deployment(platform.get_deployment(ns, &name).await?),
        };
        let selector = cluster_selector(ident);
        let services = platform.list_services(ns, &selector).await?;
        let config_maps = platform.list_config_maps(ns, &selector).await?;
        let pods = platform.list_pods(ns, &selector).await?;
        Ok(Self {
            workload,
            services,
            config_maps,
            pods,
        })
    }
}
