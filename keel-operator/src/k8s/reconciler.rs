//! Work units & their execution.
//!
//! Every watch event and every periodic sweep is turned into work units, one per component. A
//! work unit holds its component's lock for the duration of its flow, so units of the same
//! component never overlap while units of different components run concurrently.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_core::crd::{Condition, KafkaCluster, KafkaConnect, RequiredMetadata};
use keel_core::LABEL_CLUSTER;

use crate::cluster::{ClusterIdentity, ClusterSpec, ComponentKind, ImageDefaults, SourceKind, WorkloadKind};
use crate::error::{OperationError, OperationResult};
use crate::k8s::generator::kind_selector;
use crate::k8s::lock::LockRegistry;
use crate::k8s::pipeline::Orchestrator;
use crate::k8s::platform::{LiveState, Platform, PlatformResult};

/// The condition reason of a successfully reconciled component.
const REASON_RECONCILED: &str = "Reconciled";
/// The condition reason of a component whose storage is unchanged.
const REASON_STORAGE_UNCHANGED: &str = "StorageUnchanged";
/// The condition reason of a rejected storage change.
const REASON_STORAGE_REJECTED: &str = "StorageChangeRejected";

/// A unit of reconciliation work for a single component.
#[derive(Clone, Debug)]
pub enum WorkUnit {
    /// Create or update the component.
    Apply(ClusterSpec),
    /// Delete all resources of the component.
    Delete(ClusterIdentity),
    /// The declaring resource failed validation, only its status is updated.
    Invalid {
        source: SourceKind,
        namespace: String,
        name: String,
        kinds: Vec<ComponentKind>,
        message: String,
    },
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply(spec) => write!(f, "apply {}", spec.identity),
            Self::Delete(ident) => write!(f, "delete {}", ident),
            Self::Invalid { source, namespace, name, .. } => write!(f, "invalid {} {}/{}", source, namespace, name),
        }
    }
}

impl WorkUnit {
    /// The work units of a declared KafkaCluster.
    pub fn for_kafka_cluster(cluster: &KafkaCluster, images: &ImageDefaults) -> Vec<Self> {
        match ClusterSpec::from_kafka_cluster(cluster, images) {
            Ok(specs) => specs.into_iter().map(Self::Apply).collect(),
            Err(err) => vec![Self::Invalid {
                source: SourceKind::KafkaCluster,
                namespace: RequiredMetadata::namespace(cluster).into(),
                name: RequiredMetadata::name(cluster).into(),
                kinds: vec![ComponentKind::Zookeeper, ComponentKind::Kafka],
                message: format!("{:#}", err),
            }],
        }
    }

    /// The work units of a declared KafkaConnect.
    pub fn for_kafka_connect(connect: &KafkaConnect, images: &ImageDefaults) -> Vec<Self> {
        match ClusterSpec::from_kafka_connect(connect, images) {
            Ok(spec) => vec![Self::Apply(spec)],
            Err(err) => vec![Self::Invalid {
                source: SourceKind::KafkaConnect,
                namespace: RequiredMetadata::namespace(connect).into(),
                name: RequiredMetadata::name(connect).into(),
                kinds: vec![ComponentKind::Connect],
                message: format!("{:#}", err),
            }],
        }
    }

    /// The delete work units of a removed KafkaCluster.
    pub fn deleted_kafka_cluster(cluster: &KafkaCluster) -> Vec<Self> {
        let (ns, name) = (RequiredMetadata::namespace(cluster), RequiredMetadata::name(cluster));
        vec![
            Self::Delete(ClusterIdentity::new(ns, name, ComponentKind::Kafka)),
            Self::Delete(ClusterIdentity::new(ns, name, ComponentKind::Zookeeper)),
        ]
    }

    /// The delete work units of a removed KafkaConnect.
    pub fn deleted_kafka_connect(connect: &KafkaConnect) -> Vec<Self> {
        let (ns, name) = (RequiredMetadata::namespace(connect), RequiredMetadata::name(connect));
        vec![Self::Delete(ClusterIdentity::new(ns, name, ComponentKind::Connect))]
    }

    /// The identities of the components covered by this unit.
    pub fn identities(&self) -> Vec<ClusterIdentity> {
        match self {
            Self::Apply(spec) => vec![spec.identity.clone()],
            Self::Delete(ident) => vec![ident.clone()],
            Self::Invalid { namespace, name, kinds, .. } => kinds.iter().map(|kind| ClusterIdentity::new(namespace.as_str(), name.as_str(), *kind)).collect(),
        }
    }
}

/// Executes work units against the platform.
#[derive(Clone)]
pub struct Reconciler {
    platform: Arc<dyn Platform>,
    orchestrator: Orchestrator,
    locks: LockRegistry,
    lock_timeout: Duration,
}

impl Reconciler {
    pub fn new(platform: Arc<dyn Platform>, orchestrator: Orchestrator, locks: LockRegistry, lock_timeout: Duration) -> Self {
        Self {
            platform,
            orchestrator,
            locks,
            lock_timeout,
        }
    }

    /// Run the given work unit to completion.
    #[tracing::instrument(level = "debug", skip(self, unit), fields(unit = %unit))]
    pub async fn run(&self, unit: WorkUnit) -> OperationResult<()> {
        match unit {
            WorkUnit::Apply(spec) => self.apply(&spec).await,
            WorkUnit::Delete(ident) => self.delete(&ident).await,
            WorkUnit::Invalid {
                source,
                namespace,
                name,
                kinds,
                message,
            } => {
                tracing::warn!(%namespace, %name, %message, "rejecting invalid {}", source);
                let err = OperationError::InvalidSpec(message);
                let now = chrono::Utc::now().to_rfc3339();
                let conditions = kinds
                    .iter()
                    .map(|kind| Condition::new(format!("{}Ready", kind), false, err.reason(), err.to_string(), now.as_str()))
                    .collect();
                self.platform.record_conditions(source, &namespace, &name, conditions).await?;
                Ok(())
            }
        }
    }

    /// Create or update the given component, recording the outcome on its declaring resource.
    async fn apply(&self, spec: &ClusterSpec) -> OperationResult<()> {
        let ident = &spec.identity;
        let _guard = self.locks.acquire(ident, self.lock_timeout).await?;

        let res = match LiveState::fetch(self.platform.as_ref(), ident).await {
            Ok(live) => self.orchestrator.update(spec, live).await.map(Some),
            Err(err) if err.is_not_found() => self.orchestrator.create(spec).await.map(|_| None),
            Err(err) => Err(err.into()),
        };

        let now = chrono::Utc::now().to_rfc3339();
        let ready_type = format!("{}Ready", ident.kind);
        let mut conditions = vec![match &res {
            Ok(_) => Condition::new(&ready_type, true, REASON_RECONCILED, "", now.as_str()),
            Err(err) => Condition::new(&ready_type, false, err.reason(), err.to_string(), now.as_str()),
        }];
        if let Ok(Some(diff)) = &res {
            let storage_type = format!("{}StorageChangeRejected", ident.kind);
            conditions.push(match diff.storage_rejected() {
                Some(reason) => Condition::new(storage_type, true, REASON_STORAGE_REJECTED, reason, now.as_str()),
                None => Condition::new(storage_type, false, REASON_STORAGE_UNCHANGED, "", now.as_str()),
            });
        }
        if let Err(err) = self.platform.record_conditions(ident.kind.source(), &ident.namespace, &ident.name, conditions).await {
            tracing::warn!(error = %err, cluster = %ident, "error recording status conditions");
        }

        match &res {
            Ok(Some(diff)) if !diff.is_empty() => tracing::info!(cluster = %ident, "cluster reconciled"),
            Ok(None) => tracing::info!(cluster = %ident, "cluster created"),
            Ok(_) => tracing::debug!(cluster = %ident, "cluster already converged"),
            Err(_) => (),
        }
        res.map(|_| ())
    }

    /// Delete all resources of the given component.
    async fn delete(&self, ident: &ClusterIdentity) -> OperationResult<()> {
        let guard = self.locks.acquire(ident, self.lock_timeout).await?;
        let res = self.orchestrator.delete(ident).await;
        drop(guard);
        if res.is_ok() {
            tracing::info!(cluster = %ident, "cluster deleted");
            self.locks.forget(ident);
        }
        res
    }

    /// Compute the work units of a full namespace sweep.
    ///
    /// Every declared component gets an apply unit, and every live component without a
    /// declaration gets a delete unit.
    #[tracing::instrument(level = "debug", skip(self, images))]
    pub async fn sweep(&self, ns: &str, images: &ImageDefaults) -> PlatformResult<Vec<WorkUnit>> {
        let mut units = Vec::new();
        for cluster in self.platform.list_kafka_clusters(ns).await? {
            units.extend(WorkUnit::for_kafka_cluster(&cluster, images));
        }
        for connect in self.platform.list_kafka_connects(ns).await? {
            units.extend(WorkUnit::for_kafka_connect(&connect, images));
        }
        let declared: BTreeSet<_> = units.iter().flat_map(WorkUnit::identities).collect();
        let live = self.live_identities(ns).await?;

        let plan = plan_sweep(&declared, &live);
        tracing::debug!(create = plan.create.len(), update = plan.update.len(), delete = plan.delete.len(), "full reconciliation sweep planned");
        units.extend(plan.delete.into_iter().map(WorkUnit::Delete));
        Ok(units)
    }

    /// Discover the identities of all live components of the namespace.
    async fn live_identities(&self, ns: &str) -> PlatformResult<BTreeSet<ClusterIdentity>> {
        let mut live = BTreeSet::new();
        for kind in ComponentKind::ALL {
            let selector = kind_selector(kind);
            let names: Vec<Option<String>> = match kind.profile().workload {
                WorkloadKind::StatefulSet => self
                    .platform
                    .list_statefulsets(ns, &selector)
                    .await?
                    .into_iter()
                    .map(|sts| sts.metadata.labels.and_then(|mut labels| labels.remove(LABEL_CLUSTER)))
                    .collect(),
                WorkloadKind::Deployment => self
                    .platform
                    .list_deployments(ns, &selector)
                    .await?
                    .into_iter()
                    .map(|deployment| deployment.metadata.labels.and_then(|mut labels| labels.remove(LABEL_CLUSTER)))
                    .collect(),
            };
            live.extend(names.into_iter().flatten().map(|name| ClusterIdentity::new(ns, name, kind)));
        }
        Ok(live)
    }
}

/// The discrepancies between declared & live components.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepPlan {
    /// Declared components without live resources.
    pub create: BTreeSet<ClusterIdentity>,
    /// Declared components with live resources.
    pub update: BTreeSet<ClusterIdentity>,
    /// Live components which are no longer declared.
    pub delete: BTreeSet<ClusterIdentity>,
}

/// Set-difference the declared components against the live ones.
pub fn plan_sweep(declared: &BTreeSet<ClusterIdentity>, live: &BTreeSet<ClusterIdentity>) -> SweepPlan {
    SweepPlan {
        create: declared.difference(live).cloned().collect(),
        update: declared.intersection(live).cloned().collect(),
        delete: live.difference(declared).cloned().collect(),
    }
}
