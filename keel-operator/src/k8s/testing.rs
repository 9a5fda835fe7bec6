//! In-memory platform used by tests.
//!
//! Mimics the parts of the K8s controllers which the flows depend on: StatefulSets with the
//! `OnDelete` strategy keep their pods at the old revision until those pods are deleted, and
//! deleted pods are recreated, ready, at the current update revision.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, PodCondition, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use keel_core::crd::{ClusterStatus, Condition, KafkaCluster, KafkaConnect, RequiredMetadata, StorageSpec};

use crate::cluster::{ClusterIdentity, ClusterSpec, ComponentKind, HealthCheck, SourceKind, WorkloadKind};
use crate::error::PlatformError;
use crate::k8s::generator::{AuxiliaryKind, AuxiliaryManifest, LABEL_REVISION};
use crate::k8s::pipeline::FlowSettings;
use crate::k8s::platform::{Manifest, Platform, PlatformResult, ResourceKind};

type Key = (String, String);

/// A write issued against the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Apply(ResourceKind, String),
    Delete(ResourceKind, String),
    Scale(String, i32),
    Conditions(String),
}

#[derive(Debug, Default)]
struct FakeState {
    statefulsets: BTreeMap<Key, StatefulSet>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    config_maps: BTreeMap<Key, ConfigMap>,
    pods: BTreeMap<Key, Pod>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    auxiliary: BTreeMap<(AuxiliaryKind, String, String), AuxiliaryManifest>,
    kafka_clusters: Vec<KafkaCluster>,
    kafka_connects: Vec<KafkaConnect>,
    statuses: HashMap<(SourceKind, String, String), ClusterStatus>,
    ops: Vec<Op>,
    failing_applies: Vec<ResourceKind>,
    next_uid: u64,
}

/// An in-memory platform which records every write.
#[derive(Clone, Debug, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes issued so far.
    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Make every apply of the given kind fail.
    pub fn fail_applies(&self, kind: ResourceKind) {
        self.lock().failing_applies.push(kind);
    }

    pub fn add_kafka_cluster(&self, cluster: KafkaCluster) {
        self.lock().kafka_clusters.push(cluster);
    }

    pub fn add_kafka_connect(&self, connect: KafkaConnect) {
        self.lock().kafka_connects.push(connect);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let key = key_of(&pvc.metadata);
        self.lock().pvcs.insert(key, pvc);
    }

    /// The live pods of the given StatefulSet, ordered by name.
    pub fn pods_of(&self, ident: &ClusterIdentity) -> Vec<Pod> {
        let owner = ident.workload_name();
        self.lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == &ident.namespace && owner_of(pod) == Some(owner.as_str()))
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    /// The recorded status of a declaring resource.
    pub fn status(&self, source: SourceKind, ns: &str, name: &str) -> Option<ClusterStatus> {
        self.lock().statuses.get(&(source, ns.into(), name.into())).cloned()
    }

    pub fn has(&self, kind: ResourceKind, ns: &str, name: &str) -> bool {
        let state = self.lock();
        let key = (ns.to_string(), name.to_string());
        match kind {
            ResourceKind::StatefulSet => state.statefulsets.contains_key(&key),
            ResourceKind::Deployment => state.deployments.contains_key(&key),
            ResourceKind::Service => state.services.contains_key(&key),
            ResourceKind::ConfigMap => state.config_maps.contains_key(&key),
            ResourceKind::PersistentVolumeClaim => state.pvcs.contains_key(&key),
            ResourceKind::Pod => state.pods.contains_key(&key),
            ResourceKind::ImageStream => state.auxiliary.contains_key(&(AuxiliaryKind::ImageStream, key.0, key.1)),
            ResourceKind::BuildConfig => state.auxiliary.contains_key(&(AuxiliaryKind::BuildConfig, key.0, key.1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake platform state poisoned")
    }
}

impl FakeState {
    fn apply_statefulset(&mut self, mut sts: StatefulSet) {
        let key = key_of(&sts.metadata);
        let generation = match self.statefulsets.get(&key) {
            Some(live) if live.spec == sts.spec => live.metadata.generation.unwrap_or(1),
            Some(live) => live.metadata.generation.unwrap_or(1) + 1,
            None => 1,
        };
        sts.metadata.generation = Some(generation);
        sts.metadata.uid = Some(match self.statefulsets.get(&key).and_then(|live| live.metadata.uid.clone()) {
            Some(uid) => uid,
            None => self.uid(),
        });
        self.statefulsets.insert(key.clone(), sts);
        self.sync_statefulset(&key);
    }

    /// Converge status & pods of a StatefulSet, leaving existing pods at their revision.
    fn sync_statefulset(&mut self, key: &Key) {
        let (revision, replicas, labels, owner_uid) = match self.statefulsets.get_mut(key) {
            Some(sts) => {
                let spec = sts.spec.clone().unwrap_or_default();
                let revision = revision_of(&spec.template);
                let replicas = spec.replicas.unwrap_or(1);
                sts.status = Some(StatefulSetStatus {
                    observed_generation: sts.metadata.generation,
                    replicas,
                    ready_replicas: Some(replicas),
                    update_revision: Some(revision.clone()),
                    ..Default::default()
                });
                let labels = spec.template.metadata.and_then(|meta| meta.labels).unwrap_or_default();
                (revision, replicas, labels, sts.metadata.uid.clone().unwrap_or_default())
            }
            None => return,
        };
        let (ns, name) = key.clone();
        let stale: Vec<Key> = self
            .pods
            .iter()
            .filter(|((pod_ns, _), pod)| pod_ns == &ns && owner_of(pod) == Some(name.as_str()))
            .filter(|(_, pod)| ordinal_of(pod, &name).map_or(true, |ordinal| ordinal >= replicas))
            .map(|(key, _)| key.clone())
            .collect();
        for pod in stale {
            self.pods.remove(&pod);
        }
        for ordinal in 0..replicas {
            let pod_key = (ns.clone(), format!("{}-{}", name, ordinal));
            if !self.pods.contains_key(&pod_key) {
                let pod = self.new_pod(&pod_key, &name, &owner_uid, labels.clone(), &revision);
                self.pods.insert(pod_key, pod);
            }
        }
    }

    fn new_pod(&mut self, key: &Key, owner: &str, owner_uid: &str, mut labels: BTreeMap<String, String>, revision: &str) -> Pod {
        labels.insert(LABEL_REVISION.into(), revision.into());
        Pod {
            metadata: ObjectMeta {
                namespace: Some(key.0.clone()),
                name: Some(key.1.clone()),
                uid: Some(self.uid()),
                labels: Some(labels),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "StatefulSet".into(),
                    name: owner.into(),
                    uid: owner_uid.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn apply_deployment(&mut self, mut deployment: Deployment) {
        let key = key_of(&deployment.metadata);
        let generation = match self.deployments.get(&key) {
            Some(live) if live.spec == deployment.spec => live.metadata.generation.unwrap_or(1),
            Some(live) => live.metadata.generation.unwrap_or(1) + 1,
            None => 1,
        };
        deployment.metadata.generation = Some(generation);
        self.deployments.insert(key.clone(), deployment);
        self.sync_deployment(&key);
    }

    /// Deployments roll out instantly.
    fn sync_deployment(&mut self, key: &Key) {
        if let Some(deployment) = self.deployments.get_mut(key) {
            let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
            deployment.status = Some(DeploymentStatus {
                observed_generation: deployment.metadata.generation,
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                available_replicas: Some(replicas),
                unavailable_replicas: None,
                ..Default::default()
            });
        }
    }

    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }
}

fn key_of(meta: &ObjectMeta) -> Key {
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

fn owner_of(pod: &Pod) -> Option<&str> {
    pod.metadata.owner_references.as_ref()?.first().map(|owner| owner.name.as_str())
}

fn ordinal_of(pod: &Pod, owner: &str) -> Option<i32> {
    pod.metadata.name.as_deref()?.strip_prefix(owner)?.strip_prefix('-')?.parse().ok()
}

fn revision_of(template: &k8s_openapi::api::core::v1::PodTemplateSpec) -> String {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(template).unwrap_or_default().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Whether the labels satisfy an equality-based selector such as `a=b,c=d`.
fn selects(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.split(',').filter(|term| !term.is_empty()).all(|term| match term.split_once('=') {
        Some((key, val)) => labels.and_then(|labels| labels.get(key)).map_or(false, |live| live == val),
        None => false,
    })
}

fn list<T: Clone>(map: &BTreeMap<Key, T>, ns: &str, selector: &str, meta: impl Fn(&T) -> &ObjectMeta) -> Vec<T> {
    map.iter()
        .filter(|((obj_ns, _), obj)| obj_ns == ns && selects(selector, meta(*obj).labels.as_ref()))
        .map(|(_, obj)| obj.clone())
        .collect()
}

fn get<T: Clone>(map: &BTreeMap<Key, T>, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<T> {
    map.get(&(ns.to_string(), name.to_string())).cloned().ok_or_else(|| PlatformError::not_found(kind, ns, name))
}

#[async_trait]
impl Platform for FakePlatform {
    async fn get_statefulset(&self, ns: &str, name: &str) -> PlatformResult<StatefulSet> {
        get(&self.lock().statefulsets, ResourceKind::StatefulSet, ns, name)
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> PlatformResult<Deployment> {
        get(&self.lock().deployments, ResourceKind::Deployment, ns, name)
    }

    async fn get_pod(&self, ns: &str, name: &str) -> PlatformResult<Pod> {
        get(&self.lock().pods, ResourceKind::Pod, ns, name)
    }

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> PlatformResult<Vec<StatefulSet>> {
        Ok(list(&self.lock().statefulsets, ns, selector, |obj| &obj.metadata))
    }

    async fn list_deployments(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Deployment>> {
        Ok(list(&self.lock().deployments, ns, selector, |obj| &obj.metadata))
    }

    async fn list_services(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Service>> {
        Ok(list(&self.lock().services, ns, selector, |obj| &obj.metadata))
    }

    async fn list_config_maps(&self, ns: &str, selector: &str) -> PlatformResult<Vec<ConfigMap>> {
        Ok(list(&self.lock().config_maps, ns, selector, |obj| &obj.metadata))
    }

    async fn list_pods(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Pod>> {
        Ok(list(&self.lock().pods, ns, selector, |obj| &obj.metadata))
    }

    async fn list_pvcs(&self, ns: &str, selector: &str) -> PlatformResult<Vec<PersistentVolumeClaim>> {
        Ok(list(&self.lock().pvcs, ns, selector, |obj| &obj.metadata))
    }

    async fn list_auxiliary(&self, ns: &str, kind: AuxiliaryKind, selector: &str) -> PlatformResult<Vec<AuxiliaryManifest>> {
        Ok(self
            .lock()
            .auxiliary
            .values()
            .filter(|aux| aux.kind == kind && aux.namespace == ns && selects(selector, Some(&aux.labels)))
            .cloned()
            .collect())
    }

    async fn list_kafka_clusters(&self, ns: &str) -> PlatformResult<Vec<KafkaCluster>> {
        Ok(self.lock().kafka_clusters.iter().filter(|obj| RequiredMetadata::namespace(*obj) == ns).cloned().collect())
    }

    async fn list_kafka_connects(&self, ns: &str) -> PlatformResult<Vec<KafkaConnect>> {
        Ok(self.lock().kafka_connects.iter().filter(|obj| RequiredMetadata::namespace(*obj) == ns).cloned().collect())
    }

    async fn apply(&self, manifest: &Manifest) -> PlatformResult<()> {
        let mut state = self.lock();
        if state.failing_applies.contains(&manifest.kind()) {
            return Err(PlatformError::Invalid(format!("apply of {} {} rejected", manifest.kind(), manifest.name())));
        }
        state.ops.push(Op::Apply(manifest.kind(), manifest.name().into()));
        match manifest.clone() {
            Manifest::StatefulSet(sts) => state.apply_statefulset(sts),
            Manifest::Deployment(deployment) => state.apply_deployment(deployment),
            Manifest::Service(svc) => {
                state.services.insert(key_of(&svc.metadata), svc);
            }
            Manifest::ConfigMap(cm) => {
                state.config_maps.insert(key_of(&cm.metadata), cm);
            }
            Manifest::Auxiliary(aux) => {
                state.auxiliary.insert((aux.kind, aux.namespace.clone(), aux.name.clone()), aux);
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<()> {
        let mut state = self.lock();
        state.ops.push(Op::Delete(kind, name.into()));
        let key = (ns.to_string(), name.to_string());
        match kind {
            ResourceKind::StatefulSet => {
                state.statefulsets.remove(&key);
                state.pods.retain(|_, pod| owner_of(pod) != Some(name));
            }
            ResourceKind::Deployment => {
                state.deployments.remove(&key);
            }
            ResourceKind::Service => {
                state.services.remove(&key);
            }
            ResourceKind::ConfigMap => {
                state.config_maps.remove(&key);
            }
            ResourceKind::PersistentVolumeClaim => {
                state.pvcs.remove(&key);
            }
            ResourceKind::Pod => {
                // The owning StatefulSet recreates the pod at its update revision.
                if let Some(owner) = state.pods.remove(&key).as_ref().and_then(owner_of).map(String::from) {
                    state.sync_statefulset(&(ns.to_string(), owner));
                }
            }
            ResourceKind::ImageStream => {
                state.auxiliary.remove(&(AuxiliaryKind::ImageStream, key.0, key.1));
            }
            ResourceKind::BuildConfig => {
                state.auxiliary.remove(&(AuxiliaryKind::BuildConfig, key.0, key.1));
            }
        }
        Ok(())
    }

    async fn scale(&self, kind: WorkloadKind, ns: &str, name: &str, replicas: i32) -> PlatformResult<()> {
        let mut state = self.lock();
        state.ops.push(Op::Scale(name.into(), replicas));
        match kind {
            WorkloadKind::StatefulSet => {
                let mut sts = get(&state.statefulsets, ResourceKind::StatefulSet, ns, name)?;
                if let Some(spec) = sts.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
                state.apply_statefulset(sts);
            }
            WorkloadKind::Deployment => {
                let mut deployment = get(&state.deployments, ResourceKind::Deployment, ns, name)?;
                if let Some(spec) = deployment.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
                state.apply_deployment(deployment);
            }
        }
        Ok(())
    }

    async fn record_conditions(&self, source: SourceKind, ns: &str, name: &str, conditions: Vec<Condition>) -> PlatformResult<()> {
        let mut state = self.lock();
        let status = state.statuses.entry((source, ns.into(), name.into())).or_default();
        let mut changed = false;
        for cond in conditions {
            changed |= status.upsert_condition(cond);
        }
        if changed {
            state.ops.push(Op::Conditions(name.into()));
        }
        Ok(())
    }
}

/// Flow settings with short timeouts.
pub fn test_settings() -> FlowSettings {
    FlowSettings {
        operation_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        roll_deadline: Duration::from_secs(1),
        roll_backoff: Duration::from_millis(10),
        roll_backoff_max: Duration::from_millis(100),
        image_builds_enabled: false,
    }
}

/// A component spec with ephemeral storage and no metrics.
pub fn component_spec(kind: ComponentKind, replicas: i32, image: &str) -> ClusterSpec {
    let profile = kind.profile();
    ClusterSpec {
        identity: ClusterIdentity::new("default", "events", kind),
        image: image.into(),
        replicas,
        storage: StorageSpec::Ephemeral,
        healthcheck: HealthCheck {
            initial_delay_seconds: profile.default_initial_delay_seconds,
            timeout_seconds: profile.default_timeout_seconds,
        },
        labels: BTreeMap::new(),
        config: maplit::btreemap! {
            profile.metrics_env.to_string() => "false".to_string(),
        },
        metrics: None,
        build: None,
    }
}

pub fn persistent(size: &str, delete_claim: bool) -> StorageSpec {
    StorageSpec::PersistentClaim {
        size: size.into(),
        class: None,
        selector: None,
        delete_claim,
    }
}
