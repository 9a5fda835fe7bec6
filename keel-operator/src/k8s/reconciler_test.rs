use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use keel_core::crd::{Condition, KafkaCluster, KafkaConnect, CONDITION_FALSE, CONDITION_TRUE};

use super::generator::{generate, AuxiliaryKind, AuxiliaryManifest};
use super::lock::LockRegistry;
use super::pipeline::Orchestrator;
use super::platform::{Manifest, Platform, PlatformResult, ResourceKind};
use super::reconciler::{plan_sweep, Reconciler, WorkUnit};
use super::testing::{component_spec, persistent, test_settings, FakePlatform};
use crate::admin::testing::FakeConnector;
use crate::cluster::{ClusterIdentity, ComponentKind, ImageDefaults, SourceKind, WorkloadKind};
use crate::error::OperationError;

fn images() -> ImageDefaults {
    ImageDefaults {
        kafka: "kafka:default".into(),
        zookeeper: "zookeeper:default".into(),
        connect: "connect:default".into(),
    }
}

fn reconciler(platform: Arc<dyn Platform>, locks: LockRegistry, lock_timeout: Duration) -> Reconciler {
    let orchestrator = Orchestrator::new(platform.clone(), Arc::new(FakeConnector::default()), test_settings());
    Reconciler::new(platform, orchestrator, locks, lock_timeout)
}

fn kafka_cluster(name: &str, brokers: u32) -> Result<KafkaCluster> {
    Ok(serde_json::from_value(serde_json::json!({
        "apiVersion": "keel.rs/v1beta1",
        "kind": "KafkaCluster",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {
            "kafka": {"replicas": brokers},
            "zookeeper": {"replicas": 3},
        },
    }))?)
}

#[test]
fn plan_sweep_set_differences_declared_and_live() -> Result<()> {
    let ident = |name: &str, kind| ClusterIdentity::new("default", name, kind);
    let declared: BTreeSet<_> = vec![ident("a", ComponentKind::Kafka), ident("b", ComponentKind::Kafka), ident("b", ComponentKind::Zookeeper)].into_iter().collect();
    let live: BTreeSet<_> = vec![ident("b", ComponentKind::Kafka), ident("c", ComponentKind::Connect)].into_iter().collect();

    let plan = plan_sweep(&declared, &live);

    let expect = |idents: Vec<ClusterIdentity>| idents.into_iter().collect::<BTreeSet<_>>();
    assert!(plan.create == expect(vec![ident("a", ComponentKind::Kafka), ident("b", ComponentKind::Zookeeper)]), "unexpected create set {:?}", plan.create);
    assert!(plan.update == expect(vec![ident("b", ComponentKind::Kafka)]), "unexpected update set {:?}", plan.update);
    assert!(plan.delete == expect(vec![ident("c", ComponentKind::Connect)]), "unexpected delete set {:?}", plan.delete);
    Ok(())
}

#[tokio::test]
async fn sweep_applies_declared_and_deletes_orphans() -> Result<()> {
    let platform = FakePlatform::new();
    platform.add_kafka_cluster(kafka_cluster("events", 3)?);
    // A leftover of a cluster whose declaration was deleted while the watch was down.
    let mut orphan = component_spec(ComponentKind::Kafka, 1, "kafka:1");
    orphan.identity = ClusterIdentity::new("default", "old", ComponentKind::Kafka);
    platform.apply(&generate(&orphan).workload.into()).await?;

    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(1));
    let units = reconciler.sweep("default", &images()).await?;

    let desc: Vec<_> = units.iter().map(|unit| unit.to_string()).collect();
    let expected = vec![
        "apply default/events/Zookeeper".to_string(),
        "apply default/events/Kafka".to_string(),
        "delete default/old/Kafka".to_string(),
    ];
    assert!(desc == expected, "expected units {:?}, got {:?}", expected, desc);
    Ok(())
}

#[tokio::test]
async fn apply_creates_then_records_ready() -> Result<()> {
    let platform = FakePlatform::new();
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(1));
    let cluster = kafka_cluster("events", 3)?;

    for unit in WorkUnit::for_kafka_cluster(&cluster, &images()) {
        reconciler.run(unit).await?;
    }

    assert!(platform.has(ResourceKind::StatefulSet, "default", "events-zookeeper"), "expected zookeeper workload");
    assert!(platform.has(ResourceKind::StatefulSet, "default", "events-kafka"), "expected kafka workload");
    let status = platform.status(SourceKind::KafkaCluster, "default", "events").unwrap_or_default();
    for type_ in ["ZookeeperReady", "KafkaReady"] {
        let cond = status.condition(type_);
        assert!(
            cond.map(|cond| cond.status.as_str()) == Some(CONDITION_TRUE),
            "expected {} to hold, got {:?}",
            type_,
            cond
        );
    }
    Ok(())
}

#[tokio::test]
async fn rejected_storage_change_is_recorded_as_condition() -> Result<()> {
    let platform = FakePlatform::new();
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(1));
    let mut spec = component_spec(ComponentKind::Kafka, 1, "kafka:1");
    spec.storage = persistent("10Gi", false);
    reconciler.run(WorkUnit::Apply(spec.clone())).await?;
    reconciler.run(WorkUnit::Apply(spec.clone())).await?;
    let status = platform.status(SourceKind::KafkaCluster, "default", "events").unwrap_or_default();
    let cond = status.condition("KafkaStorageChangeRejected");
    assert!(cond.map(|cond| cond.status.as_str()) == Some(CONDITION_FALSE), "expected no rejection, got {:?}", cond);

    spec.storage = persistent("50Gi", false);
    reconciler.run(WorkUnit::Apply(spec)).await?;

    let status = platform.status(SourceKind::KafkaCluster, "default", "events").unwrap_or_default();
    let cond = status.condition("KafkaStorageChangeRejected");
    assert!(cond.map(|cond| cond.status.as_str()) == Some(CONDITION_TRUE), "expected rejection, got {:?}", cond);
    let ready = status.condition("KafkaReady");
    assert!(ready.map(|cond| cond.status.as_str()) == Some(CONDITION_TRUE), "expected reconciliation to continue, got {:?}", ready);
    Ok(())
}

#[tokio::test]
async fn invalid_spec_only_records_condition() -> Result<()> {
    let platform = FakePlatform::new();
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(1));
    let cluster = kafka_cluster("events", 0)?;

    let units = WorkUnit::for_kafka_cluster(&cluster, &images());
    assert!(matches!(units.as_slice(), [WorkUnit::Invalid { .. }]), "expected a single invalid unit, got {:?}", units);
    for unit in units {
        reconciler.run(unit).await?;
    }

    assert!(!platform.has(ResourceKind::StatefulSet, "default", "events-kafka"), "expected no workload for invalid spec");
    let status = platform.status(SourceKind::KafkaCluster, "default", "events").unwrap_or_default();
    let cond = status.condition("KafkaReady");
    assert!(
        cond.map(|cond| (cond.status.as_str(), cond.reason.as_deref())) == Some((CONDITION_FALSE, Some("InvalidSpec"))),
        "expected InvalidSpec condition, got {:?}",
        cond
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lock_timeout_aborts_without_writes() -> Result<()> {
    let platform = FakePlatform::new();
    let locks = LockRegistry::new();
    let reconciler = reconciler(Arc::new(platform.clone()), locks.clone(), Duration::from_millis(100));
    let spec = component_spec(ComponentKind::Kafka, 1, "kafka:1");

    let _held = locks.acquire(&spec.identity, Duration::from_secs(1)).await?;
    let res = reconciler.run(WorkUnit::Apply(spec)).await;

    assert!(matches!(&res, Err(OperationError::LockTimeout(..))), "expected lock timeout, got {:?}", res);
    assert!(res.as_ref().err().map_or(false, OperationError::is_transient), "expected lock timeout to be transient");
    assert!(platform.ops().is_empty(), "expected no writes, got {:?}", platform.ops());
    Ok(())
}

#[tokio::test]
async fn delete_unit_removes_component() -> Result<()> {
    let platform = FakePlatform::new();
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(1));
    let cluster = kafka_cluster("events", 1)?;
    for unit in WorkUnit::for_kafka_cluster(&cluster, &images()) {
        reconciler.run(unit).await?;
    }

    for unit in WorkUnit::deleted_kafka_cluster(&cluster) {
        reconciler.run(unit).await?;
    }

    assert!(!platform.has(ResourceKind::StatefulSet, "default", "events-kafka"), "expected kafka workload to be deleted");
    assert!(!platform.has(ResourceKind::StatefulSet, "default", "events-zookeeper"), "expected zookeeper workload to be deleted");
    Ok(())
}

/// A platform which yields inside every call and tracks how many calls are in flight.
#[derive(Clone)]
struct TrackingPlatform {
    inner: FakePlatform,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl TrackingPlatform {
    fn new(inner: FakePlatform) -> Self {
        Self {
            inner,
            active: Default::default(),
            max_active: Default::default(),
        }
    }

    async fn track<T>(&self, fut: impl Future<Output = T>) -> T {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let out = fut.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl Platform for TrackingPlatform {
    async fn get_statefulset(&self, ns: &str, name: &str) -> PlatformResult<StatefulSet> {
        self.track(self.inner.get_statefulset(ns, name)).await
    }
    async fn get_deployment(&self, ns: &str, name: &str) -> PlatformResult<Deployment> {
        self.track(self.inner.get_deployment(ns, name)).await
    }
    async fn get_pod(&self, ns: &str, name: &str) -> PlatformResult<Pod> {
        self.track(self.inner.get_pod(ns, name)).await
    }
    async fn list_statefulsets(&self, ns: &str, selector: &str) -> PlatformResult<Vec<StatefulSet>> {
        self.track(self.inner.list_statefulsets(ns, selector)).await
    }
    async fn list_deployments(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Deployment>> {
        self.track(self.inner.list_deployments(ns, selector)).await
    }
    async fn list_services(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Service>> {
        self.track(self.inner.list_services(ns, selector)).await
    }
    async fn list_config_maps(&self, ns: &str, selector: &str) -> PlatformResult<Vec<ConfigMap>> {
        self.track(self.inner.list_config_maps(ns, selector)).await
    }
    async fn list_pods(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Pod>> {
        self.track(self.inner.list_pods(ns, selector)).await
    }
    async fn list_pvcs(&self, ns: &str, selector: &str) -> PlatformResult<Vec<PersistentVolumeClaim>> {
        self.track(self.inner.list_pvcs(ns, selector)).await
    }
    async fn list_auxiliary(&self, ns: &str, kind: AuxiliaryKind, selector: &str) -> PlatformResult<Vec<AuxiliaryManifest>> {
        self.track(self.inner.list_auxiliary(ns, kind, selector)).await
    }
    async fn list_kafka_clusters(&self, ns: &str) -> PlatformResult<Vec<KafkaCluster>> {
        self.track(self.inner.list_kafka_clusters(ns)).await
    }
    async fn list_kafka_connects(&self, ns: &str) -> PlatformResult<Vec<KafkaConnect>> {
        self.track(self.inner.list_kafka_connects(ns)).await
    }
    async fn apply(&self, manifest: &Manifest) -> PlatformResult<()> {
        self.track(self.inner.apply(manifest)).await
    }
    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<()> {
        self.track(self.inner.delete(kind, ns, name)).await
    }
    async fn scale(&self, kind: WorkloadKind, ns: &str, name: &str, replicas: i32) -> PlatformResult<()> {
        self.track(self.inner.scale(kind, ns, name, replicas)).await
    }
    async fn record_conditions(&self, source: SourceKind, ns: &str, name: &str, conditions: Vec<Condition>) -> PlatformResult<()> {
        self.track(self.inner.record_conditions(source, ns, name, conditions)).await
    }
}

#[tokio::test(start_paused = true)]
async fn units_of_one_component_never_overlap() -> Result<()> {
    let platform = TrackingPlatform::new(FakePlatform::new());
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(60));
    let spec = component_spec(ComponentKind::Kafka, 3, "kafka:1");
    let mut changed = spec.clone();
    changed.image = "kafka:2".into();

    let units = vec![WorkUnit::Apply(spec.clone()), WorkUnit::Apply(changed), WorkUnit::Apply(spec), WorkUnit::Delete(ClusterIdentity::new("default", "events", ComponentKind::Kafka))];
    let handles: Vec<_> = units
        .into_iter()
        .map(|unit| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(unit).await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    let max = platform.max_active.load(Ordering::SeqCst);
    assert!(max == 1, "expected at most one flow in flight, got {}", max);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn units_of_different_components_run_concurrently() -> Result<()> {
    let platform = TrackingPlatform::new(FakePlatform::new());
    let reconciler = reconciler(Arc::new(platform.clone()), LockRegistry::new(), Duration::from_secs(60));

    let handles: Vec<_> = [ComponentKind::Zookeeper, ComponentKind::Kafka]
        .into_iter()
        .map(|kind| {
            let (reconciler, spec) = (reconciler.clone(), component_spec(kind, 1, "image:1"));
            tokio::spawn(async move { reconciler.run(WorkUnit::Apply(spec)).await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    let max = platform.max_active.load(Ordering::SeqCst);
    assert!(max == 2, "expected both components to be reconciled concurrently, got {}", max);
    Ok(())
}
