//! The K8s implementation of the platform operations.
//!
//! All writes use [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/)
//! with forced conflicts, so the operator always wins over the fields it manages. Every call is
//! bounded by `API_TIMEOUT`.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use keel_core::crd::{ClusterStatus, Condition, HasClusterStatus, KafkaCluster, KafkaConnect};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;

use crate::cluster::{SourceKind, WorkloadKind};
use crate::error::PlatformError;
use crate::k8s::generator::{AuxiliaryKind, AuxiliaryManifest};
use crate::k8s::platform::{Manifest, Platform, PlatformResult, ResourceKind};
use crate::k8s::APP_NAME;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform operations backed by the K8s API.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn aux_resource(kind: AuxiliaryKind) -> ApiResource {
        let (group, version, kind, plural) = kind.gvk();
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
    }

    fn aux_api(&self, ns: &str, kind: AuxiliaryKind) -> (Api<DynamicObject>, ApiResource) {
        let resource = Self::aux_resource(kind);
        (Api::namespaced_with(self.client.clone(), ns, &resource), resource)
    }

    async fn get<K>(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        call(kind, ns, name, "fetching", api.get(name)).await
    }

    async fn list<K>(&self, kind: ResourceKind, ns: &str, selector: &str) -> PlatformResult<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        let params = ListParams::default().labels(selector);
        call(kind, ns, selector, "listing", api.list(&params)).await.map(|list| list.items)
    }

    async fn apply_typed<K>(&self, kind: ResourceKind, obj: &K) -> PlatformResult<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let mut obj = obj.clone();
        obj.meta_mut().managed_fields = None;
        obj.meta_mut().resource_version = None;
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        tracing::info!(%kind, %ns, %name, "applying resource");
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        let params = PatchParams::apply(APP_NAME).force();
        call(kind, &ns, &name, "applying", api.patch(&name, &params, &Patch::Apply(&obj))).await.map(|_| ())
    }

    async fn delete_typed<K>(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        tracing::info!(%kind, %ns, %name, "deleting resource");
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        ignore_not_found(call(kind, ns, name, "deleting", api.delete(name, &DeleteParams::default())).await.map(|_| ()))
    }

    async fn record_on<K>(&self, source: SourceKind, ns: &str, name: &str, conditions: Vec<Condition>) -> PlatformResult<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + HasClusterStatus + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let kind = source.to_string();
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        let obj = match timeout(API_TIMEOUT, api.get(name)).await {
            Err(_) => return Err(PlatformError::Timeout(format!("fetching {} {}/{}", kind, ns, name))),
            Ok(Err(kube::Error::Api(err))) if err.code == 404 => return Err(PlatformError::not_found(kind, ns, name)),
            Ok(Err(source)) => return Err(PlatformError::Api { context: format!("fetching {} {}/{}", kind, ns, name), source }),
            Ok(Ok(obj)) => obj,
        };
        let mut status: ClusterStatus = obj.cluster_status().cloned().unwrap_or_default();
        let mut changed = false;
        for condition in conditions {
            changed |= status.upsert_condition(condition);
        }
        if !changed {
            return Ok(());
        }
        tracing::debug!(%kind, %ns, %name, "patching status conditions");
        let patch = json!({ "status": status });
        match timeout(API_TIMEOUT, api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))).await {
            Err(_) => Err(PlatformError::Timeout(format!("patching status of {} {}/{}", kind, ns, name))),
            Ok(Err(source)) => Err(PlatformError::Api { context: format!("patching status of {} {}/{}", kind, ns, name), source }),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Await the given API call, bounded by `API_TIMEOUT`, and map its errors.
async fn call<T>(kind: ResourceKind, ns: &str, name: &str, verb: &str, fut: impl Future<Output = Result<T, kube::Error>>) -> PlatformResult<T> {
    match timeout(API_TIMEOUT, fut).await {
        Err(_) => Err(PlatformError::Timeout(format!("{} {} {}/{}", verb, kind, ns, name))),
        Ok(Err(kube::Error::Api(err))) if err.code == 404 => Err(PlatformError::not_found(kind, ns, name)),
        Ok(Err(source)) => Err(PlatformError::Api {
            context: format!("{} {} {}/{}", verb, kind, ns, name),
            source,
        }),
        Ok(Ok(val)) => Ok(val),
    }
}

fn ignore_not_found(res: PlatformResult<()>) -> PlatformResult<()> {
    match res {
        Err(err) if err.is_not_found() => Ok(()),
        res => res,
    }
}

#[async_trait]
impl Platform for KubePlatform {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_statefulset(&self, ns: &str, name: &str) -> PlatformResult<StatefulSet> {
        self.get(ResourceKind::StatefulSet, ns, name).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_deployment(&self, ns: &str, name: &str) -> PlatformResult<Deployment> {
        self.get(ResourceKind::Deployment, ns, name).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_pod(&self, ns: &str, name: &str) -> PlatformResult<Pod> {
        self.get(ResourceKind::Pod, ns, name).await
    }

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> PlatformResult<Vec<StatefulSet>> {
        self.list(ResourceKind::StatefulSet, ns, selector).await
    }

    async fn list_deployments(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Deployment>> {
        self.list(ResourceKind::Deployment, ns, selector).await
    }

    async fn list_services(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Service>> {
        self.list(ResourceKind::Service, ns, selector).await
    }

    async fn list_config_maps(&self, ns: &str, selector: &str) -> PlatformResult<Vec<ConfigMap>> {
        self.list(ResourceKind::ConfigMap, ns, selector).await
    }

    async fn list_pods(&self, ns: &str, selector: &str) -> PlatformResult<Vec<Pod>> {
        self.list(ResourceKind::Pod, ns, selector).await
    }

    async fn list_pvcs(&self, ns: &str, selector: &str) -> PlatformResult<Vec<PersistentVolumeClaim>> {
        self.list(ResourceKind::PersistentVolumeClaim, ns, selector).await
    }

    async fn list_auxiliary(&self, ns: &str, kind: AuxiliaryKind, selector: &str) -> PlatformResult<Vec<AuxiliaryManifest>> {
        let (api, _) = self.aux_api(ns, kind);
        let params = ListParams::default().labels(selector);
        let list = call(kind.into(), ns, selector, "listing", api.list(&params)).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| AuxiliaryManifest {
                kind,
                namespace: obj.metadata.namespace.clone().unwrap_or_else(|| ns.into()),
                name: obj.metadata.name.clone().unwrap_or_default(),
                labels: obj.metadata.labels.clone().unwrap_or_default(),
                spec: obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }

    async fn list_kafka_clusters(&self, ns: &str) -> PlatformResult<Vec<KafkaCluster>> {
        let api: Api<KafkaCluster> = Api::namespaced(self.client.clone(), ns);
        let list = match timeout(API_TIMEOUT, api.list(&ListParams::default())).await {
            Err(_) => return Err(PlatformError::Timeout(format!("listing KafkaClusters in {}", ns))),
            Ok(res) => res.map_err(|source| PlatformError::Api { context: format!("listing KafkaClusters in {}", ns), source })?,
        };
        Ok(list.items)
    }

    async fn list_kafka_connects(&self, ns: &str) -> PlatformResult<Vec<KafkaConnect>> {
        let api: Api<KafkaConnect> = Api::namespaced(self.client.clone(), ns);
        let list = match timeout(API_TIMEOUT, api.list(&ListParams::default())).await {
            Err(_) => return Err(PlatformError::Timeout(format!("listing KafkaConnects in {}", ns))),
            Ok(res) => res.map_err(|source| PlatformError::Api { context: format!("listing KafkaConnects in {}", ns), source })?,
        };
        Ok(list.items)
    }

    #[tracing::instrument(level = "debug", skip(self, manifest), fields(kind = %manifest.kind(), name = manifest.name()))]
    async fn apply(&self, manifest: &Manifest) -> PlatformResult<()> {
        match manifest {
            Manifest::StatefulSet(obj) => self.apply_typed(ResourceKind::StatefulSet, obj).await,
            Manifest::Deployment(obj) => self.apply_typed(ResourceKind::Deployment, obj).await,
            Manifest::Service(obj) => self.apply_typed(ResourceKind::Service, obj).await,
            Manifest::ConfigMap(obj) => self.apply_typed(ResourceKind::ConfigMap, obj).await,
            Manifest::Auxiliary(aux) => {
                tracing::info!(kind = ?aux.kind, ns = %aux.namespace, name = %aux.name, "applying resource");
                let (api, resource) = self.aux_api(&aux.namespace, aux.kind);
                let mut obj = DynamicObject::new(&aux.name, &resource).within(&aux.namespace).data(json!({ "spec": aux.spec }));
                obj.metadata.labels = Some(aux.labels.clone());
                let params = PatchParams::apply(APP_NAME).force();
                call(aux.kind.into(), &aux.namespace, &aux.name, "applying", api.patch(&aux.name, &params, &Patch::Apply(&obj)))
                    .await
                    .map(|_| ())
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> PlatformResult<()> {
        match kind {
            ResourceKind::StatefulSet => self.delete_typed::<StatefulSet>(kind, ns, name).await,
            ResourceKind::Deployment => self.delete_typed::<Deployment>(kind, ns, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(kind, ns, name).await,
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(kind, ns, name).await,
            ResourceKind::PersistentVolumeClaim => self.delete_typed::<PersistentVolumeClaim>(kind, ns, name).await,
            ResourceKind::Pod => self.delete_typed::<Pod>(kind, ns, name).await,
            ResourceKind::ImageStream | ResourceKind::BuildConfig => {
                let aux_kind = if kind == ResourceKind::ImageStream { AuxiliaryKind::ImageStream } else { AuxiliaryKind::BuildConfig };
                tracing::info!(%kind, %ns, %name, "deleting resource");
                let (api, _) = self.aux_api(ns, aux_kind);
                ignore_not_found(call(kind, ns, name, "deleting", api.delete(name, &DeleteParams::default())).await.map(|_| ()))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn scale(&self, kind: WorkloadKind, ns: &str, name: &str, replicas: i32) -> PlatformResult<()> {
        tracing::info!(%ns, %name, replicas, "scaling workload");
        let patch = json!({ "spec": { "replicas": replicas } });
        let params = PatchParams::default();
        match kind {
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
                call(kind.into(), ns, name, "scaling", api.patch(name, &params, &Patch::Merge(&patch))).await.map(|_| ())
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                call(kind.into(), ns, name, "scaling", api.patch(name, &params, &Patch::Merge(&patch))).await.map(|_| ())
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, conditions))]
    async fn record_conditions(&self, source: SourceKind, ns: &str, name: &str, conditions: Vec<Condition>) -> PlatformResult<()> {
        match source {
            SourceKind::KafkaCluster => self.record_on::<KafkaCluster>(source, ns, name, conditions).await,
            SourceKind::KafkaConnect => self.record_on::<KafkaConnect>(source, ns, name, conditions).await,
        }
    }
}
