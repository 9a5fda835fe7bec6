//! Desired state generation.
//!
//! `generate` is a pure function of a `ClusterSpec`: the same spec always yields identical
//! manifests, which is what makes the diff engine's equality checks meaningful. All component
//! kinds share the same builders, parameterized by the kind's static profile.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStrategy, RollingUpdateDeployment, StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::crd::StorageSpec;
use keel_core::{LABEL_APP_VALUE, LABEL_CLUSTER, LABEL_CONTROLLED_BY, LABEL_CONTROLLED_BY_VALUE, LABEL_KIND};
use serde_json::json;

use crate::cluster::{ClusterIdentity, ClusterSpec, ComponentKind, ProbeKind, WorkloadKind, METRICS_PORT, METRICS_PORT_NAME};

/// The annotation recording whether claims are deleted along with the cluster.
pub const ANNOTATION_DELETE_CLAIM: &str = "keel.rs/delete-claim";
/// The label carrying the StatefulSet revision of a pod.
pub const LABEL_REVISION: &str = "controller-revision-hash";
/// The key of the JMX exporter config in the metrics config map.
pub const METRICS_CONFIG_KEY: &str = "metrics-config.json";
/// The name of the data volume & volume claim template.
pub const DATA_VOLUME: &str = "data";
/// The name of the metrics config volume.
const METRICS_VOLUME: &str = "metrics-config";
/// The path at which the metrics config is mounted.
const METRICS_MOUNT_PATH: &str = "/opt/keel/metrics";
const PROBE_PERIOD_SECONDS: i32 = 10;
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 30;

/// The workload backing a component.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::StatefulSet(_) => WorkloadKind::StatefulSet,
            Self::Deployment(_) => WorkloadKind::Deployment,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::StatefulSet(sts) => &sts.metadata,
            Self::Deployment(deployment) => &deployment.metadata,
        }
    }

    /// The desired replica count of the workload, the platform default being 1.
    pub fn replicas(&self) -> i32 {
        let replicas = match self {
            Self::StatefulSet(sts) => sts.spec.as_ref().and_then(|spec| spec.replicas),
            Self::Deployment(deployment) => deployment.spec.as_ref().and_then(|spec| spec.replicas),
        };
        replicas.unwrap_or(1)
    }

    pub fn set_replicas(&mut self, replicas: i32) {
        match self {
            Self::StatefulSet(sts) => sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas),
            Self::Deployment(deployment) => deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas),
        }
    }

    /// The number of ready pods reported by the platform.
    pub fn ready_replicas(&self) -> i32 {
        let ready = match self {
            Self::StatefulSet(sts) => sts.status.as_ref().and_then(|status| status.ready_replicas),
            Self::Deployment(deployment) => deployment.status.as_ref().and_then(|status| status.ready_replicas),
        };
        ready.unwrap_or(0)
    }

    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::StatefulSet(sts) => sts.spec.as_ref().map(|spec| &spec.template),
            Self::Deployment(deployment) => deployment.spec.as_ref().map(|spec| &spec.template),
        }
    }

    /// The volume claim templates of the workload, empty for deployments.
    pub fn volume_claim_templates(&self) -> &[PersistentVolumeClaim] {
        match self {
            Self::StatefulSet(sts) => sts.spec.as_ref().and_then(|spec| spec.volume_claim_templates.as_deref()).unwrap_or_default(),
            Self::Deployment(_) => &[],
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata().annotations.as_ref().and_then(|annotations| annotations.get(key)).map(String::as_str)
    }
}

/// The kinds of platform-variant image build resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuxiliaryKind {
    ImageStream,
    BuildConfig,
}

impl AuxiliaryKind {
    pub const ALL: [AuxiliaryKind; 2] = [AuxiliaryKind::ImageStream, AuxiliaryKind::BuildConfig];

    /// The API group, version, kind & plural of the resource.
    pub fn gvk(self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Self::ImageStream => ("image.openshift.io", "v1", "ImageStream", "imagestreams"),
            Self::BuildConfig => ("build.openshift.io", "v1", "BuildConfig", "buildconfigs"),
        }
    }
}

/// A platform-variant image build resource, kept as untyped JSON.
#[derive(Clone, Debug, PartialEq)]
pub struct AuxiliaryManifest {
    pub kind: AuxiliaryKind,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub spec: serde_json::Value,
}

/// The complete desired resource topology of one component.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredManifests {
    pub workload: Workload,
    pub services: Vec<Service>,
    pub config_maps: Vec<ConfigMap>,
    pub auxiliary: Vec<AuxiliaryManifest>,
}

/// The labels identifying the resources of the given component.
pub fn canonical_labels(ident: &ClusterIdentity) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    labels.insert(LABEL_CLUSTER.into(), ident.name.clone());
    labels.insert(LABEL_KIND.into(), ident.kind.label_value().into());
    labels
}

/// A label selector matching all resources of the given component.
pub fn cluster_selector(ident: &ClusterIdentity) -> String {
    format!("{},{}={},{}={}", keel_core::KEEL_OPERATOR_LABEL_SELECTORS, LABEL_CLUSTER, ident.name, LABEL_KIND, ident.kind.label_value())
}

/// A label selector matching all resources of the given component kind.
pub fn kind_selector(kind: ComponentKind) -> String {
    format!("{},{}={}", keel_core::KEEL_OPERATOR_LABEL_SELECTORS, LABEL_KIND, kind.label_value())
}

/// Set the cannonical labels on an object controlled by Keel.
fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), LABEL_APP_VALUE.into());
    labels.insert(LABEL_CONTROLLED_BY.into(), LABEL_CONTROLLED_BY_VALUE.into());
}

/// User labels overlaid with the canonical labels of the component.
fn resource_labels(spec: &ClusterSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.extend(canonical_labels(&spec.identity));
    labels
}

fn object_meta(spec: &ClusterSpec, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(spec.identity.namespace.clone()),
        labels: Some(resource_labels(spec)),
        ..Default::default()
    }
}

/// Generate the desired manifests of the given component.
pub fn generate(spec: &ClusterSpec) -> DesiredManifests {
    let profile = spec.kind().profile();
    let workload = match profile.workload {
        WorkloadKind::StatefulSet => Workload::StatefulSet(build_statefulset(spec)),
        WorkloadKind::Deployment => Workload::Deployment(build_deployment(spec)),
    };

    let mut services = vec![build_service(spec)];
    if profile.headless_service {
        services.push(build_headless_service(spec));
    }

    let config_maps = spec.metrics.iter().map(|metrics| build_metrics_config_map(spec, metrics)).collect();

    let auxiliary = match &spec.build {
        Some(build) => build_auxiliary(spec, &build.tag),
        None => vec![],
    };

    DesiredManifests {
        workload,
        services,
        config_maps,
        auxiliary,
    }
}

#[tracing::instrument(level = "trace", skip(spec), fields(cluster = %spec.identity))]
fn build_statefulset(spec: &ClusterSpec) -> StatefulSet {
    let ident = &spec.identity;
    let mut sts = StatefulSet {
        metadata: object_meta(spec, ident.workload_name()),
        ..Default::default()
    };
    sts.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_DELETE_CLAIM.into(), spec.storage.delete_claim().to_string());

    let sts_spec = sts.spec.get_or_insert_with(Default::default);
    // Pods are only ever replaced by the operator, one at a time, after a roll decision.
    sts_spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("OnDelete".into()),
        rolling_update: None,
    });
    sts_spec.pod_management_policy = Some("Parallel".into());
    sts_spec.service_name = ident.headless_service_name();
    sts_spec.replicas = Some(spec.replicas);
    sts_spec.selector = LabelSelector {
        match_labels: Some(canonical_labels(ident)),
        ..Default::default()
    };
    sts_spec.template = build_pod_template(spec);
    if let StorageSpec::PersistentClaim { size, class, selector, .. } = &spec.storage {
        sts_spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME.into()),
                labels: Some(canonical_labels(ident)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: class.clone(),
                selector: selector.as_ref().map(|match_labels| LabelSelector {
                    match_labels: Some(match_labels.clone()),
                    ..Default::default()
                }),
                resources: Some(ResourceRequirements {
                    requests: Some(maplit::btreemap! {
                        "storage".into() => Quantity(size.clone()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }
    sts
}

#[tracing::instrument(level = "trace", skip(spec), fields(cluster = %spec.identity))]
fn build_deployment(spec: &ClusterSpec) -> Deployment {
    let ident = &spec.identity;
    let mut deployment = Deployment {
        metadata: object_meta(spec, ident.workload_name()),
        ..Default::default()
    };
    let dep_spec = deployment.spec.get_or_insert_with(Default::default);
    dep_spec.replicas = Some(spec.replicas);
    dep_spec.strategy = Some(DeploymentStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: Some(RollingUpdateDeployment {
            max_surge: Some(IntOrString::Int(1)),
            max_unavailable: Some(IntOrString::Int(0)),
        }),
    });
    dep_spec.selector = LabelSelector {
        match_labels: Some(canonical_labels(ident)),
        ..Default::default()
    };
    dep_spec.template = build_pod_template(spec);
    deployment
}

fn build_pod_template(spec: &ClusterSpec) -> PodTemplateSpec {
    let profile = spec.kind().profile();

    let mut ports: Vec<ContainerPort> = profile
        .ports
        .iter()
        .map(|(name, port)| ContainerPort {
            name: Some((*name).into()),
            container_port: *port,
            protocol: Some("TCP".into()),
            ..Default::default()
        })
        .collect();

    let env = spec
        .config
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let mut volumes = vec![];
    let mut volume_mounts = vec![];
    if let Some(mount_path) = profile.data_mount_path {
        if matches!(spec.storage, StorageSpec::Ephemeral) {
            volumes.push(Volume {
                name: DATA_VOLUME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        volume_mounts.push(VolumeMount {
            name: DATA_VOLUME.into(),
            mount_path: mount_path.into(),
            ..Default::default()
        });
    }
    if spec.metrics.is_some() {
        ports.push(ContainerPort {
            name: Some(METRICS_PORT_NAME.into()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        });
        volumes.push(Volume {
            name: METRICS_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(spec.identity.metrics_config_name()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: METRICS_VOLUME.into(),
            mount_path: METRICS_MOUNT_PATH.into(),
            ..Default::default()
        });
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(resource_labels(spec)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
            containers: vec![Container {
                name: profile.container_name.into(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                ports: Some(ports),
                env: Some(env),
                volume_mounts: Some(volume_mounts),
                readiness_probe: Some(build_probe(spec)),
                liveness_probe: Some(build_probe(spec)),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

fn build_probe(spec: &ClusterSpec) -> Probe {
    let mut probe = Probe {
        initial_delay_seconds: Some(spec.healthcheck.initial_delay_seconds),
        timeout_seconds: Some(spec.healthcheck.timeout_seconds),
        period_seconds: Some(PROBE_PERIOD_SECONDS),
        ..Default::default()
    };
    match spec.kind().profile().probe {
        ProbeKind::Exec(command) => {
            probe.exec = Some(ExecAction {
                command: Some(command.iter().map(|arg| (*arg).into()).collect()),
            })
        }
        ProbeKind::Http { path, port } => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.into()),
                port: IntOrString::Int(port),
                ..Default::default()
            })
        }
    }
    probe
}

fn service_ports(spec: &ClusterSpec) -> Vec<ServicePort> {
    let mut ports: Vec<ServicePort> = spec
        .kind()
        .profile()
        .ports
        .iter()
        .map(|(name, port)| ServicePort {
            name: Some((*name).into()),
            port: *port,
            target_port: Some(IntOrString::Int(*port)),
            protocol: Some("TCP".into()),
            ..Default::default()
        })
        .collect();
    if spec.metrics.is_some() {
        ports.push(ServicePort {
            name: Some(METRICS_PORT_NAME.into()),
            port: METRICS_PORT,
            target_port: Some(IntOrString::Int(METRICS_PORT)),
            protocol: Some("TCP".into()),
            ..Default::default()
        });
    }
    ports
}

fn build_service(spec: &ClusterSpec) -> Service {
    Service {
        metadata: object_meta(spec, spec.identity.workload_name()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(canonical_labels(&spec.identity)),
            ports: Some(service_ports(spec)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_headless_service(spec: &ClusterSpec) -> Service {
    Service {
        metadata: object_meta(spec, spec.identity.headless_service_name()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            cluster_ip: Some("None".into()),
            publish_not_ready_addresses: Some(true),
            selector: Some(canonical_labels(&spec.identity)),
            ports: Some(service_ports(spec)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_metrics_config_map(spec: &ClusterSpec, metrics: &serde_json::Value) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(spec, spec.identity.metrics_config_name()),
        data: Some(maplit::btreemap! {
            METRICS_CONFIG_KEY.into() => metrics.to_string(),
        }),
        ..Default::default()
    }
}

fn build_auxiliary(spec: &ClusterSpec, tag: &str) -> Vec<AuxiliaryManifest> {
    let name = spec.identity.workload_name();
    let image_stream = AuxiliaryManifest {
        kind: AuxiliaryKind::ImageStream,
        namespace: spec.identity.namespace.clone(),
        name: name.clone(),
        labels: resource_labels(spec),
        spec: json!({
            "lookupPolicy": {"local": true},
        }),
    };
    let build_config = AuxiliaryManifest {
        kind: AuxiliaryKind::BuildConfig,
        namespace: spec.identity.namespace.clone(),
        name: name.clone(),
        labels: resource_labels(spec),
        spec: json!({
            "runPolicy": "Serial",
            "source": {"type": "Binary", "binary": {}},
            "strategy": {
                "type": "Source",
                "sourceStrategy": {"from": {"kind": "DockerImage", "name": spec.image}},
            },
            "output": {"to": {"kind": "ImageStreamTag", "name": format!("{}:{}", name, tag)}},
        }),
    };
    vec![image_stream, build_config]
}
