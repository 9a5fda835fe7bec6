//! The diff engine.
//!
//! Compares the desired manifests of a component against its live state and classifies the
//! work needed to converge them. Only fields owned by the generator are compared, so defaults
//! filled in by the platform never register as differences.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Container, PersistentVolumeClaim, Pod, Probe, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::k8s::generator::{DesiredManifests, Workload, ANNOTATION_DELETE_CLAIM, DATA_VOLUME, LABEL_REVISION};
use crate::k8s::platform::LiveState;

/// The classification of a change to the storage of a component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageChange {
    /// Storage is unchanged.
    #[default]
    None,
    /// Only the delete-claim flag changed, which is applied freely.
    AllowedDeleteClaimFlagOnly,
    /// The storage type, size, class or selector changed, which is never applied.
    Rejected(String),
}

/// The work needed to converge a component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// The replica count of the live workload.
    pub current_replicas: i32,
    /// The replica count of the desired workload.
    pub target_replicas: i32,
    pub scale_up: bool,
    pub scale_down: bool,
    /// Differences patched without restarting pods.
    pub different_non_rolling: bool,
    /// Differences which require every pod to be replaced.
    pub rolling_update_required: bool,
    /// The content of the metrics config changed, or it is to be created or deleted.
    pub metrics_config_changed: bool,
    pub storage_change: StorageChange,
    /// Whether the delete-claim annotation of the workload differs.
    pub delete_claim_changed: bool,
    /// Whether the workload's own labels differ.
    pub workload_labels_changed: bool,
    /// The names of desired services which are missing or differ.
    pub changed_services: Vec<String>,
    /// The names of live config maps which are no longer desired.
    pub stale_config_maps: Vec<String>,
}

impl DiffResult {
    /// True when the component is fully converged.
    pub fn is_empty(&self) -> bool {
        !self.scale_up
            && !self.scale_down
            && !self.different_non_rolling
            && !self.rolling_update_required
            && !self.metrics_config_changed
            && self.storage_change == StorageChange::None
    }

    /// Whether the storage change was rejected.
    pub fn storage_rejected(&self) -> Option<&str> {
        match &self.storage_change {
            StorageChange::Rejected(reason) => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Compare the desired manifests of a component against its live state.
pub fn diff(desired: &DesiredManifests, live: &LiveState) -> DiffResult {
    let mut out = DiffResult {
        current_replicas: live.workload.replicas(),
        target_replicas: desired.workload.replicas(),
        ..Default::default()
    };
    out.scale_up = out.target_replicas > out.current_replicas;
    out.scale_down = out.target_replicas < out.current_replicas;

    // Workload.
    out.rolling_update_required = templates_differ(&desired.workload, &live.workload) || pending_roll(&live.workload, &live.pods);
    out.workload_labels_changed = desired.workload.metadata().labels != live.workload.metadata().labels;
    out.delete_claim_changed = desired.workload.annotation(ANNOTATION_DELETE_CLAIM) != live.workload.annotation(ANNOTATION_DELETE_CLAIM);
    out.storage_change = match storage_difference(desired.workload.volume_claim_templates(), live.workload.volume_claim_templates()) {
        Some(reason) => StorageChange::Rejected(reason),
        None if out.delete_claim_changed => StorageChange::AllowedDeleteClaimFlagOnly,
        None => StorageChange::None,
    };

    // Services.
    out.changed_services = desired
        .services
        .iter()
        .filter(|svc| {
            let name = svc.metadata.name.as_deref();
            match live.services.iter().find(|live| live.metadata.name.as_deref() == name) {
                Some(live) => services_differ(svc, live),
                None => true,
            }
        })
        .filter_map(|svc| svc.metadata.name.clone())
        .collect();

    // Config maps.
    out.stale_config_maps = live
        .config_maps
        .iter()
        .filter(|cm| !desired.config_maps.iter().any(|d| d.metadata.name == cm.metadata.name))
        .filter_map(|cm| cm.metadata.name.clone())
        .collect();
    out.metrics_config_changed = !out.stale_config_maps.is_empty()
        || desired.config_maps.iter().any(|cm| {
            let found = live.config_maps.iter().find(|live| live.metadata.name == cm.metadata.name);
            !matches!(found, Some(live) if !config_maps_differ(cm, live))
        });

    out.different_non_rolling = out.delete_claim_changed || out.workload_labels_changed || !out.changed_services.is_empty();
    out
}

/// The fields of a pod template which require pods to be replaced when changed.
#[derive(Debug, PartialEq)]
struct TemplateFingerprint<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
    image: Option<&'a str>,
    env: Vec<(&'a str, Option<&'a str>)>,
    ports: Vec<(Option<&'a str>, i32)>,
    readiness: Option<(Option<i32>, Option<i32>)>,
    liveness: Option<(Option<i32>, Option<i32>)>,
    volumes: Vec<&'a str>,
}

fn probe_timing(probe: Option<&Probe>) -> Option<(Option<i32>, Option<i32>)> {
    probe.map(|probe| (probe.initial_delay_seconds, probe.timeout_seconds))
}

fn fingerprint(workload: &Workload) -> Option<TemplateFingerprint<'_>> {
    let template = workload.template()?;
    let pod = template.spec.as_ref()?;
    let container: &Container = pod.containers.first()?;
    let mut env: Vec<_> = container
        .env
        .iter()
        .flatten()
        .map(|var| (var.name.as_str(), var.value.as_deref()))
        .collect();
    env.sort_unstable();
    let mut ports: Vec<_> = container.ports.iter().flatten().map(|port| (port.name.as_deref(), port.container_port)).collect();
    ports.sort_unstable();
    // The data volume follows the storage type, whose changes are rejected rather than rolled.
    let mut volumes: Vec<_> = pod
        .volumes
        .iter()
        .flatten()
        .map(|vol| vol.name.as_str())
        .filter(|name| *name != DATA_VOLUME)
        .collect();
    volumes.sort_unstable();
    Some(TemplateFingerprint {
        labels: template.metadata.as_ref().and_then(|meta| meta.labels.as_ref()),
        image: container.image.as_deref(),
        env,
        ports,
        readiness: probe_timing(container.readiness_probe.as_ref()),
        liveness: probe_timing(container.liveness_probe.as_ref()),
        volumes,
    })
}

fn templates_differ(desired: &Workload, live: &Workload) -> bool {
    fingerprint(desired) != fingerprint(live)
}

/// Whether a previous roll of the given StatefulSet was interrupted.
///
/// Only trusted once the platform has observed the latest generation of the StatefulSet.
fn pending_roll(live: &Workload, pods: &[Pod]) -> bool {
    let sts = match live {
        Workload::StatefulSet(sts) => sts,
        Workload::Deployment(_) => return false,
    };
    let status = match sts.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if status.observed_generation.is_none() || status.observed_generation != sts.metadata.generation {
        return false;
    }
    let revision = match status.update_revision.as_deref() {
        Some(revision) => revision,
        None => return false,
    };
    pods.iter().any(|pod| pod_revision(&pod.metadata) != Some(revision))
}

/// The StatefulSet revision of the given pod.
pub fn pod_revision(meta: &ObjectMeta) -> Option<&str> {
    meta.labels.as_ref().and_then(|labels| labels.get(LABEL_REVISION)).map(String::as_str)
}

/// Describe the rejected difference between desired & live volume claim templates, if any.
fn storage_difference(desired: &[PersistentVolumeClaim], live: &[PersistentVolumeClaim]) -> Option<String> {
    let find = |vcts: &[PersistentVolumeClaim]| vcts.iter().find(|vct| vct.metadata.name.as_deref() == Some(DATA_VOLUME)).cloned();
    match (find(desired), find(live)) {
        (None, None) => None,
        (Some(_), None) => Some("storage type can not be changed from ephemeral to persistent-claim".into()),
        (None, Some(_)) => Some("storage type can not be changed from persistent-claim to ephemeral".into()),
        (Some(desired), Some(live)) => {
            let (desired, live) = (desired.spec.unwrap_or_default(), live.spec.unwrap_or_default());
            let size = |spec: &k8s_openapi::api::core::v1::PersistentVolumeClaimSpec| {
                spec.resources
                    .as_ref()
                    .and_then(|res| res.requests.as_ref())
                    .and_then(|req| req.get("storage"))
                    .map(|qty| qty.0.clone())
            };
            if !same_quantity(size(&desired).as_deref(), size(&live).as_deref()) {
                return Some(format!("storage size can not be changed from {:?} to {:?}", size(&live), size(&desired)));
            }
            if desired.storage_class_name != live.storage_class_name {
                return Some(format!(
                    "storage class can not be changed from {:?} to {:?}",
                    live.storage_class_name, desired.storage_class_name
                ));
            }
            let selector = |spec: &k8s_openapi::api::core::v1::PersistentVolumeClaimSpec| spec.selector.as_ref().and_then(|sel| sel.match_labels.clone());
            if selector(&desired) != selector(&live) {
                return Some("storage selector can not be changed".into());
            }
            None
        }
    }
}

/// Whether two storage quantities denote the same amount, so that `1Gi` equals `1024Mi`.
fn same_quantity(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (quantity_millis(a), quantity_millis(b)) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (a, b) => a == b,
    }
}

/// The amount of a quantity in thousandths of its unit, for plain & suffixed decimal numbers.
fn quantity_millis(qty: &str) -> Option<u128> {
    let qty = qty.trim();
    let (number, suffix) = qty.split_at(qty.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(qty.len()));
    let factor: u128 = match suffix {
        "m" => 1,
        "" => 1_000,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000_000,
        "Ki" => 1_000 << 10,
        "Mi" => 1_000 << 20,
        "Gi" => 1_000 << 30,
        "Ti" => 1_000 << 40,
        "Pi" => 1_000 << 50,
        "Ei" => 1_000 << 60,
        _ => return None,
    };
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    let digits: u128 = format!("{}{}", whole, frac).parse().ok()?;
    let scale = 10u128.checked_pow(u32::try_from(frac.len()).ok()?)?;
    digits.checked_mul(factor).map(|millis| millis / scale)
}

fn services_differ(desired: &Service, live: &Service) -> bool {
    if desired.metadata.labels != live.metadata.labels {
        return true;
    }
    let (desired, live) = match (desired.spec.as_ref(), live.spec.as_ref()) {
        (Some(desired), Some(live)) => (desired, live),
        (desired, live) => return desired.is_some() != live.is_some(),
    };
    let ports = |spec: &k8s_openapi::api::core::v1::ServiceSpec| {
        let mut ports: Vec<_> = spec.ports.iter().flatten().map(|port| (port.name.clone(), port.port)).collect();
        ports.sort_unstable();
        ports
    };
    let headless = |spec: &k8s_openapi::api::core::v1::ServiceSpec| spec.cluster_ip.as_deref() == Some("None");
    desired.selector != live.selector || ports(desired) != ports(live) || headless(desired) != headless(live)
}

fn config_maps_differ(desired: &ConfigMap, live: &ConfigMap) -> bool {
    desired.data != live.data || desired.metadata.labels != live.metadata.labels
}
