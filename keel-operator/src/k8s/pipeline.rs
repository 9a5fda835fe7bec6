//! The update pipeline.
//!
//! Executes the create, update & delete flows of a single component. Callers must hold the
//! component's lock. An update always runs its steps in the same order: scale down, patch
//! non-disruptive differences, roll disruptive differences one pod at a time, scale up. Any
//! failure aborts the remaining steps; the next pass re-diffs and resumes from the live state.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Pod, PodTemplateSpec, Volume};
use tokio::time::{sleep, Instant};

use crate::admin::{can_roll, AdminConnector, ClusterAdmin};
use crate::cluster::{ClusterIdentity, ClusterSpec, WorkloadKind};
use crate::config::Config;
use crate::error::{AdminError, OperationError, OperationResult};
use crate::k8s::diff::{diff, pod_revision, DiffResult};
use crate::k8s::generator::{cluster_selector, generate, AuxiliaryKind, DesiredManifests, Workload, ANNOTATION_DELETE_CLAIM, DATA_VOLUME};
use crate::k8s::platform::{LiveState, Manifest, Platform, ResourceKind};

/// Timing & feature settings of the flows.
#[derive(Clone, Debug)]
pub struct FlowSettings {
    /// The maximum duration of each wait on the platform.
    pub operation_timeout: Duration,
    pub poll_interval: Duration,
    /// The maximum duration to wait for a single broker to become safe to restart.
    pub roll_deadline: Duration,
    pub roll_backoff: Duration,
    pub roll_backoff_max: Duration,
    /// Whether image build resources are managed.
    pub image_builds_enabled: bool,
}

impl FlowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            operation_timeout: config.operation_timeout(),
            poll_interval: config.poll_interval(),
            roll_deadline: config.roll_deadline(),
            roll_backoff: config.roll_backoff(),
            roll_backoff_max: config.roll_backoff_max(),
            image_builds_enabled: config.image_builds_enabled,
        }
    }
}

/// Executes the flows of single components against the platform.
#[derive(Clone)]
pub struct Orchestrator {
    platform: Arc<dyn Platform>,
    admin: Arc<dyn AdminConnector>,
    settings: FlowSettings,
}

impl Orchestrator {
    pub fn new(platform: Arc<dyn Platform>, admin: Arc<dyn AdminConnector>, settings: FlowSettings) -> Self {
        Self { platform, admin, settings }
    }

    /// Create all resources of a component which has no live workload.
    #[tracing::instrument(level = "debug", skip(self, spec), fields(cluster = %spec.identity))]
    pub async fn create(&self, spec: &ClusterSpec) -> OperationResult<()> {
        tracing::info!("creating cluster resources");
        let desired = generate(spec);
        for cm in desired.config_maps {
            self.platform.apply(&Manifest::ConfigMap(cm)).await?;
        }
        for svc in desired.services {
            self.platform.apply(&Manifest::Service(svc)).await?;
        }
        self.platform.apply(&desired.workload.into()).await?;
        if self.settings.image_builds_enabled {
            for aux in desired.auxiliary {
                self.platform.apply(&Manifest::Auxiliary(aux)).await?;
            }
        }
        Ok(())
    }

    /// Converge the live state of a component onto its spec.
    ///
    /// Returns the diff which was acted upon.
    #[tracing::instrument(level = "debug", skip(self, spec, live), fields(cluster = %spec.identity))]
    pub async fn update(&self, spec: &ClusterSpec, live: LiveState) -> OperationResult<DiffResult> {
        let desired = generate(spec);
        let diff = diff(&desired, &live);
        if !diff.is_empty() {
            tracing::debug!(?diff, "cluster differs from spec");
        }
        tokio::try_join!(self.update_steps(spec, &desired, &live, &diff), self.reconcile_auxiliary(spec, &desired))?;
        Ok(diff)
    }

    async fn update_steps(&self, spec: &ClusterSpec, desired: &DesiredManifests, live: &LiveState, diff: &DiffResult) -> OperationResult<()> {
        let ident = &spec.identity;
        let (ns, name, kind) = (ident.namespace.as_str(), ident.workload_name(), desired.workload.kind());
        let retained = diff.current_replicas.min(diff.target_replicas);

        // 1. Scale down.
        if diff.scale_down {
            tracing::info!(from = diff.current_replicas, to = diff.target_replicas, "scaling down");
            self.platform.scale(kind, ns, &name, diff.target_replicas).await?;
        }

        // 2. Non-disruptive differences.
        for svc in desired.services.iter().filter(|svc| svc.metadata.name.as_ref().map_or(false, |name| diff.changed_services.contains(name))) {
            self.platform.apply(&Manifest::Service(svc.clone())).await?;
        }
        if diff.metrics_config_changed {
            for cm in desired.config_maps.iter() {
                self.platform.apply(&Manifest::ConfigMap(cm.clone())).await?;
            }
            for stale in diff.stale_config_maps.iter() {
                self.platform.delete(ResourceKind::ConfigMap, ns, stale).await?;
            }
        }
        if (diff.delete_claim_changed || diff.workload_labels_changed) && !diff.rolling_update_required {
            // Keep the live template, so that no new revision is produced.
            let workload = retained_workload(desired, live, true, retained);
            tracing::info!(delete_claim = ?workload.annotation(ANNOTATION_DELETE_CLAIM), "patching workload metadata");
            self.platform.apply(&workload.into()).await?;
        }
        if let Some(reason) = diff.storage_rejected() {
            tracing::warn!(reason, "rejected storage change will not be applied");
        }

        // 3. Disruptive differences.
        if diff.rolling_update_required {
            let workload = retained_workload(desired, live, false, retained);
            tracing::info!("patching workload template");
            self.platform.apply(&workload.into()).await?;
            match kind {
                WorkloadKind::StatefulSet => self.roll_statefulset(ident, retained).await?,
                WorkloadKind::Deployment => self.await_deployment_rollout(ns, &name).await?,
            }
        }

        // 4. Scale up.
        if diff.scale_up {
            tracing::info!(from = diff.current_replicas, to = diff.target_replicas, "scaling up");
            self.platform.scale(kind, ns, &name, diff.target_replicas).await?;
            self.await_ready_replicas(kind, ns, &name, diff.target_replicas).await?;
        }
        Ok(())
    }

    /// Create, update or delete the image build resources of a component.
    async fn reconcile_auxiliary(&self, spec: &ClusterSpec, desired: &DesiredManifests) -> OperationResult<()> {
        if !self.settings.image_builds_enabled {
            return Ok(());
        }
        let (ns, selector) = (spec.identity.namespace.as_str(), cluster_selector(&spec.identity));
        for kind in AuxiliaryKind::ALL {
            let live = self.platform.list_auxiliary(ns, kind, &selector).await?;
            for aux in desired.auxiliary.iter().filter(|aux| aux.kind == kind) {
                match live.iter().find(|live| live.name == aux.name) {
                    Some(live) if live == aux => continue,
                    _ => self.platform.apply(&Manifest::Auxiliary(aux.clone())).await?,
                }
            }
            for stale in live.iter().filter(|live| !desired.auxiliary.iter().any(|aux| aux.kind == kind && aux.name == live.name)) {
                self.platform.delete(kind.into(), ns, &stale.name).await?;
            }
        }
        Ok(())
    }

    /// Delete all resources of a component, dependents first.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %ident))]
    pub async fn delete(&self, ident: &ClusterIdentity) -> OperationResult<()> {
        tracing::info!("deleting cluster resources");
        let (ns, name, selector) = (ident.namespace.as_str(), ident.workload_name(), cluster_selector(ident));
        let workload_kind = ident.kind.profile().workload;

        let delete_claims = match workload_kind {
            WorkloadKind::StatefulSet => match self.platform.get_statefulset(ns, &name).await {
                Ok(sts) => Workload::StatefulSet(sts).annotation(ANNOTATION_DELETE_CLAIM) == Some("true"),
                Err(err) if err.is_not_found() => false,
                Err(err) => return Err(err.into()),
            },
            WorkloadKind::Deployment => false,
        };

        if self.settings.image_builds_enabled {
            for kind in AuxiliaryKind::ALL {
                for aux in self.platform.list_auxiliary(ns, kind, &selector).await? {
                    self.platform.delete(kind.into(), ns, &aux.name).await?;
                }
            }
        }
        self.platform.delete(workload_kind.into(), ns, &name).await?;
        for svc in self.platform.list_services(ns, &selector).await? {
            if let Some(svc_name) = svc.metadata.name.as_deref() {
                self.platform.delete(ResourceKind::Service, ns, svc_name).await?;
            }
        }
        for cm in self.platform.list_config_maps(ns, &selector).await? {
            if let Some(cm_name) = cm.metadata.name.as_deref() {
                self.platform.delete(ResourceKind::ConfigMap, ns, cm_name).await?;
            }
        }
        if delete_claims {
            for pvc in self.platform.list_pvcs(ns, &selector).await? {
                if let Some(pvc_name) = pvc.metadata.name.as_deref() {
                    self.platform.delete(ResourceKind::PersistentVolumeClaim, ns, pvc_name).await?;
                }
            }
        }
        Ok(())
    }

    /// Replace every pod of the StatefulSet below `replicas` which is not at the update revision.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn roll_statefulset(&self, ident: &ClusterIdentity, replicas: i32) -> OperationResult<()> {
        let (ns, name) = (ident.namespace.as_str(), ident.workload_name());
        let revision = self.await_update_revision(ns, &name).await?;
        for ordinal in 0..replicas {
            let pod_name = ident.pod_name(ordinal);
            let pod = match self.platform.get_pod(ns, &pod_name).await {
                Ok(pod) => pod,
                // The platform recreates missing pods at the update revision.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            if pod_revision(&pod.metadata) == Some(revision.as_str()) {
                continue;
            }
            if ident.kind.is_broker() {
                self.await_roll_safety(ident, ordinal).await?;
            }
            tracing::info!(pod = %pod_name, %revision, "restarting pod");
            self.platform.delete(ResourceKind::Pod, ns, &pod_name).await?;
            self.await_pod_replaced(ns, &pod_name, pod.metadata.uid.as_deref(), &revision).await?;
        }
        Ok(())
    }

    /// Block until the given broker may be restarted, backing off between checks.
    ///
    /// The admin client is connected lazily, and every check queries a fresh snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn await_roll_safety(&self, ident: &ClusterIdentity, broker: i32) -> OperationResult<()> {
        let deadline = Instant::now() + self.settings.roll_deadline;
        let mut backoff = self.settings.roll_backoff;
        let mut admin: Option<Arc<dyn ClusterAdmin>> = None;
        loop {
            let last_err = match self.check_roll(&mut admin, ident, broker).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::info!(broker, "broker can not be restarted yet without dropping below min in-sync replicas");
                    None
                }
                Err(err) => {
                    tracing::warn!(broker, error = %err, "error deciding whether broker may restart");
                    Some(err)
                }
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(match last_err {
                    Some(source) => OperationError::Admin { broker, source },
                    None => OperationError::RollDeadline {
                        broker,
                        deadline: self.settings.roll_deadline,
                    },
                });
            }
            sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.settings.roll_backoff_max);
        }
    }

    async fn check_roll(&self, admin: &mut Option<Arc<dyn ClusterAdmin>>, ident: &ClusterIdentity, broker: i32) -> Result<bool, AdminError> {
        if admin.is_none() {
            *admin = Some(self.admin.connect(ident).await?);
        }
        match admin.as_deref() {
            Some(conn) => can_roll(conn, broker).await,
            None => Err(AdminError::Unavailable(format!("no admin connection to {}", ident))),
        }
    }

    /// Wait for the platform to observe the latest StatefulSet generation, returning its update revision.
    async fn await_update_revision(&self, ns: &str, name: &str) -> OperationResult<String> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        loop {
            let sts = self.platform.get_statefulset(ns, name).await?;
            let observed = sts.status.as_ref().and_then(|status| status.observed_generation);
            let revision = sts.status.as_ref().and_then(|status| status.update_revision.clone());
            if let (Some(observed), Some(revision)) = (observed, revision) {
                if Some(observed) >= sts.metadata.generation {
                    return Ok(revision);
                }
            }
            self.tick(deadline, format!("waiting for StatefulSet {}/{} to observe its latest generation", ns, name)).await?;
        }
    }

    /// Wait for a deleted pod to be replaced by a ready pod at the given revision.
    async fn await_pod_replaced(&self, ns: &str, name: &str, old_uid: Option<&str>, revision: &str) -> OperationResult<()> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        loop {
            match self.platform.get_pod(ns, name).await {
                Ok(pod) if pod.metadata.uid.as_deref() != old_uid && pod_revision(&pod.metadata) == Some(revision) && pod_ready(&pod) => {
                    tracing::debug!(pod = %name, "pod rejoined");
                    return Ok(());
                }
                Ok(_) => (),
                Err(err) if err.is_not_found() => (),
                Err(err) => return Err(err.into()),
            }
            self.tick(deadline, format!("waiting for pod {}/{} to be replaced", ns, name)).await?;
        }
    }

    async fn await_ready_replicas(&self, kind: WorkloadKind, ns: &str, name: &str, replicas: i32) -> OperationResult<()> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        loop {
            let ready = match kind {
                WorkloadKind::StatefulSet => Workload::StatefulSet(self.platform.get_statefulset(ns, name).await?).ready_replicas(),
                WorkloadKind::Deployment => Workload::Deployment(self.platform.get_deployment(ns, name).await?).ready_replicas(),
            };
            if ready >= replicas {
                return Ok(());
            }
            self.tick(deadline, format!("waiting for {} ready replicas of {}/{}", replicas, ns, name)).await?;
        }
    }

    async fn await_deployment_rollout(&self, ns: &str, name: &str) -> OperationResult<()> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        loop {
            let deployment = self.platform.get_deployment(ns, name).await?;
            let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
            if let Some(status) = deployment.status.as_ref() {
                let observed = status.observed_generation.is_some() && status.observed_generation >= deployment.metadata.generation;
                if observed && status.updated_replicas.unwrap_or(0) >= replicas && status.ready_replicas.unwrap_or(0) >= replicas && status.unavailable_replicas.unwrap_or(0) == 0 {
                    return Ok(());
                }
            }
            self.tick(deadline, format!("waiting for rollout of Deployment {}/{}", ns, name)).await?;
        }
    }

    /// Sleep for one poll interval, or fail if the deadline has passed.
    async fn tick(&self, deadline: Instant, what: String) -> OperationResult<()> {
        if Instant::now() >= deadline {
            return Err(OperationError::Timeout(what));
        }
        sleep(self.settings.poll_interval).await;
        Ok(())
    }
}

/// The desired workload with the given replica count, keeping the live volume claim templates
/// and optionally the live pod template.
fn retained_workload(desired: &DesiredManifests, live: &LiveState, keep_template: bool, replicas: i32) -> Workload {
    let mut workload = desired.workload.clone();
    workload.set_replicas(replicas);
    match (&mut workload, &live.workload) {
        (Workload::StatefulSet(sts), Workload::StatefulSet(live)) => {
            if let (Some(spec), Some(live)) = (sts.spec.as_mut(), live.spec.as_ref()) {
                // Claim templates are immutable, only rejected changes can differ here.
                spec.volume_claim_templates = live.volume_claim_templates.clone();
                if keep_template {
                    spec.template = live.template.clone();
                } else {
                    let persistent = spec
                        .volume_claim_templates
                        .iter()
                        .flatten()
                        .any(|vct| vct.metadata.name.as_deref() == Some(DATA_VOLUME));
                    retain_data_volume(&mut spec.template, persistent);
                }
            }
        }
        (Workload::Deployment(deployment), Workload::Deployment(live)) if keep_template => {
            if let (Some(spec), Some(live)) = (deployment.spec.as_mut(), live.spec.as_ref()) {
                spec.template = live.template.clone();
            }
        }
        _ => (),
    }
    workload
}

/// Back the `data` mount of the given template with an emptyDir volume, unless the mount is
/// backed by a claim template.
fn retain_data_volume(template: &mut PodTemplateSpec, persistent: bool) {
    let pod = match template.spec.as_mut() {
        Some(pod) => pod,
        None => return,
    };
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|vol| vol.name != DATA_VOLUME);
    let mounted = pod
        .containers
        .iter()
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .any(|mount| mount.name == DATA_VOLUME);
    if mounted && !persistent {
        volumes.insert(
            0,
            Volume {
                name: DATA_VOLUME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        );
    }
    if volumes.is_empty() {
        pod.volumes = None;
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conds| conds.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
}
