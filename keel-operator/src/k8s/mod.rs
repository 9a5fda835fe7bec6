//! Kubernetes controller.
//!
//! This controller watches the KafkaCluster & KafkaConnect resources of its namespace, turns
//! every observed change into work units, and dispatches those units onto a bounded pool of
//! tasks. A periodic full sweep re-drives every declared cluster and removes the resources of
//! clusters which are no longer declared, covering any watch events which were missed.

mod diff;
mod generator;
mod kube_platform;
mod lock;
mod pipeline;
mod platform;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
#[cfg(test)]
mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::prelude::*;
use futures::stream::BoxStream;
use kube::api::Api;
use kube::client::Client;
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;

use crate::admin::AdminConnector;
use crate::cluster::ImageDefaults;
use crate::config::Config;
use crate::k8s::lock::LockRegistry;
use crate::k8s::pipeline::{FlowSettings, Orchestrator};
use crate::k8s::reconciler::{Reconciler, WorkUnit};
use keel_core::crd::{KafkaCluster, KafkaConnect};

pub use kube_platform::KubePlatform;
pub use platform::Platform;

/// The app name used by the operator.
pub const APP_NAME: &str = "keel-operator";

type EventResult<T> = std::result::Result<Event<T>, watcher::Error>;

/// Kubernetes controller for watching Keel CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// Set once the initial listing of both watches has been observed.
    ready: Arc<AtomicBool>,

    /// The executor of work units, shared by all spawned tasks.
    reconciler: Reconciler,
    images: ImageDefaults,
    /// All in-flight work units.
    tasks: JoinSet<()>,
    /// Bounds the number of concurrently executing work units.
    permits: Arc<Semaphore>,

    /// Whether the initial KafkaCluster listing has been observed.
    clusters_listed: bool,
    /// Whether the initial KafkaConnect listing has been observed.
    connects_listed: bool,
}

impl Controller {
    /// Create a new instance.
    pub fn new(
        client: Client, config: Arc<Config>, platform: Arc<dyn Platform>, admin: Arc<dyn AdminConnector>, ready: Arc<AtomicBool>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let orchestrator = Orchestrator::new(platform.clone(), admin, FlowSettings::from_config(&config));
        let reconciler = Reconciler::new(platform, orchestrator, LockRegistry::new(), config.lock_timeout());
        Self {
            client,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            ready,
            reconciler,
            images: ImageDefaults::from_config(&config),
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_reconciliations.max(1))),
            clusters_listed: false,
            connects_listed: false,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams. Failed watches are re-established with backoff.
        let clusters: Api<KafkaCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut clusters_watcher: BoxStream<'static, EventResult<KafkaCluster>> = watcher(clusters, watcher::Config::default()).default_backoff().boxed();
        let connects: Api<KafkaConnect> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut connects_watcher: BoxStream<'static, EventResult<KafkaConnect>> = watcher(connects, watcher::Config::default()).default_backoff().boxed();

        let period = self.config.full_reconciliation_interval();
        let mut sweep_timer = interval_at(Instant::now() + period, period);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res),
                Some(k8s_event_res) = connects_watcher.next() => self.handle_connect_event(k8s_event_res),
                _ = sweep_timer.tick() => self.full_reconciliation().await,
                Some(join_res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = join_res {
                        tracing::error!(error = ?err, "work unit task panicked");
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        drop(sweep_timer);
        drop(clusters_watcher);
        drop(connects_watcher);
        self.ready.store(false, Ordering::SeqCst);

        let shutdown_timeout = self.config.shutdown_timeout();
        let in_flight = self.tasks.len();
        let tasks = &mut self.tasks;
        let drained = timeout(shutdown_timeout, async move {
            while let Some(join_res) = tasks.join_next().await {
                if let Err(err) = join_res {
                    tracing::error!(error = ?err, "work unit task panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(in_flight, timeout = ?shutdown_timeout, "in-flight work units did not drain in time, aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        drop(self.reconciler);
        tracing::debug!("administrative connections released");
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    fn handle_cluster_event(&mut self, res: EventResult<KafkaCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "error from KafkaCluster watch, re-establishing");
                return;
            }
        };
        match event {
            Event::Applied(cluster) => WorkUnit::for_kafka_cluster(&cluster, &self.images).into_iter().for_each(|unit| self.dispatch(unit)),
            Event::Deleted(cluster) => WorkUnit::deleted_kafka_cluster(&cluster).into_iter().for_each(|unit| self.dispatch(unit)),
            Event::Restarted(clusters) => {
                for cluster in clusters {
                    WorkUnit::for_kafka_cluster(&cluster, &self.images).into_iter().for_each(|unit| self.dispatch(unit));
                }
                self.clusters_listed = true;
                self.update_readiness();
            }
        }
    }

    fn handle_connect_event(&mut self, res: EventResult<KafkaConnect>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "error from KafkaConnect watch, re-establishing");
                return;
            }
        };
        match event {
            Event::Applied(connect) => WorkUnit::for_kafka_connect(&connect, &self.images).into_iter().for_each(|unit| self.dispatch(unit)),
            Event::Deleted(connect) => WorkUnit::deleted_kafka_connect(&connect).into_iter().for_each(|unit| self.dispatch(unit)),
            Event::Restarted(connects) => {
                for connect in connects {
                    WorkUnit::for_kafka_connect(&connect, &self.images).into_iter().for_each(|unit| self.dispatch(unit));
                }
                self.connects_listed = true;
                self.update_readiness();
            }
        }
    }

    fn update_readiness(&self) {
        if self.clusters_listed && self.connects_listed && !self.ready.swap(true, Ordering::SeqCst) {
            tracing::info!("initial watch listings observed, controller is ready");
        }
    }

    /// Re-drive every declared cluster, and delete the resources of undeclared ones.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn full_reconciliation(&mut self) {
        match self.reconciler.sweep(&self.config.namespace, &self.images).await {
            Ok(units) => units.into_iter().for_each(|unit| self.dispatch(unit)),
            Err(err) => tracing::error!(error = %err, "error performing full reconciliation"),
        }
    }

    /// Spawn a task which runs the given work unit once a permit is available.
    ///
    /// The controller never blocks on the pool, spawned tasks queue on the semaphore instead.
    fn dispatch(&mut self, unit: WorkUnit) {
        let (reconciler, permits) = (self.reconciler.clone(), self.permits.clone());
        self.tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let desc = unit.to_string();
            match reconciler.run(unit).await {
                Ok(()) => (),
                Err(err) if err.is_transient() => tracing::warn!(error = %err, unit = %desc, "work unit failed, will retry on next trigger"),
                Err(err) => tracing::error!(error = %err, unit = %desc, "work unit failed"),
            }
        });
    }
}
