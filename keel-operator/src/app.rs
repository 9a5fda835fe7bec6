use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::admin::AdminConnector;
use crate::config::Config;
use crate::k8s::{Controller, KubePlatform, Platform};
use crate::server::AppServer;

/// The application object of the Keel operator.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the health server.
    server: JoinHandle<()>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let platform: Arc<dyn Platform> = Arc::new(KubePlatform::new(client.clone()));
        let admin = admin_connector(&config);

        // Spawn various core tasks.
        let ready = Arc::new(AtomicBool::new(false));
        let server = AppServer::new(config.clone(), ready.clone(), shutdown_tx.clone()).spawn();
        let controller = Controller::new(client, config.clone(), platform, admin, ready, shutdown_tx.clone()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Keel Operator is shutting down");
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server task");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("Keel Operator shutdown complete");
        Ok(())
    }
}

/// Build the connector used for roll-safety queries against managed clusters.
#[cfg(feature = "kafka")]
fn admin_connector(config: &Config) -> Arc<dyn AdminConnector> {
    Arc::new(crate::admin::KafkaAdminConnector::new(config.admin_timeout()))
}

/// Build the connector used for roll-safety queries against managed clusters.
#[cfg(not(feature = "kafka"))]
fn admin_connector(_config: &Config) -> Arc<dyn AdminConnector> {
    tracing::warn!("built without the kafka feature, brokers will never be considered safe to restart");
    Arc::new(crate::admin::DisabledAdminConnector)
}
