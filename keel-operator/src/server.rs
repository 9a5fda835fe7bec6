use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Router, Server as AxumServer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Application server, serving the liveness & readiness routes.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// Set by the controller once its watches are established.
    ready: Arc<AtomicBool>,

    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, ready: Arc<AtomicBool>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, ready, shutdown }
    }

    /// Spawn the HTTP server.
    pub fn spawn(self) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let mut http_shutdown_rx = self.shutdown.subscribe();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let app = router(self.ready);
        tokio::spawn(async move {
            tracing::info!(%addr, "http server listening");
            let res = AxumServer::bind(&addr)
                .serve(app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _res = http_shutdown_rx.recv().await;
                })
                .await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown.send(());
            }
        })
    }
}

/// The routes of the server.
pub fn router(ready: Arc<AtomicBool>) -> Router {
    Router::new().route("/healthy", get(healthy)).route("/ready", get(readiness)).with_state(ready)
}

/// Liveness route.
pub async fn healthy(State(ready): State<Arc<AtomicBool>>) -> StatusCode {
    status(&ready)
}

/// Readiness route.
pub async fn readiness(State(ready): State<Arc<AtomicBool>>) -> StatusCode {
    status(&ready)
}

fn status(ready: &AtomicBool) -> StatusCode {
    if ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
