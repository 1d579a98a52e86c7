//! Web server setup, routing and the pose loop

use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Running server and pose loop
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and the pose loop and wait for both to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Server task panicked");
            }
        }
        info!("Server stopped");
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api::get_status))
        .route("/api/mapping", get(api::get_mapping))
        .route("/api/connections", get(api::list_connections))
        // Mapping session
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind the server and start it together with the pose loop
pub async fn start(state: Arc<AppState>, bind: &str) -> Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, protocol = "HTTP", "Starting web server");

    let (shutdown, rx) = watch::channel(false);
    let app = router(state.clone());

    let mut server_rx = rx.clone();
    let server = tokio::spawn(async move {
        let signal = async move {
            let _ = server_rx.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
            error!(error = %e, "Web server failed");
        }
    });

    let interval = state.config.daemon.tick_interval();
    let pose_loop = tokio::spawn(run_pose_loop(state, interval, rx));

    Ok(ServerHandle {
        local_addr,
        shutdown,
        tasks: vec![server, pose_loop],
    })
}

async fn run_pose_loop(state: Arc<AppState>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(period_ms = period.as_millis() as u64, "Pose loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                state.tick();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Pose loop stopped");
}
