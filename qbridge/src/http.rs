//! Operator HTTP surface.
//!
//! A small status-and-control endpoint next to the control loop. Not a
//! data-plane component: it only reads the health snapshot the loop
//! publishes and can request a graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::runtime::BridgeHealth;

#[derive(Clone)]
pub struct OperatorState {
    health_rx: watch::Receiver<BridgeHealth>,
    shutdown_tx: watch::Sender<bool>,
}

impl OperatorState {
    pub fn new(health_rx: watch::Receiver<BridgeHealth>, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            health_rx,
            shutdown_tx,
        }
    }
}

async fn health(State(state): State<Arc<OperatorState>>) -> Json<BridgeHealth> {
    Json(state.health_rx.borrow().clone())
}

async fn shutdown(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    info!("shutdown requested via operator endpoint");
    let _ = state.shutdown_tx.send(true);
    StatusCode::ACCEPTED
}

pub fn routes(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Serve the operator endpoint until shutdown is signalled.
pub async fn serve(listen: &str, state: Arc<OperatorState>) -> anyhow::Result<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let app = routes(state);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("operator endpoint listening on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Either an OS signal or the /shutdown handler flips the watch.
            let _ = shutdown_rx.wait_for(|v| *v).await;
        })
        .await?;

    info!("operator endpoint closed");
    Ok(())
}
