//! ---
//! warden_section: "05-observability"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Metrics collection and export utilities."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! `GET /metrics` over the shared registry, in the text exposition format.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::SharedRegistry;

/// Bind `addr` and serve `registry` until [`MetricsServer::shutdown`].
pub async fn serve_metrics(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics listener {addr}"))?;
    let addr = listener
        .local_addr()
        .context("reading metrics listener address")?;
    let router = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
            .context("metrics exporter failed")
    });
    info!(address = %addr, "metrics exporter listening");
    Ok(MetricsServer {
        addr,
        stop: Some(stop),
        task,
    })
}

async fn render(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut body) {
        warn!(error = %err, "metrics encoding failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], body).into_response()
}

/// Running exporter; the port is resolved, so binding `:0` is fine.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}
