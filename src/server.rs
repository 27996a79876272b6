use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::{Collector, render};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `/metrics`, rendering a fresh collection on every scrape.
pub(crate) fn metrics_router(collector: Arc<Collector>) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(collector)
}

/// `/healthz` and `/readyz`.
pub(crate) fn probe_router() -> Router {
    Router::new().route("/healthz", get(ping)).route("/readyz", get(ping))
}

async fn metrics(State(collector): State<Arc<Collector>>) -> Response {
    match collector.collect().await {
        Ok(families) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], render(&families)).into_response(),
        Err(e) => {
            error!("Scrape failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn ping() -> &'static str {
    "ok"
}

pub(crate) async fn bind(name: &str, address: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(address).await?;
    info!("Serving {name} on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serves `router` until `shutdown` is cancelled, then finishes open
/// requests.
pub(crate) async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
