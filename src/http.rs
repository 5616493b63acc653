use std::net::SocketAddr;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::supervisor::Readiness;
use crate::Result;

/// Serves the liveness and metrics endpoints until cancelled.
pub async fn serve(addr: SocketAddr, readiness: Readiness, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(readiness);
    axum::serve(listener, app).with_graceful_shutdown(shutdown(cancel)).await?;
    Ok(())
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}

async fn healthz(State(readiness): State<Readiness>) -> Health {
    if readiness.all_initialised() {
        Health::Ready
    } else {
        Health::NotReady
    }
}

async fn metrics() -> String {
    let mut buffer = String::new();
    let registry = &*crate::metrics::REGISTRY.read().unwrap();
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(()) => buffer,
        Err(_) => String::new(),
    }
}

enum Health {
    Ready,
    NotReady,
}

impl IntoResponse for Health {
    fn into_response(self) -> Response {
        match self {
            Health::Ready => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("Ok"))
                .unwrap(),
            Health::NotReady => Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("NotReady"))
                .unwrap(),
        }
    }
}
