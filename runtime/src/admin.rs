use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use futures::prelude::*;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Serves the admin surface (`/metrics`, `/live`, `/ready`) until the
/// shutdown signal fires, then drains gracefully.
pub async fn serve_admin(
    addr: SocketAddr,
    registry: Arc<Registry>,
    drain: drain::Watch,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/live", get(|| async { "live" }))
        .route("/ready", get(|| async { "ready" }))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::pin! {
        let srv = axum::serve(listener, app)
            .with_graceful_shutdown(close_rx.map(|_| ()))
            .into_future();
    }

    tokio::select! {
        res = &mut srv => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(&mut srv).await?;
        }
    }
    Ok(())
}

async fn metrics(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut exposition = String::new();
    match encode(&mut exposition, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            exposition,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
