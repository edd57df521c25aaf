use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::config::HttpConfig;
use crate::error::{FleetError, Result};

/// Applies request tracing, panic recovery, timeouts, and the body size limit.
pub fn with_http_layers(router: Router, http: &HttpConfig) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                    .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG)),
            )
            .layer(CatchPanicLayer::new())
            // Outside the timeout: its response body has no `Default`.
            .layer(RequestBodyLimitLayer::new(http.max_body_bytes))
            .layer(TimeoutLayer::new(http.write_timeout))
            .layer(RequestBodyTimeoutLayer::new(http.read_body_timeout))
            .layer(DefaultBodyLimit::max(http.max_body_bytes)),
    )
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| FleetError::Internal(format!("bind {addr}: {e}")))
}

/// Serves `app` until `shutdown` fires, then gives in-flight requests `grace` to finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "HTTP server listening");

    let drain = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .into_future();

    with_grace(server, shutdown, grace)
        .await
        .map_err(|e| FleetError::Internal(format!("http server: {e}")))
}

async fn with_grace<F>(server: F, shutdown: CancellationToken, grace: Duration) -> std::io::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(server);
    tokio::select! {
        res = &mut server => return res,
        _ = shutdown.cancelled() => {}
    }
    match tokio::time::timeout(grace, server).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(grace_secs = grace.as_secs(), "Shutdown grace elapsed with requests in flight");
            Ok(())
        }
    }
}
