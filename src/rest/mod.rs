// rest/mod.rs — Public REST API server.
//
// Axum HTTP server carrying the identification contract. The resolver
// and store do all the work; this layer only validates input shape and
// maps errors to status codes.
//
// Endpoints:
//   POST /identify
//   GET  /health
//   GET  /

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::info;

use crate::AppContext;

/// Hard deadline per request; slower requests get a 408.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("identityd listening on http://{}", bind);

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(routes::health::service_info))
        .route("/health", get(routes::health::health))
        .route("/identify", post(routes::identify::identify))
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(ctx)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received, draining connections");
    }
}
