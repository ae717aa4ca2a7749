use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::observability::HealthStatus;
use crate::AppContext;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthStatus> {
    let db_ok = ctx.store.ping().await.is_ok();
    let uptime = ctx.started_at.elapsed().as_secs();
    Json(HealthStatus::ok(uptime, db_ok))
}

pub async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "identityd",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "identify": "POST /identify",
            "health": "GET /health",
        },
    }))
}
