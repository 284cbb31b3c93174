//! `GET /health`: liveness probe, no authentication required.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::protocol::envelope::now_millis;
use crate::server::state::AppState;

pub async fn health(State(_state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": now_millis(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
