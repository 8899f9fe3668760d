use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use switchboard_runner::Engine;

/// GET /health - liveness probe, returns server metadata and feature list.
pub async fn health_handler(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::app::VERSION,
        "features": [
            "messages",
            "streaming",
            "sessions",
            "identity-migration",
            "regenerate",
            "monitor",
            "deploy",
        ],
        "monitorClients": engine.monitor.client_count(),
        "activeRuns": engine.active.len(),
        "knownSessions": engine.registry.len(),
    }))
}
