use axum::{
    http::{HeaderName, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use switchboard_runner::Engine;

/// Current version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Assemble the full Axum router.
pub fn build_router(engine: Arc<Engine>) -> Router {
    // Clients send auth headers we accept-and-ignore, plus our own control
    // headers; all must survive the preflight.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("anthropic-version"),
            HeaderName::from_static("x-session-key"),
            HeaderName::from_static("x-regenerate"),
        ]);

    Router::new()
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route("/v1/models", get(crate::http::models::models_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/events", get(crate::http::monitor::events_handler))
        .route("/deploy", post(crate::http::deploy::deploy_handler))
        .fallback(not_found)
        .with_state(engine)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "type": "error",
            "error": {"type": "not_found_error", "message": "unknown route"}
        })),
    )
}
