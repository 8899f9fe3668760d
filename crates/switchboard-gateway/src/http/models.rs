use axum::Json;
use serde_json::{json, Value};

/// GET /v1/models - the three model families the CLI accepts.
pub async fn models_handler() -> Json<Value> {
    Json(json!({
        "data": [
            {"id": "opus", "type": "model", "display_name": "Opus"},
            {"id": "sonnet", "type": "model", "display_name": "Sonnet"},
            {"id": "haiku", "type": "model", "display_name": "Haiku"},
        ]
    }))
}
