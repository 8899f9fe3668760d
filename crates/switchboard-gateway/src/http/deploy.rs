//! POST /deploy - GitHub push webhook.
//!
//! Verifies the `X-Hub-Signature-256` HMAC over the raw body, acts only on
//! pushes to main, and launches the update script as a detached process so
//! the running gateway can be replaced underneath it.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use switchboard_runner::Engine;

type HmacSha256 = Hmac<Sha256>;

pub async fn deploy_handler(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let secret = engine.config.deploy.secret.as_deref().ok_or_else(|| {
        warn!("deploy webhook received but no secret is configured");
        auth_error("deploy webhook is not configured")
    })?;

    verify_signature(&headers, &body, secret).map_err(|reason| {
        warn!(reason, "deploy webhook signature rejected");
        auth_error(reason)
    })?;

    // Only push events to the main branch trigger an update; everything
    // else is acknowledged and dropped.
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if event != "push" {
        info!(event, "deploy webhook ignored (not a push)");
        return Ok(Json(json!({"ok": true, "action": "ignored", "reason": "not a push event"})));
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "message": format!("invalid JSON body: {e}")}
            })),
        )
    })?;
    let git_ref = payload.get("ref").and_then(Value::as_str).unwrap_or("");
    if git_ref != "refs/heads/main" {
        info!(git_ref, "deploy webhook ignored (not main)");
        return Ok(Json(json!({"ok": true, "action": "ignored", "reason": "not main branch"})));
    }

    let commit = payload
        .pointer("/head_commit/id")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!(commit, "deploy webhook accepted; launching update");
    engine
        .monitor
        .publish(json!({"type": "deploy", "commit": commit}));

    crate::update::launch_update(engine.config.deploy.update_script.as_deref()).map_err(|e| {
        warn!(error = %e, "failed to launch update script");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "type": "error",
                "error": {"type": "api_error", "message": "failed to launch update"}
            })),
        )
    })?;

    Ok(Json(json!({"ok": true, "action": "updating", "commit": commit})))
}

/// GitHub-style HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256. The
/// comparison inside `verify_slice` is constant-time.
fn verify_signature(headers: &HeaderMap, body: &Bytes, secret: &str) -> Result<(), &'static str> {
    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing X-Hub-Signature-256 header")?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or("malformed X-Hub-Signature-256 header")?;

    let expected = hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex")?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid HMAC key length")?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch")
}

fn auth_error(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": reason}
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let body = Bytes::from_static(b"{\"ref\":\"refs/heads/main\"}");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("s3cret", &body).parse().unwrap(),
        );
        assert!(verify_signature(&headers, &body, "s3cret").is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = Bytes::from_static(b"{}");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("other", &body).parse().unwrap(),
        );
        assert!(verify_signature(&headers, &body, "s3cret").is_err());
    }

    #[test]
    fn missing_or_malformed_header_rejected() {
        let body = Bytes::from_static(b"{}");
        let headers = HeaderMap::new();
        assert!(verify_signature(&headers, &body, "s3cret").is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", "md5=abcd".parse().unwrap());
        assert!(verify_signature(&headers, &body, "s3cret").is_err());
    }

    #[test]
    fn tampered_body_rejected() {
        let body = Bytes::from_static(b"{\"ref\":\"refs/heads/main\"}");
        let sig = sign("s3cret", b"{\"ref\":\"refs/heads/other\"}");
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sig.parse().unwrap());
        assert!(verify_signature(&headers, &body, "s3cret").is_err());
    }
}
