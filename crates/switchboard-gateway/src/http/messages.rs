//! POST /v1/messages - the Messages API endpoint.
//!
//! The client gateway is authoritative for conversation context, and the
//! CLI preserves its own history via resume, so only the *last* user
//! message travels to the CLI; `messages[]` is never replayed. The response
//! is plain JSON or an SSE stream per `stream`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use switchboard_core::text::{metadata_block, normalize_model, strip_gateway_tags};
use switchboard_runner::run::{run_turn, TurnRequest};
use switchboard_runner::translate::SseFrame;
use switchboard_runner::Engine;
use switchboard_sessions::identity::extract_identity;
use switchboard_sessions::key::{derive_session_key, derive_session_uuid};

pub async fn messages_handler(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, "invalid_request_error", &format!("body is not a valid request: {e}")),
    };
    let Some(last_user) = req.last_user_message() else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "at least one user message is required",
        );
    };

    // Last user turn only; base64 images land in a temp dir whose paths are
    // appended so the CLI can open them itself.
    let (raw_text, image_suffix, images) = extract_content(last_user);
    let prompt_text = strip_gateway_tags(&raw_text);
    let system_text = strip_gateway_tags(&req.system_text());
    let model = normalize_model(req.model.as_deref().unwrap_or(&engine.config.cli.model));

    let identity = extract_identity(&raw_text, &system_text, &engine.aliases);
    let session_key = headers
        .get("x-session-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| derive_session_key(&system_text, identity.as_deref()));
    let regenerate = headers
        .get("x-regenerate")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let request_id = format!("msg_{}", uuid::Uuid::new_v4().simple());

    // `/stop` is a gateway command, not a prompt: kill whatever is running
    // for this session and answer directly. No spawn, no queue.
    if prompt_text.trim() == "/stop" {
        let killed = engine.active.kill(&session_key);
        info!(session_key, killed, "/stop received");
        engine
            .monitor
            .publish(json!({"type": "stop_command", "session_key": session_key, "killed": killed}));
        let text = if killed {
            "Stopped the active run."
        } else {
            "Nothing is running for this session."
        };
        return canned_response(&request_id, &model, text, req.stream);
    }

    // Exact key match, then identity migration, then the on-disk probe that
    // lets conversations survive gateway restarts.
    let (uuid, resume) = match engine.registry.lookup(&session_key) {
        Some(record) => (record.uuid, true),
        None => {
            let migrated = identity
                .as_deref()
                .and_then(|id| engine.registry.migrate(&session_key, id));
            match migrated {
                Some(record) => (record.uuid, true),
                None => {
                    let derived = derive_session_uuid(&session_key);
                    let on_disk = engine.store.exists(&derived);
                    (derived, on_disk)
                }
            }
        }
    };

    info!(
        session_key,
        uuid, resume, regenerate, model, stream = req.stream, "messages request"
    );

    let prompt = format!("{prompt_text}{image_suffix}");
    let turn = TurnRequest {
        session_key,
        uuid,
        resume,
        prompt,
        system: (!resume && !system_text.is_empty()).then(|| system_text.clone()),
        append_system: resume.then(|| resume_fragment(&system_text)),
        model: model.clone(),
        stream: req.stream,
        request_id: request_id.clone(),
        identity,
        sender: sender_display(&raw_text),
        regenerate,
    };

    if req.stream {
        stream_response(engine, turn, images).await
    } else {
        json_response(engine, turn, images).await
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

async fn stream_response(
    engine: Arc<Engine>,
    turn: TurnRequest,
    images: Option<tempfile::TempDir>,
) -> Response {
    let request_id = turn.request_id.clone();
    let keepalive = engine.config.stream.keepalive_secs;
    let (tx, mut rx) = mpsc::channel::<SseFrame>(64);
    let kill = engine.shutdown.child_token();

    let run_kill = kill.clone();
    let err_tx = tx.clone();
    tokio::spawn(async move {
        // The temp dir lives exactly as long as the run.
        let _images = images;
        match run_turn(&engine, turn, Some(tx), run_kill).await {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "streaming run failed");
                let _ = err_tx
                    .send(SseFrame {
                        event: "error",
                        data: json!({
                            "type": "error",
                            "error": {"type": "api_error", "message": e.to_string()}
                        }),
                    })
                    .await;
            }
        }
    });

    let stream = async_stream::stream! {
        // Dropping the response body (client disconnect) drops this guard,
        // which cancels the run and kills the child.
        let _guard = kill.drop_guard();
        while let Some(frame) = rx.recv().await {
            yield Ok::<_, Infallible>(Event::default().event(frame.event).data(frame.data.to_string()));
        }
    };

    let sse = Sse::new(stream);
    let response = if keepalive > 0 {
        sse.keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(keepalive))
                .text("keepalive"),
        )
        .into_response()
    } else {
        sse.into_response()
    };

    with_request_id(response, &request_id)
}

// ── Non-streaming ────────────────────────────────────────────────────────────

async fn json_response(
    engine: Arc<Engine>,
    turn: TurnRequest,
    images: Option<tempfile::TempDir>,
) -> Response {
    let request_id = turn.request_id.clone();
    let model = turn.model.clone();
    let kill = engine.shutdown.child_token();

    // Run detached so a vanishing client cannot leak queue or active-run
    // slots; the guard converts handler drop into a clean cancellation.
    let run_kill = kill.clone();
    let handle = tokio::spawn(async move {
        let _images = images;
        run_turn(&engine, turn, None, run_kill).await
    });
    let guard = kill.clone().drop_guard();
    let outcome = handle.await;
    guard.disarm();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "run task panicked");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "api_error", "internal error");
        }
    };

    match outcome {
        Ok(out) if !out.errored => {
            let text = out
                .result
                .as_ref()
                .and_then(|r| r.text.as_deref())
                .map(strip_gateway_tags)
                .unwrap_or_default();
            let body = json!({
                "id": request_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [{"type": "text", "text": text}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {
                    "input_tokens": out.input_tokens,
                    "output_tokens": out.output_tokens
                }
            });
            with_request_id(Json(body).into_response(), &request_id)
        }
        Ok(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            "the CLI reported a stream error",
        ),
        Err(e) => {
            warn!(error = %e, "run failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "api_error", &e.to_string())
        }
    }
}

// ── Request body types ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MessagesRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub source: Option<ImageSource>,
}

#[derive(Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
    Object(SystemBlock),
}

#[derive(Deserialize)]
pub struct SystemBlock {
    #[serde(default)]
    pub text: String,
}

impl MessagesRequest {
    fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }

    fn system_text(&self) -> String {
        match &self.system {
            None => String::new(),
            Some(SystemPrompt::Text(s)) => s.clone(),
            Some(SystemPrompt::Object(block)) => block.text.clone(),
            Some(SystemPrompt::Blocks(blocks)) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ── Content extraction ───────────────────────────────────────────────────────

/// Text of the last user message, plus a prompt suffix naming any extracted
/// image files and the temp dir that owns them (removed on drop).
fn extract_content(message: &Message) -> (String, String, Option<tempfile::TempDir>) {
    match &message.content {
        MessageContent::Text(s) => (s.clone(), String::new(), None),
        MessageContent::Blocks(blocks) => {
            let mut text_parts = Vec::new();
            let mut suffix = String::new();
            let mut dir: Option<tempfile::TempDir> = None;

            for block in blocks {
                match block.kind.as_str() {
                    "text" => {
                        if let Some(t) = &block.text {
                            text_parts.push(t.as_str());
                        }
                    }
                    "image" => match save_image(block, &mut dir) {
                        Some(path) => {
                            suffix.push_str(&format!("\n[Image attached at: {path}]"));
                        }
                        None => {
                            suffix.push_str("\n[image attachment could not be saved]");
                        }
                    },
                    _ => {}
                }
            }
            (text_parts.join("\n"), suffix, dir)
        }
    }
}

/// Decode one base64 image block into the shared temp dir.
fn save_image(block: &ContentBlock, dir: &mut Option<tempfile::TempDir>) -> Option<String> {
    let source = block.source.as_ref()?;
    let data = source.data.as_deref()?;
    let ext = match source.media_type.as_deref() {
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "jpg",
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(data).ok()?;

    if dir.is_none() {
        *dir = tempfile::Builder::new().prefix("switchboard-img-").tempdir().ok();
    }
    let dir = dir.as_ref()?;
    let path = dir
        .path()
        .join(format!("{}.{ext}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&path, &bytes).ok()?;
    Some(path.to_string_lossy().into_owned())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// The per-turn fragment appended on resume: the current metadata block (so
/// the CLI sees this turn's channel/chat context) plus a standing reminder.
/// Never the full system prompt - that would overwrite the stored one.
fn resume_fragment(system_text: &str) -> String {
    let mut fragment = String::new();
    if let Some(block) = metadata_block(system_text) {
        fragment.push_str(block);
        fragment.push('\n');
    }
    fragment.push_str(
        "Re-read the project instructions in your working directory before acting if you have not done so this session.",
    );
    fragment
}

/// Display form of the sender tag for monitor visibility, e.g. `@alice_w`.
fn sender_display(text: &str) -> Option<String> {
    let start = text.find("[from:")?;
    let end = text[start..].find(']')?;
    Some(text[start..start + end + 1].to_string())
}

fn api_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": {"type": kind, "message": message}
        })),
    )
        .into_response()
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// A complete assistant reply fabricated by the gateway itself (`/stop`).
fn canned_response(request_id: &str, model: &str, text: &str, stream: bool) -> Response {
    if !stream {
        let body = json!({
            "id": request_id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        });
        return with_request_id(Json(body).into_response(), request_id);
    }

    let frames = vec![
        (
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": request_id, "type": "message", "role": "assistant",
                    "model": model, "content": [],
                    "stop_reason": null, "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ),
        (
            "content_block_start",
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "text", "text": ""}}),
        ),
        (
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "text_delta", "text": text}}),
        ),
        (
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
        (
            "message_delta",
            json!({"type": "message_delta",
                   "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                   "usage": {"output_tokens": 0}}),
        ),
        ("message_stop", json!({"type": "message_stop"})),
    ];
    let stream = futures_util::stream::iter(frames.into_iter().map(|(event, data)| {
        Ok::<_, Infallible>(Event::default().event(event).data(data.to_string()))
    }));
    with_request_id(Sse::new(stream).into_response(), request_id)
}
