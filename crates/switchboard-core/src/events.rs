//! Event model for the CLI's stream-json stdout.
//!
//! The CLI emits variant-shaped JSON objects. Rather than a strict serde
//! schema we decode from `serde_json::Value` so unknown shapes degrade to
//! `CliEvent::Unknown` (logged and ignored) instead of aborting the stream.

use serde::Serialize;
use serde_json::Value;

/// One parsed object from the child's stdout.
#[derive(Debug, Clone)]
pub enum CliEvent {
    /// Session bootstrap info (session id, tools, model).
    Init(Value),
    ContentBlockStart {
        index: u64,
        block: BlockKind,
    },
    ContentBlockDelta {
        index: u64,
        delta: Delta,
    },
    ContentBlockStop {
        index: u64,
    },
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: Option<u64>,
    },
    /// `system` events: compaction boundaries, status changes.
    System {
        subtype: String,
        status: Option<String>,
        pre_tokens: Option<u64>,
    },
    /// Complete assistant message snapshots. Monitor only.
    Assistant(Value),
    /// User-role entries (tool results echoed back). Monitor only.
    User(Value),
    /// Final turn summary with text and usage.
    Result(TurnResult),
    Error {
        message: String,
    },
    /// Anything we do not recognise. Never an error.
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
    Other(String),
}

impl BlockKind {
    pub fn is_tool_use(&self) -> bool {
        matches!(self, BlockKind::ToolUse { .. })
    }

    /// Wire name of the block type.
    pub fn as_str(&self) -> &str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Thinking => "thinking",
            BlockKind::ToolUse { .. } => "tool_use",
            BlockKind::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Delta {
    Text(String),
    Thinking(String),
    InputJson(String),
    Other(String),
}

/// The CLI's final per-turn report.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    pub text: Option<String>,
    pub is_error: bool,
    pub usage: Usage,
}

/// Token usage as reported by the CLI.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Billable input: base + cache creation + cache reads.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    pub fn from_value(v: &Value) -> Self {
        let get = |key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: get("input_tokens"),
            cache_creation_input_tokens: get("cache_creation_input_tokens"),
            cache_read_input_tokens: get("cache_read_input_tokens"),
            output_tokens: get("output_tokens"),
        }
    }
}

impl CliEvent {
    /// Classify a raw stdout object.
    pub fn from_value(v: Value) -> CliEvent {
        let ty = v.get("type").and_then(Value::as_str).unwrap_or("");
        match ty {
            "content_block_start" => {
                let index = v.get("index").and_then(Value::as_u64).unwrap_or(0);
                let block = parse_block_kind(v.get("content_block"));
                CliEvent::ContentBlockStart { index, block }
            }
            "content_block_delta" => {
                let index = v.get("index").and_then(Value::as_u64).unwrap_or(0);
                let delta = parse_delta(v.get("delta"));
                CliEvent::ContentBlockDelta { index, delta }
            }
            "content_block_stop" => {
                let index = v.get("index").and_then(Value::as_u64).unwrap_or(0);
                CliEvent::ContentBlockStop { index }
            }
            "message_delta" => CliEvent::MessageDelta {
                stop_reason: v
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .map(String::from),
                output_tokens: v.pointer("/usage/output_tokens").and_then(Value::as_u64),
            },
            "system" => {
                let subtype = v
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if subtype == "init" {
                    return CliEvent::Init(v);
                }
                CliEvent::System {
                    subtype,
                    status: v.get("status").and_then(Value::as_str).map(String::from),
                    pre_tokens: v
                        .pointer("/compact_metadata/pre_tokens")
                        .and_then(Value::as_u64),
                }
            }
            "init" => CliEvent::Init(v),
            "assistant" => CliEvent::Assistant(v),
            "user" => CliEvent::User(v),
            "result" => CliEvent::Result(TurnResult {
                text: v.get("result").and_then(Value::as_str).map(String::from),
                is_error: v.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                usage: v
                    .get("usage")
                    .map(Usage::from_value)
                    .unwrap_or_default(),
            }),
            "error" => CliEvent::Error {
                message: v
                    .pointer("/error/message")
                    .or_else(|| v.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown CLI error")
                    .to_string(),
            },
            _ => CliEvent::Unknown(v),
        }
    }
}

fn parse_block_kind(block: Option<&Value>) -> BlockKind {
    let Some(block) = block else {
        return BlockKind::Other(String::new());
    };
    match block.get("type").and_then(Value::as_str).unwrap_or("") {
        "text" => BlockKind::Text,
        "thinking" => BlockKind::Thinking,
        "tool_use" => BlockKind::ToolUse {
            id: block
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        other => BlockKind::Other(other.to_string()),
    }
}

fn parse_delta(delta: Option<&Value>) -> Delta {
    let Some(delta) = delta else {
        return Delta::Other(String::new());
    };
    let text = |key: &str| {
        delta
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match delta.get("type").and_then(Value::as_str).unwrap_or("") {
        "text_delta" => Delta::Text(text("text")),
        "thinking_delta" => Delta::Thinking(text("thinking")),
        "input_json_delta" => Delta::InputJson(text("partial_json")),
        other => Delta::Other(other.to_string()),
    }
}
