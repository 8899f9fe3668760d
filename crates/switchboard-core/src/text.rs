//! Text shaping shared by the request handler and the translator.

use regex::Regex;
use std::sync::LazyLock;

/// Gateway-only reply metadata the model must never see or echo:
/// `[[reply_to_message_id: 12345]]` plus any trailing whitespace.
static REPLY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[reply_to_message_id:\s*\d+\]\]\s*").expect("reply tag regex")
});

/// Dynamic per-message fields inside the fenced metadata block. Stripped
/// before hashing so the session key is stable across turns.
static VOLATILE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#",?\s*"(message_id|reply_to_message_id)"\s*:\s*(\d+|null|"[^"]*")"#)
        .expect("volatile field regex")
});

/// First fenced JSON block: ```json ... ```
static METADATA_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("metadata fence regex")
});

/// Trailing `-YYYYMMDD` release date on a model id.
static MODEL_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-\d{8}$").expect("model date regex"));

/// Remove gateway reply tags from prompt, system, and outbound text.
/// Idempotent: a second pass is a no-op.
pub fn strip_gateway_tags(text: &str) -> String {
    REPLY_TAG.replace_all(text, "").into_owned()
}

/// System-prompt text with volatile per-message metadata removed, suitable
/// for session-key hashing.
pub fn stable_system_text(system: &str) -> String {
    let stripped = strip_gateway_tags(system);
    VOLATILE_FIELD.replace_all(&stripped, "").into_owned()
}

/// Extract the first fenced JSON metadata block (fence included) from the
/// system prompt, e.g. the per-turn channel/chat_id envelope.
pub fn metadata_block(system: &str) -> Option<&str> {
    METADATA_FENCE.find(system).map(|m| m.as_str())
}

/// The JSON payload inside the first fenced metadata block.
pub fn metadata_json(system: &str) -> Option<serde_json::Value> {
    let caps = METADATA_FENCE.captures(system)?;
    serde_json::from_str(caps.get(1)?.as_str()).ok()
}

/// Normalize a client-supplied model id for the CLI.
///
/// Ecosystem prefixes (`anthropic/claude-3-opus`, `us.anthropic.claude…`) and
/// date suffixes (`claude-sonnet-4-20250514`) are stripped; any id containing
/// a known family token collapses to that token. Anything else passes through
/// unchanged so custom ids still reach the CLI.
pub fn normalize_model(model: &str) -> String {
    let bare = model.rsplit('/').next().unwrap_or(model);
    let bare = bare.rsplit("anthropic.").next().unwrap_or(bare);
    let bare = MODEL_DATE.replace(bare, "");
    let lowered = bare.to_ascii_lowercase();
    for family in ["opus", "sonnet", "haiku"] {
        if lowered.contains(family) {
            return family.to_string();
        }
    }
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_reply_tags() {
        let s = "hello [[reply_to_message_id: 42]] world";
        assert_eq!(strip_gateway_tags(s), "hello world");
    }

    #[test]
    fn stripping_is_idempotent() {
        let s = "a [[reply_to_message_id: 1]]  b [[reply_to_message_id: 2]]";
        let once = strip_gateway_tags(s);
        let twice = strip_gateway_tags(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn stable_text_drops_message_ids() {
        let a = "prefix\n```json\n{\"chat_id\": 7, \"message_id\": 100}\n```\n";
        let b = "prefix\n```json\n{\"chat_id\": 7, \"message_id\": 999}\n```\n";
        assert_eq!(stable_system_text(a), stable_system_text(b));
        // chat_id survives
        assert!(stable_system_text(a).contains("chat_id"));
    }

    #[test]
    fn metadata_block_found() {
        let s = "intro\n```json\n{\"channel\": \"telegram\", \"chat_id\": 5}\n```\ntail";
        let block = metadata_block(s).unwrap();
        assert!(block.starts_with("```json"));
        let json = metadata_json(s).unwrap();
        assert_eq!(json["chat_id"], 5);
    }

    #[test]
    fn model_families_collapse() {
        assert_eq!(normalize_model("claude-3-5-sonnet-20241022"), "sonnet");
        assert_eq!(normalize_model("anthropic/claude-opus-4"), "opus");
        assert_eq!(normalize_model("us.anthropic.claude-haiku-3"), "haiku");
        assert_eq!(normalize_model("opus"), "opus");
    }

    #[test]
    fn unknown_models_pass_through() {
        assert_eq!(normalize_model("gpt-4o"), "gpt-4o");
        assert_eq!(normalize_model("my-local-model"), "my-local-model");
    }
}
