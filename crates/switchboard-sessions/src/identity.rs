//! Canonical-identity extraction and aliasing.
//!
//! The identity ties a request to a person or chat regardless of how the
//! client's system prompt drifts across deployments. Precedence:
//!
//!   1. `[from: Display Name (@handle)]` sender tag in the last user message
//!   2. `chat_id` inside the first fenced JSON metadata block of the system
//!      prompt
//!   3. none - the session key alone identifies the conversation
//!
//! A configured alias map rewrites extracted identities to their canonical
//! form (e.g. a secondary channel's chat id to the primary handle), which is
//! what lets one person share a session across channels.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use switchboard_core::text::metadata_json;

static SENDER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[from:[^\]]*\(@([A-Za-z0-9_.]+)\)\]").expect("sender tag regex"));

/// Identity → canonical alias mapping, loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct AliasMap {
    map: HashMap<String, String>,
}

impl AliasMap {
    /// Load from a JSON object file (`{"tg:123": "alice", ...}`).
    /// Missing or unreadable files yield an empty map with a warning.
    pub fn load(path: Option<&str>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(Path::new(path)) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => {
                    debug!(entries = map.len(), path, "identity alias map loaded");
                    Self { map }
                }
                Err(e) => {
                    warn!(path, error = %e, "alias map is not a JSON string map; ignoring");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path, error = %e, "alias map unreadable; ignoring");
                Self::default()
            }
        }
    }

    /// Replace an extracted identity by its canonical alias, if mapped.
    pub fn canonical<'a>(&'a self, identity: &'a str) -> &'a str {
        self.map.get(identity).map(String::as_str).unwrap_or(identity)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Extract the canonical identity for a request, applying the alias map.
pub fn extract_identity(
    last_user_text: &str,
    system: &str,
    aliases: &AliasMap,
) -> Option<String> {
    let raw = sender_handle(last_user_text).or_else(|| chat_id_identity(system))?;
    Some(aliases.canonical(&raw).to_string())
}

/// `[from: Display Name (@handle)]` anywhere in the text, handle lowercased.
fn sender_handle(text: &str) -> Option<String> {
    SENDER_TAG
        .captures(text)
        .map(|c| c[1].to_ascii_lowercase())
}

/// `chat_id` from the system prompt's fenced JSON metadata block. Numeric
/// and string ids are both accepted.
fn chat_id_identity(system: &str) -> Option<String> {
    let meta = metadata_json(system)?;
    match meta.get("chat_id") {
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_tag_wins_over_chat_id() {
        let aliases = AliasMap::default();
        let id = extract_identity(
            "[from: Alice Wonder (@Alice_W)] hello",
            "```json\n{\"chat_id\": 42}\n```",
            &aliases,
        );
        assert_eq!(id.as_deref(), Some("alice_w"));
    }

    #[test]
    fn chat_id_fallback() {
        let aliases = AliasMap::default();
        let id = extract_identity("plain text", "```json\n{\"chat_id\": 42}\n```", &aliases);
        assert_eq!(id.as_deref(), Some("42"));
    }

    #[test]
    fn none_when_nothing_matches() {
        let aliases = AliasMap::default();
        assert_eq!(extract_identity("hi", "no metadata here", &aliases), None);
    }

    #[test]
    fn alias_applies_after_extraction() {
        let mut map = HashMap::new();
        map.insert("42".to_string(), "alice_w".to_string());
        let aliases = AliasMap { map };
        let id = extract_identity("plain", "```json\n{\"chat_id\": 42}\n```", &aliases);
        assert_eq!(id.as_deref(), Some("alice_w"));
    }
}
