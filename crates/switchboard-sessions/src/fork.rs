//! Regeneration fork: truncate a stored conversation at its last real user
//! turn and write the survivors under a fresh UUID.
//!
//! The original file is never modified - the fork is a copy, so a bad
//! regenerate can always be recovered from by hand.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::store::SessionStore;

/// Fork `uuid` at its last real user turn. Returns the fresh UUID the kept
/// entries were written under.
pub fn fork_session(store: &SessionStore, uuid: &str) -> Result<String> {
    let raw = std::fs::read_to_string(store.session_file(uuid))?;

    // Keep the original line text verbatim; parse a shadow copy for the
    // pruning decisions so unknown fields survive the rewrite untouched.
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let parsed: Vec<Option<Value>> = lines
        .iter()
        .map(|l| serde_json::from_str(l).ok())
        .collect();

    let cut = lines
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, _)| {
            parsed[i]
                .as_ref()
                .filter(|v| is_real_user_turn(v))
                .map(|_| i)
        })
        .ok_or_else(|| SessionError::NothingToFork {
            uuid: uuid.to_string(),
        })?;

    // The cut entry plus everything descending from it (entries whose
    // parentUuid chain leads back to it). Parents precede children in the
    // log, so one forward pass suffices.
    let mut removed: HashSet<String> = HashSet::new();
    let mut drop_idx: HashSet<usize> = HashSet::new();
    if let Some(id) = entry_uuid(parsed[cut].as_ref()) {
        removed.insert(id);
    }
    drop_idx.insert(cut);
    for (i, entry) in parsed.iter().enumerate().skip(cut + 1) {
        let Some(v) = entry else { continue };
        let parent_removed = v
            .get("parentUuid")
            .and_then(Value::as_str)
            .map(|p| removed.contains(p))
            .unwrap_or(false);
        if parent_removed {
            if let Some(id) = entry_uuid(entry.as_ref()) {
                removed.insert(id);
            }
            drop_idx.insert(i);
        }
    }

    // The snapshot written just before a user turn belongs to that turn.
    if cut > 0 && entry_type(parsed[cut - 1].as_ref()) == Some("file-history-snapshot") {
        drop_idx.insert(cut - 1);
    }

    let kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| !drop_idx.contains(i))
        .map(|(_, l)| *l)
        .collect();

    let fork_uuid = Uuid::new_v4().to_string();
    let fork_path = store.session_file(&fork_uuid);
    if let Some(parent) = fork_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = kept.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    std::fs::write(&fork_path, body)?;

    info!(
        from = uuid,
        to = %fork_uuid,
        kept = kept.len(),
        dropped = drop_idx.len(),
        "session forked for regeneration"
    );
    debug!(path = %fork_path.display(), "fork written");
    Ok(fork_uuid)
}

/// A user entry that is neither a compaction summary nor a pure tool_result
/// carrier - i.e. an actual human turn.
fn is_real_user_turn(v: &Value) -> bool {
    if v.get("type").and_then(Value::as_str) != Some("user") {
        return false;
    }
    if v.get("isCompactSummary")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return false;
    }
    match v.pointer("/message/content") {
        // Array content that is nothing but tool_result parts carries tool
        // output back to the model, not user input.
        Some(Value::Array(parts)) => !parts.iter().all(|p| {
            p.get("type").and_then(Value::as_str) == Some("tool_result")
        }),
        _ => true,
    }
}

fn entry_uuid(v: Option<&Value>) -> Option<String> {
    v?.get("uuid").and_then(Value::as_str).map(String::from)
}

fn entry_type<'a>(v: Option<&'a Value>) -> Option<&'a str> {
    v?.get("type").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &std::path::Path) -> SessionStore {
        SessionStore::new(dir.to_str().unwrap(), "/ws")
    }

    fn write_session(store: &SessionStore, uuid: &str, entries: &[Value]) {
        let path = store.session_file(uuid);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = entries
            .iter()
            .map(|e| format!("{e}\n"))
            .collect();
        std::fs::write(path, body).unwrap();
    }

    fn read_entries(store: &SessionStore, uuid: &str) -> Vec<Value> {
        std::fs::read_to_string(store.session_file(uuid))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn fork_drops_last_user_turn_and_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let entries = vec![
            json!({"type":"user","uuid":"u1","parentUuid":null,"message":{"content":"Secret is alpha."}}),
            json!({"type":"assistant","uuid":"a1","parentUuid":"u1","message":{"content":"Noted."}}),
            json!({"type":"file-history-snapshot","uuid":"s2","parentUuid":"a1"}),
            json!({"type":"user","uuid":"u2","parentUuid":"a1","message":{"content":"Secret is bravo."}}),
            json!({"type":"assistant","uuid":"a2","parentUuid":"u2","message":{"content":"Noted again."}}),
        ];
        write_session(&store, "orig", &entries);

        let fork = fork_session(&store, "orig").unwrap();
        let kept = read_entries(&store, &fork);
        let uuids: Vec<&str> = kept.iter().map(|e| e["uuid"].as_str().unwrap()).collect();
        assert_eq!(uuids, vec!["u1", "a1"]);

        // Original untouched.
        assert_eq!(read_entries(&store, "orig").len(), 5);
        // Fork lives under a different UUID.
        assert_ne!(fork, "orig");
    }

    #[test]
    fn fork_skips_tool_result_and_compact_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let entries = vec![
            json!({"type":"user","uuid":"u1","parentUuid":null,"message":{"content":"real question"}}),
            json!({"type":"assistant","uuid":"a1","parentUuid":"u1","message":{"content":[{"type":"tool_use","id":"t1"}]}}),
            json!({"type":"user","uuid":"r1","parentUuid":"a1","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}),
            json!({"type":"assistant","uuid":"a2","parentUuid":"r1","message":{"content":"answer"}}),
            json!({"type":"user","uuid":"c1","parentUuid":"a2","isCompactSummary":true,"message":{"content":"summary"}}),
        ];
        write_session(&store, "orig", &entries);

        // The only real user turn is u1: the fork removes it and all its
        // descendants, leaving only entries outside its subtree (none here
        // except the detached compact summary, which is parented into the
        // removed chain too).
        let fork = fork_session(&store, "orig").unwrap();
        let kept = read_entries(&store, &fork);
        assert!(kept.iter().all(|e| e["uuid"] != "u1"));
        assert!(kept.iter().all(|e| e["uuid"] != "a1"));
    }

    #[test]
    fn fork_without_user_turn_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let entries = vec![
            json!({"type":"assistant","uuid":"a1","parentUuid":null,"message":{"content":"hello"}}),
        ];
        write_session(&store, "orig", &entries);
        assert!(matches!(
            fork_session(&store, "orig"),
            Err(SessionError::NothingToFork { .. })
        ));
    }
}
