//! Session-key and session-UUID derivation.
//!
//! The key must be stable across turns of the same logical chat even when
//! per-message metadata changes; the UUID must be stable for a given key so
//! the CLI resumes the same on-disk conversation after a gateway restart.

use sha2::{Digest, Sha256};
use switchboard_core::text::stable_system_text;

/// Derive the session key for a request: SHA-256 hex over the stable
/// system-prompt text concatenated with the canonical identity (when known).
pub fn derive_session_key(system: &str, identity: Option<&str>) -> String {
    let stable = stable_system_text(system);
    let mut hasher = Sha256::new();
    hasher.update(stable.as_bytes());
    if let Some(id) = identity {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Deterministically derive the CLI session UUID for a key.
///
/// SHA-256 of the key, reformatted as canonical 8-4-4-4-12 text with the
/// version nibble forced to 4 and the variant nibble forced to 8, so the id
/// is indistinguishable from a random v4 UUID to the CLI.
pub fn derive_session_uuid(session_key: &str) -> String {
    let digest = Sha256::digest(session_key.as_bytes());
    let hex = hex::encode(&digest[..16]);
    // The version/variant nibbles overwrite positions 12 and 16.
    format!(
        "{}-{}-4{}-8{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        &hex[17..20],
        &hex[20..32],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_canonical_v4(u: &str) -> bool {
        let parts: Vec<&str> = u.split('-').collect();
        parts.len() == 5
            && parts[0].len() == 8
            && parts[1].len() == 4
            && parts[2].len() == 4
            && parts[3].len() == 4
            && parts[4].len() == 12
            && parts[2].starts_with('4')
            && parts[3].starts_with('8')
            && u.chars().all(|c| c == '-' || c.is_ascii_hexdigit())
    }

    #[test]
    fn uuid_is_deterministic_and_canonical() {
        let a = derive_session_uuid("key-1");
        let b = derive_session_uuid("key-1");
        assert_eq!(a, b);
        assert!(is_canonical_v4(&a), "not canonical: {a}");
    }

    #[test]
    fn distinct_keys_distinct_uuids() {
        assert_ne!(derive_session_uuid("key-1"), derive_session_uuid("key-2"));
    }

    #[test]
    fn key_ignores_volatile_metadata() {
        let sys_a = "You are a bot.\n```json\n{\"chat_id\": 9, \"message_id\": 1}\n```";
        let sys_b = "You are a bot.\n```json\n{\"chat_id\": 9, \"message_id\": 2}\n```";
        assert_eq!(
            derive_session_key(sys_a, Some("alice")),
            derive_session_key(sys_b, Some("alice"))
        );
    }

    #[test]
    fn key_depends_on_identity() {
        assert_ne!(
            derive_session_key("same system", Some("alice")),
            derive_session_key("same system", Some("bob"))
        );
        assert_ne!(
            derive_session_key("same system", Some("alice")),
            derive_session_key("same system", None)
        );
    }
}
