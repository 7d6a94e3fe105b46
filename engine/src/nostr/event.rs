//! NIP-01 events: canonical serialization, id computation, verification.

use secp256k1::schnorr::Signature;
use secp256k1::{All, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Canonical serialization for hashing:
/// `[0, pubkey, created_at, kind, tags, content]` with compact separators.
pub fn serialize_for_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string()
}

pub(crate) fn id_digest(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let serialized = serialize_for_id(pubkey, created_at, kind, tags, content);
    Sha256::digest(serialized.as_bytes()).into()
}

/// Event id: SHA-256 of the canonical serialization, hex-encoded.
pub fn event_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    hex::encode(id_digest(pubkey, created_at, kind, tags, content))
}

impl NostrEvent {
    pub fn compute_id(&self) -> String {
        event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Full NIP-01 verification: id must match the canonical hash and the
    /// Schnorr signature must verify against the claimed pubkey.
    pub fn verify(&self) -> bool {
        let digest = id_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(digest) != self.id {
            return false;
        }
        let Ok(pk_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(xonly) = XOnlyPublicKey::from_slice(&pk_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let msg = Message::from_digest(digest);
        secp().verify_schnorr(&sig, &msg, &xonly).is_ok()
    }
}

/// A valid challenge response is any signed event whose content equals the
/// issued challenge string and whose pubkey matches the caller.
pub fn verify_signed_challenge(
    event: &NostrEvent,
    expected_challenge: &str,
    expected_pubkey: &str,
) -> bool {
    if expected_challenge.is_empty() || expected_pubkey.is_empty() {
        return false;
    }
    event.pubkey == expected_pubkey && event.content == expected_challenge && event.verify()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_serialization_is_compact() {
        let tags = vec![vec!["d".to_string(), "BTC-USD-PERP".to_string()]];
        let s = serialize_for_id("ab".repeat(32).as_str(), 1_700_000_000, 1050, &tags, "hi");
        assert_eq!(
            s,
            format!(
                "[0,\"{}\",1700000000,1050,[[\"d\",\"BTC-USD-PERP\"]],\"hi\"]",
                "ab".repeat(32)
            )
        );
    }

    #[test]
    fn event_id_is_hex_sha256() {
        let id = event_id("pk", 0, 1, &[], "");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(id, event_id("pk", 0, 1, &[], ""));
        assert_ne!(id, event_id("pk", 0, 1, &[], "x"));
    }

    #[test]
    fn verify_rejects_bad_hex() {
        let ev = NostrEvent {
            id: event_id("zz", 0, 1, &[], "c"),
            pubkey: "zz".into(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: "c".into(),
            sig: "00".into(),
        };
        assert!(!ev.verify());
    }
}
