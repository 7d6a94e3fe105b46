//! Request authentication: signed challenges and signed events.
//!
//! Privileged calls present either a fresh signed challenge (issued by
//! GET /api/challenge, single use, 5 minute TTL) or a signed event of the
//! kind the endpoint expects. Processed event ids are remembered so a
//! replayed event is rejected without side effects.

use crate::state::Challenge;
use engine::config::CHALLENGE_TTL_SECONDS;
use engine::lock;
use engine::nostr::{verify_signed_challenge, NostrEvent};
use engine::EngineError;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Pubkeys are 32-byte lowercase hex. This also keeps pseudo-accounts like
/// "anon" out of the futures engine.
pub fn valid_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64
        && pubkey
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

pub fn issue_challenge(
    challenges: &Mutex<HashMap<String, Challenge>>,
    now: u64,
    pubkey: &str,
) -> Challenge {
    // the random suffix keeps two challenges issued in the same second
    // distinct
    let nonce: u32 = rand::thread_rng().gen();
    let challenge = Challenge {
        challenge: format!("bank:{now}:{nonce:08x}"),
        expires_at: now + CHALLENGE_TTL_SECONDS,
    };
    lock(challenges, "challenges").insert(pubkey.to_string(), challenge.clone());
    challenge
}

/// Consume the stored challenge for a pubkey and verify the signed
/// response. A challenge is single use whether or not verification
/// succeeds.
pub fn consume_challenge(
    challenges: &Mutex<HashMap<String, Challenge>>,
    now: u64,
    pubkey: &str,
    signed: Option<&NostrEvent>,
) -> Result<(), EngineError> {
    let stored = lock(challenges, "challenges")
        .remove(pubkey)
        .ok_or_else(|| EngineError::Unauthorized("missing or expired challenge".into()))?;
    if stored.expires_at < now {
        return Err(EngineError::Unauthorized("challenge expired".into()));
    }
    let signed =
        signed.ok_or_else(|| EngineError::Unauthorized("missing signed_challenge".into()))?;
    if !verify_signed_challenge(signed, &stored.challenge, pubkey) {
        return Err(EngineError::Unauthorized("invalid signature".into()));
    }
    Ok(())
}

/// Verify a client-originated signed event of the expected kind and check
/// it has not been processed before. Call `record_processed` only after the
/// operation succeeds, so a failed request does not burn the event id.
pub fn verify_request_event(
    processed: &Mutex<HashSet<String>>,
    event: &NostrEvent,
    expected_kind: u32,
) -> Result<(), EngineError> {
    if event.kind != expected_kind {
        return Err(EngineError::Validation(format!(
            "expected event kind {expected_kind}, got {}",
            event.kind
        )));
    }
    if !valid_pubkey(&event.pubkey) {
        return Err(EngineError::Unauthorized("invalid pubkey".into()));
    }
    if !event.verify() {
        return Err(EngineError::Unauthorized("invalid signature".into()));
    }
    if lock(processed, "processed_events").contains(&event.id) {
        return Err(EngineError::Conflict("event already processed".into()));
    }
    Ok(())
}

pub fn record_processed(processed: &Mutex<HashSet<String>>, event_id: &str) {
    lock(processed, "processed_events").insert(event_id.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::nostr::{SchnorrSigner, Signer};

    #[test]
    fn pubkey_validation() {
        assert!(valid_pubkey(&"ab".repeat(32)));
        assert!(!valid_pubkey("anon"));
        assert!(!valid_pubkey(&"AB".repeat(32)));
        assert!(!valid_pubkey(&"zz".repeat(32)));
        assert!(!valid_pubkey(&"ab".repeat(31)));
    }

    #[test]
    fn challenge_round_trip() {
        let signer = SchnorrSigner::generate();
        let pubkey = signer.pubkey();
        let challenges = Mutex::new(HashMap::new());

        let issued = issue_challenge(&challenges, 1_700_000_000, &pubkey);
        let signed = signer.sign(1, vec![], issued.challenge.clone(), 1_700_000_000);
        consume_challenge(&challenges, 1_700_000_010, &pubkey, Some(&signed)).unwrap();

        // single use
        let err = consume_challenge(&challenges, 1_700_000_010, &pubkey, Some(&signed)).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn expired_challenge_rejected() {
        let signer = SchnorrSigner::generate();
        let pubkey = signer.pubkey();
        let challenges = Mutex::new(HashMap::new());
        let issued = issue_challenge(&challenges, 1_700_000_000, &pubkey);
        let signed = signer.sign(1, vec![], issued.challenge, 1_700_000_000);
        let err = consume_challenge(&challenges, 1_700_000_000 + 301, &pubkey, Some(&signed))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn wrong_signer_rejected() {
        let signer = SchnorrSigner::generate();
        let other = SchnorrSigner::generate();
        let pubkey = signer.pubkey();
        let challenges = Mutex::new(HashMap::new());
        let issued = issue_challenge(&challenges, 1_700_000_000, &pubkey);
        // signed by somebody else
        let signed = other.sign(1, vec![], issued.challenge, 1_700_000_000);
        let err =
            consume_challenge(&challenges, 1_700_000_001, &pubkey, Some(&signed)).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn replayed_event_conflicts_without_side_effects() {
        let signer = SchnorrSigner::generate();
        let event = signer.sign(30051, vec![], "{\"size_sats\":1}".into(), 1_700_000_000);
        let processed = Mutex::new(HashSet::new());

        verify_request_event(&processed, &event, 30051).unwrap();
        record_processed(&processed, &event.id);

        let err = verify_request_event(&processed, &event, 30051).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn wrong_kind_and_bad_signature_rejected() {
        let signer = SchnorrSigner::generate();
        let processed = Mutex::new(HashSet::new());
        let event = signer.sign(30051, vec![], "{}".into(), 0);
        assert!(matches!(
            verify_request_event(&processed, &event, 1052),
            Err(EngineError::Validation(_))
        ));
        let mut tampered = event.clone();
        tampered.content = "{\"evil\":true}".into();
        tampered.id = tampered.compute_id();
        assert!(matches!(
            verify_request_event(&processed, &tampered, 30051),
            Err(EngineError::Unauthorized(_))
        ));
    }
}
