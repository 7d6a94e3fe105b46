use crate::error::{EngineError, Result};
use crate::nostr::event::{id_digest, secp, NostrEvent};
use rand::RngCore;
use secp256k1::{Keypair, Message, SecretKey};

/// Produces bank-signed events. The engine only ever sees this trait, so
/// tests can substitute a signer without touching key material handling.
pub trait Signer: Send + Sync {
    fn pubkey(&self) -> String;
    fn sign(&self, kind: u32, tags: Vec<Vec<String>>, content: String, created_at: u64)
        -> NostrEvent;
}

/// BIP-340 Schnorr signer over the bank's key.
pub struct SchnorrSigner {
    keypair: Keypair,
    pubkey_hex: String,
}

impl SchnorrSigner {
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex)
            .map_err(|_| EngineError::Validation("secret key must be hex".into()))?;
        let sk = SecretKey::from_slice(&bytes)
            .map_err(|_| EngineError::Validation("invalid secret key".into()))?;
        Ok(Self::from_secret_key(sk))
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 32];
        loop {
            rng.fill_bytes(&mut bytes);
            if let Ok(sk) = SecretKey::from_slice(&bytes) {
                return Self::from_secret_key(sk);
            }
        }
    }

    fn from_secret_key(sk: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(secp(), &sk);
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            keypair,
            pubkey_hex: hex::encode(xonly.serialize()),
        }
    }
}

impl Signer for SchnorrSigner {
    fn pubkey(&self) -> String {
        self.pubkey_hex.clone()
    }

    fn sign(
        &self,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: u64,
    ) -> NostrEvent {
        let digest = id_digest(&self.pubkey_hex, created_at, kind, &tags, &content);
        let msg = Message::from_digest(digest);
        let sig = secp().sign_schnorr_no_aux_rand(&msg, &self.keypair);
        NostrEvent {
            id: hex::encode(digest),
            pubkey: self.pubkey_hex.clone(),
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.serialize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event::verify_signed_challenge;

    #[test]
    fn sign_then_verify() {
        let signer = SchnorrSigner::generate();
        let ev = signer.sign(
            1050,
            vec![vec!["market".into(), "BTC-USD-PERP".into()]],
            "{\"size_sats\":1}".into(),
            1_700_000_000,
        );
        assert_eq!(ev.pubkey.len(), 64);
        assert_eq!(ev.id, ev.compute_id());
        assert!(ev.verify());
    }

    #[test]
    fn tampered_event_fails_verification() {
        let signer = SchnorrSigner::generate();
        let mut ev = signer.sign(1, vec![], "bank:1700000000".into(), 1_700_000_000);
        assert!(ev.verify());
        ev.content = "bank:1700000001".into();
        ev.id = ev.compute_id();
        assert!(!ev.verify());
    }

    #[test]
    fn keys_round_trip_through_hex() {
        let hex_key = "0000000000000000000000000000000000000000000000000000000000000001";
        let a = SchnorrSigner::from_hex(hex_key).unwrap();
        let b = SchnorrSigner::from_hex(hex_key).unwrap();
        assert_eq!(a.pubkey(), b.pubkey());
        assert!(SchnorrSigner::from_hex("not hex").is_err());
        assert!(SchnorrSigner::from_hex("00").is_err());
    }

    #[test]
    fn challenge_verification() {
        let signer = SchnorrSigner::generate();
        let ev = signer.sign(1, vec![], "bank:1700000000".into(), 1_700_000_000);
        assert!(verify_signed_challenge(&ev, "bank:1700000000", &signer.pubkey()));
        assert!(!verify_signed_challenge(&ev, "bank:9", &signer.pubkey()));
        assert!(!verify_signed_challenge(&ev, "bank:1700000000", "other"));
    }
}
