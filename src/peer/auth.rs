//! Proof of node identity exchanged in PING.
//!
//! A proof is an ed25519 signature by the sender's key over
//! `sha256(cur_time as u64 BE || recipient id)`. The sender's verifying key is its node identifier,
//! so a valid proof binds the connection to that identifier.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::core::{id::NodeId, message::AuthProof};

/// Proofs older or newer than this many seconds are rejected.
pub const AUTH_TIME_WINDOW: u64 = 5 * 60;

/// Seconds since the epoch.
pub fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

fn signed_digest(cur_time: u64, to: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(cur_time.to_be_bytes());
    hasher.update(to.as_bytes());
    hasher.finalize().into()
}

/// Signs a proof addressed to `to`.
pub fn sign_proof(key: &SigningKey, to: &NodeId, cur_time: u64) -> AuthProof {
    let signature = key.sign(&signed_digest(cur_time, to));

    AuthProof {
        pk: key.verifying_key().to_bytes(),
        cur_time,
        sign: signature.to_bytes().to_vec(),
    }
}

/// Checks a proof addressed to `local_id`, returning the identifier it proves.
pub fn verify_proof(proof: &AuthProof, local_id: &NodeId, now: u64) -> Option<NodeId> {
    if proof.cur_time.abs_diff(now) > AUTH_TIME_WINDOW {
        return None;
    }

    let key = VerifyingKey::from_bytes(&proof.pk).ok()?;
    let signature = Signature::from_slice(&proof.sign).ok()?;
    key.verify_strict(&signed_digest(proof.cur_time, local_id), &signature)
        .ok()?;

    Some(NodeId::new(proof.pk))
}

/// The node identifier of a signing key.
pub fn node_id_of(key: &SigningKey) -> NodeId {
    NodeId::new(key.verifying_key().to_bytes())
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn valid_proof() {
        let key = SigningKey::generate(&mut OsRng);
        let local_id = NodeId::rand();
        let now = unix_now();

        let proof = sign_proof(&key, &local_id, now);
        assert_eq!(verify_proof(&proof, &local_id, now), Some(node_id_of(&key)));
        // Clocks may drift within the window.
        assert!(verify_proof(&proof, &local_id, now + AUTH_TIME_WINDOW).is_some());
    }

    #[test]
    fn stale_proof() {
        let key = SigningKey::generate(&mut OsRng);
        let local_id = NodeId::rand();
        let now = unix_now();

        let proof = sign_proof(&key, &local_id, now - AUTH_TIME_WINDOW - 1);
        assert!(verify_proof(&proof, &local_id, now).is_none());
    }

    #[test]
    fn proof_for_someone_else() {
        let key = SigningKey::generate(&mut OsRng);
        let now = unix_now();

        let proof = sign_proof(&key, &NodeId::rand(), now);
        assert!(verify_proof(&proof, &NodeId::rand(), now).is_none());
    }

    #[test]
    fn forged_key() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let local_id = NodeId::rand();
        let now = unix_now();

        let mut proof = sign_proof(&key, &local_id, now);
        proof.pk = other.verifying_key().to_bytes();
        assert!(verify_proof(&proof, &local_id, now).is_none());

        proof.sign.truncate(10);
        assert!(verify_proof(&proof, &local_id, now).is_none());
    }
}
