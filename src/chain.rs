//! Hash chain primitives for the sealed integrity ledger.
//!
//! Every ledger entry commits to the previous entry hash, so deleting, reordering or
//! editing a violation record breaks the chain for every entry after it.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Domain tag mixed into every entry hash.
const DOMAIN_LEDGER_ENTRY: &[u8] = b"proctor-ledger:entry:v1";

/// Previous-hash value of the first entry in a chain.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Hashes a ledger entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_LEDGER_ENTRY);
    hasher.update(prev_hash);
    hasher.update((payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Signs a ledger entry hash with the device key.
pub fn sign_entry(signing_key: &SigningKey, entry_hash: &[u8; 32]) -> [u8; 64] {
    signing_key.sign(entry_hash).to_bytes()
}

pub fn verify_entry_signature(
    verifying_key: &VerifyingKey,
    entry_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<()> {
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(entry_hash, &sig)
        .map_err(|e| anyhow!("signature verification failed: {}", e))
}

/// Chain link for one appended payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SealedLink {
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
    pub signature: [u8; 64],
}

pub fn seal_payload(signing_key: &SigningKey, prev_hash: [u8; 32], payload: &[u8]) -> SealedLink {
    let entry_hash = hash_entry(&prev_hash, payload);
    SealedLink {
        prev_hash,
        entry_hash,
        signature: sign_entry(signing_key, &entry_hash),
    }
}
