//! Signer — ECDSA P-256 over `digest || le(epoch) || le(counter)`

use super::keys::KeyPair;
use crate::error::{Result, UsigError};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, VerifyingKey};

/// Size of a message digest (SHA-256)
pub const DIGEST_SIZE: usize = 32;
/// Size of a fixed-width `r || s` signature
pub const SIGNATURE_SIZE: usize = 64;
/// Size of the signed payload
pub const PAYLOAD_SIZE: usize = DIGEST_SIZE + 16;

pub type Digest = [u8; DIGEST_SIZE];

/// Bytes covered by a USIG signature
pub fn signed_payload(digest: &Digest, epoch: u64, counter: u64) -> [u8; PAYLOAD_SIZE] {
    let mut payload = [0u8; PAYLOAD_SIZE];
    payload[..DIGEST_SIZE].copy_from_slice(digest);
    payload[DIGEST_SIZE..DIGEST_SIZE + 8].copy_from_slice(&epoch.to_le_bytes());
    payload[DIGEST_SIZE + 8..].copy_from_slice(&counter.to_le_bytes());
    payload
}

pub fn sign(pair: &KeyPair, digest: &Digest, epoch: u64, counter: u64) -> Result<Signature> {
    let payload = signed_payload(digest, epoch, counter);
    let signature: Signature = pair
        .signing_key()
        .try_sign(&payload)
        .map_err(|e| UsigError::SigningFailure(e.to_string()))?;
    // Low-S form only, so each (epoch, counter) has exactly one valid cert
    Ok(signature.normalize_s().unwrap_or(signature))
}

/// Check a signature; any mismatch yields `false`, as does a high-S signature
pub fn verify(
    public_key: &VerifyingKey,
    digest: &Digest,
    epoch: u64,
    counter: u64,
    signature: &Signature,
) -> bool {
    if signature.normalize_s().is_some() {
        return false;
    }
    let payload = signed_payload(digest, epoch, counter);
    public_key.verify(&payload, signature).is_ok()
}

/// Like [`verify`], for a signature still in wire form
pub fn verify_bytes(
    public_key: &VerifyingKey,
    digest: &Digest,
    epoch: u64,
    counter: u64,
    signature: &[u8],
) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => verify(public_key, digest, epoch, counter, &sig),
        Err(_) => false,
    }
}
