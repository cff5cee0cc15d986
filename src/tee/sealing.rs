//! Sealing — bind data to the platform trust root and enclave identity
//!
//! Blob layout: `magic (4) | version (1) | nonce (12) | ciphertext | tag (16)`.
//! The header is authenticated as associated data. A blob sealed under a
//! different platform or enclave image fails authentication on unseal.

use super::enclave::{EnclaveContext, TeeError};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use std::alloc::Layout;
use zeroize::Zeroizing;

pub const SEAL_MAGIC: &[u8; 4] = b"USGL";
pub const SEAL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 5;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Total blob size for `plaintext_len` bytes of sealed data
pub fn sealed_size(plaintext_len: usize) -> usize {
    HEADER_SIZE + NONCE_SIZE + plaintext_len + TAG_SIZE
}

/// Seal `plaintext` under the context's sealing key
///
/// Running out of memory for the blob aborts the process: a half-built
/// blob may already hold key plaintext awaiting encryption.
pub fn seal(context: &EnclaveContext, plaintext: &[u8]) -> Result<Vec<u8>, TeeError> {
    let total = sealed_size(plaintext.len());
    let mut blob = allocate_blob(total);

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| TeeError::SealingError(format!("Nonce generation: {}", e)))?;

    blob.extend_from_slice(SEAL_MAGIC);
    blob.push(SEAL_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(plaintext);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(context.sealing_key()));
    let (aad, body) = blob.split_at_mut(HEADER_SIZE);
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            aad,
            &mut body[NONCE_SIZE..],
        )
        .map_err(|_| {
            blob_wipe(body);
            TeeError::SealingError("Encryption failed".into())
        })?;
    blob.extend_from_slice(&tag);

    log::debug!("Sealed {} bytes in context {}", plaintext.len(), &context.id()[..8]);
    Ok(blob)
}

/// Reverse [`seal`]; fails on malformed, foreign or tampered blobs
pub fn unseal(context: &EnclaveContext, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError> {
    if blob.len() < sealed_size(0) {
        return Err(TeeError::SealingError(format!(
            "Sealed blob too short: {} bytes",
            blob.len()
        )));
    }
    let (header, rest) = blob.split_at(HEADER_SIZE);
    if &header[..4] != SEAL_MAGIC {
        return Err(TeeError::SealingError("Not a sealed blob".into()));
    }
    if header[4] != SEAL_VERSION {
        return Err(TeeError::SealingError(format!(
            "Unsupported sealing version {}",
            header[4]
        )));
    }

    let (nonce, rest) = rest.split_at(NONCE_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(context.sealing_key()));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            header,
            plaintext.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| {
            TeeError::IntegrityError("Sealed blob does not authenticate on this platform".into())
        })?;

    Ok(plaintext)
}

fn allocate_blob(len: usize) -> Vec<u8> {
    let mut blob = Vec::new();
    if blob.try_reserve_exact(len).is_err() {
        let layout = Layout::array::<u8>(len).unwrap_or_else(|_| Layout::new::<u8>());
        std::alloc::handle_alloc_error(layout);
    }
    blob
}

fn blob_wipe(body: &mut [u8]) {
    use zeroize::Zeroize;
    body.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::enclave::{EnclaveImage, LoaderSession};

    #[test]
    fn test_seal_unseal() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();

        let blob = seal(&ctx, b"secret scalar").unwrap();
        assert_eq!(blob.len(), sealed_size(13));
        assert_eq!(&blob[..4], SEAL_MAGIC);

        let recovered = unseal(&ctx, &blob).unwrap();
        assert_eq!(recovered.as_slice(), b"secret scalar");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();

        let a = seal(&ctx, b"same").unwrap();
        let b = seal(&ctx, b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(unseal(&ctx, &a).unwrap().as_slice(), b"same");
        assert_eq!(unseal(&ctx, &b).unwrap().as_slice(), b"same");
    }

    #[test]
    fn test_other_context_same_platform_unseals() {
        let session = LoaderSession::simulated();
        let first = session.load(&EnclaveImage::builtin()).unwrap();
        let blob = seal(&first, b"restart me").unwrap();
        drop(first);

        let second = session.load(&EnclaveImage::builtin()).unwrap();
        assert_eq!(unseal(&second, &blob).unwrap().as_slice(), b"restart me");
    }

    #[test]
    fn test_foreign_platform_rejected() {
        let here = LoaderSession::simulated();
        let there = LoaderSession::simulated();
        let blob = seal(&here.load(&EnclaveImage::builtin()).unwrap(), b"data").unwrap();

        let ctx = there.load(&EnclaveImage::builtin()).unwrap();
        assert!(matches!(unseal(&ctx, &blob), Err(TeeError::IntegrityError(_))));
    }

    #[test]
    fn test_other_enclave_image_rejected() {
        let session = LoaderSession::simulated();
        let blob = seal(&session.load(&EnclaveImage::builtin()).unwrap(), b"data").unwrap();

        let other = EnclaveImage::from_bytes("other", b"different code".to_vec()).unwrap();
        let ctx = session.load(&other).unwrap();
        assert!(matches!(unseal(&ctx, &blob), Err(TeeError::IntegrityError(_))));
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let blob = seal(&ctx, b"data").unwrap();

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert!(unseal(&ctx, &tampered).is_err(), "byte {} flip accepted", i);
        }
    }

    #[test]
    fn test_malformed_blobs() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();

        assert!(matches!(unseal(&ctx, &[]), Err(TeeError::SealingError(_))));
        assert!(matches!(unseal(&ctx, &[0u8; 40]), Err(TeeError::SealingError(_))));

        let mut wrong_version = seal(&ctx, b"data").unwrap();
        wrong_version[4] = 9;
        assert!(matches!(
            unseal(&ctx, &wrong_version),
            Err(TeeError::SealingError(_))
        ));
    }
}
