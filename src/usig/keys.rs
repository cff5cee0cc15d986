//! Key Material Manager — generate, seal and unseal the USIG signing key

use crate::error::{Result, UsigError};
use crate::tee::{sealing, EnclaveContext, TeeError};
use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Size of the P-256 private scalar
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of a compressed SEC1 public key
pub const PUBLIC_KEY_SIZE: usize = 33;

const SEALED_PAYLOAD_SIZE: usize = PRIVATE_KEY_SIZE + PUBLIC_KEY_SIZE;
const MAX_GENERATE_ATTEMPTS: usize = 8;

/// A NIST P-256 signing key pair, immutable once created
pub struct KeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl KeyPair {
    fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = VerifyingKey::from(&signing);
        Self { signing, verifying }
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "KeyPair(public={}, private=[REDACTED])",
            hex::encode(self.verifying.to_encoded_point(true).as_bytes())
        )
    }
}

/// Opaque, platform-bound encoding of a [`KeyPair`]
///
/// The caller owns the blob once exported; its format is private to the
/// sealing primitive and only meaningful on the platform that produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyBlob(Vec<u8>);

impl SealedKeyBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SealedKeyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedKeyBlob({} bytes)", self.0.len())
    }
}

/// Key lifecycle operations performed inside one enclave context
pub struct KeyMaterialManager<'a> {
    context: &'a EnclaveContext,
}

impl<'a> KeyMaterialManager<'a> {
    pub fn new(context: &'a EnclaveContext) -> Self {
        Self { context }
    }

    /// Fresh key pair from the enclave's entropy source
    pub fn generate(&self) -> Result<KeyPair> {
        let mut seed = Zeroizing::new([0u8; PRIVATE_KEY_SIZE]);
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            OsRng
                .try_fill_bytes(&mut seed[..])
                .map_err(|e| UsigError::LoadFailure(format!("Entropy source: {}", e)))?;
            // Rejects zero and out-of-range scalars; retry with new entropy.
            if let Ok(signing) = SigningKey::from_slice(&seed[..]) {
                return Ok(KeyPair::from_signing_key(signing));
            }
        }
        Err(UsigError::LoadFailure(
            "Entropy source produced no valid P-256 scalar".into(),
        ))
    }

    /// Bind `pair` to this platform and enclave identity
    pub fn seal(&self, pair: &KeyPair) -> Result<SealedKeyBlob> {
        let mut payload = Zeroizing::new([0u8; SEALED_PAYLOAD_SIZE]);
        payload[..PRIVATE_KEY_SIZE].copy_from_slice(&pair.signing.to_bytes());
        payload[PRIVATE_KEY_SIZE..]
            .copy_from_slice(pair.verifying.to_encoded_point(true).as_bytes());

        let blob = sealing::seal(self.context, &payload[..])
            .map_err(|e| UsigError::SealFailure(e.to_string()))?;
        Ok(SealedKeyBlob(blob))
    }

    /// Recover a key pair sealed on this platform
    ///
    /// Any defect in the blob yields [`UsigError::UnsealFailure`]; a partly
    /// decoded key is never returned.
    pub fn unseal(&self, blob: &SealedKeyBlob) -> Result<KeyPair> {
        let payload = sealing::unseal(self.context, &blob.0).map_err(|e| {
            log::warn!("Rejected sealed key ({} bytes): {}", blob.len(), e);
            UsigError::unseal(e)
        })?;

        if payload.len() != SEALED_PAYLOAD_SIZE {
            return Err(UsigError::unseal(TeeError::SealingError(format!(
                "Unexpected payload size {}",
                payload.len()
            ))));
        }

        let signing = SigningKey::from_slice(&payload[..PRIVATE_KEY_SIZE])
            .map_err(|e| UsigError::UnsealFailure(format!("Invalid private key: {}", e)))?;
        let pair = KeyPair::from_signing_key(signing);

        if pair.verifying.to_encoded_point(true).as_bytes() != &payload[PRIVATE_KEY_SIZE..] {
            return Err(UsigError::UnsealFailure(
                "Public key does not match private key".into(),
            ));
        }
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::{EnclaveImage, LoaderSession};
    use crate::usig::signer;

    #[test]
    fn test_generate_distinct_keys() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let manager = KeyMaterialManager::new(&ctx);

        let a = manager.generate().unwrap();
        let b = manager.generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_seal_unseal_roundtrip_preserves_signing() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let manager = KeyMaterialManager::new(&ctx);

        let original = manager.generate().unwrap();
        let blob = manager.seal(&original).unwrap();
        let restored = manager.unseal(&blob).unwrap();

        assert_eq!(original.public_key(), restored.public_key());

        let digest = [0x42u8; 32];
        let sig = signer::sign(&restored, &digest, 7, 1).unwrap();
        assert!(signer::verify(original.public_key(), &digest, 7, 1, &sig));
    }

    #[test]
    fn test_two_seals_differ_but_both_unseal() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let manager = KeyMaterialManager::new(&ctx);

        let pair = manager.generate().unwrap();
        let a = manager.seal(&pair).unwrap();
        let b = manager.seal(&pair).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.unseal(&a).unwrap().public_key(), pair.public_key());
        assert_eq!(manager.unseal(&b).unwrap().public_key(), pair.public_key());
    }

    #[test]
    fn test_unseal_on_foreign_platform_fails() {
        let here = LoaderSession::simulated();
        let there = LoaderSession::simulated();
        let ctx_here = here.load(&EnclaveImage::builtin()).unwrap();
        let ctx_there = there.load(&EnclaveImage::builtin()).unwrap();

        let pair = KeyMaterialManager::new(&ctx_here).generate().unwrap();
        let blob = KeyMaterialManager::new(&ctx_here).seal(&pair).unwrap();

        let result = KeyMaterialManager::new(&ctx_there).unseal(&blob);
        assert!(matches!(result, Err(UsigError::UnsealFailure(_))));
    }

    #[test]
    fn test_unseal_garbage_fails() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let manager = KeyMaterialManager::new(&ctx);

        for bytes in [Vec::new(), vec![0u8; 16], vec![0xffu8; 200]] {
            let result = manager.unseal(&SealedKeyBlob::from_bytes(bytes));
            assert!(matches!(result, Err(UsigError::UnsealFailure(_))));
        }
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let session = LoaderSession::simulated();
        let ctx = session.load(&EnclaveImage::builtin()).unwrap();
        let pair = KeyMaterialManager::new(&ctx).generate().unwrap();
        let private_hex = hex::encode(pair.signing_key().to_bytes());

        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&private_hex));
    }
}
