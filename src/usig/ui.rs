//! Unique identifiers as consumers see them
//!
//! A USIG identity is `be(epoch) || SubjectPublicKeyInfo DER` and a UI
//! certificate is `be(epoch) || r || s`. Messages are stamped by their
//! SHA-256 digest.

use super::keys::SealedKeyBlob;
use super::service::{IdentifierService, InstanceHandle, UsigEnclave};
use super::signer::{self, Digest, SIGNATURE_SIZE};
use crate::error::{Result, UsigError, VerifyError};
use crate::tee::EnclaveImage;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

const EPOCH_SIZE: usize = 8;

/// A counter value with the certificate that proves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ui {
    pub counter: u64,
    #[serde(with = "hex_bytes")]
    pub cert: Vec<u8>,
}

pub fn message_digest(message: &[u8]) -> Digest {
    use sha2::Digest as _;
    Sha256::digest(message).into()
}

pub fn make_cert(epoch: u64, signature: &Signature) -> Vec<u8> {
    let mut cert = Vec::with_capacity(EPOCH_SIZE + SIGNATURE_SIZE);
    cert.extend_from_slice(&epoch.to_be_bytes());
    cert.extend_from_slice(&signature.to_bytes());
    cert
}

pub fn parse_cert(cert: &[u8]) -> std::result::Result<(u64, Signature), VerifyError> {
    if cert.len() < EPOCH_SIZE {
        return Err(VerifyError::InvalidCert("failed to extract epoch".into()));
    }
    let (epoch, signature) = cert.split_at(EPOCH_SIZE);
    let epoch = u64::from_be_bytes(epoch.try_into().unwrap_or_default());
    let signature =
        Signature::from_slice(signature).map_err(|e| VerifyError::InvalidCert(e.to_string()))?;
    Ok((epoch, signature))
}

pub fn make_id(epoch: u64, public_key: &VerifyingKey) -> Result<Vec<u8>> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| UsigError::Encoding(format!("failed to serialize public key: {}", e)))?;
    let mut id = Vec::with_capacity(EPOCH_SIZE + der.as_bytes().len());
    id.extend_from_slice(&epoch.to_be_bytes());
    id.extend_from_slice(der.as_bytes());
    Ok(id)
}

pub fn parse_id(usig_id: &[u8]) -> std::result::Result<(u64, VerifyingKey), VerifyError> {
    if usig_id.len() < EPOCH_SIZE {
        return Err(VerifyError::InvalidId("failed to extract epoch".into()));
    }
    let (epoch, der) = usig_id.split_at(EPOCH_SIZE);
    let epoch = u64::from_be_bytes(epoch.try_into().unwrap_or_default());
    let public_key = VerifyingKey::from_public_key_der(der)
        .map_err(|e| VerifyError::InvalidId(format!("failed to parse public key: {}", e)))?;
    Ok((epoch, public_key))
}

/// Stamp `message` through any USIG implementation
pub fn create_ui<E: UsigEnclave + ?Sized>(enclave: &E, message: &[u8]) -> Result<Ui> {
    // Epoch first: a failure here must not consume a counter value
    let epoch = enclave.epoch()?;
    let (counter, signature) = enclave.create_identifier(&message_digest(message))?;
    Ok(Ui {
        counter,
        cert: make_cert(epoch, &signature),
    })
}

pub fn usig_id<E: UsigEnclave + ?Sized>(enclave: &E) -> Result<Vec<u8>> {
    make_id(enclave.epoch()?, &enclave.public_key()?)
}

/// Verify `ui` was issued for `message` by the USIG identified by `usig_id`
pub fn verify_ui(message: &[u8], ui: &Ui, usig_id: &[u8]) -> std::result::Result<(), VerifyError> {
    let (epoch, public_key) = parse_id(usig_id)?;
    let (cert_epoch, signature) = parse_cert(&ui.cert)?;

    if cert_epoch != epoch {
        return Err(VerifyError::EpochMismatch {
            id: epoch,
            cert: cert_epoch,
        });
    }

    if signer::verify(&public_key, &message_digest(message), epoch, ui.counter, &signature) {
        Ok(())
    } else {
        Err(VerifyError::BadSignature)
    }
}

/// A USIG instance bound to its service; destroyed when dropped
pub struct Usig {
    service: Arc<IdentifierService>,
    handle: InstanceHandle,
}

impl Usig {
    pub fn new(
        service: Arc<IdentifierService>,
        image: &EnclaveImage,
        sealed_key: Option<&SealedKeyBlob>,
    ) -> Result<Self> {
        let handle = service.initialize(image, sealed_key)?;
        Ok(Self { service, handle })
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn create_ui(&self, message: &[u8]) -> Result<Ui> {
        create_ui(self, message)
    }

    pub fn id(&self) -> Result<Vec<u8>> {
        usig_id(self)
    }

    /// Re-seal this instance's key for storage by the caller
    pub fn sealed_key(&self) -> Result<SealedKeyBlob> {
        self.export_sealed_key()
    }

    pub fn verify_ui(
        &self,
        message: &[u8],
        ui: &Ui,
        usig_id: &[u8],
    ) -> std::result::Result<(), VerifyError> {
        verify_ui(message, ui, usig_id)
    }
}

impl UsigEnclave for Usig {
    fn create_identifier(&self, digest: &Digest) -> Result<(u64, Signature)> {
        self.service.create_identifier(self.handle, digest)
    }

    fn epoch(&self) -> Result<u64> {
        self.service.get_epoch(self.handle)
    }

    fn public_key(&self) -> Result<VerifyingKey> {
        self.service.get_public_key(self.handle)
    }

    fn export_sealed_key(&self) -> Result<SealedKeyBlob> {
        self.service.export_sealed_key(self.handle)
    }
}

impl Drop for Usig {
    fn drop(&mut self) {
        if let Err(e) = self.service.destroy(self.handle) {
            log::debug!("{} already gone on drop: {}", self.handle, e);
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
