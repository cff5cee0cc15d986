//! Identifier Service — the façade callers reach across the trust boundary
//!
//! Instances are created by [`IdentifierService::initialize`] and addressed
//! by an opaque [`InstanceHandle`] until [`IdentifierService::destroy`].
//! Each instance exclusively owns its enclave context, key pair and
//! epoch/counter state.

use super::counter::EpochCounter;
use super::keys::{KeyMaterialManager, KeyPair, SealedKeyBlob};
use super::signer::{self, Digest};
use crate::error::{Result, UsigError};
use crate::tee::{EnclaveContext, EnclaveImage, EnclaveStatus, LoaderSession};
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// The operations a USIG exposes, whatever hosts it
pub trait UsigEnclave: Send + Sync {
    /// Assign the next counter value to `digest` and sign it
    fn create_identifier(&self, digest: &Digest) -> Result<(u64, Signature)>;

    fn epoch(&self) -> Result<u64>;

    fn public_key(&self) -> Result<VerifyingKey>;

    /// Seal the instance key for later reuse on this platform
    fn export_sealed_key(&self) -> Result<SealedKeyBlob>;
}

/// Opaque reference to a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "usig#{}", self.0)
    }
}

/// One initialized USIG: context, key pair and counter state
pub struct UsigInstance {
    keys: KeyPair,
    counter: EpochCounter,
    // Declared last so the context is released after the key is dropped.
    context: EnclaveContext,
}

impl UsigInstance {
    /// Load an enclave and bring it to the active state
    ///
    /// With no `sealed_key` a new key pair is generated; otherwise the blob
    /// is unsealed. On failure the loaded context is dropped, which releases
    /// it, and nothing else has been created.
    pub fn initialize(
        session: &LoaderSession,
        image: &EnclaveImage,
        sealed_key: Option<&SealedKeyBlob>,
    ) -> Result<Self> {
        let context = session.load(image).map_err(UsigError::load)?;

        let keys = {
            let manager = KeyMaterialManager::new(&context);
            match sealed_key {
                Some(blob) => manager.unseal(blob)?,
                None => manager.generate()?,
            }
        };
        let counter = EpochCounter::activate();

        log::info!(
            "USIG instance ready in context {} (epoch={:016x}, key={})",
            &context.id()[..8],
            counter.epoch(),
            if sealed_key.is_some() { "unsealed" } else { "generated" }
        );

        Ok(Self {
            keys,
            counter,
            context,
        })
    }

    pub fn status(&self) -> EnclaveStatus {
        self.context.status()
    }

    /// Highest counter value issued so far
    pub fn last_counter(&self) -> u64 {
        self.counter.last_issued()
    }
}

impl UsigEnclave for UsigInstance {
    fn create_identifier(&self, digest: &Digest) -> Result<(u64, Signature)> {
        let epoch = self.counter.epoch();
        self.counter
            .issue(|counter| signer::sign(&self.keys, digest, epoch, counter))
    }

    fn epoch(&self) -> Result<u64> {
        Ok(self.counter.epoch())
    }

    fn public_key(&self) -> Result<VerifyingKey> {
        Ok(*self.keys.public_key())
    }

    fn export_sealed_key(&self) -> Result<SealedKeyBlob> {
        KeyMaterialManager::new(&self.context).seal(&self.keys)
    }
}

/// Registry of instances created through one loader session
pub struct IdentifierService {
    session: LoaderSession,
    instances: RwLock<HashMap<u64, Arc<UsigInstance>>>,
    next_handle: AtomicU64,
}

impl IdentifierService {
    pub fn new(session: LoaderSession) -> Self {
        Self {
            session,
            instances: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn session(&self) -> &LoaderSession {
        &self.session
    }

    /// Create an instance, generating a key or unsealing `sealed_key`
    pub fn initialize(
        &self,
        image: &EnclaveImage,
        sealed_key: Option<&SealedKeyBlob>,
    ) -> Result<InstanceHandle> {
        let instance = UsigInstance::initialize(&self.session, image, sealed_key)?;

        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let raw = self.next_handle.fetch_add(1, Ordering::SeqCst);
        instances.insert(raw, Arc::new(instance));

        let handle = InstanceHandle(raw);
        log::info!("Initialized {}", handle);
        Ok(handle)
    }

    pub fn create_identifier(
        &self,
        handle: InstanceHandle,
        digest: &Digest,
    ) -> Result<(u64, Signature)> {
        self.instance(handle)?.create_identifier(digest)
    }

    pub fn get_epoch(&self, handle: InstanceHandle) -> Result<u64> {
        self.instance(handle)?.epoch()
    }

    pub fn get_public_key(&self, handle: InstanceHandle) -> Result<VerifyingKey> {
        self.instance(handle)?.public_key()
    }

    /// Seal the instance key; the caller owns the returned blob
    pub fn export_sealed_key(&self, handle: InstanceHandle) -> Result<SealedKeyBlob> {
        self.instance(handle)?.export_sealed_key()
    }

    pub fn status(&self, handle: InstanceHandle) -> Result<EnclaveStatus> {
        Ok(self.instance(handle)?.status())
    }

    /// Release the instance; later calls with `handle` fail
    ///
    /// Calls already in flight finish against the instance they looked up;
    /// its context is released when the last of them returns.
    pub fn destroy(&self, handle: InstanceHandle) -> Result<()> {
        let removed = {
            let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
            instances.remove(&handle.0)
        };
        match removed {
            Some(instance) => {
                log::info!(
                    "Destroyed {} after {} identifiers",
                    handle,
                    instance.last_counter()
                );
                Ok(())
            }
            None => Err(self.missing(handle)),
        }
    }

    pub fn active_instances(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn instance(&self, handle: InstanceHandle) -> Result<Arc<UsigInstance>> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        instances
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| self.missing(handle))
    }

    /// Handles this service issued earlier are reported as no longer
    /// initialized; anything else was never valid.
    fn missing(&self, handle: InstanceHandle) -> UsigError {
        if handle.0 != 0 && handle.0 < self.next_handle.load(Ordering::SeqCst) {
            UsigError::NotInitialized(handle.0)
        } else {
            UsigError::InvalidHandle(handle.0)
        }
    }
}
