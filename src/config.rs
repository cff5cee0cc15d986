//! Configuration for hosting a USIG
//!
//! Loaded from JSON; a missing file means defaults. The sealed-key path is
//! used by callers (the CLI) that persist the exported blob themselves.

use crate::error::{Result, UsigError};
use crate::tee::{EnclaveImage, LoaderSession, TeeBackend, TrustRoot};
use crate::usig::SealedKeyBlob;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsigConfig {
    /// TEE backend to load enclaves on
    pub backend: TeeBackend,
    /// Fail instead of falling back to simulation when hardware is missing
    pub require_hardware: bool,
    /// Enclave image file; the built-in image when unset
    pub enclave_image: Option<PathBuf>,
    /// Simulated platform root secret (hex)
    pub platform_secret_path: PathBuf,
    /// Where the caller keeps the sealed key blob
    pub sealed_key_path: PathBuf,
}

impl Default for UsigConfig {
    fn default() -> Self {
        Self {
            backend: TeeBackend::Simulated,
            require_hardware: false,
            enclave_image: None,
            platform_secret_path: PathBuf::from("usig-data/platform.key"),
            sealed_key_path: PathBuf::from("usig-data/sealed-key.bin"),
        }
    }
}

impl UsigConfig {
    /// Load configuration from `path`, falling back to defaults if absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| UsigError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| UsigError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Open a loader session on the configured backend and platform
    pub fn open_session(&self) -> Result<LoaderSession> {
        let root = TrustRoot::load_or_create(&self.platform_secret_path).map_err(UsigError::load)?;
        LoaderSession::new(self.backend, root, self.require_hardware).map_err(UsigError::load)
    }

    pub fn enclave_image(&self) -> Result<EnclaveImage> {
        match &self.enclave_image {
            Some(path) => EnclaveImage::from_path(path).map_err(UsigError::load),
            None => Ok(EnclaveImage::builtin()),
        }
    }

    /// Previously stored sealed key, if any
    pub fn read_sealed_key(&self) -> Result<Option<SealedKeyBlob>> {
        if !self.sealed_key_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.sealed_key_path)?;
        Ok(Some(SealedKeyBlob::from_bytes(bytes)))
    }

    pub fn write_sealed_key(&self, blob: &SealedKeyBlob) -> Result<()> {
        if let Some(parent) = self.sealed_key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.sealed_key_path, blob.as_bytes())?;
        info!(
            "Stored sealed key ({} bytes) at {}",
            blob.len(),
            self.sealed_key_path.display()
        );
        Ok(())
    }
}
