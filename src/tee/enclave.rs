//! TEE Enclave — loader session, trust root and enclave contexts
//!
//! Models the pieces of a trusted execution environment the USIG needs:
//! - **Trust root**: the per-machine secret that sealing keys derive from
//! - **Loader session**: explicit replacement for a process-wide launch token
//! - **Enclave context**: one loaded enclave instance, released on drop
//!
//! Intel SGX and ARM TrustZone are probed for; without the device the
//! session either falls back to the simulated backend or refuses to load.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroizing;

/// Size of the platform root secret and of derived sealing keys
pub const ROOT_SECRET_SIZE: usize = 32;

/// Code identity used when no enclave image file is supplied
const BUILTIN_IMAGE: &[u8] = b"usig-enclave-v1:create_ui,get_epoch,get_pub_key,seal_key";

/// Supported TEE backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeeBackend {
    /// Intel SGX enclave
    IntelSgx,
    /// ARM TrustZone
    ArmTrustZone,
    /// Software-simulated (always available, NOT hardware-secured)
    Simulated,
}

impl TeeBackend {
    pub fn name(&self) -> &str {
        match self {
            TeeBackend::IntelSgx => "Intel SGX",
            TeeBackend::ArmTrustZone => "ARM TrustZone",
            TeeBackend::Simulated => "Simulated (software)",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, TeeBackend::Simulated)
    }

    /// Whether the device node for this backend is present
    pub fn probe(&self) -> bool {
        match self {
            TeeBackend::IntelSgx => probe_sgx(),
            TeeBackend::ArmTrustZone => probe_trustzone(),
            TeeBackend::Simulated => true,
        }
    }
}

/// TEE enclave security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Hardware-backed (SGX/TrustZone available)
    Hardware,
    /// Software simulation (no hardware TEE, development only)
    Software,
}

/// Measurement of enclave identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveMeasurement {
    /// MRENCLAVE — hash of enclave code
    pub mrenclave: String,
    /// MRSIGNER — hash of the signing authority
    pub mrsigner: String,
    /// Product ID
    pub product_id: u16,
    /// Security version number
    pub isv_svn: u16,
}

impl EnclaveMeasurement {
    /// Compute a measurement over the enclave code (simulated via SHA256)
    pub fn compute(code: &[u8], signer_key: &str, product_id: u16, svn: u16) -> Self {
        let mrenclave = {
            let mut h = Sha256::new();
            h.update(code);
            h.update(b"mrenclave-v1");
            hex::encode(h.finalize())
        };
        let mrsigner = {
            let mut h = Sha256::new();
            h.update(signer_key.as_bytes());
            h.update(b"mrsigner-v1");
            hex::encode(h.finalize())
        };
        Self {
            mrenclave,
            mrsigner,
            product_id,
            isv_svn: svn,
        }
    }

    /// Verify measurement matches expected values
    pub fn matches(&self, expected: &EnclaveMeasurement) -> bool {
        self.mrenclave == expected.mrenclave
            && self.mrsigner == expected.mrsigner
            && self.isv_svn >= expected.isv_svn
    }
}

/// Reference to the enclave code that a loader session instantiates
#[derive(Debug, Clone)]
pub struct EnclaveImage {
    name: String,
    code: Vec<u8>,
}

impl EnclaveImage {
    /// The image compiled into this crate
    pub fn builtin() -> Self {
        Self {
            name: "builtin".to_string(),
            code: BUILTIN_IMAGE.to_vec(),
        }
    }

    /// Read an enclave image from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TeeError> {
        let path = path.as_ref();
        let code = std::fs::read(path)
            .map_err(|e| TeeError::EnclaveError(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(&path.display().to_string(), code)
    }

    pub fn from_bytes(name: &str, code: Vec<u8>) -> Result<Self, TeeError> {
        if code.is_empty() {
            return Err(TeeError::EnclaveError(format!("enclave image '{}' is empty", name)));
        }
        Ok(Self {
            name: name.to_string(),
            code,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn measurement(&self) -> EnclaveMeasurement {
        EnclaveMeasurement::compute(&self.code, "usig-signer-key-v1", 1, 1)
    }
}

/// The physical host's root of trust
///
/// On real hardware this secret is fused into the CPU and never visible;
/// here it is a random 256-bit value, optionally kept in a file so that a
/// restarted process counts as "the same machine".
pub struct TrustRoot {
    secret: Zeroizing<[u8; ROOT_SECRET_SIZE]>,
}

impl TrustRoot {
    /// A fresh, previously unseen platform
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; ROOT_SECRET_SIZE]);
        OsRng.fill_bytes(&mut secret[..]);
        Self { secret }
    }

    pub fn from_secret(secret: [u8; ROOT_SECRET_SIZE]) -> Self {
        Self {
            secret: Zeroizing::new(secret),
        }
    }

    /// Load the platform secret from `path`, creating it on first use
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, TeeError> {
        let path = path.as_ref();
        if path.exists() {
            let encoded = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                TeeError::BackendUnavailable(format!("Read platform secret: {}", e))
            })?);
            let bytes = Zeroizing::new(
                hex::decode(encoded.trim())
                    .map_err(|e| TeeError::BackendUnavailable(format!("Platform secret: {}", e)))?,
            );
            let secret: [u8; ROOT_SECRET_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                TeeError::BackendUnavailable(format!(
                    "Platform secret must be {} bytes, got {}",
                    ROOT_SECRET_SIZE,
                    bytes.len()
                ))
            })?;
            return Ok(Self::from_secret(secret));
        }

        let root = Self::generate();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| TeeError::BackendUnavailable(format!("Create dir: {}", e)))?;
        }
        write_secret_file(path, Zeroizing::new(hex::encode(&root.secret[..])).as_bytes())
            .map_err(|e| TeeError::BackendUnavailable(format!("Write platform secret: {}", e)))?;
        log::info!("Provisioned new platform root at {}", path.display());
        Ok(root)
    }

    /// Public fingerprint of this platform, safe to log
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(&self.secret[..]);
        h.update(b"usig-platform-fingerprint-v1");
        hex::encode(&h.finalize()[..8])
    }

    /// Sealing key bound to this platform and to one enclave identity
    fn derive_sealing_key(
        &self,
        measurement: &EnclaveMeasurement,
    ) -> Zeroizing<[u8; ROOT_SECRET_SIZE]> {
        let mut h = Sha256::new();
        h.update(&self.secret[..]);
        h.update(measurement.mrenclave.as_bytes());
        h.update(measurement.mrsigner.as_bytes());
        h.update(b"usig-sealing-key-v1");
        let mut key = Zeroizing::new([0u8; ROOT_SECRET_SIZE]);
        key.copy_from_slice(&h.finalize());
        key
    }
}

impl std::fmt::Debug for TrustRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrustRoot({})", self.fingerprint())
    }
}

/// Launch token cached per enclave identity for the lifetime of a session
#[derive(Debug, Clone)]
struct LaunchToken {
    issued_at: DateTime<Utc>,
    launches: u64,
}

/// A loader session: owns the launch-token cache and counts live contexts
///
/// Everything that used to be process-global lives here and is passed
/// explicitly to whoever loads enclaves.
pub struct LoaderSession {
    backend: TeeBackend,
    security_level: SecurityLevel,
    trust_root: Arc<TrustRoot>,
    tokens: Mutex<HashMap<String, LaunchToken>>,
    live_contexts: Arc<AtomicUsize>,
}

impl LoaderSession {
    /// Open a session on `backend`
    ///
    /// A hardware backend whose device is missing falls back to simulation,
    /// unless `require_hardware` is set, in which case the session fails.
    pub fn new(
        backend: TeeBackend,
        trust_root: TrustRoot,
        require_hardware: bool,
    ) -> Result<Self, TeeError> {
        let security_level = if !backend.is_hardware() {
            SecurityLevel::Software
        } else if backend.probe() {
            SecurityLevel::Hardware
        } else if require_hardware {
            return Err(TeeError::BackendUnavailable(format!(
                "{} device not present",
                backend.name()
            )));
        } else {
            log::warn!("{} not available, falling back to simulated enclave", backend.name());
            SecurityLevel::Software
        };

        log::info!(
            "Loader session opened: backend={}, security={:?}, platform={}",
            backend.name(),
            security_level,
            trust_root.fingerprint()
        );

        Ok(Self {
            backend,
            security_level,
            trust_root: Arc::new(trust_root),
            tokens: Mutex::new(HashMap::new()),
            live_contexts: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Simulated session on a brand-new platform
    pub fn simulated() -> Self {
        Self {
            backend: TeeBackend::Simulated,
            security_level: SecurityLevel::Software,
            trust_root: Arc::new(TrustRoot::generate()),
            tokens: Mutex::new(HashMap::new()),
            live_contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Instantiate `image` as a new enclave context
    pub fn load(&self, image: &EnclaveImage) -> Result<EnclaveContext, TeeError> {
        let measurement = image.measurement();

        {
            let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
            let token = tokens
                .entry(measurement.mrenclave.clone())
                .or_insert_with(|| {
                    log::debug!("Issued launch token for {}", &measurement.mrenclave[..16]);
                    LaunchToken {
                        issued_at: Utc::now(),
                        launches: 0,
                    }
                });
            token.launches += 1;
        }

        let sealing_key = self.trust_root.derive_sealing_key(&measurement);
        let id = uuid::Uuid::new_v4().to_string();
        self.live_contexts.fetch_add(1, Ordering::SeqCst);

        log::debug!(
            "Enclave context {} loaded from image '{}' (mrenclave={}...)",
            &id[..8],
            image.name(),
            &measurement.mrenclave[..16]
        );

        Ok(EnclaveContext {
            id,
            backend: self.backend,
            security_level: self.security_level,
            measurement,
            sealing_key,
            created_at: Utc::now(),
            live: Arc::clone(&self.live_contexts),
        })
    }

    pub fn backend(&self) -> TeeBackend {
        self.backend
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn trust_root(&self) -> &TrustRoot {
        &self.trust_root
    }

    /// Number of contexts loaded by this session that are not yet released
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    /// How many times `image` has been launched in this session
    pub fn launches(&self, image: &EnclaveImage) -> u64 {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(&image.measurement().mrenclave)
            .map(|t| t.launches)
            .unwrap_or(0)
    }

    /// When the launch token for `image` was first issued
    pub fn token_issued_at(&self, image: &EnclaveImage) -> Option<DateTime<Utc>> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.get(&image.measurement().mrenclave).map(|t| t.issued_at)
    }
}

/// One loaded enclave; its resources are released when it is dropped
pub struct EnclaveContext {
    id: String,
    backend: TeeBackend,
    security_level: SecurityLevel,
    measurement: EnclaveMeasurement,
    sealing_key: Zeroizing<[u8; ROOT_SECRET_SIZE]>,
    created_at: DateTime<Utc>,
    live: Arc<AtomicUsize>,
}

impl EnclaveContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn measurement(&self) -> &EnclaveMeasurement {
        &self.measurement
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn status(&self) -> EnclaveStatus {
        EnclaveStatus {
            enclave_id: self.id.clone(),
            backend: self.backend,
            security_level: self.security_level,
            created_at: self.created_at,
            mrenclave: self.measurement.mrenclave.clone(),
        }
    }

    pub(crate) fn sealing_key(&self) -> &[u8; ROOT_SECRET_SIZE] {
        &self.sealing_key
    }
}

impl Drop for EnclaveContext {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Enclave context {} released", &self.id[..8]);
    }
}

impl std::fmt::Debug for EnclaveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveContext")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("mrenclave", &self.measurement.mrenclave)
            .finish_non_exhaustive()
    }
}

/// Status of a running enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveStatus {
    pub enclave_id: String,
    pub backend: TeeBackend,
    pub security_level: SecurityLevel,
    pub created_at: DateTime<Utc>,
    pub mrenclave: String,
}

fn probe_sgx() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        Path::new("/dev/sgx_enclave").exists() || Path::new("/dev/isgx").exists()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

fn probe_trustzone() -> bool {
    #[cfg(target_arch = "aarch64")]
    {
        Path::new("/dev/tee0").exists() || Path::new("/dev/opteearmtz00").exists()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        false
    }
}

/// TEE-related errors
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("TEE backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Sealing error: {0}")]
    SealingError(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),

    #[error("Enclave error: {0}")]
    EnclaveError(String),
}

/// Write `contents` readable by the owner only
fn write_secret_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
