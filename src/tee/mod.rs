//! TEE (Trusted Execution Environment) — the trust boundary under the USIG
//!
//! - **Enclave**: backends, measurements, trust root, loader session, contexts
//! - **Sealing**: platform-bound authenticated encryption of key material

pub mod enclave;
pub mod sealing;

pub use enclave::{
    EnclaveContext, EnclaveImage, EnclaveMeasurement, EnclaveStatus, LoaderSession,
    SecurityLevel, TeeBackend, TeeError, TrustRoot,
};
