//! USIG — Unique Sequential Identifier Generator
//!
//! A trusted service that stamps message digests with strictly increasing,
//! signed `(epoch, counter)` pairs so that a BFT protocol can rely on a
//! non-equivocating ordering primitive even on a compromised host.

pub mod config;
pub mod error;
pub mod tee;
pub mod usig;

pub use config::UsigConfig;
pub use error::{Result, UsigError, VerifyError};
pub use tee::{EnclaveImage, LoaderSession, TeeBackend, TrustRoot};
pub use usig::{IdentifierService, InstanceHandle, SealedKeyBlob, Ui, Usig, UsigEnclave};
