//! Error kinds surfaced by the identifier service

use crate::tee::TeeError;

pub type Result<T> = std::result::Result<T, UsigError>;

/// Errors returned across the service boundary
///
/// Memory exhaustion while building a sealed blob is not represented here;
/// it aborts the process (see [`crate::tee::sealing::seal`]).
#[derive(Debug, thiserror::Error)]
pub enum UsigError {
    #[error("Trusted context could not be established: {0}")]
    LoadFailure(String),

    #[error("Sealed key rejected: {0}")]
    UnsealFailure(String),

    #[error("Instance {0} is not initialized")]
    NotInitialized(u64),

    #[error("Unknown instance handle {0}")]
    InvalidHandle(u64),

    #[error("Signing failed: {0}")]
    SigningFailure(String),

    #[error("Counter exhausted; instance refuses further identifiers")]
    CounterExhausted,

    #[error("Sealing failed: {0}")]
    SealFailure(String),

    #[error("Identity encoding failed: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UsigError {
    /// Map a loader error onto the initialize failure kind
    pub(crate) fn load(err: TeeError) -> Self {
        UsigError::LoadFailure(err.to_string())
    }

    pub(crate) fn unseal(err: TeeError) -> Self {
        UsigError::UnsealFailure(err.to_string())
    }
}

/// Reasons a unique identifier does not verify
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Failed to parse USIG ID: {0}")]
    InvalidId(String),

    #[error("Failed to parse UI cert: {0}")]
    InvalidCert(String),

    #[error("Epoch value mismatch: id={id}, cert={cert}")]
    EpochMismatch { id: u64, cert: u64 },

    #[error("Signature verification failed")]
    BadSignature,
}
