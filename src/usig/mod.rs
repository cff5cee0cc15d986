//! USIG — Unique Sequential Identifier Generator
//!
//! - **Keys**: generate, seal and unseal the P-256 signing key
//! - **Counter**: per-instance random epoch and gapless monotonic counter
//! - **Signer**: signatures over `digest || le(epoch) || le(counter)`
//! - **Service**: instance registry addressed by opaque handles
//! - **UI**: identities, certificates and the drop-to-destroy `Usig` wrapper

pub mod counter;
pub mod keys;
pub mod service;
pub mod signer;
pub mod ui;

pub use counter::{EpochCounter, INITIAL_COUNTER};
pub use keys::{KeyMaterialManager, KeyPair, SealedKeyBlob};
pub use service::{IdentifierService, InstanceHandle, UsigEnclave, UsigInstance};
pub use signer::{sign, verify, verify_bytes, Digest, DIGEST_SIZE, SIGNATURE_SIZE};
pub use ui::{
    create_ui, make_cert, make_id, message_digest, parse_cert, parse_id, usig_id, verify_ui, Ui,
    Usig,
};
