//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns `Result<_, IrisRegError>`.
//! Per-module errors (`codec::CodecError`, `he::HeError`, ...) exist where a
//! caller benefits from matching on a narrower set of kinds, and convert into
//! `IrisRegError` via `#[from]` at the module boundary.

use std::sync::PoisonError;

use thiserror::Error;

/// The error kinds enumerated in the design: a request that cannot be safely
/// completed returns one of these rather than a misleading result.
#[derive(Debug, Error)]
pub enum IrisRegError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encryption key required but not configured")]
    MissingKey,

    #[error("AES-GCM authentication tag did not verify")]
    AuthTagFail,

    #[error("HE context initialization failed: {0}")]
    HeInit(String),

    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("enrollment blocked by existing identity {existing_identity_id}")]
    Duplicate { existing_identity_id: uuid::Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl<T> From<PoisonError<T>> for IrisRegError {
    fn from(_: PoisonError<T>) -> Self {
        Self::LockPoisoned
    }
}

impl From<crate::he::HeError> for IrisRegError {
    fn from(e: crate::he::HeError) -> Self {
        Self::HeInit(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IrisRegError>;
