use thiserror::Error;

use crate::certify::CertificationReport;
use crate::content::ContentStoreError;
use crate::types::LockKey;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("certification failed: {} file(s) rejected", .0.iter().filter(|r| r.is_failed()).count())]
    CertificationFailed(Vec<CertificationReport>),

    #[error("resource locked: {key} is held by {holder}")]
    ResourceLocked { key: LockKey, holder: String },

    #[error("broken lock: {0}")]
    BrokenLock(String),

    #[error("name collision: {0}")]
    NameCollision(String),

    #[error("derivation failed: {0}")]
    DerivationFailed(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("content store: {0}")]
    Content(#[from] ContentStoreError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RegistryError {
    /// Stable machine code, `{AREA}:{CODE}`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "REGISTRY:NOT_FOUND",
            Self::CertificationFailed(_) => "SUBMIT:CERTIFICATION_FAILED",
            Self::ResourceLocked { .. } => "LOCK:RESOURCE_LOCKED",
            Self::BrokenLock(_) => "LOCK:BROKEN",
            Self::NameCollision(_) => "NAMING:COLLISION",
            Self::DerivationFailed(_) => "DERIVE:FAILED",
            Self::DeliveryFailed(_) => "DELIVER:FAILED",
            Self::SubmissionFailed(_) => "SUBMIT:FAILED",
            Self::Conflict(_) => "REGISTRY:CONFLICT",
            Self::InvalidInput(_) => "REGISTRY:INVALID_INPUT",
            Self::Content(_) => "CONTENT:STORE",
            Self::Io(_) => "INFRA:IO",
            Self::Internal(_) => "INFRA:INTERNAL",
        }
    }

    /// Whether the caller may retry the same request later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceLocked { .. })
    }
}
