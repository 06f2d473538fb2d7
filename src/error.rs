//! Typed errors for the playbook library
//!
//! The learning path recovers from everything it can; these variants exist
//! so callers can tell a retryable model hiccup apart from a store outage.

use crate::types::BulletId;
use thiserror::Error;

/// Errors surfaced by the playbook components
#[derive(Debug, Error)]
pub enum PlaybookError {
    /// Model call failed or returned output that does not match the
    /// reflection schema. Recovered locally with the best partial result.
    #[error("transient generation failure: {0}")]
    TransientGeneration(String),

    /// Exact byte-identical content already exists. Carries the existing id
    /// so callers can treat the insert as a no-op success.
    #[error("duplicate content, existing bullet {existing_id}")]
    DuplicateContent { existing_id: BulletId },

    /// Store state changed between scoring and apply; the guarded delta was
    /// rejected whole. Retried once by the refiner, then dropped and logged.
    #[error("delta application conflict: {0}")]
    DeltaConflict(String),

    /// The backing store could not be reached or the transaction failed.
    /// Hard failure; retrieval callers degrade to an empty context.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Embedding capability failed; retrieval quality degrades, learning
    /// proceeds without an embedding.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A bullet violated a structural invariant (empty content, bad section)
    #[error("invalid bullet: {0}")]
    InvalidBullet(String),
}

impl From<rusqlite::Error> for PlaybookError {
    fn from(err: rusqlite::Error) -> Self {
        PlaybookError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlaybookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_content_carries_existing_id() {
        let err = PlaybookError::DuplicateContent {
            existing_id: "abc123".to_string(),
        };
        assert!(err.to_string().contains("abc123"));
    }
}
