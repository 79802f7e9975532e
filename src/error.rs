// phantom-dspm-core/src/error.rs
// Error taxonomy for the scan pipeline, shared by every component.

use thiserror::Error;

/// Error kinds surfaced across the classifier, pipeline, collector and
/// orchestrator. Variants map one-to-one onto the error kinds enumerated
/// in the design's error handling section.
#[derive(Debug, Error)]
pub enum DspmError {
    /// Bad regex or missing credential field. Fatal for built-in rules,
    /// rejects only the offending custom rule otherwise.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential probe failed. Fatal to the job.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Credential valid but insufficient permissions. Fatal to the job.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Object read failed after exhausting retries. Not fatal; the object
    /// is skipped and the error is counted.
    #[error("transient I/O error reading {path}: {source}")]
    TransientIo { path: String, source: String },

    /// Classifier panicked or a regex engine overflowed. Recovered; the
    /// object is skipped.
    #[error("classifier error on {path}: {reason}")]
    Classifier { path: String, reason: String },

    /// The store rejected a write. Bulk-insert failures degrade to
    /// per-row; asset-upsert failures drop the asset's downstream rows.
    #[error("store error: {0}")]
    Store(String),

    /// Referenced row does not exist (e.g. a cancel for an unknown job).
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted an illegal job status transition.
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The operation was aborted by cancellation. Not a failure outcome;
    /// callers should map this to a terminal `cancelled` status, not an
    /// error response.
    #[error("operation cancelled")]
    Cancelled,
}

pub type DspmResult<T> = Result<T, DspmError>;
