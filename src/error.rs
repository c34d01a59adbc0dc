//! Error types for the edgequake-ingest library.
//!
//! Three layers of failure, each with its own type:
//!
//! * [`IngestError`] (**Fatal**): the pipeline cannot start or a submission
//!   cannot be accepted (bad configuration, missing provider, invalid URL,
//!   unreachable store). Returned as `Err(IngestError)` from the public API.
//!
//! * [`StageError`] (**Per-job**): one Stage Executor failed. The job state
//!   machine only ever looks at [`StageError::kind`] to decide between a retry
//!   and a terminal `FAILED`; the full error is kept on the job record.
//!
//! * [`ResourceError`] (**Best-effort**): a temp artifact could not be
//!   deleted. Logged and otherwise ignored; it never fails a job.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the edgequake-ingest library.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Submission errors ─────────────────────────────────────────────────
    /// The submitted string is not an absolute HTTP/HTTPS URL.
    #[error("Invalid source URL '{input}': {reason}")]
    InvalidUrl { input: String, reason: String },

    /// No job with this id exists in the job store.
    #[error("Unknown job {0}")]
    JobNotFound(Uuid),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed. Aborts worker startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Store errors ──────────────────────────────────────────────────────
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the dedup, job, document and vector stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record '{path}': {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A compare-and-swap precondition did not hold.
    #[error("Conflict on '{key}': {detail}")]
    Conflict { key: String, detail: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// How the retry policy treats a [`StageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout, rate-limit, store hiccup. Retried with backoff.
    Transient,
    /// The model answered, but not with the expected structure. Retried
    /// within the small malformed-output budget, then terminal.
    Malformed,
    /// Extraction output violated the document schema. Never retried.
    Validation,
    /// Retrying cannot help (HTTP 4xx, corrupt PDF, oversize body, auth).
    Permanent,
    /// Cancellation observed at a suspension point.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Malformed)
    }
}

/// The single typed error a Stage Executor may return.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    // ── Fetch ─────────────────────────────────────────────────────────────
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    #[error("Failed to download '{url}': {reason}")]
    Connection { url: String, reason: String },

    #[error("Download of '{url}' returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Download of '{url}' exceeds the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },

    #[error("Downloaded body is not a PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    // ── Render ────────────────────────────────────────────────────────────
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    #[error("PDF has no pages")]
    EmptyDocument,

    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Parse ─────────────────────────────────────────────────────────────
    #[error("VLM call timed out after {secs}s")]
    ModelTimeout { secs: u64 },

    #[error("VLM rate limit exceeded: {detail}")]
    RateLimited { detail: String },

    #[error("VLM unavailable: {detail}")]
    ModelUnavailable { detail: String },

    /// Authentication or request rejected by the provider.
    #[error("VLM rejected the request: {detail}")]
    ModelRejected { detail: String },

    #[error("VLM response is not the expected structure: {reason}")]
    MalformedOutput { reason: String, excerpt: String },

    // ── Validate ──────────────────────────────────────────────────────────
    #[error("Extraction failed validation: {0}")]
    Validation(#[from] ValidationError),

    // ── Persist ───────────────────────────────────────────────────────────
    #[error("Embedding failed: {detail}")]
    Embedding { detail: String },

    #[error("Embedding has {got} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, got: usize },

    #[error("Store write failed: {detail}")]
    Store { detail: String },

    /// The dedup claim was taken over by another run of the job.
    #[error("Dedup claim lost: {detail}")]
    ClaimLost { detail: String },

    // ── Shared ────────────────────────────────────────────────────────────
    #[error("Temp storage failed: {detail}")]
    TempStorage { detail: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Classify the error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::DownloadTimeout { .. }
            | StageError::Connection { .. }
            | StageError::ModelTimeout { .. }
            | StageError::RateLimited { .. }
            | StageError::ModelUnavailable { .. }
            | StageError::Embedding { .. }
            | StageError::Store { .. }
            | StageError::TempStorage { .. } => ErrorKind::Transient,
            // 408 and 429 are the only 4xx worth another try.
            StageError::HttpStatus { status, .. } => {
                if *status == 408 || *status == 429 || *status >= 500 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            StageError::MalformedOutput { .. } => ErrorKind::Malformed,
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Cancelled => ErrorKind::Cancelled,
            StageError::TooLarge { .. }
            | StageError::NotAPdf { .. }
            | StageError::CorruptPdf { .. }
            | StageError::EmptyDocument
            | StageError::RasterisationFailed { .. }
            | StageError::ModelRejected { .. }
            | StageError::EmbeddingDimension { .. }
            | StageError::ClaimLost { .. }
            | StageError::Internal(_) => ErrorKind::Permanent,
        }
    }
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => StageError::ClaimLost {
                detail: e.to_string(),
            },
            _ => StageError::Store {
                detail: e.to_string(),
            },
        }
    }
}

/// Schema violations found by the Validate stage. The first one wins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title is missing or empty")]
    MissingTitle,

    #[error("year is missing")]
    MissingYear,

    #[error("year {year} is outside {min}..={max}")]
    YearOutOfRange { year: i64, min: i32, max: i32 },

    #[error("issuing_authority is missing or empty")]
    MissingIssuingAuthority,

    #[error("chunks is missing or empty")]
    NoChunks,

    #[error("chunk {index} has empty text")]
    EmptyChunkText { index: usize },
}

/// A temp artifact could not be deleted.
#[derive(Debug, Error)]
#[error("Failed to delete temp artifact '{path}': {source}")]
pub struct ResourceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_4xx_is_permanent() {
        let e = StageError::HttpStatus {
            url: "https://gov.example/a.pdf".into(),
            status: 404,
        };
        assert_eq!(e.kind(), ErrorKind::Permanent);
        let e = StageError::HttpStatus {
            url: "https://gov.example/a.pdf".into(),
            status: 403,
        };
        assert_eq!(e.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn http_5xx_and_429_are_transient() {
        for status in [429, 500, 503] {
            let e = StageError::HttpStatus {
                url: "u".into(),
                status,
            };
            assert_eq!(e.kind(), ErrorKind::Transient, "status {status}");
        }
    }

    #[test]
    fn validation_is_not_retryable() {
        let e = StageError::from(ValidationError::MissingTitle);
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(!e.kind().is_retryable());
        assert!(e.to_string().contains("title"));
    }

    #[test]
    fn malformed_output_is_retryable() {
        let e = StageError::MalformedOutput {
            reason: "expected value at line 1".into(),
            excerpt: "Sorry, I".into(),
        };
        assert!(e.kind().is_retryable());
    }

    #[test]
    fn download_timeout_display() {
        let e = StageError::DownloadTimeout {
            url: "https://gov.example/decree-12.pdf".into(),
            secs: 40,
        };
        assert!(e.to_string().contains("40s"));
        assert_eq!(e.kind(), ErrorKind::Transient);
    }

    #[test]
    fn store_error_converts_to_transient_stage_error() {
        let e: StageError = StoreError::Backend("connection reset".into()).into();
        assert_eq!(e.kind(), ErrorKind::Transient);
    }

    #[test]
    fn lost_claim_is_permanent() {
        let e: StageError = StoreError::Conflict {
            key: "abc".into(),
            detail: "record is Completed".into(),
        }
        .into();
        assert!(matches!(e, StageError::ClaimLost { .. }));
        assert_eq!(e.kind(), ErrorKind::Permanent);
    }
}
