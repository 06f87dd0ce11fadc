//! Typed error taxonomy and the recovery ledger each error carries.
//!
//! Mirrors the shape of a typed API error enum (`thiserror`, `#[from]`
//! conversions for transport/serialization failures) but adds the
//! classification and recovery bookkeeping the scheduler and error
//! center need: a stable `ErrorKind`, a recoverability flag, and an
//! append-only ledger of recovery attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used to pick a recovery disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    Server,
    Dns,
    ConnectionReset,
    File,
    Validation,
    QuotaExceeded,
    Memory,
    Worker,
    Security,
    Abort,
    Environment,
    Unknown,
}

impl ErrorKind {
    /// Whether this kind is retryable at all, independent of remaining attempts.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::Security
                | ErrorKind::Abort
                | ErrorKind::File
                | ErrorKind::Environment
        )
    }

    /// Default retry ceiling for this kind; the scheduler's configured
    /// `retries` is used only when no per-kind override applies.
    pub fn default_retry_cap(&self) -> u32 {
        match self {
            ErrorKind::Network => 5,
            ErrorKind::Timeout | ErrorKind::ConnectionReset => 4,
            ErrorKind::Server => 4,
            ErrorKind::Dns => 2,
            ErrorKind::Worker => 1,
            ErrorKind::Memory => 3,
            ErrorKind::Unknown => 1,
            ErrorKind::QuotaExceeded
            | ErrorKind::Validation
            | ErrorKind::Security
            | ErrorKind::Abort
            | ErrorKind::File
            | ErrorKind::Environment => 0,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One recorded attempt at recovering an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub at: DateTime<Utc>,
    pub strategy: String,
    pub success: bool,
}

/// Chunk context attached to errors raised mid-transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub retry_count: u32,
}

/// The library's single error currency. Produced by `ErrorCenter::handle_error`
/// and carried through scheduler retry/recovery decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadError {
    pub error_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub is_recoverable: bool,
    pub retry_count: u32,
    pub ledger: Vec<RecoveryAttempt>,
    pub chunk_info: Option<ChunkInfo>,
    pub created_at: DateTime<Utc>,
}

impl UploadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let is_recoverable = kind.is_recoverable();
        Self {
            error_id: Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            is_recoverable,
            retry_count: 0,
            ledger: Vec::new(),
            chunk_info: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_chunk(mut self, index: usize, retry_count: u32) -> Self {
        self.chunk_info = Some(ChunkInfo { index, retry_count });
        self
    }

    pub fn record_attempt(&mut self, strategy: impl Into<String>, success: bool) {
        self.ledger.push(RecoveryAttempt {
            at: Utc::now(),
            strategy: strategy.into(),
            success,
        });
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.error_id, self.message)
    }
}

impl std::error::Error for UploadError {}

/// Transport-level failures surfaced by [`crate::network::NetworkAdapter`]
/// implementations, before they are classified into an [`UploadError`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upload was aborted")]
    Aborted,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the raw transport status looks retryable (5xx, 429, 408, 409).
    pub fn status_is_retryable(status: u16) -> bool {
        status == 429 || status == 408 || status == 409 || (500..600).contains(&status)
    }
}

/// Failures from [`crate::storage::StorageAdapter`] implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("no persisted state for fingerprint {0}")]
    NotFound(String),
}

/// Configuration validation failures raised eagerly in `Uploader::new`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("endpoint must not be empty")]
    EmptyEndpoint,

    #[error("minChunkSize ({min}) must not exceed maxChunkSize ({max})")]
    ChunkSizeRange { min: u64, max: u64 },

    #[error("concurrency ceiling must be at least 1")]
    ZeroConcurrency,
}

pub type Result<T> = std::result::Result<T, UploadError>;
