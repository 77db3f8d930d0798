//! Error taxonomy for the sift engine.
//!
//! Per-image failures (`NotFound`, `FetchFailed`, `TooLarge`, `Decode`) are
//! recorded on the affected cache entry and the session continues. The only
//! session-fatal error is `SourceUnavailable` at catalog build time.
//! `LedgerWriteFailed` is fatal for the specific mark operation that hit it:
//! the controller leaves the mark set untouched and surfaces the error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiftError {
    /// The catalog could not be enumerated (auth failure, unreadable
    /// directory, unreachable endpoint). Aborts session start.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The identifier no longer exists at the source.
    #[error("image not found: {0}")]
    NotFound(String),

    /// Transient I/O or network failure. Workers retry with backoff
    /// before giving up and marking the entry failed.
    #[error("fetch failed for {identifier}: {reason}")]
    FetchFailed { identifier: String, reason: String },

    /// Decoding the image would exceed the configured per-image memory
    /// ceiling. The image is never partially cached.
    #[error("image {identifier} too large: {bytes} bytes exceeds ceiling of {ceiling}")]
    TooLarge {
        identifier: String,
        bytes: u64,
        ceiling: u64,
    },

    /// The payload was fetched but is not a decodable image.
    #[error("cannot decode {identifier}: {reason}")]
    Decode { identifier: String, reason: String },

    /// The durable ledger write did not complete. The mark that triggered
    /// it must not be considered applied.
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),
}

impl SiftError {
    /// Whether a fetch worker should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SiftError::FetchFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;
