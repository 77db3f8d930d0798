//! The image source abstraction.
//!
//! A source produces the ordered catalog snapshot at session start and
//! decoded pixel data on demand. Two implementations exist —
//! [`LocalSource`](crate::source_local::LocalSource) over a directory and
//! [`RemoteSource`](crate::source_remote::RemoteSource) over a paginated
//! photo-library API — and everything above them is polymorphic over this
//! trait.
//!
//! # Contract
//!
//! - `list` returns the full catalog in a stable order, or
//!   `SourceUnavailable` when it cannot be enumerated at all.
//! - `fetch` of the same identifier returns byte-identical pixel data for
//!   the lifetime of a session (witnessed by the payload content hash).
//! - `fetch` failures are per-image: `NotFound`, `FetchFailed` (transient,
//!   retried by the cache), or `TooLarge`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::error::SiftError;
use crate::models::{ImageRef, PixelBuffer, SourceKind};
use crate::source_local::LocalSource;
use crate::source_remote::RemoteSource;

#[async_trait]
pub trait ImageSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// One-line description for startup output and diagnostics.
    fn describe(&self) -> String;

    /// Enumerate the catalog. Called once per session; the result is a
    /// snapshot and is never re-queried mid-session.
    async fn list(&self) -> Result<Vec<ImageRef>, SiftError>;

    /// Fetch and decode one image. Called from cache workers only.
    async fn fetch(&self, image: &ImageRef) -> Result<PixelBuffer, SiftError>;
}

/// Build the configured source. Exactly one of the two variants is
/// selected by `[source] kind`; a missing matching table is a
/// configuration error surfaced as `SourceUnavailable`.
pub fn source_from_config(config: &Config) -> Result<Arc<dyn ImageSource>, SiftError> {
    let max_image_bytes = config.cache.max_image_bytes();

    match config.source.kind {
        SourceKind::Local => {
            let local = config.source.local.as_ref().ok_or_else(|| {
                SiftError::SourceUnavailable(
                    "source kind is 'local' but [source.local] is missing".to_string(),
                )
            })?;
            Ok(Arc::new(LocalSource::new(local, max_image_bytes)?))
        }
        SourceKind::Remote => {
            let remote = config.source.remote.as_ref().ok_or_else(|| {
                SiftError::SourceUnavailable(
                    "source kind is 'remote' but [source.remote] is missing".to_string(),
                )
            })?;
            Ok(Arc::new(RemoteSource::new(remote, max_image_bytes)?))
        }
    }
}

/// Decode encoded bytes off the async runtime. Decode is CPU-bound and a
/// large JPEG takes long enough to stall other workers' I/O completions.
pub(crate) async fn decode_off_thread(
    identifier: String,
    bytes: Vec<u8>,
    ceiling: u64,
) -> Result<PixelBuffer, SiftError> {
    let id = identifier.clone();
    tokio::task::spawn_blocking(move || PixelBuffer::decode(&id, &bytes, ceiling))
        .await
        .map_err(|e| SiftError::FetchFailed {
            identifier,
            reason: format!("decode task aborted: {e}"),
        })?
}
