//! Core data types that flow between the source, cache, controller, and
//! ledger: catalog entries, decoded pixel payloads, and cache status
//! snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;

use crate::error::SiftError;

/// Which kind of source an image came from. Recorded on ledger entries so
/// the external deleter knows how to act on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Local => write!(f, "local"),
            SourceKind::Remote => write!(f, "remote"),
        }
    }
}

/// One entry of the catalog snapshot. Created once at session start and
/// immutable afterwards; the ordinal is its position in catalog order.
#[derive(Debug, Clone)]
pub struct ImageRef {
    /// Opaque identifier: a relative path for local sources, a media item
    /// id for remote ones.
    pub identifier: String,
    /// Position in the catalog, 0-based.
    pub ordinal: usize,
    /// Capture time when the source knows it (media metadata for remote
    /// items, file mtime for local ones). Drives burst grouping.
    pub captured_at: Option<DateTime<Utc>>,
    /// Browser-facing URL of the remote item, carried into the ledger so
    /// the external deleter can navigate to it.
    pub product_url: Option<String>,
    /// Direct download URL for remote items. Captured at list time; the
    /// catalog is never re-queried mid-session.
    pub download_url: Option<String>,
    pub kind: SourceKind,
}

/// A decoded image: tightly packed RGB8 rows plus the hash of the encoded
/// bytes it was produced from.
///
/// The content hash is the byte-identity witness required of sources:
/// fetching the same identifier twice within a session must yield the same
/// hash, and therefore the same pixels and the same focus score.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
    /// Hex SHA-256 of the encoded payload this buffer was decoded from.
    pub content_hash: String,
}

impl PixelBuffer {
    /// Decode encoded image bytes, enforcing `ceiling` on the decoded size.
    ///
    /// Dimensions are read from the header first so an oversized image is
    /// rejected with `TooLarge` before any pixel allocation happens.
    pub fn decode(identifier: &str, bytes: &[u8], ceiling: u64) -> Result<Self, SiftError> {
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| SiftError::Decode {
                identifier: identifier.to_string(),
                reason: e.to_string(),
            })?;

        let (width, height) = reader.into_dimensions().map_err(|e| SiftError::Decode {
            identifier: identifier.to_string(),
            reason: e.to_string(),
        })?;

        let decoded_bytes = width as u64 * height as u64 * 3;
        if decoded_bytes > ceiling {
            return Err(SiftError::TooLarge {
                identifier: identifier.to_string(),
                bytes: decoded_bytes,
                ceiling,
            });
        }

        let dynamic = image::load_from_memory(bytes).map_err(|e| SiftError::Decode {
            identifier: identifier.to_string(),
            reason: e.to_string(),
        })?;
        let rgb = dynamic.into_rgb8();

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let content_hash = hex::encode(hasher.finalize());

        Ok(PixelBuffer {
            width,
            height,
            data: Arc::new(rgb.into_raw()),
            content_hash,
        })
    }

    /// Resident size of the decoded payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Grayscale value of the pixel at (x, y) using integer Rec. 601
    /// luma weights. Used by the focus scorer.
    #[inline]
    pub fn luma(&self, x: u32, y: u32) -> i32 {
        let idx = ((y * self.width + x) * 3) as usize;
        let r = self.data[idx] as i32;
        let g = self.data[idx + 1] as i32;
        let b = self.data[idx + 2] as i32;
        (r * 299 + g * 587 + b * 114) / 1000
    }
}

/// Observable status of a cache entry. Payloads clone cheaply: pixel data
/// sits behind an `Arc`.
#[derive(Debug, Clone)]
pub enum CacheStatus {
    /// No entry: never requested, or evicted when the window moved away.
    Absent,
    /// Queued or in flight.
    Pending,
    Ready(PixelBuffer),
    Failed(String),
}

impl CacheStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, CacheStatus::Ready(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn decode_produces_stable_content_hash() {
        let bytes = encode_png(16, 8);
        let a = PixelBuffer::decode("img", &bytes, u64::MAX).unwrap();
        let b = PixelBuffer::decode("img", &bytes, u64::MAX).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.data, b.data);
        assert_eq!((a.width, a.height), (16, 8));
    }

    #[test]
    fn decode_rejects_oversized_before_allocating() {
        let bytes = encode_png(64, 64);
        let err = PixelBuffer::decode("big", &bytes, 100).unwrap_err();
        match err {
            SiftError::TooLarge { bytes, ceiling, .. } => {
                assert_eq!(bytes, 64 * 64 * 3);
                assert_eq!(ceiling, 100);
            }
            other => panic!("expected TooLarge, got {other}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = PixelBuffer::decode("junk", b"not an image", u64::MAX).unwrap_err();
        assert!(matches!(err, SiftError::Decode { .. }));
    }
}
