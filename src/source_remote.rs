//! Remote photo-library source.
//!
//! Talks to a paginated media-items API: the catalog is assembled by
//! following `nextPageToken` continuations across
//! `GET {endpoint}/mediaItems` pages, and individual images are
//! downloaded through the `baseUrl` carried on each item. Videos and
//! other non-photo items are skipped.
//!
//! # Configuration
//!
//! ```toml
//! [source.remote]
//! endpoint = "https://photoslibrary.example.com/v1"
//! page_size = 100
//! # token_env = "BURSTSIFT_API_TOKEN"
//! ```
//!
//! # Authentication
//!
//! Requests carry a bearer token read from the environment variable named
//! by `token_env`. Acquiring and refreshing the token is the caller's
//! responsibility; a missing token fails session start with
//! `SourceUnavailable`.
//!
//! # Failure profile
//!
//! The API is rate limited: HTTP 429 and 5xx responses surface as
//! transient `FetchFailed`, which the cache workers retry with backoff.
//! HTTP 404 means the item was removed remotely and maps to `NotFound`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::config::RemoteSourceConfig;
use crate::error::SiftError;
use crate::models::{ImageRef, PixelBuffer, SourceKind};
use crate::source::{decode_off_thread, ImageSource};

pub struct RemoteSource {
    endpoint: String,
    page_size: u32,
    token: String,
    client: reqwest::Client,
    max_image_bytes: u64,
}

impl RemoteSource {
    pub fn new(config: &RemoteSourceConfig, max_image_bytes: u64) -> Result<Self, SiftError> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            SiftError::SourceUnavailable(format!(
                "environment variable {} is not set; export an API token before \
                 running in remote mode",
                config.token_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SiftError::SourceUnavailable(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            token,
            client,
            max_image_bytes,
        })
    }
}

#[async_trait]
impl ImageSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn describe(&self) -> String {
        format!("remote library {}", self.endpoint)
    }

    async fn list(&self) -> Result<Vec<ImageRef>, SiftError> {
        let url = format!("{}/mediaItems", self.endpoint);
        let mut items: Vec<MediaItem> = Vec::new();
        let mut page_token: Option<String> = None;

        // Restartable: every call walks the pages from the beginning, so
        // an aborted enumeration leaves no state behind.
        loop {
            let mut query: Vec<(&str, String)> =
                vec![("pageSize", self.page_size.to_string())];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await
                .map_err(|e| {
                    SiftError::SourceUnavailable(format!("cannot reach {}: {e}", self.endpoint))
                })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(SiftError::SourceUnavailable(format!(
                    "mediaItems list failed (HTTP {status}): {}",
                    body.chars().take(300).collect::<String>()
                )));
            }

            let page: MediaItemsPage = response
                .json()
                .await
                .map_err(|e| SiftError::SourceUnavailable(format!("bad list response: {e}")))?;

            items.extend(page.media_items.unwrap_or_default());

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(build_catalog(items))
    }

    async fn fetch(&self, image: &ImageRef) -> Result<PixelBuffer, SiftError> {
        let url = image
            .download_url
            .as_ref()
            .ok_or_else(|| SiftError::NotFound(image.identifier.clone()))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SiftError::FetchFailed {
                identifier: image.identifier.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SiftError::NotFound(image.identifier.clone()));
        }
        if !status.is_success() {
            // 429 and 5xx are the rate-limit/transient cases; auth lapses
            // land here too and exhaust their retries.
            return Err(SiftError::FetchFailed {
                identifier: image.identifier.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SiftError::FetchFailed {
                identifier: image.identifier.clone(),
                reason: e.to_string(),
            })?
            .to_vec();

        decode_off_thread(image.identifier.clone(), bytes, self.max_image_bytes).await
    }
}

// ============ Wire format ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemsPage {
    media_items: Option<Vec<MediaItem>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItem {
    id: String,
    #[allow(dead_code)]
    filename: Option<String>,
    base_url: Option<String>,
    product_url: Option<String>,
    media_metadata: Option<MediaMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaMetadata {
    creation_time: Option<String>,
    /// Present only for still photos; videos carry a `video` block instead.
    photo: Option<serde_json::Value>,
}

/// Turn the raw page items into the catalog snapshot: photos only, in API
/// order, with download URLs pinned to the original-resolution variant.
fn build_catalog(items: Vec<MediaItem>) -> Vec<ImageRef> {
    items
        .into_iter()
        .filter(|item| {
            item.media_metadata
                .as_ref()
                .is_some_and(|m| m.photo.is_some())
        })
        .enumerate()
        .map(|(ordinal, item)| {
            let captured_at = item
                .media_metadata
                .as_ref()
                .and_then(|m| m.creation_time.as_deref())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));

            ImageRef {
                identifier: item.id,
                ordinal,
                captured_at,
                product_url: item.product_url,
                // "=d" requests the original bytes rather than a resized
                // preview, keeping repeated fetches byte-identical.
                download_url: item.base_url.map(|u| format!("{u}=d")),
                kind: SourceKind::Remote,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_parses_and_videos_are_skipped() {
        let body = r#"{
            "mediaItems": [
                {
                    "id": "photo-1",
                    "filename": "IMG_0001.JPG",
                    "baseUrl": "https://cdn.example.com/p1",
                    "productUrl": "https://photos.example.com/item/p1",
                    "mediaMetadata": {
                        "creationTime": "2024-06-01T10:15:30Z",
                        "photo": {}
                    }
                },
                {
                    "id": "video-1",
                    "filename": "MOV_0002.MP4",
                    "baseUrl": "https://cdn.example.com/v1",
                    "mediaMetadata": { "video": {} }
                }
            ],
            "nextPageToken": "token-2"
        }"#;

        let page: MediaItemsPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("token-2"));

        let catalog = build_catalog(page.media_items.unwrap());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].identifier, "photo-1");
        assert_eq!(catalog[0].ordinal, 0);
        assert_eq!(
            catalog[0].download_url.as_deref(),
            Some("https://cdn.example.com/p1=d")
        );
        assert!(catalog[0].captured_at.is_some());
        assert_eq!(catalog[0].kind, SourceKind::Remote);
    }

    #[test]
    fn empty_page_yields_empty_catalog() {
        let page: MediaItemsPage = serde_json::from_str("{}").unwrap();
        assert!(page.media_items.is_none());
        assert!(build_catalog(Vec::new()).is_empty());
    }
}
