use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::LocalSourceConfig;
use crate::error::SiftError;
use crate::models::{ImageRef, PixelBuffer, SourceKind};
use crate::source::{decode_off_thread, ImageSource};

/// Image source over a local directory.
///
/// The catalog is a deterministic lexicographic scan of the root filtered
/// by include/exclude globs; capture time is approximated by file mtime.
#[derive(Debug)]
pub struct LocalSource {
    root: PathBuf,
    include_set: GlobSet,
    exclude_set: GlobSet,
    recursive: bool,
    follow_symlinks: bool,
    max_image_bytes: u64,
}

impl LocalSource {
    pub fn new(config: &LocalSourceConfig, max_image_bytes: u64) -> Result<Self, SiftError> {
        if !config.root.is_dir() {
            return Err(SiftError::SourceUnavailable(format!(
                "image directory does not exist: {}",
                config.root.display()
            )));
        }

        Ok(Self {
            root: config.root.clone(),
            include_set: build_globset(&config.include_globs)?,
            exclude_set: build_globset(&config.exclude_globs)?,
            recursive: config.recursive,
            follow_symlinks: config.follow_symlinks,
            max_image_bytes,
        })
    }

    fn full_path(&self, identifier: &str) -> PathBuf {
        self.root.join(identifier)
    }
}

#[async_trait]
impl ImageSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    async fn list(&self) -> Result<Vec<ImageRef>, SiftError> {
        let mut walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut found: Vec<(String, Option<DateTime<Utc>>)> = Vec::new();

        for entry in walker {
            let entry = entry.map_err(|e| {
                SiftError::SourceUnavailable(format!(
                    "cannot scan {}: {e}",
                    self.root.display()
                ))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude_set.is_match(&rel_str) {
                continue;
            }
            if !self.include_set.is_match(&rel_str) {
                continue;
            }

            let captured_at = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            found.push((rel_str, captured_at));
        }

        // Sort for deterministic catalog order
        found.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(found
            .into_iter()
            .enumerate()
            .map(|(ordinal, (identifier, captured_at))| ImageRef {
                identifier,
                ordinal,
                captured_at,
                product_url: None,
                download_url: None,
                kind: SourceKind::Local,
            })
            .collect())
    }

    async fn fetch(&self, image: &ImageRef) -> Result<PixelBuffer, SiftError> {
        let path = self.full_path(&image.identifier);

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SiftError::NotFound(image.identifier.clone())
            } else {
                SiftError::FetchFailed {
                    identifier: image.identifier.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        decode_off_thread(image.identifier.clone(), bytes, self.max_image_bytes).await
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SiftError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SiftError::SourceUnavailable(format!("bad glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SiftError::SourceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Cursor;

    fn write_png(path: &std::path::Path) {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(path, out).unwrap();
    }

    fn local_config(root: &std::path::Path) -> LocalSourceConfig {
        let config: Config = toml::from_str(&format!(
            r#"
            [source]
            kind = "local"

            [source.local]
            root = "{}"
            "#,
            root.display()
        ))
        .unwrap();
        config.source.local.unwrap()
    }

    #[tokio::test]
    async fn list_is_sorted_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(&tmp.path().join("b.png"));
        write_png(&tmp.path().join("a.png"));
        std::fs::write(tmp.path().join("notes.txt"), "skip me").unwrap();

        let source = LocalSource::new(&local_config(tmp.path()), u64::MAX).unwrap();
        let catalog = source.list().await.unwrap();

        let names: Vec<&str> = catalog.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(catalog[0].ordinal, 0);
        assert_eq!(catalog[1].ordinal, 1);
        assert!(catalog[0].captured_at.is_some());
    }

    #[tokio::test]
    async fn missing_root_is_source_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = local_config(tmp.path());
        config.root = tmp.path().join("nope");
        let err = LocalSource::new(&config, u64::MAX).unwrap_err();
        assert!(matches!(err, SiftError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn fetch_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(&tmp.path().join("a.png"));

        let source = LocalSource::new(&local_config(tmp.path()), u64::MAX).unwrap();
        let mut image = source.list().await.unwrap().remove(0);
        image.identifier = "gone.png".to_string();

        let err = source.fetch(&image).await.unwrap_err();
        assert!(matches!(err, SiftError::NotFound(_)));
    }

    #[tokio::test]
    async fn repeated_fetch_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(&tmp.path().join("a.png"));

        let source = LocalSource::new(&local_config(tmp.path()), u64::MAX).unwrap();
        let image = source.list().await.unwrap().remove(0);

        let first = source.fetch(&image).await.unwrap();
        let second = source.fetch(&image).await.unwrap();
        assert_eq!(first.content_hash, second.content_hash);
    }
}
