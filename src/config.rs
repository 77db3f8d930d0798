use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::SourceKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    pub source: SourceConfig,
}

/// Prefetch cache sizing. The defaults keep roughly seventeen mid-size
/// JPEGs resident, well under the memory ceiling.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Window radius W: the cache keeps [cursor-W, cursor+W] resident.
    #[serde(default = "default_window_radius")]
    pub window_radius: usize,
    /// Fetch worker pool size F.
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    /// Total resident decoded bytes across all entries, in megabytes.
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u64,
    /// Per-image decoded-size ceiling, in megabytes. Larger images fail
    /// fetch with TooLarge instead of being cached partially.
    #[serde(default = "default_max_image_mb")]
    pub max_image_mb: u64,
    /// Retries for transient fetch failures before an entry is marked
    /// failed.
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    /// Base backoff between retries; doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window_radius: default_window_radius(),
            fetch_workers: default_fetch_workers(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
            max_image_mb: default_max_image_mb(),
            fetch_retries: default_fetch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl CacheConfig {
    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_ceiling_mb * 1024 * 1024
    }

    pub fn max_image_bytes(&self) -> u64 {
        self.max_image_mb * 1024 * 1024
    }
}

fn default_window_radius() -> usize {
    8
}
fn default_fetch_workers() -> usize {
    4
}
fn default_memory_ceiling_mb() -> u64 {
    512
}
fn default_max_image_mb() -> u64 {
    64
}
fn default_fetch_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Two adjacent images whose capture times differ by at most this many
    /// seconds belong to the same burst group.
    #[serde(default = "default_burst_gap_secs")]
    pub burst_gap_secs: f64,
    /// Minimum focus-score difference for mark-worse to act. Below it the
    /// pair is considered a tie and nothing is marked.
    #[serde(default)]
    pub focus_threshold: f64,
    /// Maximum undo stack depth. Unset means unbounded.
    #[serde(default)]
    pub undo_depth: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            burst_gap_secs: default_burst_gap_secs(),
            focus_threshold: 0.0,
            undo_depth: None,
        }
    }
}

fn default_burst_gap_secs() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./data/sift-ledger.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub local: Option<LocalSourceConfig>,
    pub remote: Option<RemoteSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Scan subdirectories too. The common burst workflow is one flat
    /// directory, so this is off by default.
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "*.jpg".to_string(),
        "*.jpeg".to_string(),
        "*.png".to_string(),
        "*.JPG".to_string(),
        "*.JPEG".to_string(),
        "*.PNG".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteSourceConfig {
    /// Base URL of the photo library API, e.g.
    /// `https://photoslibrary.example.com/v1`.
    pub endpoint: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Environment variable holding the bearer token. Token acquisition
    /// and refresh happen outside this process.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_page_size() -> u32 {
    100
}
fn default_token_env() -> String {
    "BURSTSIFT_API_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [source]
            kind = "local"

            [source.local]
            root = "/photos/burst"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.window_radius, 8);
        assert_eq!(config.cache.fetch_workers, 4);
        assert_eq!(config.session.burst_gap_secs, 2.0);
        assert_eq!(config.session.undo_depth, None);
        assert_eq!(config.ledger.path, default_ledger_path());
        let local = config.source.local.unwrap();
        assert!(!local.recursive);
        assert_eq!(local.include_globs.len(), 6);
    }

    #[test]
    fn remote_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            window_radius = 3
            fetch_workers = 2
            memory_ceiling_mb = 64

            [source]
            kind = "remote"

            [source.remote]
            endpoint = "https://photos.example.com/v1"
            page_size = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.source.kind, SourceKind::Remote);
        let remote = config.source.remote.unwrap();
        assert_eq!(remote.page_size, 25);
        assert_eq!(remote.token_env, "BURSTSIFT_API_TOKEN");
        assert_eq!(config.cache.memory_ceiling_bytes(), 64 * 1024 * 1024);
    }
}
