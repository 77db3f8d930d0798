//! Prefetch progress reporting.
//!
//! The cache emits observable events as the window moves and workers
//! complete, so a user watching a slow remote session can see what is
//! being fetched and what was given up on. Events go to **stderr**: stdout
//! stays parseable (the `export` command prints JSON there).

use std::io::Write;

/// A single observable cache event.
#[derive(Clone, Debug)]
pub enum SiftEvent {
    /// The prefetch window was recentered to [lo, hi].
    WindowMoved { lo: usize, hi: usize },
    /// A worker finished decoding an image into the cache.
    FetchReady { identifier: String, bytes: usize },
    /// A fetch gave up after retries (or failed terminally).
    FetchFailed { identifier: String, reason: String },
    /// A resident entry left the window and released its payload.
    Evicted { identifier: String },
    /// A fetch completed for an identifier that had already left the
    /// window; the result was dropped instead of cached.
    Discarded { identifier: String },
}

/// Receives cache events. Implementations write to stderr (human or JSON).
pub trait SiftProgressReporter: Send + Sync {
    fn report(&self, event: SiftEvent);
}

/// Human-friendly one-liners: "prefetch ready IMG_0042.jpg (3.1 MB)".
pub struct StderrProgress;

impl SiftProgressReporter for StderrProgress {
    fn report(&self, event: SiftEvent) {
        let line = match &event {
            SiftEvent::WindowMoved { lo, hi } => {
                format!("prefetch window {lo}..={hi}\n")
            }
            SiftEvent::FetchReady { identifier, bytes } => {
                format!(
                    "prefetch ready {identifier} ({:.1} MB)\n",
                    *bytes as f64 / (1024.0 * 1024.0)
                )
            }
            SiftEvent::FetchFailed { identifier, reason } => {
                format!("prefetch failed {identifier}: {reason}\n")
            }
            SiftEvent::Evicted { identifier } => format!("prefetch evicted {identifier}\n"),
            SiftEvent::Discarded { identifier } => {
                format!("prefetch discarded stale {identifier}\n")
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SiftProgressReporter for JsonProgress {
    fn report(&self, event: SiftEvent) {
        let obj = match &event {
            SiftEvent::WindowMoved { lo, hi } => serde_json::json!({
                "event": "window", "lo": lo, "hi": hi
            }),
            SiftEvent::FetchReady { identifier, bytes } => serde_json::json!({
                "event": "ready", "identifier": identifier, "bytes": bytes
            }),
            SiftEvent::FetchFailed { identifier, reason } => serde_json::json!({
                "event": "failed", "identifier": identifier, "reason": reason
            }),
            SiftEvent::Evicted { identifier } => serde_json::json!({
                "event": "evicted", "identifier": identifier
            }),
            SiftEvent::Discarded { identifier } => serde_json::json!({
                "event": "discarded", "identifier": identifier
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SiftProgressReporter for NoProgress {
    fn report(&self, _event: SiftEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. The cache takes ownership.
    pub fn reporter(&self) -> Box<dyn SiftProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
