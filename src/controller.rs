//! The sift session state machine.
//!
//! `SiftController` is the only component the front end talks to. It owns
//! the cursor, the mark set, and the undo history; it drives the prefetch
//! window on every cursor move and appends to the deletion ledger on
//! every mark. Navigation never blocks on image fetches — if the current
//! image is not resident yet, `display_state` says so and the caller
//! shows a loading indicator. The single synchronous wait in this module
//! is the durable ledger append inside mark/unmark.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use crate::cache::PrefetchCache;
use crate::config::Config;
use crate::error::SiftError;
use crate::ledger::{DeletionLedger, LedgerExport};
use crate::models::{CacheStatus, ImageRef};
use crate::progress::SiftProgressReporter;
use crate::score::{focus_score, FocusScore};
use crate::source::ImageSource;

/// Machine state. `Exhausted` is re-entrant: `Back` returns to browsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiftState {
    /// Cursor points at a valid image outside any burst group.
    Browsing,
    /// The cursor sits inside a burst group of two or more adjacent
    /// shots, pinned for side-by-side comparison.
    Comparing,
    /// The cursor has passed the last image.
    Exhausted,
}

/// Commands accepted from the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Advance,
    Back,
    Mark,
    Unmark,
    /// Mark the lower-scoring image of the compared pair.
    MarkWorse,
    Undo,
    JumpTo(usize),
}

/// Readiness of the image at the cursor, as the front end sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Fetch pending (or not yet scheduled); show a loading indicator.
    NotReady,
    Ready,
    /// The fetch failed permanently; the slot is shown as unavailable.
    Unavailable(String),
}

/// Snapshot returned to the front end for rendering.
#[derive(Debug, Clone)]
pub struct DisplayState {
    pub cursor: usize,
    pub total: usize,
    pub state: SiftState,
    /// None once the session is exhausted.
    pub identifier: Option<String>,
    pub readiness: Readiness,
    /// Memoized focus score, present once the image has been scored.
    pub focus: Option<f64>,
    pub marked: bool,
}

/// A reversible delta on the undo stack.
#[derive(Debug)]
enum UndoEntry {
    CursorMove { from: usize },
    MarkToggle { ordinal: usize, set: bool },
}

pub struct SiftController {
    catalog: Arc<Vec<ImageRef>>,
    cache: PrefetchCache,
    ledger: DeletionLedger,
    cursor: usize,
    marks: HashSet<String>,
    undo_stack: VecDeque<UndoEntry>,
    undo_depth: Option<usize>,
    scores: HashMap<String, FocusScore>,
    state: SiftState,
    radius: usize,
    burst_gap: chrono::Duration,
    focus_threshold: f64,
}

impl SiftController {
    /// Build a session: snapshot the catalog, open the ledger, resume any
    /// surviving marks from it, and start prefetching around image 0.
    ///
    /// Fails with `SourceUnavailable` if the catalog cannot be
    /// enumerated, or `LedgerWriteFailed` if the ledger cannot be opened.
    pub async fn new(
        source: Arc<dyn ImageSource>,
        config: &Config,
        reporter: Box<dyn SiftProgressReporter>,
    ) -> Result<Self, SiftError> {
        let catalog = Arc::new(source.list().await?);
        let ledger = DeletionLedger::open(&config.ledger.path).await?;

        // The ledger is the durable source of truth for marks: a session
        // resumed after a crash starts with the surviving mark set,
        // restricted to identifiers that are still in the catalog.
        let known: HashSet<&str> = catalog.iter().map(|i| i.identifier.as_str()).collect();
        let marks: HashSet<String> = ledger
            .active_marks()
            .await?
            .into_iter()
            .filter(|id| known.contains(id.as_str()))
            .collect();

        let cache = PrefetchCache::new(
            Arc::clone(&catalog),
            source,
            &config.cache,
            reporter,
        );

        let mut controller = Self {
            catalog,
            cache,
            ledger,
            cursor: 0,
            marks,
            undo_stack: VecDeque::new(),
            undo_depth: config.session.undo_depth,
            scores: HashMap::new(),
            state: SiftState::Browsing,
            radius: config.cache.window_radius,
            burst_gap: chrono::Duration::milliseconds(
                (config.session.burst_gap_secs * 1000.0) as i64,
            ),
            focus_threshold: config.session.focus_threshold,
        };
        controller.refresh_state();
        controller.recenter();
        Ok(controller)
    }

    /// Dispatch a front-end command.
    pub async fn apply(&mut self, command: Command) -> Result<(), SiftError> {
        match command {
            Command::Advance => {
                self.advance();
                Ok(())
            }
            Command::Back => {
                self.back();
                Ok(())
            }
            Command::Mark => self.mark().await,
            Command::Unmark => self.unmark().await,
            Command::MarkWorse => self.mark_worse().await.map(|_| ()),
            Command::Undo => self.undo().await.map(|_| ()),
            Command::JumpTo(index) => {
                self.jump_to(index);
                Ok(())
            }
        }
    }

    /// Move the cursor forward. Past the last image the session becomes
    /// `Exhausted`; further advances are no-ops.
    pub fn advance(&mut self) {
        if self.cursor >= self.catalog.len() {
            return;
        }
        self.push_undo(UndoEntry::CursorMove { from: self.cursor });
        self.cursor += 1;
        self.refresh_state();
        self.recenter();
    }

    /// Move the cursor back. No-op at the start of the catalog.
    pub fn back(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.push_undo(UndoEntry::CursorMove { from: self.cursor });
        self.cursor -= 1;
        self.refresh_state();
        self.recenter();
    }

    /// Reposition the cursor directly (thumbnail-grid selection). This is
    /// the expensive-but-rare path: most of the cache may be evicted and
    /// refetched around the new center.
    pub fn jump_to(&mut self, index: usize) {
        if self.catalog.is_empty() {
            return;
        }
        let index = index.min(self.catalog.len() - 1);
        if index == self.cursor {
            return;
        }
        self.push_undo(UndoEntry::CursorMove { from: self.cursor });
        self.cursor = index;
        self.refresh_state();
        self.recenter();
    }

    /// Mark the current image as a deletion candidate. The ledger append
    /// must complete before the mark is applied; marking an already
    /// marked image is a no-op.
    pub async fn mark(&mut self) -> Result<(), SiftError> {
        match self.current_ordinal() {
            Some(ordinal) => self.mark_at(ordinal).await,
            None => Ok(()),
        }
    }

    /// Remove the current image from the mark set, appending a
    /// compensating tombstone. Unmarking an unmarked image is a no-op.
    pub async fn unmark(&mut self) -> Result<(), SiftError> {
        match self.current_ordinal() {
            Some(ordinal) => self.unmark_at(ordinal).await,
            None => Ok(()),
        }
    }

    /// In a burst group, mark whichever of the compared pair scores
    /// lower. Refuses to choose (returns `Ok(None)`) when either image is
    /// not ready or unscorable, or when the score difference is within
    /// the configured threshold.
    pub async fn mark_worse(&mut self) -> Result<Option<usize>, SiftError> {
        let group = self.compare_group();
        if group.len() < 2 {
            return Ok(None);
        }

        // Compare the cursor with its forward neighbor inside the group,
        // falling back to the backward neighbor at the group's end.
        let (a, b) = if self.cursor + 1 < group.end {
            (self.cursor, self.cursor + 1)
        } else {
            (self.cursor - 1, self.cursor)
        };

        let (Some(score_a), Some(score_b)) = (self.score_at(a), self.score_at(b)) else {
            return Ok(None);
        };

        let difference = score_a - score_b;
        if difference.abs() < self.focus_threshold {
            return Ok(None);
        }

        let worse = if difference > 0.0 { b } else { a };
        self.mark_at(worse).await?;
        Ok(Some(worse))
    }

    /// Pop the most recent delta and reverse it. Returns whether anything
    /// was undone. Undoing a mark appends the compensating ledger record,
    /// so the durable history and the in-memory set stay consistent.
    pub async fn undo(&mut self) -> Result<bool, SiftError> {
        let Some(entry) = self.undo_stack.pop_back() else {
            return Ok(false);
        };

        match entry {
            UndoEntry::CursorMove { from } => {
                self.cursor = from;
                self.refresh_state();
                self.recenter();
            }
            UndoEntry::MarkToggle { ordinal, set } => {
                let image = self.catalog[ordinal].clone();
                let result = if set {
                    self.ledger.record_unmark(&image).await
                } else {
                    self.ledger.record_mark(&image).await
                };
                if let Err(err) = result {
                    // The delta was not reversed; keep it undoable.
                    self.undo_stack
                        .push_back(UndoEntry::MarkToggle { ordinal, set });
                    return Err(err);
                }
                if set {
                    self.marks.remove(&image.identifier);
                } else {
                    self.marks.insert(image.identifier);
                }
            }
        }
        Ok(true)
    }

    /// Current observable state for rendering. Computes and memoizes the
    /// focus score the first time the current image is seen ready.
    pub fn display_state(&mut self) -> DisplayState {
        let total = self.catalog.len();
        let Some(ordinal) = self.current_ordinal() else {
            return DisplayState {
                cursor: self.cursor,
                total,
                state: self.state,
                identifier: None,
                readiness: Readiness::NotReady,
                focus: None,
                marked: false,
            };
        };

        let identifier = self.catalog[ordinal].identifier.clone();
        let readiness = match self.cache.status_at(ordinal) {
            CacheStatus::Ready(_) => Readiness::Ready,
            CacheStatus::Failed(reason) => Readiness::Unavailable(reason),
            CacheStatus::Pending | CacheStatus::Absent => Readiness::NotReady,
        };

        DisplayState {
            cursor: self.cursor,
            total,
            state: self.state,
            focus: self.score_at(ordinal),
            marked: self.marks.contains(&identifier),
            identifier: Some(identifier),
            readiness,
        }
    }

    /// The maximal run of burst-grouped images containing the cursor.
    /// A single-image "group" means no comparison is active.
    pub fn compare_group(&self) -> Range<usize> {
        let Some(ordinal) = self.current_ordinal() else {
            return self.cursor..self.cursor;
        };

        let mut start = ordinal;
        while start > 0 && self.same_burst(start - 1, start) {
            start -= 1;
        }
        let mut end = ordinal + 1;
        while end < self.catalog.len() && self.same_burst(end - 1, end) {
            end += 1;
        }
        start..end
    }

    /// Memoized focus score for a catalog ordinal, computed once the
    /// image is resident. Unscorable images memoize as "no opinion".
    pub fn score_at(&mut self, ordinal: usize) -> Option<f64> {
        let identifier = self.catalog.get(ordinal)?.identifier.clone();
        if let Some(score) = self.scores.get(&identifier) {
            return score.value();
        }
        match self.cache.status_at(ordinal) {
            CacheStatus::Ready(px) => {
                let score = focus_score(&px);
                self.scores.insert(identifier, score);
                score.value()
            }
            _ => None,
        }
    }

    /// Cache status for any catalog ordinal, payload included when
    /// ready. The side-by-side front end reads the compare group's
    /// images through this; it never triggers a fetch.
    pub fn image_at(&self, ordinal: usize) -> CacheStatus {
        self.cache.status_at(ordinal)
    }

    pub fn state(&self) -> SiftState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn catalog(&self) -> &[ImageRef] {
        &self.catalog
    }

    pub fn is_marked(&self, identifier: &str) -> bool {
        self.marks.contains(identifier)
    }

    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }

    /// Export the ledger artifact for the external deletion executor.
    pub async fn export_marks(&self) -> Result<Vec<LedgerExport>, SiftError> {
        self.ledger.export().await
    }

    /// Shut down the prefetch workers and close the ledger.
    pub async fn close(self) {
        self.cache.close().await;
        self.ledger.close().await;
    }

    // ============ internals ============

    fn current_ordinal(&self) -> Option<usize> {
        (self.cursor < self.catalog.len()).then_some(self.cursor)
    }

    async fn mark_at(&mut self, ordinal: usize) -> Result<(), SiftError> {
        let image = self.catalog[ordinal].clone();
        if self.marks.contains(&image.identifier) {
            return Ok(());
        }
        // Durability before the in-memory mark: if this fails the mark
        // never happened.
        self.ledger.record_mark(&image).await?;
        self.marks.insert(image.identifier);
        self.push_undo(UndoEntry::MarkToggle { ordinal, set: true });
        Ok(())
    }

    async fn unmark_at(&mut self, ordinal: usize) -> Result<(), SiftError> {
        let image = self.catalog[ordinal].clone();
        if !self.marks.contains(&image.identifier) {
            return Ok(());
        }
        self.ledger.record_unmark(&image).await?;
        self.marks.remove(&image.identifier);
        self.push_undo(UndoEntry::MarkToggle {
            ordinal,
            set: false,
        });
        Ok(())
    }

    fn push_undo(&mut self, entry: UndoEntry) {
        if let Some(depth) = self.undo_depth {
            while self.undo_stack.len() >= depth {
                self.undo_stack.pop_front();
            }
        }
        self.undo_stack.push_back(entry);
    }

    fn refresh_state(&mut self) {
        self.state = if self.current_ordinal().is_none() {
            SiftState::Exhausted
        } else if self.compare_group().len() >= 2 {
            SiftState::Comparing
        } else {
            SiftState::Browsing
        };
    }

    fn recenter(&self) {
        if self.catalog.is_empty() {
            return;
        }
        let center = self.cursor.min(self.catalog.len() - 1);
        self.cache.set_window(center, self.radius);
    }

    /// Burst heuristic: capture times within the configured gap when both
    /// are known, otherwise consecutive trailing numbers on an identical
    /// file stem (IMG_0041.jpg / IMG_0042.jpg).
    fn same_burst(&self, a: usize, b: usize) -> bool {
        let (left, right) = (&self.catalog[a], &self.catalog[b]);

        if let (Some(ta), Some(tb)) = (left.captured_at, right.captured_at) {
            return (tb - ta).abs() <= self.burst_gap;
        }

        match (
            split_numbered_stem(&left.identifier),
            split_numbered_stem(&right.identifier),
        ) {
            (Some((prefix_a, na)), Some((prefix_b, nb))) => {
                prefix_a == prefix_b && nb == na + 1
            }
            _ => false,
        }
    }
}

/// Split `"IMG_0042.jpg"` into `("IMG_", 42)`. Returns None when the stem
/// has no trailing digits.
fn split_numbered_stem(identifier: &str) -> Option<(&str, u64)> {
    let stem = identifier
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(identifier);
    let digits_start = stem
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let digits = &stem[digits_start..];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok().map(|n| (&stem[..digits_start], n))
}
