//! The background prefetch cache.
//!
//! Keeps a sliding window of images around the cursor resident in memory,
//! fetched ahead of need by a bounded pool of worker tasks. The cache is
//! owned by the session that created it; there is no process-global state.
//!
//! # Coordination
//!
//! All mutable state lives in one mutex-guarded [`State`]: the entry map,
//! the in-flight set, the priority queue, and the current window. Workers
//! claim tasks under the lock, fetch without it, and re-check the live
//! window when a fetch completes. A completion whose ordinal has left the
//! window is discarded rather than inserted, which bounds wasted work to
//! at most the pool size — `set_window` rebuilds the queue outright, so
//! superseded fetches that never started simply disappear.
//!
//! # Priorities
//!
//! Pending fetches are ordered by distance from the window center,
//! nearest first; at equal distance the forward neighbor wins because
//! forward navigation is the common case.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::error::SiftError;
use crate::models::{CacheStatus, ImageRef, PixelBuffer};
use crate::progress::{SiftEvent, SiftProgressReporter};
use crate::source::ImageSource;

/// A queued fetch, prioritized by proximity to the window center.
#[derive(Debug, PartialEq, Eq)]
struct FetchTask {
    distance: usize,
    backward: bool,
    ordinal: usize,
}

impl Ord for FetchTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the greatest element, so "greater" must mean
        // "fetch sooner": smaller distance, then forward before backward.
        other
            .distance
            .cmp(&self.distance)
            .then_with(|| other.backward.cmp(&self.backward))
            .then_with(|| other.ordinal.cmp(&self.ordinal))
    }
}

impl PartialOrd for FetchTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum EntryState {
    Pending,
    Ready(PixelBuffer),
    Failed(String),
}

struct Entry {
    state: EntryState,
    last_access: u64,
}

struct State {
    /// Inclusive window bounds. Starts empty (lo > hi) until the first
    /// `set_window`.
    window: (usize, usize),
    center: usize,
    entries: HashMap<usize, Entry>,
    in_flight: HashSet<usize>,
    queue: BinaryHeap<FetchTask>,
    resident_bytes: u64,
    access_clock: u64,
}

struct Shared {
    catalog: Arc<Vec<ImageRef>>,
    index: HashMap<String, usize>,
    source: Arc<dyn ImageSource>,
    reporter: Box<dyn SiftProgressReporter>,
    memory_ceiling: u64,
    retries: u32,
    backoff: Duration,
    state: Mutex<State>,
    notify: tokio::sync::Notify,
    shutdown: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct PrefetchCache {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PrefetchCache {
    /// Create the cache and spawn its fetch workers. Must be called from
    /// within a tokio runtime. No fetching happens until the first
    /// [`set_window`](Self::set_window).
    pub fn new(
        catalog: Arc<Vec<ImageRef>>,
        source: Arc<dyn ImageSource>,
        config: &CacheConfig,
        reporter: Box<dyn SiftProgressReporter>,
    ) -> Self {
        let index = catalog
            .iter()
            .map(|image| (image.identifier.clone(), image.ordinal))
            .collect();

        let shared = Arc::new(Shared {
            catalog,
            index,
            source,
            reporter,
            memory_ceiling: config.memory_ceiling_bytes(),
            retries: config.fetch_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            state: Mutex::new(State {
                window: (1, 0),
                center: 0,
                entries: HashMap::new(),
                in_flight: HashSet::new(),
                queue: BinaryHeap::new(),
                resident_bytes: 0,
                access_clock: 0,
            }),
            notify: tokio::sync::Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..config.fetch_workers.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                tokio::spawn(worker_loop(shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// Declare the desired window [center-radius, center+radius] clamped
    /// to catalog bounds. Entries outside the new window are evicted
    /// immediately; missing in-window entries are queued nearest-first.
    pub fn set_window(&self, center: usize, radius: usize) {
        let len = self.shared.catalog.len();
        if len == 0 {
            return;
        }
        let center = center.min(len - 1);
        let lo = center.saturating_sub(radius);
        let hi = (center + radius).min(len - 1);

        let mut queued_any = false;
        {
            let mut st = self.shared.state();
            st.window = (lo, hi);
            st.center = center;

            let outside: Vec<usize> = st
                .entries
                .keys()
                .filter(|&&ordinal| ordinal < lo || ordinal > hi)
                .copied()
                .collect();
            for ordinal in outside {
                if let Some(entry) = st.entries.remove(&ordinal) {
                    if let EntryState::Ready(px) = &entry.state {
                        st.resident_bytes -= px.byte_len() as u64;
                    }
                    self.shared.reporter.report(SiftEvent::Evicted {
                        identifier: self.shared.catalog[ordinal].identifier.clone(),
                    });
                }
            }

            // A later window supersedes earlier priorities wholesale.
            st.queue.clear();
            let clock = st.access_clock;
            for ordinal in lo..=hi {
                if st.in_flight.contains(&ordinal) {
                    // Still being fetched from a previous window; make it
                    // observable as Pending again but do not queue twice.
                    st.entries.entry(ordinal).or_insert(Entry {
                        state: EntryState::Pending,
                        last_access: clock,
                    });
                    continue;
                }
                if st.entries.contains_key(&ordinal) {
                    continue;
                }
                st.entries.insert(
                    ordinal,
                    Entry {
                        state: EntryState::Pending,
                        last_access: clock,
                    },
                );
                st.queue.push(FetchTask {
                    distance: ordinal.abs_diff(center),
                    backward: ordinal < center,
                    ordinal,
                });
                queued_any = true;
            }
        }

        self.shared
            .reporter
            .report(SiftEvent::WindowMoved { lo, hi });
        if queued_any {
            self.shared.notify.notify_waiters();
        }
    }

    /// Non-blocking status observation by identifier. Never triggers a
    /// fetch.
    pub fn get(&self, identifier: &str) -> CacheStatus {
        match self.shared.index.get(identifier) {
            Some(&ordinal) => self.status_at(ordinal),
            None => CacheStatus::Absent,
        }
    }

    /// Non-blocking status observation by catalog ordinal.
    pub fn status_at(&self, ordinal: usize) -> CacheStatus {
        let mut st = self.shared.state();
        st.access_clock += 1;
        let clock = st.access_clock;
        match st.entries.get_mut(&ordinal) {
            None => CacheStatus::Absent,
            Some(entry) => {
                entry.last_access = clock;
                match &entry.state {
                    EntryState::Pending => CacheStatus::Pending,
                    EntryState::Ready(px) => CacheStatus::Ready(px.clone()),
                    EntryState::Failed(reason) => CacheStatus::Failed(reason.clone()),
                }
            }
        }
    }

    /// Total decoded bytes currently resident.
    pub fn resident_bytes(&self) -> u64 {
        self.shared.state().resident_bytes
    }

    /// Stop the workers and wait for them to drain. In-flight fetches
    /// finish their current attempt and exit.
    pub async fn close(mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.notify.notify_waiters();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for PrefetchCache {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.notify.notify_waiters();
        for handle in self.workers.drain(..) {
            handle.abort();
        }
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }

        // Register for wakeups before checking the queue so a push that
        // lands between the check and the await is not missed.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match claim_next(&shared) {
            Some(ordinal) => {
                let image = shared.catalog[ordinal].clone();
                let result = fetch_with_retry(&shared, &image).await;
                finish_fetch(&shared, ordinal, result);
            }
            None => notified.await,
        }
    }
}

/// Pop tasks until one is still worth fetching, and claim it. Tasks whose
/// ordinal left the window, already completed, or is already in flight
/// are dropped on the floor.
fn claim_next(shared: &Shared) -> Option<usize> {
    let mut st = shared.state();
    while let Some(task) = st.queue.pop() {
        let (lo, hi) = st.window;
        if task.ordinal < lo || task.ordinal > hi {
            continue;
        }
        if st.in_flight.contains(&task.ordinal) {
            continue;
        }
        match st.entries.get(&task.ordinal) {
            Some(entry) if !matches!(entry.state, EntryState::Pending) => continue,
            _ => {}
        }
        st.in_flight.insert(task.ordinal);
        return Some(task.ordinal);
    }
    None
}

async fn fetch_with_retry(shared: &Shared, image: &ImageRef) -> Result<PixelBuffer, SiftError> {
    let mut attempt: u32 = 0;
    loop {
        match shared.source.fetch(image).await {
            Ok(px) => return Ok(px),
            Err(err) if err.is_transient() && attempt < shared.retries => {
                attempt += 1;
                tokio::time::sleep(shared.backoff * 2u32.saturating_pow(attempt - 1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Record a completed fetch. If the ordinal has left the window since the
/// fetch started, the result is discarded so the cache never grows beyond
/// the window from stale work.
fn finish_fetch(shared: &Shared, ordinal: usize, result: Result<PixelBuffer, SiftError>) {
    let identifier = shared.catalog[ordinal].identifier.clone();
    let mut st = shared.state();
    st.in_flight.remove(&ordinal);

    let (lo, hi) = st.window;
    if ordinal < lo || ordinal > hi {
        st.entries.remove(&ordinal);
        drop(st);
        shared.reporter.report(SiftEvent::Discarded { identifier });
        return;
    }

    match result {
        Ok(px) => {
            let bytes = px.byte_len();
            st.resident_bytes += bytes as u64;
            st.access_clock += 1;
            let clock = st.access_clock;
            st.entries.insert(
                ordinal,
                Entry {
                    state: EntryState::Ready(px),
                    last_access: clock,
                },
            );
            enforce_ceiling(shared, &mut st);
            drop(st);
            shared
                .reporter
                .report(SiftEvent::FetchReady { identifier, bytes });
        }
        Err(err) => {
            let reason = err.to_string();
            st.access_clock += 1;
            let clock = st.access_clock;
            st.entries.insert(
                ordinal,
                Entry {
                    state: EntryState::Failed(reason.clone()),
                    last_access: clock,
                },
            );
            drop(st);
            shared
                .reporter
                .report(SiftEvent::FetchFailed { identifier, reason });
        }
    }
}

/// Evict ready entries furthest from the center (least recently accessed
/// on ties) until resident bytes fit the ceiling again. The center image
/// itself is never evicted.
fn enforce_ceiling(shared: &Shared, st: &mut State) {
    while st.resident_bytes > shared.memory_ceiling {
        let center = st.center;
        let victim = st
            .entries
            .iter()
            .filter(|(ordinal, entry)| {
                **ordinal != center && matches!(entry.state, EntryState::Ready(_))
            })
            .max_by_key(|(ordinal, entry)| {
                (ordinal.abs_diff(center), std::cmp::Reverse(entry.last_access))
            })
            .map(|(ordinal, _)| *ordinal);

        let Some(ordinal) = victim else { break };
        if let Some(entry) = st.entries.remove(&ordinal) {
            if let EntryState::Ready(px) = &entry.state {
                st.resident_bytes -= px.byte_len() as u64;
            }
            shared.reporter.report(SiftEvent::Evicted {
                identifier: shared.catalog[ordinal].identifier.clone(),
            });
        }
    }
}
