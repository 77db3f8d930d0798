//! # burstsift
//!
//! A sift engine for burst photographs: compare near-duplicate shots and
//! decide which to keep, without UI lag.
//!
//! The engine is a navigation/decision state machine backed by a
//! bounded-memory, concurrently populated prefetch cache. The currently
//! viewed and soon-to-be-viewed images are always being fetched ahead of
//! need, whether they come from a local directory or a remote paginated
//! photo API. Deletion decisions are appended to a crash-safe ledger and
//! exported as JSON for an external deletion executor; this crate never
//! deletes anything itself, and never renders a pixel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌───────────────┐      ┌──────────────┐
//! │ ImageSource  │─────▶│ PrefetchCache │◀─────│SiftController│
//! │ local/remote │      │ F workers +   │      │ cursor/marks │
//! └──────────────┘      │ window evict  │      │ undo history │
//!                       └───────────────┘      └──────┬───────┘
//!                                                     │ mark
//!                              ┌──────────────┐       ▼
//!                              │ FocusScorer  │  ┌──────────────┐
//!                              │ (pure)       │  │DeletionLedger│
//!                              └──────────────┘  │ SQLite → JSON│
//!                                                └──────────────┘
//! ```
//!
//! The front end (display, keybindings) is an external collaborator: it
//! sends [`Command`](controller::Command)s to the controller and renders
//! [`DisplayState`](controller::DisplayState) snapshots. Navigation stays
//! responsive while fetches are outstanding — a not-yet-resident image
//! reports `NotReady` instead of blocking.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Catalog refs, pixel buffers, cache status |
//! | [`source`] | The `ImageSource` trait and source factory |
//! | [`source_local`] | Local-directory source |
//! | [`source_remote`] | Paginated remote photo-library source |
//! | [`score`] | Variance-of-Laplacian focus scoring |
//! | [`cache`] | Windowed background prefetch cache |
//! | [`controller`] | The sift state machine |
//! | [`ledger`] | Durable deletion ledger and JSON export |
//! | [`progress`] | Prefetch progress reporting |
//! | [`error`] | The `SiftError` taxonomy |

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod models;
pub mod progress;
pub mod score;
pub mod source;
pub mod source_local;
pub mod source_remote;
