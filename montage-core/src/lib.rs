//! # montage-core - Track synchronization engine
//!
//! Pure, synchronous building blocks shared by the server and every client.
//!
//! ```text
//!   local edit ──▶ SyncEngine ──Delta──▶ reconcile ──▶ Track (authority)
//!                      ▲                     │
//!                      └──── remote Delta ◀──┘
//!                      │
//!                      ▼
//!               SegmentChanges (diff)
//! ```
//!
//! ## Modules
//!
//! - [`document`]: arena-backed document tree with structural sharing
//! - [`step`]: positional steps, step maps and mappings
//! - [`media`]: media segments and last-writer-wins patches
//! - [`track`]: tracks, deltas, bounded history, chapters
//! - [`reconcile`]: server-side acceptance of a delta
//! - [`collab`]: client-side sync state machine
//! - [`diff`]: segment-level change sets
//! - [`registry`]: per-kind capabilities and attribute stamping

pub mod collab;
pub mod diff;
pub mod document;
pub mod media;
pub mod reconcile;
pub mod registry;
pub mod step;
pub mod time;
pub mod track;

pub use collab::{SyncConfig, SyncEngine, SyncError, SyncOutcome, SyncState};
pub use diff::{diff_document, diff_media, SegmentChanges, SegmentEntry, SegmentValue};
pub use document::{Arena, Attrs, DocNode, Document, DocumentError, Mark, NodeId, NodeType};
pub use media::{AttrsPatch, MediaContent, Patch, PatchError, Segment, SegmentKind};
pub use reconcile::{reconcile, ApplyError, Reconciliation, Rejection};
pub use registry::{Capability, HistoryHook, Registry};
pub use step::{Mapping, Step, StepError, StepMap};
pub use time::Timestamp;
pub use track::{Change, ChangeResponse, Chapter, Delta, History, Track, TrackContent, TrackKind};
