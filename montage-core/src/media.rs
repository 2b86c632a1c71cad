//! Media tracks: id-keyed segment maps edited by patches.
//!
//! Clients apply patches unconditionally to their optimistic copy. The
//! server reconciles them with last-writer-wins on the segment's own
//! `updatedAt`, and rewrites a losing update to the stored value so that
//! history and broadcast carry what was actually kept.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Attrs;
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Video frame sequence.
    Frame,
    /// Audio sample.
    Sample,
}

fn default_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub track_id: Uuid,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default = "default_rate")]
    pub playback_rate: f64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Segment {
    pub fn new(track_id: Uuid, kind: SegmentKind, src: impl Into<String>, offset: f64, duration: f64) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            track_id,
            kind,
            src: src.into(),
            offset,
            duration,
            playback_rate: 1.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whole-track attribute merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrsPatch {
    pub attrs: Attrs,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum Patch {
    Attrs(AttrsPatch),
    Created(Segment),
    Updated(Segment),
    #[serde(rename_all = "camelCase")]
    Deleted { id: Uuid, updated_at: Timestamp },
}

impl Patch {
    pub fn segment_id(&self) -> Option<Uuid> {
        match self {
            Patch::Attrs(_) => None,
            Patch::Created(s) | Patch::Updated(s) => Some(s.id),
            Patch::Deleted { id, .. } => Some(*id),
        }
    }

    pub fn updated_at(&self) -> Timestamp {
        match self {
            Patch::Attrs(p) => p.updated_at,
            Patch::Created(s) | Patch::Updated(s) => s.updated_at,
            Patch::Deleted { updated_at, .. } => *updated_at,
        }
    }

    /// Stamp the patch's `updatedAt`; a created segment also gets `createdAt`.
    pub fn stamp(&mut self, now: Timestamp) {
        match self {
            Patch::Attrs(p) => p.updated_at = now,
            Patch::Created(s) => {
                s.created_at = now;
                s.updated_at = now;
            }
            Patch::Updated(s) => s.updated_at = now,
            Patch::Deleted { updated_at, .. } => *updated_at = now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("segment {id} has kind {found:?}, track expects {expected:?}")]
    KindMismatch {
        id: Uuid,
        expected: SegmentKind,
        found: SegmentKind,
    },
}

/// Content of a video or audio track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default)]
    pub segments: BTreeMap<Uuid, Segment>,
}

impl MediaContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.insert(segment.id, segment);
        self
    }

    fn check_kind(patch: &Patch, expected: SegmentKind) -> Result<(), PatchError> {
        match patch {
            Patch::Created(s) | Patch::Updated(s) if s.kind != expected => Err(PatchError::KindMismatch {
                id: s.id,
                expected,
                found: s.kind,
            }),
            _ => Ok(()),
        }
    }

    /// Apply a patch as-is: the client's optimistic echo, and the client's
    /// application of server-reconciled patches.
    pub fn apply(&mut self, patch: &Patch, kind: SegmentKind) -> Result<(), PatchError> {
        Self::check_kind(patch, kind)?;
        match patch {
            Patch::Attrs(p) => merge_attrs(&mut self.attrs, &p.attrs),
            Patch::Created(s) | Patch::Updated(s) => {
                self.segments.insert(s.id, s.clone());
            }
            Patch::Deleted { id, .. } => {
                self.segments.remove(id);
            }
        }
        Ok(())
    }

    /// Server-side merge. Returns the patch as it should be recorded: an
    /// update that lost to a newer stored segment comes back carrying the
    /// stored segment.
    pub fn reconcile(&mut self, patch: &Patch, kind: SegmentKind) -> Result<Patch, PatchError> {
        Self::check_kind(patch, kind)?;
        match patch {
            Patch::Updated(incoming) => match self.segments.get(&incoming.id) {
                Some(stored) if stored.updated_at > incoming.updated_at => {
                    log::debug!(
                        "segment {} kept stored value ({} > {})",
                        incoming.id,
                        stored.updated_at,
                        incoming.updated_at
                    );
                    Ok(Patch::Updated(stored.clone()))
                }
                _ => {
                    self.segments.insert(incoming.id, incoming.clone());
                    Ok(patch.clone())
                }
            },
            _ => {
                self.apply(patch, kind)?;
                Ok(patch.clone())
            }
        }
    }

    /// A patch undoing `patch` against the current content.
    pub fn inverse(&self, patch: &Patch) -> Option<Patch> {
        match patch {
            Patch::Attrs(p) => {
                let previous = p
                    .attrs
                    .keys()
                    .map(|k| (k.clone(), self.attrs.get(k).cloned().unwrap_or(serde_json::Value::Null)))
                    .collect();
                Some(Patch::Attrs(AttrsPatch {
                    attrs: previous,
                    updated_at: p.updated_at,
                }))
            }
            Patch::Created(s) => Some(Patch::Deleted {
                id: s.id,
                updated_at: s.updated_at,
            }),
            Patch::Updated(s) => match self.segments.get(&s.id) {
                Some(old) => Some(Patch::Updated(old.clone())),
                None => Some(Patch::Deleted {
                    id: s.id,
                    updated_at: s.updated_at,
                }),
            },
            Patch::Deleted { id, .. } => self.segments.get(id).cloned().map(Patch::Created),
        }
    }
}

/// Shallow merge; `null` removes a key.
fn merge_attrs(target: &mut Attrs, incoming: &Attrs) {
    for (key, value) in incoming {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
