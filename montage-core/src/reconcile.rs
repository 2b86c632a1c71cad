//! Authoritative acceptance of a delta against a track.
//!
//! A delta is accepted only when it was made against the track's current
//! version, and then either every change applies or none does. Accepted
//! deltas advance the version by their length and enter the bounded
//! history stamped with the resulting version.

use crate::document::{DocNode, Document, DocumentError};
use crate::media::{MediaContent, PatchError, SegmentKind};
use crate::step::{Step, StepError};
use crate::time::Timestamp;
use crate::track::{Change, Delta, Track, TrackContent, TrackKind};

/// Why a well-versioned delta could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("stored document is invalid: {0}")]
    Document(#[from] DocumentError),
    #[error("{kind:?} tracks do not accept {change}")]
    WrongChange { kind: TrackKind, change: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    VersionConflict { expected: u64, got: u64 },
    Unapplicable(ApplyError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Applied; carries the server-stamped delta.
    Accepted(Delta),
    /// Empty delta at the current version.
    Noop,
    /// The track was left untouched.
    Rejected(Rejection),
}

pub fn reconcile(track: &mut Track, delta: &Delta, history_cap: usize) -> Reconciliation {
    if delta.version != track.version {
        return Reconciliation::Rejected(Rejection::VersionConflict {
            expected: track.version,
            got: delta.version,
        });
    }
    if delta.steps.is_empty() {
        return Reconciliation::Noop;
    }

    let kind = track.kind();
    let applied = match &track.content {
        TrackContent::Document(node) => apply_document(node, &delta.steps)
            .map(|doc| (TrackContent::Document(doc), delta.steps.clone())),
        TrackContent::Video(media) | TrackContent::Audio(media) => {
            let segment_kind = kind.segment_kind().unwrap_or(SegmentKind::Frame);
            apply_media(media, kind, segment_kind, &delta.steps).and_then(|(content, patches)| {
                TrackContent::media(kind, content)
                    .map(|c| (c, patches))
                    .ok_or(ApplyError::WrongChange { kind, change: "patches" })
            })
        }
    };

    match applied {
        Err(e) => Reconciliation::Rejected(Rejection::Unapplicable(e)),
        Ok((content, changes)) => {
            track.content = content;
            track.version += changes.len() as u64;
            track.updated_at = track.updated_at.max(Timestamp::now());
            let stamped = Delta::new(track.version, delta.client_id, changes);
            track.history.push(stamped.clone(), history_cap);
            Reconciliation::Accepted(stamped)
        }
    }
}

fn apply_document(node: &DocNode, changes: &[Change]) -> Result<DocNode, ApplyError> {
    let steps = changes
        .iter()
        .map(|c| match c {
            Change::Step(step) => Ok(step.clone()),
            Change::Patch(_) => Err(ApplyError::WrongChange {
                kind: TrackKind::Document,
                change: "patches",
            }),
        })
        .collect::<Result<Vec<Step>, _>>()?;
    let mut doc = Document::from_json(node)?;
    doc.apply_all(&steps)?;
    Ok(doc.to_json())
}

fn apply_media(
    media: &MediaContent,
    kind: TrackKind,
    segment_kind: SegmentKind,
    changes: &[Change],
) -> Result<(MediaContent, Vec<Change>), ApplyError> {
    let mut content = media.clone();
    let mut recorded = Vec::with_capacity(changes.len());
    for change in changes {
        let patch = match change {
            Change::Patch(patch) => patch,
            Change::Step(_) => return Err(ApplyError::WrongChange { kind, change: "steps" }),
        };
        recorded.push(Change::Patch(content.reconcile(patch, segment_kind)?));
    }
    Ok((content, recorded))
}
