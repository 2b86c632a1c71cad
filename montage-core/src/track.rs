//! Tracks, deltas and the bounded per-track history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{DocNode, NodeType};
use crate::media::{MediaContent, Patch, SegmentKind};
use crate::step::Step;
use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Document,
    Video,
    Audio,
}

impl TrackKind {
    /// Segment kind a media track holds; `None` for document tracks.
    pub fn segment_kind(self) -> Option<SegmentKind> {
        match self {
            TrackKind::Document => None,
            TrackKind::Video => Some(SegmentKind::Frame),
            TrackKind::Audio => Some(SegmentKind::Sample),
        }
    }

    pub fn is_media(self) -> bool {
        self != TrackKind::Document
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum TrackContent {
    Document(DocNode),
    Video(MediaContent),
    Audio(MediaContent),
}

impl TrackContent {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackContent::Document(_) => TrackKind::Document,
            TrackContent::Video(_) => TrackKind::Video,
            TrackContent::Audio(_) => TrackKind::Audio,
        }
    }

    pub fn media(kind: TrackKind, content: MediaContent) -> Option<Self> {
        match kind {
            TrackKind::Document => None,
            TrackKind::Video => Some(TrackContent::Video(content)),
            TrackKind::Audio => Some(TrackContent::Audio(content)),
        }
    }

    pub fn as_media(&self) -> Option<&MediaContent> {
        match self {
            TrackContent::Video(m) | TrackContent::Audio(m) => Some(m),
            TrackContent::Document(_) => None,
        }
    }
}

/// One unit of change inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Change {
    Step(Step),
    Patch(Patch),
}

impl From<Step> for Change {
    fn from(step: Step) -> Self {
        Change::Step(step)
    }
}

impl From<Patch> for Change {
    fn from(patch: Patch) -> Self {
        Change::Patch(patch)
    }
}

/// A batch of changes. Client-sent deltas carry the version they were made
/// against; server-accepted deltas carry the version they produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub version: u64,
    pub client_id: Uuid,
    pub steps: Vec<Change>,
}

impl Delta {
    pub fn new(version: u64, client_id: Uuid, steps: Vec<Change>) -> Self {
        Self {
            version,
            client_id,
            steps,
        }
    }

    /// Version a server-stamped delta was applied on top of.
    pub fn base_version(&self) -> u64 {
        self.version.saturating_sub(self.steps.len() as u64)
    }
}

/// Accepted deltas in application order, oldest dropped first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: VecDeque<Delta>,
}

impl History {
    pub const DEFAULT_CAP: usize = 1000;

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delta> {
        self.entries.iter()
    }

    pub fn push(&mut self, delta: Delta, cap: usize) {
        self.entries.push_back(delta);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
    }

    /// Deltas after `version`, when history still reaches back that far.
    pub fn since(&self, version: u64) -> Option<Vec<Delta>> {
        let start = self.entries.iter().position(|d| d.version > version);
        match start {
            None => match self.entries.back() {
                Some(last) if last.version == version => Some(Vec::new()),
                _ => None,
            },
            Some(i) if self.entries[i].base_version() == version => {
                Some(self.entries.iter().skip(i).cloned().collect())
            }
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: Uuid,
    pub version: u64,
    pub content: TrackContent,
    #[serde(default)]
    pub history: History,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Track {
    pub fn new(id: Uuid, content: TrackContent) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            version: 0,
            content,
            history: History::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// An empty document track: a page with one empty paragraph.
    pub fn empty_document(id: Uuid) -> Self {
        let page = DocNode::new(NodeType::Page)
            .with_attr("id", id.to_string())
            .with_content(vec![DocNode::new(NodeType::Paragraph)]);
        Self::new(id, TrackContent::Document(page))
    }

    pub fn empty_media(id: Uuid, kind: TrackKind) -> Option<Self> {
        TrackContent::media(kind, MediaContent::new()).map(|c| Self::new(id, c))
    }

    pub fn kind(&self) -> TrackKind {
        self.content.kind()
    }
}

/// A group of tracks; tracks are stored as their own entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub track_ids: Vec<Uuid>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Chapter {
    pub fn new(id: Uuid) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            project_id: None,
            track_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn contains(&self, track_id: Uuid) -> bool {
        self.track_ids.contains(&track_id)
    }
}

/// Server reply to a submitted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "lowercase")]
pub enum ChangeResponse {
    /// The delta was accepted; carries the server-stamped delta.
    Applied(Delta),
    /// The delta was rejected; carries the authoritative track.
    Current(Track),
    Created(Track),
    Deleted(Track),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(version: u64, steps: usize) -> Delta {
        let step = Step::DocAttr {
            attr: "k".into(),
            value: serde_json::Value::Null,
        };
        Delta::new(version, Uuid::nil(), vec![Change::Step(step); steps])
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = History::default();
        for v in 1..=1005 {
            history.push(delta(v, 1), History::DEFAULT_CAP);
        }
        assert_eq!(history.len(), 1000);
        assert_eq!(history.iter().next().map(|d| d.version), Some(6));
    }

    #[test]
    fn test_history_since() {
        let mut history = History::default();
        history.push(delta(2, 2), 10);
        history.push(delta(3, 1), 10);
        history.push(delta(6, 3), 10);

        assert_eq!(history.since(3).map(|d| d.len()), Some(1));
        assert_eq!(history.since(0).map(|d| d.len()), Some(3));
        assert_eq!(history.since(6), Some(Vec::new()));
        // version 4 sits inside the last delta, not on a boundary
        assert_eq!(history.since(4), None);

        let mut short = History::default();
        short.push(delta(9, 1), 1);
        assert_eq!(short.since(2), None);
    }

    #[test]
    fn test_change_untagged_json() {
        let step: Change = serde_json::from_value(serde_json::json!({
            "stepType": "docAttr", "attr": "title", "value": "x"
        }))
        .unwrap();
        assert!(matches!(step, Change::Step(Step::DocAttr { .. })));

        let patch: Change = serde_json::from_value(serde_json::json!({
            "action": "deleted",
            "data": {"id": "6f1c2b1e-8f5e-4d1a-9a5e-3f7e2d1c0b9a", "updatedAt": 3}
        }))
        .unwrap();
        assert!(matches!(patch, Change::Patch(Patch::Deleted { .. })));
    }

    #[test]
    fn test_track_json_shape() {
        let track = Track::empty_media(Uuid::new_v4(), TrackKind::Audio).unwrap();
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json["content"]["kind"], "audio");
        assert_eq!(json["version"], 0);
        let back: Track = serde_json::from_value(json).unwrap();
        assert_eq!(back, track);
        assert_eq!(back.kind(), TrackKind::Audio);
    }

    #[test]
    fn test_base_version() {
        assert_eq!(delta(7, 3).base_version(), 4);
        assert_eq!(delta(0, 0).base_version(), 0);
    }
}
