//! Segment-level change sets between two replica states.
//!
//! Document segments are matched by their `id` attribute. Block subtrees
//! present in both trees are skipped outright: a shared [`NodeId`] means an
//! identical subtree, so nothing inside it can have changed.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::document::{Arena, DocNode, NodeGroup, NodeId};
use crate::media::{MediaContent, Segment};

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentValue {
    Node(DocNode),
    Media(Segment),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub id: Uuid,
    pub value: SegmentValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentChanges {
    pub created: Vec<SegmentEntry>,
    pub updated: Vec<SegmentEntry>,
    pub deleted: Vec<Uuid>,
}

impl SegmentChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Segments under `root`'s blocks that are not in `skip`, in document order.
fn collect_segments(arena: &Arena, root: NodeId, skip: &HashSet<NodeId>) -> Vec<(Uuid, NodeId)> {
    let mut out = Vec::new();
    for block in &arena.get(root).children {
        if !skip.contains(block) {
            walk(arena, *block, &mut out);
        }
    }
    out
}

fn walk(arena: &Arena, id: NodeId, out: &mut Vec<(Uuid, NodeId)>) {
    let node = arena.get(id);
    if node.node_type.group() == NodeGroup::Segment {
        if let Some(segment_id) = node.id() {
            out.push((segment_id, id));
        }
        return;
    }
    for child in &node.children {
        walk(arena, *child, out);
    }
}

/// Created, updated and deleted segments between two roots of one arena.
pub fn diff_document(arena: &Arena, before: NodeId, after: NodeId) -> SegmentChanges {
    let mut changes = SegmentChanges::default();
    if before == after {
        return changes;
    }
    let before_blocks: HashSet<NodeId> = arena.get(before).children.iter().copied().collect();
    let after_blocks: HashSet<NodeId> = arena.get(after).children.iter().copied().collect();

    let prev = collect_segments(arena, before, &after_blocks);
    let next = collect_segments(arena, after, &before_blocks);
    let prev_index: HashMap<Uuid, NodeId> = prev.iter().copied().collect();
    let next_ids: HashSet<Uuid> = next.iter().map(|(id, _)| *id).collect();

    for (id, node) in next {
        match prev_index.get(&id) {
            None => changes.created.push(SegmentEntry {
                id,
                value: SegmentValue::Node(arena.export(node)),
            }),
            Some(&old) if !arena.deep_eq(old, node) => changes.updated.push(SegmentEntry {
                id,
                value: SegmentValue::Node(arena.export(node)),
            }),
            Some(_) => {}
        }
    }
    changes.deleted = prev
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| !next_ids.contains(id))
        .collect();
    changes
}

/// Created, updated and deleted segments between two media states.
pub fn diff_media(before: &MediaContent, after: &MediaContent) -> SegmentChanges {
    let mut changes = SegmentChanges::default();
    for (id, segment) in &after.segments {
        let entry = || SegmentEntry {
            id: *id,
            value: SegmentValue::Media(segment.clone()),
        };
        match before.segments.get(id) {
            None => changes.created.push(entry()),
            Some(old) if old != segment => changes.updated.push(entry()),
            Some(_) => {}
        }
    }
    changes.deleted = before
        .segments
        .keys()
        .filter(|id| !after.segments.contains_key(id))
        .copied()
        .collect();
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeType};
    use crate::media::SegmentKind;
    use crate::step::Step;
    use crate::time::Timestamp;

    fn voice(id: Uuid, text: &str) -> DocNode {
        DocNode::new(NodeType::Voice)
            .with_attr("id", id.to_string())
            .with_content(vec![DocNode::text(text)])
    }

    #[test]
    fn test_document_diff_by_identity() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let page = DocNode::new(NodeType::Page).with_content(vec![
            DocNode::new(NodeType::Paragraph).with_content(vec![voice(a, "one"), voice(b, "two")]),
            DocNode::new(NodeType::Paragraph).with_content(vec![voice(c, "three")]),
        ]);
        let mut doc = Document::from_json(&page).unwrap();
        let before = doc.root();

        // edit text of `a`, delete `b`, leave the second paragraph alone
        doc.apply(&Step::insert(3, vec![DocNode::text("!")])).unwrap();
        doc.apply(&Step::delete(7, 12)).unwrap();
        let d = Uuid::new_v4();
        doc.apply(&Step::insert(7, vec![voice(d, "four")])).unwrap();

        let changes = diff_document(doc.arena(), before, doc.root());
        assert_eq!(changes.updated.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a]);
        assert_eq!(changes.created.iter().map(|e| e.id).collect::<Vec<_>>(), vec![d]);
        assert_eq!(changes.deleted, vec![b]);
    }

    #[test]
    fn test_document_diff_unchanged_is_empty() {
        let page = DocNode::new(NodeType::Page)
            .with_content(vec![DocNode::new(NodeType::Paragraph).with_content(vec![voice(Uuid::new_v4(), "x")])]);
        let mut doc = Document::from_json(&page).unwrap();
        let before = doc.root();
        assert!(diff_document(doc.arena(), before, before).is_empty());

        // a paragraph attribute change copies the block but not its segments
        doc.apply(&Step::attr(0, "updatedAt", 5)).unwrap();
        assert!(diff_document(doc.arena(), before, doc.root()).is_empty());
    }

    #[test]
    fn test_media_diff() {
        let track = Uuid::new_v4();
        let keep = Segment::new(track, SegmentKind::Sample, "a.wav", 0.0, 1.0);
        let gone = Segment::new(track, SegmentKind::Sample, "b.wav", 1.0, 1.0);
        let before = MediaContent::new().with_segment(keep.clone()).with_segment(gone.clone());

        let mut moved = keep.clone();
        moved.offset = 3.0;
        moved.updated_at = Timestamp(moved.updated_at.0 + 1);
        let fresh = Segment::new(track, SegmentKind::Sample, "c.wav", 5.0, 1.0);
        let after = MediaContent::new().with_segment(moved).with_segment(fresh.clone());

        let changes = diff_media(&before, &after);
        assert_eq!(changes.created.len(), 1);
        assert_eq!(changes.created[0].id, fresh.id);
        assert_eq!(changes.updated[0].id, keep.id);
        assert_eq!(changes.deleted, vec![gone.id]);
    }
}
