//! Structural steps on a document tree.
//!
//! A step is an atomic positional edit. Applying it either yields a new
//! root in the same arena or fails without leaving allocations behind.
//! Every step can be inverted against the document it was applied to, and
//! mapped through the position changes of concurrent steps.

mod map;

pub use map::{Assoc, MapRange, MapResult, Mapping, StepMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{slice_size, Arena, Attrs, DocNode, DocumentError, Mark, NodeId, NodeType};

/// Why a step could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("position {pos} is outside the document (size {size})")]
    OutOfRange { pos: usize, size: usize },
    #[error("invalid range {from}..{to}")]
    InvalidRange { from: usize, to: usize },
    #[error("range {from}..{to} spans more than one parent node")]
    CrossParent { from: usize, to: usize },
    #[error("{child:?} is not allowed inside {parent:?}")]
    ContentNotAllowed { parent: NodeType, child: NodeType },
    #[error("no node starts at position {0}")]
    NoNodeAt(usize),
    #[error("text node at position {0} has no attributes")]
    TextHasNoAttrs(usize),
    #[error("invalid content: {0}")]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum Step {
    /// Replace the flat range `[from, to)` with `content`.
    Replace {
        from: usize,
        to: usize,
        #[serde(default)]
        content: Vec<DocNode>,
    },
    AddMark { from: usize, to: usize, mark: Mark },
    RemoveMark { from: usize, to: usize, mark: Mark },
    /// Set an attribute on the node starting at `pos`; `null` removes it.
    Attr {
        pos: usize,
        attr: String,
        #[serde(default)]
        value: Value,
    },
    DocAttr {
        attr: String,
        #[serde(default)]
        value: Value,
    },
}

impl Step {
    pub fn insert(pos: usize, content: Vec<DocNode>) -> Self {
        Step::Replace { from: pos, to: pos, content }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Step::Replace { from, to, content: Vec::new() }
    }

    pub fn attr(pos: usize, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Step::Attr {
            pos,
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Apply to the tree at `root`, returning the new root. On failure the
    /// arena is left exactly as it was.
    pub fn apply(&self, arena: &mut Arena, root: NodeId) -> Result<NodeId, StepError> {
        let checkpoint = arena.checkpoint();
        let result = match self {
            Step::Replace { from, to, content } => apply_replace(arena, root, *from, *to, content),
            Step::AddMark { from, to, mark } => apply_mark(arena, root, *from, *to, *mark, true),
            Step::RemoveMark { from, to, mark } => apply_mark(arena, root, *from, *to, *mark, false),
            Step::Attr { pos, attr, value } => {
                let (node, rpos) = arena.node_at(root, *pos)?;
                if arena.get(node).is_text() {
                    return Err(StepError::TextHasNoAttrs(*pos));
                }
                check_identity(&arena.get(node).attrs, attr, value)?;
                let updated = arena.with_attr(node, attr, value);
                let parent = arena.with_child(rpos.parent(), rpos.index(), updated);
                Ok(arena.rebuild_path(&rpos, parent))
            }
            Step::DocAttr { attr, value } => check_identity(&arena.get(root).attrs, attr, value)
                .map(|()| arena.with_attr(root, attr, value))
                .map_err(StepError::from),
        };
        if result.is_err() {
            arena.rollback(checkpoint);
        }
        result
    }

    pub fn get_map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, content } => StepMap::new(vec![MapRange {
                start: *from,
                old_size: to - from,
                new_size: slice_size(content),
            }]),
            _ => StepMap::empty(),
        }
    }

    /// Steps that undo this one when applied to its result. `root` is the
    /// document this step applies to.
    ///
    /// Mark steps only touch text whose mark state actually changes, so the
    /// inverse may be several smaller mark steps (or none).
    pub fn invert(&self, arena: &Arena, root: NodeId) -> Result<Vec<Step>, StepError> {
        match self {
            Step::Replace { from, to, content } => {
                let removed = arena.slice_flat(root, *from, *to)?;
                Ok(vec![Step::Replace {
                    from: *from,
                    to: from + slice_size(content),
                    content: removed,
                }])
            }
            Step::AddMark { from, to, mark } => Ok(mark_runs(arena, root, *from, *to, *mark, false)?
                .into_iter()
                .map(|(from, to)| Step::RemoveMark { from, to, mark: *mark })
                .collect()),
            Step::RemoveMark { from, to, mark } => Ok(mark_runs(arena, root, *from, *to, *mark, true)?
                .into_iter()
                .map(|(from, to)| Step::AddMark { from, to, mark: *mark })
                .collect()),
            Step::Attr { pos, attr, .. } => {
                let (node, _) = arena.node_at(root, *pos)?;
                let previous = arena.get(node).attrs.get(attr).cloned().unwrap_or(Value::Null);
                Ok(vec![Step::Attr {
                    pos: *pos,
                    attr: attr.clone(),
                    value: previous,
                }])
            }
            Step::DocAttr { attr, .. } => {
                let previous = arena.get(root).attrs.get(attr).cloned().unwrap_or(Value::Null);
                Ok(vec![Step::DocAttr {
                    attr: attr.clone(),
                    value: previous,
                }])
            }
        }
    }

    /// Rewrite this step's positions through `mapping`. `None` when the
    /// content it addressed was deleted.
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        match self {
            Step::Replace { from, to, content } => {
                let start = mapping.map_result(*from, Assoc::After);
                let end = mapping.map_result(*to, Assoc::Before);
                if start.deleted_across() && end.deleted_across() {
                    return None;
                }
                Some(Step::Replace {
                    from: start.pos,
                    to: start.pos.max(end.pos),
                    content: content.clone(),
                })
            }
            Step::AddMark { from, to, mark } | Step::RemoveMark { from, to, mark } => {
                let start = mapping.map_result(*from, Assoc::After);
                let end = mapping.map_result(*to, Assoc::Before);
                if (start.deleted() && end.deleted()) || start.pos >= end.pos {
                    return None;
                }
                Some(match self {
                    Step::AddMark { .. } => Step::AddMark { from: start.pos, to: end.pos, mark: *mark },
                    _ => Step::RemoveMark { from: start.pos, to: end.pos, mark: *mark },
                })
            }
            Step::Attr { pos, attr, value } => {
                let mapped = mapping.map_result(*pos, Assoc::After);
                if mapped.deleted_after() {
                    return None;
                }
                Some(Step::Attr {
                    pos: mapped.pos,
                    attr: attr.clone(),
                    value: value.clone(),
                })
            }
            Step::DocAttr { .. } => Some(self.clone()),
        }
    }
}

/// A node may be given an `id` once; after that the attribute only
/// accepts its current value.
fn check_identity(attrs: &Attrs, attr: &str, value: &Value) -> Result<(), DocumentError> {
    if attr != "id" {
        return Ok(());
    }
    match attrs.get("id") {
        Some(existing) if !existing.is_null() && existing != value => Err(DocumentError::PermanentId {
            existing: existing.clone(),
        }),
        _ => Ok(()),
    }
}

fn apply_replace(
    arena: &mut Arena,
    root: NodeId,
    from: usize,
    to: usize,
    content: &[DocNode],
) -> Result<NodeId, StepError> {
    let (start, end) = arena.resolve_flat(root, from, to)?;
    let parent_id = start.parent();
    let parent_type = arena.get(parent_id).node_type;
    if let Some(bad) = content.iter().find(|n| !parent_type.allows(n.node_type)) {
        return Err(StepError::ContentNotAllowed {
            parent: parent_type,
            child: bad.node_type,
        });
    }

    let old_children = arena.get(parent_id).children.clone();
    let mut children = old_children[..start.index()].to_vec();
    if start.text_offset() > 0 {
        children.push(arena.slice_text(old_children[start.index()], 0, start.text_offset()));
    }
    for node in content {
        children.push(arena.import(node)?);
    }
    if end.text_offset() > 0 {
        let text = old_children[end.index()];
        let len = arena.get(text).node_size();
        children.push(arena.slice_text(text, end.text_offset(), len));
        children.extend_from_slice(&old_children[end.index() + 1..]);
    } else {
        children.extend_from_slice(&old_children[end.index()..]);
    }

    let children = arena.normalize(children);
    let parent = arena.with_children(parent_id, children);
    Ok(arena.rebuild_path(&start, parent))
}

fn apply_mark(arena: &mut Arena, root: NodeId, from: usize, to: usize, mark: Mark, add: bool) -> Result<NodeId, StepError> {
    let size = arena.get(root).content_size();
    if from > to {
        return Err(StepError::InvalidRange { from, to });
    }
    if to > size {
        return Err(StepError::OutOfRange { pos: to, size });
    }
    Ok(remark(arena, root, 0, from, to, mark, add))
}

/// Toggle `mark` on text overlapping `[from, to)` under `id`, whose content
/// starts at `content_start`. Returns `id` itself when nothing changed.
fn remark(arena: &mut Arena, id: NodeId, content_start: usize, from: usize, to: usize, mark: Mark, add: bool) -> NodeId {
    let old_children = arena.get(id).children.clone();
    let mut children = Vec::with_capacity(old_children.len());
    let mut changed = false;
    let mut pos = content_start;
    for child in old_children {
        let node = arena.get(child);
        let size = node.node_size();
        let end = pos + size;
        if end <= from || pos >= to || (node.node_type.is_leaf() && !node.is_text()) {
            children.push(child);
        } else if node.is_text() {
            if node.marks.contains(&mark) == add {
                children.push(child);
            } else {
                let mut marks = node.marks.clone();
                if add {
                    marks.push(mark);
                    marks.sort();
                } else {
                    marks.retain(|m| *m != mark);
                }
                let (a, b) = (from.max(pos) - pos, to.min(end) - pos);
                if a > 0 {
                    children.push(arena.slice_text(child, 0, a));
                }
                children.push(arena.slice_text_marked(child, a, b, marks));
                if b < size {
                    children.push(arena.slice_text(child, b, size));
                }
                changed = true;
            }
        } else {
            let updated = remark(arena, child, pos + 1, from, to, mark, add);
            changed |= updated != child;
            children.push(updated);
        }
        pos = end;
    }
    if !changed {
        return id;
    }
    let children = arena.normalize(children);
    arena.with_children(id, children)
}

/// Maximal runs inside `[from, to)` of text whose mark state equals `has`.
fn mark_runs(arena: &Arena, root: NodeId, from: usize, to: usize, mark: Mark, has: bool) -> Result<Vec<(usize, usize)>, StepError> {
    let size = arena.get(root).content_size();
    if from > to {
        return Err(StepError::InvalidRange { from, to });
    }
    if to > size {
        return Err(StepError::OutOfRange { pos: to, size });
    }
    let mut runs: Vec<(usize, usize)> = Vec::new();
    collect_runs(arena, root, 0, from, to, mark, has, &mut runs);
    Ok(runs)
}

#[allow(clippy::too_many_arguments)]
fn collect_runs(
    arena: &Arena,
    id: NodeId,
    content_start: usize,
    from: usize,
    to: usize,
    mark: Mark,
    has: bool,
    runs: &mut Vec<(usize, usize)>,
) {
    let mut pos = content_start;
    for child in &arena.get(id).children {
        let node = arena.get(*child);
        let end = pos + node.node_size();
        if end > from && pos < to {
            if node.is_text() {
                if node.marks.contains(&mark) == has {
                    let (a, b) = (from.max(pos), to.min(end));
                    match runs.last_mut() {
                        Some(last) if last.1 == a => last.1 = b,
                        _ => runs.push((a, b)),
                    }
                }
            } else if !node.node_type.is_leaf() {
                collect_runs(arena, *child, pos + 1, from, to, mark, has, runs);
            }
        }
        pos = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn voice(text: &str) -> DocNode {
        DocNode::new(NodeType::Voice).with_content(vec![DocNode::text(text)])
    }

    fn para(content: Vec<DocNode>) -> DocNode {
        DocNode::new(NodeType::Paragraph).with_content(content)
    }

    fn doc(paras: Vec<DocNode>) -> Document {
        Document::from_json(&DocNode::new(NodeType::Page).with_content(paras)).unwrap()
    }

    fn texts(doc: &Document) -> Vec<String> {
        doc.to_json()
            .content
            .iter()
            .flat_map(|p| p.content.iter())
            .map(|s| s.content.iter().filter_map(|t| t.text.clone()).collect::<String>())
            .collect()
    }

    fn assert_inverts(mut d: Document, step: Step) {
        let original = d.to_json();
        let inverse = step.invert(d.arena(), d.root()).unwrap();
        d.apply(&step).unwrap();
        for s in &inverse {
            d.apply(s).unwrap();
        }
        assert_eq!(d.to_json(), original);
    }

    #[test]
    fn test_insert_text_into_voice() {
        let mut d = doc(vec![para(vec![voice("hello")])]);
        d.apply(&Step::insert(4, vec![DocNode::text("XY")])).unwrap();
        assert_eq!(texts(&d), vec!["heXYllo"]);
    }

    #[test]
    fn test_delete_range_inside_text() {
        let mut d = doc(vec![para(vec![voice("hello")])]);
        d.apply(&Step::delete(3, 5)).unwrap();
        assert_eq!(texts(&d), vec!["hlo"]);
    }

    #[test]
    fn test_insert_segment_into_paragraph() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        // after the voice, inside the paragraph
        d.apply(&Step::insert(5, vec![DocNode::new(NodeType::Space)])).unwrap();
        let json = d.to_json();
        assert_eq!(json.content[0].content[1].node_type, NodeType::Space);
        assert_eq!(d.content_size(), 7);
    }

    #[test]
    fn test_replace_rejects_disallowed_content() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        let before = d.arena().len();
        let err = d.apply(&Step::insert(0, vec![voice("x")])).unwrap_err();
        assert_eq!(
            err,
            StepError::ContentNotAllowed {
                parent: NodeType::Page,
                child: NodeType::Voice
            }
        );
        assert_eq!(d.arena().len(), before);
    }

    #[test]
    fn test_replace_rejects_out_of_range() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        assert!(matches!(
            d.apply(&Step::delete(1, 40)),
            Err(StepError::OutOfRange { pos: 40, .. })
        ));
    }

    #[test]
    fn test_apply_all_is_atomic() {
        let mut d = doc(vec![para(vec![voice("abc")])]);
        let before = d.to_json();
        let steps = vec![Step::insert(2, vec![DocNode::text("z")]), Step::delete(50, 51)];
        assert!(d.apply_all(&steps).is_err());
        assert_eq!(d.to_json(), before);
    }

    #[test]
    fn test_add_mark_splits_text() {
        let mut d = doc(vec![para(vec![voice("abcd")])]);
        d.apply(&Step::AddMark { from: 3, to: 5, mark: Mark::Bold }).unwrap();
        let voice = &d.to_json().content[0].content[0];
        assert_eq!(voice.content.len(), 3);
        assert_eq!(voice.content[1].text.as_deref(), Some("bc"));
        assert_eq!(voice.content[1].marks, vec![Mark::Bold]);

        d.apply(&Step::RemoveMark { from: 2, to: 6, mark: Mark::Bold }).unwrap();
        let voice = &d.to_json().content[0].content[0];
        assert_eq!(voice.content.len(), 1);
    }

    #[test]
    fn test_mark_noop_keeps_root() {
        let mut d = doc(vec![para(vec![voice("abcd")])]);
        let root = d.root();
        d.apply(&Step::RemoveMark { from: 2, to: 6, mark: Mark::Bold }).unwrap();
        assert_eq!(d.root(), root);
    }

    #[test]
    fn test_attr_sets_and_removes() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        d.apply(&Step::attr(1, "duration", 2.5)).unwrap();
        assert_eq!(d.to_json().content[0].content[0].attrs["duration"], 2.5);
        d.apply(&Step::attr(1, "duration", Value::Null)).unwrap();
        assert!(d.to_json().content[0].content[0].attrs.is_empty());

        assert_eq!(d.apply(&Step::attr(2, "x", 1)).unwrap_err(), StepError::TextHasNoAttrs(2));
        assert_eq!(d.apply(&Step::attr(3, "x", 1)).unwrap_err(), StepError::NoNodeAt(3));
    }

    #[test]
    fn test_node_id_is_permanent() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        // first assignment, then re-stating the same value
        d.apply(&Step::attr(1, "id", "seg-1")).unwrap();
        d.apply(&Step::attr(1, "id", "seg-1")).unwrap();
        let before = d.to_json();

        assert_eq!(
            d.apply(&Step::attr(1, "id", "seg-2")).unwrap_err(),
            StepError::Document(DocumentError::PermanentId {
                existing: Value::from("seg-1")
            })
        );
        assert!(matches!(
            d.apply(&Step::attr(1, "id", Value::Null)),
            Err(StepError::Document(DocumentError::PermanentId { .. }))
        ));
        assert_eq!(d.to_json(), before);

        d.apply(&Step::DocAttr { attr: "id".into(), value: "page".into() }).unwrap();
        assert!(d.apply(&Step::DocAttr { attr: "id".into(), value: "other".into() }).is_err());
        assert_eq!(d.to_json().attrs["id"], "page");
    }

    #[test]
    fn test_doc_attr() {
        let mut d = doc(vec![para(vec![voice("ab")])]);
        d.apply(&Step::DocAttr { attr: "title".into(), value: "intro".into() }).unwrap();
        assert_eq!(d.to_json().attrs["title"], "intro");
    }

    #[test]
    fn test_inverses_restore_document() {
        let base = || doc(vec![para(vec![voice("hello"), DocNode::new(NodeType::Space)]), para(vec![voice("world")])]);
        assert_inverts(base(), Step::insert(3, vec![DocNode::text("__")]));
        assert_inverts(base(), Step::delete(3, 6));
        assert_inverts(base(), Step::delete(0, 10));
        assert_inverts(base(), Step::attr(1, "offset", 4));
        assert_inverts(base(), Step::DocAttr { attr: "k".into(), value: 1.into() });
        assert_inverts(base(), Step::AddMark { from: 2, to: 15, mark: Mark::Bold });

        // partially bold text: the inverse only strips what was added
        let mut partly = base();
        partly.apply(&Step::AddMark { from: 3, to: 5, mark: Mark::Bold }).unwrap();
        assert_inverts(partly.clone(), Step::AddMark { from: 2, to: 7, mark: Mark::Bold });
        assert_inverts(partly, Step::RemoveMark { from: 2, to: 7, mark: Mark::Bold });
    }

    #[test]
    fn test_map_through_concurrent_insert() {
        let step = Step::insert(5, vec![DocNode::text("x")]);
        let mut mapping = Mapping::new();
        mapping.append_map(Step::insert(2, vec![DocNode::text("abc")]).get_map(), None);
        assert_eq!(step.map(&mapping), Some(Step::insert(8, vec![DocNode::text("x")])));
    }

    #[test]
    fn test_map_drops_deleted_targets() {
        let mut mapping = Mapping::new();
        mapping.append_map(Step::delete(2, 10).get_map(), None);
        assert_eq!(Step::delete(4, 6).map(&mapping), None);
        assert_eq!(Step::attr(4, "id", "x").map(&mapping), None);
        assert_eq!(Step::AddMark { from: 3, to: 8, mark: Mark::Bold }.map(&mapping), None);
        // a range straddling the deletion survives, shrunk
        assert_eq!(Step::delete(1, 12).map(&mapping), Some(Step::delete(1, 4)));
    }

    #[test]
    fn test_json_shape() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "stepType": "replace", "from": 1, "to": 3,
            "content": [{"type": "text", "text": "hi"}]
        }))
        .unwrap();
        assert_eq!(step, Step::Replace { from: 1, to: 3, content: vec![DocNode::text("hi")] });

        let mark = serde_json::to_value(Step::AddMark { from: 0, to: 1, mark: Mark::Bold }).unwrap();
        assert_eq!(mark["stepType"], "addMark");
        assert_eq!(mark["mark"]["type"], "bold");
    }
}
