//! Append-only node arena with path-copying edits.
//!
//! Nodes are immutable once allocated. An edit allocates new nodes only
//! along the edited path and reuses every untouched subtree, so within one
//! arena equal [`NodeId`]s always denote identical subtrees. The segment
//! diff relies on this to skip shared subtrees without comparing them.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use super::{attr_uuid, Attrs, DocNode, DocumentError, Mark, NodeType};
use crate::step::{Step, StepError, StepMap};

/// Index of a node inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An immutable tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_type: NodeType,
    pub attrs: Attrs,
    pub children: Vec<NodeId>,
    /// Only set on text nodes.
    pub text: String,
    /// Sorted, deduplicated. Only set on text nodes.
    pub marks: Vec<Mark>,
    size: usize,
}

impl Node {
    pub fn node_size(&self) -> usize {
        self.size
    }

    pub fn content_size(&self) -> usize {
        match self.node_type {
            NodeType::Text => self.size,
            NodeType::Space => 0,
            _ => self.size - 2,
        }
    }

    pub fn is_text(&self) -> bool {
        self.node_type.is_text()
    }

    pub fn id(&self) -> Option<Uuid> {
        attr_uuid(&self.attrs, "id")
    }
}

/// One ancestor level of a resolved position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub node: NodeId,
    /// Index of the child the position points into (or before).
    pub index: usize,
    /// Absolute position where child `index` starts.
    pub offset: usize,
    /// Absolute position of this node's content start.
    pub content_start: usize,
}

/// A position resolved to its chain of ancestors, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPos {
    pub pos: usize,
    levels: Vec<Level>,
}

impl ResolvedPos {
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn parent_level(&self) -> &Level {
        &self.levels[self.levels.len() - 1]
    }

    pub fn parent(&self) -> NodeId {
        self.parent_level().node
    }

    pub fn index(&self) -> usize {
        self.parent_level().index
    }

    /// Non-zero when the position falls inside a text node.
    pub fn text_offset(&self) -> usize {
        self.pos - self.parent_level().offset
    }
}

/// Node storage shared by every root derived from the same document.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn checkpoint(&self) -> usize {
        self.nodes.len()
    }

    /// Drop every node allocated after `checkpoint`. Only valid while no
    /// live root references those nodes.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.nodes.truncate(checkpoint);
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub(crate) fn alloc_text(&mut self, text: String, marks: Vec<Mark>) -> NodeId {
        let size = text.chars().count();
        self.push(Node {
            node_type: NodeType::Text,
            attrs: Attrs::new(),
            children: Vec::new(),
            text,
            marks,
            size,
        })
    }

    pub(crate) fn alloc_branch(&mut self, node_type: NodeType, attrs: Attrs, children: Vec<NodeId>) -> NodeId {
        let size = if node_type.is_leaf() {
            1
        } else {
            2 + children.iter().map(|c| self.get(*c).size).sum::<usize>()
        };
        self.push(Node {
            node_type,
            attrs,
            children,
            text: String::new(),
            marks: Vec::new(),
            size,
        })
    }

    /// Copy of `id` with a new child list.
    pub(crate) fn with_children(&mut self, id: NodeId, children: Vec<NodeId>) -> NodeId {
        let node = self.get(id);
        let (node_type, attrs) = (node.node_type, node.attrs.clone());
        self.alloc_branch(node_type, attrs, children)
    }

    pub(crate) fn with_child(&mut self, id: NodeId, index: usize, child: NodeId) -> NodeId {
        let mut children = self.get(id).children.clone();
        children[index] = child;
        self.with_children(id, children)
    }

    /// Copy of `id` with one attribute set; `null` removes it.
    pub(crate) fn with_attr(&mut self, id: NodeId, attr: &str, value: &Value) -> NodeId {
        let mut node = self.get(id).clone();
        if value.is_null() {
            node.attrs.remove(attr);
        } else {
            node.attrs.insert(attr.to_string(), value.clone());
        }
        self.push(node)
    }

    /// Characters `[from, to)` of a text node, sharing the node when whole.
    pub(crate) fn slice_text(&mut self, id: NodeId, from: usize, to: usize) -> NodeId {
        let node = self.get(id);
        if from == 0 && to == node.size {
            return id;
        }
        let text = char_slice(&node.text, from, to).to_string();
        let marks = node.marks.clone();
        self.alloc_text(text, marks)
    }

    pub(crate) fn slice_text_marked(&mut self, id: NodeId, from: usize, to: usize, marks: Vec<Mark>) -> NodeId {
        let text = char_slice(&self.get(id).text, from, to).to_string();
        self.alloc_text(text, marks)
    }

    /// Merge adjacent text nodes with equal marks and drop empty ones.
    pub(crate) fn normalize(&mut self, children: Vec<NodeId>) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::with_capacity(children.len());
        for id in children {
            let node = self.get(id);
            if node.is_text() && node.size == 0 {
                continue;
            }
            let merged = match out.last() {
                Some(&last) => {
                    let prev = self.get(last);
                    if prev.is_text() && node.is_text() && prev.marks == node.marks {
                        let mut text = prev.text.clone();
                        text.push_str(&node.text);
                        Some((text, prev.marks.clone()))
                    } else {
                        None
                    }
                }
                None => None,
            };
            match merged {
                Some((text, marks)) => {
                    let joined = self.alloc_text(text, marks);
                    if let Some(slot) = out.last_mut() {
                        *slot = joined;
                    }
                }
                None => out.push(id),
            }
        }
        out
    }

    /// Validate and allocate a JSON subtree.
    pub fn import(&mut self, node: &DocNode) -> Result<NodeId, DocumentError> {
        match node.node_type {
            NodeType::Text => {
                let text = node.text.clone().unwrap_or_default();
                if text.is_empty() {
                    return Err(DocumentError::EmptyText);
                }
                let mut marks = node.marks.clone();
                marks.sort();
                marks.dedup();
                Ok(self.alloc_text(text, marks))
            }
            leaf if leaf.is_leaf() => {
                if !node.content.is_empty() {
                    return Err(DocumentError::LeafWithContent(leaf));
                }
                Ok(self.alloc_branch(leaf, node.attrs.clone(), Vec::new()))
            }
            parent => {
                let mut children = Vec::with_capacity(node.content.len());
                for child in &node.content {
                    if !parent.allows(child.node_type) {
                        return Err(DocumentError::ContentNotAllowed {
                            parent,
                            child: child.node_type,
                        });
                    }
                    children.push(self.import(child)?);
                }
                let children = self.normalize(children);
                Ok(self.alloc_branch(parent, node.attrs.clone(), children))
            }
        }
    }

    pub fn export(&self, id: NodeId) -> DocNode {
        let node = self.get(id);
        if node.is_text() {
            return DocNode {
                text: Some(node.text.clone()),
                marks: node.marks.clone(),
                ..DocNode::new(NodeType::Text)
            };
        }
        DocNode {
            attrs: node.attrs.clone(),
            content: node.children.iter().map(|c| self.export(*c)).collect(),
            ..DocNode::new(node.node_type)
        }
    }

    fn find_index(&self, node: &Node, pos: usize) -> (usize, usize) {
        if pos == 0 {
            return (0, 0);
        }
        let mut cur = 0;
        for (i, child) in node.children.iter().enumerate() {
            let end = cur + self.get(*child).size;
            if end >= pos {
                return if end == pos { (i + 1, end) } else { (i, cur) };
            }
            cur = end;
        }
        (node.children.len(), cur)
    }

    /// Resolve `pos` (relative to the content of `root`).
    pub fn resolve(&self, root: NodeId, pos: usize) -> Result<ResolvedPos, StepError> {
        let size = self.get(root).content_size();
        if pos > size {
            return Err(StepError::OutOfRange { pos, size });
        }
        let mut levels = Vec::new();
        let mut node_id = root;
        let mut content_start = 0;
        let mut parent_offset = pos;
        loop {
            let node = self.get(node_id);
            let (index, offset) = self.find_index(node, parent_offset);
            let rem = parent_offset - offset;
            levels.push(Level {
                node: node_id,
                index,
                offset: content_start + offset,
                content_start,
            });
            if rem == 0 {
                break;
            }
            let child = node.children[index];
            if self.get(child).is_text() {
                break;
            }
            parent_offset = rem - 1;
            content_start += offset + 1;
            node_id = child;
        }
        Ok(ResolvedPos { pos, levels })
    }

    /// Resolve both ends of a range that must share one parent node.
    pub fn resolve_flat(&self, root: NodeId, from: usize, to: usize) -> Result<(ResolvedPos, ResolvedPos), StepError> {
        if from > to {
            return Err(StepError::InvalidRange { from, to });
        }
        let start = self.resolve(root, from)?;
        let end = self.resolve(root, to)?;
        if start.depth() != end.depth()
            || start.parent() != end.parent()
            || start.parent_level().content_start != end.parent_level().content_start
        {
            return Err(StepError::CrossParent { from, to });
        }
        Ok((start, end))
    }

    /// Replace the deepest level of `rpos` with `replacement` and copy the
    /// ancestors above it. Returns the new root.
    pub(crate) fn rebuild_path(&mut self, rpos: &ResolvedPos, replacement: NodeId) -> NodeId {
        let levels = rpos.levels();
        let mut current = replacement;
        for level in levels[..levels.len() - 1].iter().rev() {
            current = self.with_child(level.node, level.index, current);
        }
        current
    }

    /// JSON copy of the flat range `[from, to)`, splitting text at the ends.
    pub fn slice_flat(&self, root: NodeId, from: usize, to: usize) -> Result<Vec<DocNode>, StepError> {
        let (start, _) = self.resolve_flat(root, from, to)?;
        let parent = self.get(start.parent());
        let mut out = Vec::new();
        let mut pos = start.parent_level().content_start;
        for child in &parent.children {
            let node = self.get(*child);
            let end = pos + node.size;
            if end > from && pos < to {
                if node.is_text() {
                    let text = char_slice(&node.text, from.max(pos) - pos, to.min(end) - pos);
                    out.push(DocNode {
                        text: Some(text.to_string()),
                        marks: node.marks.clone(),
                        ..DocNode::new(NodeType::Text)
                    });
                } else {
                    out.push(self.export(*child));
                }
            }
            pos = end;
        }
        Ok(out)
    }

    /// The non-text node starting exactly at `pos`, with its resolution.
    pub fn node_at(&self, root: NodeId, pos: usize) -> Result<(NodeId, ResolvedPos), StepError> {
        let rpos = self.resolve(root, pos)?;
        if rpos.text_offset() != 0 {
            return Err(StepError::NoNodeAt(pos));
        }
        let child = self
            .get(rpos.parent())
            .children
            .get(rpos.index())
            .copied()
            .ok_or(StepError::NoNodeAt(pos))?;
        Ok((child, rpos))
    }

    /// Every node id reachable from `root`.
    pub fn reachable(&self, root: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.get(id).children.iter().copied());
            }
        }
        seen
    }

    /// Structural equality; identical ids short-circuit.
    pub fn deep_eq(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let (x, y) = (self.get(a), self.get(b));
        x.node_type == y.node_type
            && x.size == y.size
            && x.text == y.text
            && x.marks == y.marks
            && x.attrs == y.attrs
            && x.children.len() == y.children.len()
            && x.children.iter().zip(&y.children).all(|(c, d)| self.deep_eq(*c, *d))
    }

    /// Rebuild the arena keeping only nodes reachable from `roots`, and
    /// rewrite the roots in place. Sharing between roots is preserved.
    pub fn compact(&mut self, roots: &mut [&mut NodeId]) {
        let mut fresh = Arena::new();
        let mut remap = HashMap::new();
        for root in roots.iter_mut() {
            **root = fresh.copy_from(self, **root, &mut remap);
        }
        log::debug!("compacted node arena: {} -> {} nodes", self.len(), fresh.len());
        *self = fresh;
    }

    fn copy_from(&mut self, other: &Arena, id: NodeId, remap: &mut HashMap<NodeId, NodeId>) -> NodeId {
        if let Some(&copied) = remap.get(&id) {
            return copied;
        }
        let node = other.get(id);
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            children.push(self.copy_from(other, *child, remap));
        }
        let copied = self.push(Node {
            children,
            ..node.clone()
        });
        remap.insert(id, copied);
        copied
    }
}

/// Characters `[from, to)` of `s`.
pub(crate) fn char_slice(s: &str, from: usize, to: usize) -> &str {
    let byte = |n: usize| s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    &s[byte(from)..byte(to)]
}

/// A single-root document owning its arena.
#[derive(Debug, Clone)]
pub struct Document {
    arena: Arena,
    root: NodeId,
}

impl Document {
    pub fn from_json(node: &DocNode) -> Result<Self, DocumentError> {
        if node.node_type != NodeType::Page {
            return Err(DocumentError::UnexpectedRoot {
                expected: NodeType::Page,
                found: node.node_type,
            });
        }
        let mut arena = Arena::new();
        let root = arena.import(node)?;
        Ok(Self { arena, root })
    }

    pub fn to_json(&self) -> DocNode {
        self.arena.export(self.root)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn content_size(&self) -> usize {
        self.arena.get(self.root).content_size()
    }

    pub fn apply(&mut self, step: &Step) -> Result<StepMap, StepError> {
        self.root = step.apply(&mut self.arena, self.root)?;
        Ok(step.get_map())
    }

    /// Apply every step or none of them.
    pub fn apply_all(&mut self, steps: &[Step]) -> Result<Vec<StepMap>, StepError> {
        let checkpoint = self.arena.checkpoint();
        let root = self.root;
        let mut maps = Vec::with_capacity(steps.len());
        for step in steps {
            match step.apply(&mut self.arena, self.root) {
                Ok(next) => {
                    self.root = next;
                    maps.push(step.get_map());
                }
                Err(e) => {
                    self.arena.rollback(checkpoint);
                    self.root = root;
                    return Err(e);
                }
            }
        }
        Ok(maps)
    }
}
