//! Document track tree: schema, JSON form, and arena storage.
//!
//! ```text
//! page                         (track root)
//! └── paragraph*               (block)
//!     ├── voice                (segment, inline container)
//!     │   └── text*            (inline leaf, carries marks)
//!     └── space                (segment, atomic leaf)
//! ```
//!
//! Positions address a flattened token stream: a non-leaf node counts
//! 2 + its content size, an atomic leaf 1, a text node its char count.

mod arena;

pub use arena::{Arena, Document, Level, Node, NodeId, ResolvedPos};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form node attributes (`id`, `createdAt`, `offset`, ...).
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// Node types of the track schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Page,
    Paragraph,
    Voice,
    Space,
    Text,
}

/// Schema groups. Content rules are expressed between groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeGroup {
    Root,
    Block,
    Segment,
    Inline,
}

impl NodeType {
    pub fn group(self) -> NodeGroup {
        match self {
            NodeType::Page => NodeGroup::Root,
            NodeType::Paragraph => NodeGroup::Block,
            NodeType::Voice | NodeType::Space => NodeGroup::Segment,
            NodeType::Text => NodeGroup::Inline,
        }
    }

    pub fn is_text(self) -> bool {
        self == NodeType::Text
    }

    /// Leaves have no content: text nodes and atoms.
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeType::Space | NodeType::Text)
    }

    /// Whether `child` may appear in the content of this node type.
    pub fn allows(self, child: NodeType) -> bool {
        match self {
            NodeType::Page => child.group() == NodeGroup::Block,
            NodeType::Paragraph => child.group() == NodeGroup::Segment,
            NodeType::Voice => child.group() == NodeGroup::Inline,
            NodeType::Space | NodeType::Text => false,
        }
    }
}

/// Inline marks carried by text nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mark {
    Bold,
}

/// JSON form of a document node, used on the wire and in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<DocNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl DocNode {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            attrs: Attrs::new(),
            content: Vec::new(),
            text: None,
            marks: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(NodeType::Text)
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: Vec<DocNode>) -> Self {
        self.content = content;
        self
    }

    pub fn with_mark(mut self, mark: Mark) -> Self {
        if !self.marks.contains(&mark) {
            self.marks.push(mark);
            self.marks.sort();
        }
        self
    }

    /// Size of this node in the flattened token stream.
    pub fn node_size(&self) -> usize {
        match self.node_type {
            NodeType::Text => self.text.as_deref().map_or(0, |t| t.chars().count()),
            NodeType::Space => 1,
            _ => 2 + self.content_size(),
        }
    }

    pub fn content_size(&self) -> usize {
        self.content.iter().map(DocNode::node_size).sum()
    }

    /// The `id` attribute, when present and well-formed.
    pub fn id(&self) -> Option<Uuid> {
        attr_uuid(&self.attrs, "id")
    }
}

/// Total size of a flat slice of nodes.
pub fn slice_size(nodes: &[DocNode]) -> usize {
    nodes.iter().map(DocNode::node_size).sum()
}

pub(crate) fn attr_uuid(attrs: &Attrs, name: &str) -> Option<Uuid> {
    attrs
        .get(name)
        .and_then(serde_json::Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Schema violations found while importing a JSON tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error("{child:?} is not allowed inside {parent:?}")]
    ContentNotAllowed { parent: NodeType, child: NodeType },
    #[error("text nodes must not be empty")]
    EmptyText,
    #[error("{0:?} is a leaf and cannot have content")]
    LeafWithContent(NodeType),
    #[error("expected a {expected:?} root, found {found:?}")]
    UnexpectedRoot { expected: NodeType, found: NodeType },
    /// An `id`, once assigned, never changes or goes away.
    #[error("node id {existing} cannot be changed")]
    PermanentId { existing: serde_json::Value },
}
