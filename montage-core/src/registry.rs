//! Per-kind capability table consulted by the client sync engine.
//!
//! | kind     | capabilities                      |
//! |----------|-----------------------------------|
//! | document | step producer, attribute stamper  |
//! | video    | attribute stamper                 |
//! | audio    | attribute stamper                 |
//!
//! History hooks are opt-in per kind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::document::{Arena, NodeGroup, NodeId};
use crate::step::Step;
use crate::time::Timestamp;
use crate::track::{Change, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Edited through structural steps rather than patches.
    StepProducer,
    /// Local edits get `id` / `createdAt` / `updatedAt` stamped.
    AttributeStamper,
    /// Local batches are reported to registered [`HistoryHook`]s.
    HistoryHook,
}

/// Observer of local batches, e.g. an undo stack.
pub trait HistoryHook: Send + Sync {
    /// `inverse` undoes `changes` when applied in order.
    fn record(&self, track_id: Uuid, changes: &[Change], inverse: &[Change]);
}

#[derive(Clone, Default)]
struct KindBehavior {
    capabilities: BTreeSet<Capability>,
    hooks: Vec<Arc<dyn HistoryHook>>,
}

impl fmt::Debug for KindBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindBehavior")
            .field("capabilities", &self.capabilities)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    kinds: HashMap<TrackKind, KindBehavior>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

impl Registry {
    /// No capabilities for any kind.
    pub fn empty() -> Self {
        Self { kinds: HashMap::new() }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry
            .grant(TrackKind::Document, Capability::StepProducer)
            .grant(TrackKind::Document, Capability::AttributeStamper)
            .grant(TrackKind::Video, Capability::AttributeStamper)
            .grant(TrackKind::Audio, Capability::AttributeStamper);
        registry
    }

    pub fn grant(&mut self, kind: TrackKind, capability: Capability) -> &mut Self {
        self.kinds.entry(kind).or_default().capabilities.insert(capability);
        self
    }

    pub fn add_history_hook(&mut self, kind: TrackKind, hook: Arc<dyn HistoryHook>) -> &mut Self {
        let behavior = self.kinds.entry(kind).or_default();
        behavior.capabilities.insert(Capability::HistoryHook);
        behavior.hooks.push(hook);
        self
    }

    pub fn has(&self, kind: TrackKind, capability: Capability) -> bool {
        self.kinds
            .get(&kind)
            .is_some_and(|b| b.capabilities.contains(&capability))
    }

    pub fn capabilities(&self, kind: TrackKind) -> Vec<Capability> {
        self.kinds
            .get(&kind)
            .map(|b| b.capabilities.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn history_hooks(&self, kind: TrackKind) -> &[Arc<dyn HistoryHook>] {
        match self.kinds.get(&kind) {
            Some(b) if b.capabilities.contains(&Capability::HistoryHook) => &b.hooks,
            _ => &[],
        }
    }
}

/// Attribute steps stamping every block and segment node that is new or
/// changed in `after` relative to `before`. Nodes without an `id` also get
/// `id` and `createdAt`; segments get their `trackId`.
pub fn stamp_document(arena: &Arena, before: NodeId, after: NodeId, track_id: Uuid, now: Timestamp) -> Vec<Step> {
    let mut steps = Vec::new();
    if before == after {
        return steps;
    }
    let unchanged = arena.reachable(before);
    stamp_children(arena, after, 0, &unchanged, track_id, now, &mut steps);
    steps
}

fn stamp_children(
    arena: &Arena,
    id: NodeId,
    content_start: usize,
    unchanged: &HashSet<NodeId>,
    track_id: Uuid,
    now: Timestamp,
    steps: &mut Vec<Step>,
) {
    let mut pos = content_start;
    for child in &arena.get(id).children {
        let node = arena.get(*child);
        if !unchanged.contains(child) {
            let group = node.node_type.group();
            if matches!(group, NodeGroup::Block | NodeGroup::Segment) {
                steps.push(Step::attr(pos, "updatedAt", now.as_millis()));
                if node.id().is_none() {
                    steps.push(Step::attr(pos, "id", Uuid::new_v4().to_string()));
                    steps.push(Step::attr(pos, "createdAt", now.as_millis()));
                    if group == NodeGroup::Segment {
                        steps.push(Step::attr(pos, "trackId", track_id.to_string()));
                    }
                }
            }
            if !node.node_type.is_leaf() {
                stamp_children(arena, *child, pos + 1, unchanged, track_id, now, steps);
            }
        }
        pos += node.node_size();
    }
}
