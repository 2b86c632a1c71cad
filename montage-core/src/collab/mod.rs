//! Client-side sync engine for one track.
//!
//! ```text
//!            local edit                     ack / reject
//!   ┌──────┐ begin_send ┌─────────┐ mark_sent ┌─────────────┐
//!   │ Idle │───────────▶│ Sending │──────────▶│ AwaitingAck │
//!   └──────┘            └─────────┘           └─────────────┘
//!      ▲  send_failed        │                       │
//!      └─────────────────────┴───────────────────────┘
//! ```
//!
//! The engine keeps two replicas of the track: `confirmed`, the last state
//! known to match the server, and `local`, which is `confirmed` plus the
//! unconfirmed tail. Only one batch is in flight at a time; edits made
//! meanwhile accumulate for the next round.
//!
//! Document replicas share one node arena, so the segment diff between
//! any two states (before/after a local edit, a rebase, or a reset) is
//! computed by node identity.

use std::sync::Arc;

use uuid::Uuid;

use crate::diff::{diff_document, diff_media, SegmentChanges};
use crate::document::{Arena, DocumentError, NodeId};
use crate::media::{MediaContent, Patch, PatchError, SegmentKind};
use crate::registry::{stamp_document, Capability, Registry};
use crate::step::{Mapping, Step, StepError};
use crate::time::Timestamp;
use crate::track::{Change, ChangeResponse, Delta, Track, TrackContent, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Sending,
    AwaitingAck,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Arena size above which garbage nodes are collected.
    pub compact_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 4096,
        }
    }
}

/// What receiving a response, a remote delta or a snapshot did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The replica moved forward; unconfirmed edits were kept.
    Applied(SegmentChanges),
    /// The send was rejected but the replica is already current: resend.
    Retry,
    /// The replica was replaced by authoritative state and unconfirmed
    /// edits were discarded.
    Reset(SegmentChanges),
    /// Duplicate or irrelevant; nothing changed.
    Ignored,
    /// Deltas were missed; a full snapshot pull is required.
    NeedsSnapshot,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("invalid document: {0}")]
    Document(#[from] DocumentError),
    #[error("{kind:?} tracks do not accept {change}")]
    UnsupportedChange { kind: TrackKind, change: &'static str },
    #[error("snapshot is a {found:?} track, expected {expected:?}")]
    KindMismatch { expected: TrackKind, found: TrackKind },
}

#[derive(Debug, Clone)]
enum Replica {
    Document {
        arena: Arena,
        confirmed: NodeId,
        local: NodeId,
    },
    Media {
        segment_kind: SegmentKind,
        confirmed: MediaContent,
        local: MediaContent,
    },
}

impl Replica {
    fn from_content(content: &TrackContent) -> Result<Self, SyncError> {
        Ok(match content {
            TrackContent::Document(node) => {
                let mut arena = Arena::new();
                let root = arena.import(node)?;
                Replica::Document {
                    arena,
                    confirmed: root,
                    local: root,
                }
            }
            TrackContent::Video(media) | TrackContent::Audio(media) => Replica::Media {
                segment_kind: content.kind().segment_kind().unwrap_or(SegmentKind::Frame),
                confirmed: media.clone(),
                local: media.clone(),
            },
        })
    }
}

pub struct SyncEngine {
    track_id: Uuid,
    client_id: Uuid,
    kind: TrackKind,
    registry: Arc<Registry>,
    config: SyncConfig,
    state: SyncState,
    confirmed_version: u64,
    unconfirmed: Vec<Change>,
    in_flight: usize,
    replica: Replica,
}

impl SyncEngine {
    pub fn new(client_id: Uuid, track: &Track, registry: Arc<Registry>, config: SyncConfig) -> Result<Self, SyncError> {
        Ok(Self {
            track_id: track.id,
            client_id,
            kind: track.kind(),
            registry,
            config,
            state: SyncState::Idle,
            confirmed_version: track.version,
            unconfirmed: Vec::new(),
            in_flight: 0,
            replica: Replica::from_content(&track.content)?,
        })
    }

    pub fn track_id(&self) -> Uuid {
        self.track_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn confirmed_version(&self) -> u64 {
        self.confirmed_version
    }

    pub fn unconfirmed(&self) -> &[Change] {
        &self.unconfirmed
    }

    pub fn has_unconfirmed(&self) -> bool {
        !self.unconfirmed.is_empty()
    }

    /// Nodes held by the document arena; zero for media tracks.
    pub fn replica_nodes(&self) -> usize {
        match &self.replica {
            Replica::Document { arena, .. } => arena.len(),
            Replica::Media { .. } => 0,
        }
    }

    pub fn local_content(&self) -> TrackContent {
        match &self.replica {
            Replica::Document { arena, local, .. } => TrackContent::Document(arena.export(*local)),
            Replica::Media { local, .. } => self.wrap_media(local.clone()),
        }
    }

    pub fn confirmed_content(&self) -> TrackContent {
        match &self.replica {
            Replica::Document { arena, confirmed, .. } => TrackContent::Document(arena.export(*confirmed)),
            Replica::Media { confirmed, .. } => self.wrap_media(confirmed.clone()),
        }
    }

    fn wrap_media(&self, media: MediaContent) -> TrackContent {
        match self.kind {
            TrackKind::Video => TrackContent::Video(media),
            _ => TrackContent::Audio(media),
        }
    }

    // ─── Local edits ─────────────────────────────────────────────────────

    /// Apply a batch of local changes to the local replica and queue them.
    /// Either the whole batch applies or nothing changes.
    pub fn apply_local(&mut self, changes: Vec<Change>, now: Timestamp) -> Result<SegmentChanges, SyncError> {
        let stamp = self.registry.has(self.kind, Capability::AttributeStamper);
        let hooks = self.registry.history_hooks(self.kind).to_vec();
        let steps_allowed = self.registry.has(self.kind, Capability::StepProducer);

        let (applied, inverse, diff) = match &mut self.replica {
            Replica::Document { arena, local, .. } => {
                if !steps_allowed {
                    return Err(SyncError::UnsupportedChange {
                        kind: self.kind,
                        change: "steps",
                    });
                }
                let mut steps = as_steps(self.kind, &changes)?;
                let before = *local;
                let checkpoint = arena.checkpoint();
                let mut inverse = Vec::new();
                let mut next = apply_steps(arena, before, &steps, Some(&mut inverse))?;
                if stamp {
                    let stamps = stamp_document(arena, before, next, self.track_id, now);
                    match apply_steps(arena, next, &stamps, Some(&mut inverse)) {
                        Ok(stamped) => next = stamped,
                        Err(e) => {
                            arena.rollback(checkpoint);
                            return Err(e.into());
                        }
                    }
                    steps.extend(stamps);
                }
                *local = next;
                let diff = diff_document(arena, before, next);
                (
                    steps.into_iter().map(Change::Step).collect::<Vec<_>>(),
                    inverse.into_iter().rev().flatten().map(Change::Step).collect::<Vec<_>>(),
                    diff,
                )
            }
            Replica::Media {
                segment_kind, local, ..
            } => {
                let mut patches = as_patches(self.kind, &changes)?;
                if stamp {
                    patches.iter_mut().for_each(|p| p.stamp(now));
                }
                let mut next = local.clone();
                let mut inverse = Vec::with_capacity(patches.len());
                for patch in &patches {
                    inverse.extend(next.inverse(patch));
                    next.apply(patch, *segment_kind)?;
                }
                let diff = diff_media(local, &next);
                *local = next;
                (
                    patches.into_iter().map(Change::Patch).collect::<Vec<_>>(),
                    inverse.into_iter().rev().map(Change::Patch).collect::<Vec<_>>(),
                    diff,
                )
            }
        };

        for hook in &hooks {
            hook.record(self.track_id, &applied, &inverse);
        }
        self.unconfirmed.extend(applied);
        self.maybe_compact();
        Ok(diff)
    }

    // ─── Sending ─────────────────────────────────────────────────────────

    /// The delta that would be sent now: the whole unconfirmed tail on top
    /// of the confirmed version. `None` while a batch is in flight.
    pub fn sendable(&self) -> Option<Delta> {
        if self.state != SyncState::Idle || self.unconfirmed.is_empty() {
            return None;
        }
        Some(Delta::new(self.confirmed_version, self.client_id, self.unconfirmed.clone()))
    }

    /// Take the sendable delta and move to `Sending`.
    pub fn begin_send(&mut self) -> Option<Delta> {
        let delta = self.sendable()?;
        self.in_flight = delta.steps.len();
        self.state = SyncState::Sending;
        Some(delta)
    }

    pub fn mark_sent(&mut self) {
        if self.state == SyncState::Sending {
            self.state = SyncState::AwaitingAck;
        }
    }

    /// The transport dropped the batch; it stays queued for the next round.
    pub fn send_failed(&mut self) {
        self.state = SyncState::Idle;
        self.in_flight = 0;
    }

    // ─── Receiving ───────────────────────────────────────────────────────

    /// Handle the server's reply to our in-flight batch.
    pub fn receive_response(&mut self, response: &ChangeResponse) -> Result<SyncOutcome, SyncError> {
        match response {
            ChangeResponse::Applied(delta) => {
                // The batch this acknowledges was already confirmed from
                // history. A batch sent since then is still awaiting its own.
                if delta.version <= self.confirmed_version {
                    if self.in_flight == 0 {
                        self.state = SyncState::Idle;
                    }
                    log::debug!(
                        "track {} ignoring stale ack for version {} (at {})",
                        self.track_id,
                        delta.version,
                        self.confirmed_version
                    );
                    return Ok(SyncOutcome::Ignored);
                }
                let in_flight = std::mem::take(&mut self.in_flight);
                self.state = SyncState::Idle;
                if in_flight == 0 || delta.client_id != self.client_id || delta.steps.len() != in_flight {
                    return self.receive_remote(delta);
                }
                self.confirm(delta)
            }
            ChangeResponse::Current(track) => {
                self.in_flight = 0;
                self.state = SyncState::Idle;
                self.resync(track)
            }
            ChangeResponse::Created(_) | ChangeResponse::Deleted(_) => Ok(SyncOutcome::Ignored),
        }
    }

    /// Handle a server-stamped delta from the broadcast channel.
    pub fn receive_remote(&mut self, delta: &Delta) -> Result<SyncOutcome, SyncError> {
        if delta.steps.is_empty() || delta.version <= self.confirmed_version {
            return Ok(SyncOutcome::Ignored);
        }
        if delta.base_version() != self.confirmed_version {
            log::warn!(
                "track {} missed deltas: at {}, received {}..{}",
                self.track_id,
                self.confirmed_version,
                delta.base_version(),
                delta.version
            );
            return Ok(SyncOutcome::NeedsSnapshot);
        }
        if self.is_own_prefix(delta) {
            return self.confirm(delta);
        }
        self.apply_remote(delta)
    }

    /// Bring the replica up to an authoritative snapshot. Replays history
    /// when the snapshot's history covers the gap, otherwise resets.
    pub fn resync(&mut self, track: &Track) -> Result<SyncOutcome, SyncError> {
        if track.kind() != self.kind {
            return Err(SyncError::KindMismatch {
                expected: self.kind,
                found: track.kind(),
            });
        }
        if track.version == self.confirmed_version {
            return Ok(if self.unconfirmed.is_empty() {
                SyncOutcome::Ignored
            } else {
                SyncOutcome::Retry
            });
        }
        if track.version > self.confirmed_version {
            if let Some(missed) = track.history.since(self.confirmed_version) {
                log::debug!(
                    "track {} catching up {} deltas from history",
                    self.track_id,
                    missed.len()
                );
                let mut changes = SegmentChanges::default();
                for delta in &missed {
                    let outcome = if self.is_own_prefix(delta) {
                        self.confirm(delta)?
                    } else {
                        self.apply_remote(delta)?
                    };
                    match outcome {
                        SyncOutcome::Applied(c) => merge_changes(&mut changes, c),
                        SyncOutcome::Reset(_) | SyncOutcome::NeedsSnapshot => {
                            return Ok(SyncOutcome::Reset(self.reset(track)?))
                        }
                        SyncOutcome::Retry | SyncOutcome::Ignored => {}
                    }
                }
                return Ok(SyncOutcome::Applied(changes));
            }
        }
        Ok(SyncOutcome::Reset(self.reset(track)?))
    }

    /// Discard unconfirmed edits and adopt `track` as the replica.
    pub fn reset(&mut self, track: &Track) -> Result<SegmentChanges, SyncError> {
        if track.kind() != self.kind {
            return Err(SyncError::KindMismatch {
                expected: self.kind,
                found: track.kind(),
            });
        }
        if !self.unconfirmed.is_empty() {
            log::info!(
                "track {} reset to version {}, discarding {} unconfirmed changes",
                self.track_id,
                track.version,
                self.unconfirmed.len()
            );
        }
        let diff = match (&mut self.replica, &track.content) {
            (Replica::Document { arena, confirmed, local }, TrackContent::Document(node)) => {
                let root = arena.import(node)?;
                let diff = diff_document(arena, *local, root);
                *confirmed = root;
                *local = root;
                diff
            }
            (Replica::Media { confirmed, local, .. }, TrackContent::Video(media) | TrackContent::Audio(media)) => {
                let diff = diff_media(local, media);
                *confirmed = media.clone();
                *local = media.clone();
                diff
            }
            _ => {
                return Err(SyncError::KindMismatch {
                    expected: self.kind,
                    found: track.kind(),
                })
            }
        };
        self.confirmed_version = track.version;
        self.unconfirmed.clear();
        self.in_flight = 0;
        self.state = SyncState::Idle;
        self.maybe_compact();
        Ok(diff)
    }

    fn is_own_prefix(&self, delta: &Delta) -> bool {
        delta.client_id == self.client_id
            && delta.steps.len() <= self.unconfirmed.len()
            && self.unconfirmed[..delta.steps.len()] == delta.steps[..]
    }

    /// Our own batch came back accepted. When the server recorded exactly
    /// what we sent, the local replica is already right; otherwise (a media
    /// update lost to a newer stored segment) the local replica is rebuilt
    /// from the acknowledged state.
    fn confirm(&mut self, ack: &Delta) -> Result<SyncOutcome, SyncError> {
        if ack.version <= self.confirmed_version {
            return Ok(SyncOutcome::Ignored);
        }
        let count = ack.steps.len().min(self.unconfirmed.len());
        let matches = self.unconfirmed[..count] == ack.steps[..];
        let remaining = self.unconfirmed[count..].to_vec();
        let pending = remaining.len();

        let kind = self.kind;
        let (changes, kept) = match &mut self.replica {
            Replica::Document { arena, confirmed, local } => {
                let steps = as_steps(kind, &ack.steps)?;
                *confirmed = apply_steps(arena, *confirmed, &steps, None)?;
                if matches {
                    (SegmentChanges::default(), remaining)
                } else {
                    let rest = as_steps(kind, &remaining)?;
                    let before = *local;
                    let (next, kept) = match apply_steps(arena, *confirmed, &rest, None) {
                        Ok(next) => (next, remaining),
                        Err(e) => {
                            log::debug!("dropping {} unconfirmed steps after ack: {e}", rest.len());
                            (*confirmed, Vec::new())
                        }
                    };
                    *local = next;
                    (diff_document(arena, before, next), kept)
                }
            }
            Replica::Media {
                segment_kind,
                confirmed,
                local,
            } => {
                let mut next_confirmed = confirmed.clone();
                for patch in as_patches(kind, &ack.steps)? {
                    next_confirmed.apply(&patch, *segment_kind)?;
                }
                *confirmed = next_confirmed;
                if matches {
                    (SegmentChanges::default(), remaining)
                } else {
                    let next = replay_patches(confirmed, &remaining, *segment_kind);
                    let diff = diff_media(local, &next);
                    *local = next;
                    (diff, remaining)
                }
            }
        };

        self.unconfirmed = kept;
        self.confirmed_version = ack.version;
        if self.in_flight > 0 {
            self.in_flight = self.in_flight.saturating_sub(count);
            if self.in_flight == 0 {
                self.state = SyncState::Idle;
            }
        }
        self.maybe_compact();
        log::debug!(
            "track {} confirmed at version {}, {} changes still unconfirmed",
            self.track_id,
            self.confirmed_version,
            self.unconfirmed.len()
        );
        if self.unconfirmed.len() < pending {
            return Ok(SyncOutcome::Reset(changes));
        }
        Ok(SyncOutcome::Applied(changes))
    }

    /// Apply someone else's delta on top of the confirmed replica and
    /// rebase the unconfirmed tail over it.
    fn apply_remote(&mut self, delta: &Delta) -> Result<SyncOutcome, SyncError> {
        let kind = self.kind;
        let changes = match &mut self.replica {
            Replica::Document { arena, confirmed, local } => {
                let remote = as_steps(kind, &delta.steps)?;
                let pending = as_steps(kind, &self.unconfirmed)?;
                let next_confirmed = match apply_steps(arena, *confirmed, &remote, None) {
                    Ok(root) => root,
                    Err(e) => {
                        log::warn!("track {}: remote delta {} does not apply: {e}", self.track_id, delta.version);
                        return Ok(SyncOutcome::NeedsSnapshot);
                    }
                };
                let (next_local, rebased) = rebase(arena, next_confirmed, &remote, &pending);
                if rebased.len() != pending.len() {
                    log::debug!(
                        "track {}: {} unconfirmed steps dropped by rebase",
                        self.track_id,
                        pending.len() - rebased.len()
                    );
                }
                let before = *local;
                *confirmed = next_confirmed;
                *local = next_local;
                self.unconfirmed = rebased.into_iter().map(Change::Step).collect();
                diff_document(arena, before, next_local)
            }
            Replica::Media {
                segment_kind,
                confirmed,
                local,
            } => {
                let remote = as_patches(kind, &delta.steps)?;
                let mut next_confirmed = confirmed.clone();
                for patch in &remote {
                    next_confirmed.apply(patch, *segment_kind)?;
                }
                let next_local = replay_patches(&next_confirmed, &self.unconfirmed, *segment_kind);
                let diff = diff_media(local, &next_local);
                *confirmed = next_confirmed;
                *local = next_local;
                diff
            }
        };
        self.confirmed_version = delta.version;
        // A batch in flight was built on the old base and will be rejected.
        self.in_flight = 0;
        self.maybe_compact();
        Ok(SyncOutcome::Applied(changes))
    }

    fn maybe_compact(&mut self) {
        if let Replica::Document { arena, confirmed, local } = &mut self.replica {
            if arena.len() <= self.config.compact_threshold {
                return;
            }
            let mut live = arena.reachable(*confirmed);
            live.extend(arena.reachable(*local));
            if arena.len() > 2 * live.len() {
                arena.compact(&mut [confirmed, local]);
            }
        }
    }
}

fn as_steps(kind: TrackKind, changes: &[Change]) -> Result<Vec<Step>, SyncError> {
    changes
        .iter()
        .map(|c| match c {
            Change::Step(step) => Ok(step.clone()),
            Change::Patch(_) => Err(SyncError::UnsupportedChange { kind, change: "patches" }),
        })
        .collect()
}

fn as_patches(kind: TrackKind, changes: &[Change]) -> Result<Vec<Patch>, SyncError> {
    changes
        .iter()
        .map(|c| match c {
            Change::Patch(patch) => Ok(patch.clone()),
            Change::Step(_) => Err(SyncError::UnsupportedChange { kind, change: "steps" }),
        })
        .collect()
}

/// Apply `steps` in order from `root`; all or nothing. When `inverse` is
/// given, each step's inverse is pushed before it is applied.
fn apply_steps(
    arena: &mut Arena,
    root: NodeId,
    steps: &[Step],
    mut inverse: Option<&mut Vec<Vec<Step>>>,
) -> Result<NodeId, StepError> {
    let checkpoint = arena.checkpoint();
    let mut cur = root;
    for step in steps {
        let applied = match inverse.as_mut() {
            Some(inv) => step.invert(arena, cur).map(|undo| inv.push(undo)),
            None => Ok(()),
        }
        .and_then(|()| step.apply(arena, cur));
        match applied {
            Ok(next) => cur = next,
            Err(e) => {
                arena.rollback(checkpoint);
                return Err(e);
            }
        }
    }
    Ok(cur)
}

/// Rebase `pending` (made on the old confirmed state) over `remote`, which
/// has already produced `confirmed`. Steps whose target vanished or that no
/// longer apply are dropped.
fn rebase(arena: &mut Arena, confirmed: NodeId, remote: &[Step], pending: &[Step]) -> (NodeId, Vec<Step>) {
    let n = pending.len();
    let mut mapping = Mapping::new();
    for step in pending.iter().rev() {
        mapping.append_map(step.get_map().invert(), None);
    }
    for step in remote {
        mapping.append_map(step.get_map(), None);
    }

    let mut cur = confirmed;
    let mut rebased = Vec::with_capacity(n);
    for (i, step) in pending.iter().enumerate() {
        let Some(mapped) = step.map(&mapping.slice(n - i)) else {
            continue;
        };
        match mapped.apply(arena, cur) {
            Ok(next) => {
                cur = next;
                mapping.append_map(mapped.get_map(), None);
                mapping.set_mirror(n - i - 1, mapping.len() - 1);
                rebased.push(mapped);
            }
            Err(e) => log::debug!("rebased step no longer applies: {e}"),
        }
    }
    (cur, rebased)
}

fn replay_patches(base: &MediaContent, changes: &[Change], kind: SegmentKind) -> MediaContent {
    let mut content = base.clone();
    for change in changes {
        if let Change::Patch(patch) = change {
            if let Err(e) = content.apply(patch, kind) {
                log::debug!("unconfirmed patch no longer applies: {e}");
            }
        }
    }
    content
}

fn merge_changes(into: &mut SegmentChanges, from: SegmentChanges) {
    into.created.extend(from.created);
    into.updated.extend(from.updated);
    into.deleted.extend(from.deleted);
}
