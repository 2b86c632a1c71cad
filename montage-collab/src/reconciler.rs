//! Server-side reconciliation service: the only writer of track state.
//!
//! Mutations are serialized per track by an async lock; the version check,
//! apply, persist and publish all happen while it is held, so subscribers
//! see deltas in version order. Different tracks proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use montage_core::{reconcile, ChangeResponse, Chapter, Delta, Reconciliation, Rejection, Timestamp, Track};
use uuid::Uuid;

use crate::broadcast::ChannelRegistry;
use crate::protocol::{ChapterReply, ChapterRequest, ErrorCode, PullResponse, TrackMessage, TrackMessageData, TrackScope};
use crate::storage::{EntityKind, EntityStore, EntityStoreExt, StoreError};

/// Default number of deltas kept per track.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("track {track_id} is not in chapter {chapter_id}")]
    NotInChapter { chapter_id: Uuid, track_id: Uuid },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: Uuid },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } | Self::NotInChapter { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Store(_) => ErrorCode::Internal,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    channels: Arc<ChannelRegistry>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    history_cap: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntityStore>, channels: Arc<ChannelRegistry>, history_cap: usize) -> Self {
        Self {
            store,
            channels,
            locks: Mutex::new(HashMap::new()),
            history_cap,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id).or_default().clone()
    }

    /// Drop the lock of an entity that no longer exists. Callers still
    /// holding the old lock finish against the missing entity.
    fn forget_lock(&self, id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&id);
    }

    pub async fn create_chapter(&self, mut chapter: Chapter) -> Result<Chapter, ReconcileError> {
        let lock = self.lock_for(chapter.id);
        let _guard = lock.lock().await;
        if self.store.read(EntityKind::Chapter, chapter.id)?.is_some() {
            return Err(ReconcileError::AlreadyExists {
                kind: EntityKind::Chapter,
                id: chapter.id,
            });
        }
        // membership only changes through create_track / delete_track
        chapter.track_ids.clear();
        self.store.write_chapter(&chapter)?;
        log::info!("chapter {} created", chapter.id);
        Ok(chapter)
    }

    pub fn read_chapter(&self, id: Uuid) -> Result<Chapter, ReconcileError> {
        self.store.read_chapter(id)?.ok_or(ReconcileError::NotFound {
            kind: EntityKind::Chapter,
            id,
        })
    }

    /// Every stored chapter, oldest first.
    pub fn list_chapters(&self) -> Result<Vec<Chapter>, ReconcileError> {
        let mut chapters = Vec::new();
        for id in self.store.list(EntityKind::Chapter)? {
            if let Some(chapter) = self.store.read_chapter(id)? {
                chapters.push(chapter);
            }
        }
        chapters.sort_by_key(|c| (c.created_at, c.id));
        Ok(chapters)
    }

    pub async fn update_chapter(&self, id: Uuid, partial: &serde_json::Value) -> Result<Chapter, ReconcileError> {
        let Some(fields) = partial.as_object() else {
            return Err(ReconcileError::BadRequest("chapter update must be an object".into()));
        };
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.read_chapter(id)?;
        let mut merged = serde_json::to_value(&current).map_err(StoreError::from)?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        let mut chapter: Chapter =
            serde_json::from_value(merged).map_err(|e| ReconcileError::BadRequest(e.to_string()))?;
        chapter.id = current.id;
        chapter.track_ids = current.track_ids;
        chapter.created_at = current.created_at;
        chapter.updated_at = Timestamp::now().max(current.updated_at);
        self.store.write_chapter(&chapter)?;
        log::info!("chapter {id} updated");
        Ok(chapter)
    }

    /// Delete a chapter together with its tracks; each track deletion is
    /// announced to its subscribers.
    pub async fn delete_chapter(&self, origin: Uuid, id: Uuid) -> Result<Chapter, ReconcileError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let chapter = self.read_chapter(id)?;
        for &track_id in &chapter.track_ids {
            let track_lock = self.lock_for(track_id);
            let _track_guard = track_lock.lock().await;
            let Some(track) = self.store.read_track(track_id)? else {
                continue;
            };
            self.store.delete(EntityKind::Track, track_id)?;
            self.forget_lock(track_id);
            self.channels
                .publish(
                    origin,
                    TrackMessage::new(TrackScope::new(id, track_id), TrackMessageData::Deleted(track)),
                )
                .await;
        }
        self.store.delete(EntityKind::Chapter, id)?;
        self.forget_lock(id);
        log::info!("chapter {id} deleted with {} tracks", chapter.track_ids.len());
        Ok(chapter)
    }

    pub async fn handle_chapter(&self, origin: Uuid, request: ChapterRequest) -> Result<ChapterReply, ReconcileError> {
        Ok(match request {
            ChapterRequest::Create(chapter) => ChapterReply::One(self.create_chapter(chapter).await?),
            ChapterRequest::Read(id) => ChapterReply::One(self.read_chapter(id)?),
            ChapterRequest::List => ChapterReply::Many(self.list_chapters()?),
            ChapterRequest::Update { id, data } => ChapterReply::One(self.update_chapter(id, &data).await?),
            ChapterRequest::Delete(id) => ChapterReply::One(self.delete_chapter(origin, id).await?),
        })
    }

    /// Store a new track in its chapter and announce it. The version
    /// starts at 0 with an empty history whatever the caller sent.
    pub async fn create_track(
        &self,
        origin: Uuid,
        scope: TrackScope,
        mut track: Track,
    ) -> Result<ChangeResponse, ReconcileError> {
        if track.id != scope.track_id {
            return Err(ReconcileError::BadRequest(format!(
                "track id {} does not match scope {}",
                track.id, scope.track_id
            )));
        }
        let lock = self.lock_for(scope.chapter_id);
        let _guard = lock.lock().await;

        let mut chapter = self.read_chapter(scope.chapter_id)?;
        if self.store.read(EntityKind::Track, track.id)?.is_some() {
            return Err(ReconcileError::AlreadyExists {
                kind: EntityKind::Track,
                id: track.id,
            });
        }
        track.version = 0;
        track.history = Default::default();
        self.store.write_track(&track)?;

        chapter.track_ids.push(track.id);
        chapter.updated_at = Timestamp::now();
        self.store.write_chapter(&chapter)?;

        log::info!("track {} created in chapter {}", track.id, chapter.id);
        self.channels
            .publish(origin, TrackMessage::new(scope, TrackMessageData::Created(track.clone())))
            .await;
        Ok(ChangeResponse::Created(track))
    }

    pub async fn delete_track(&self, origin: Uuid, scope: TrackScope) -> Result<ChangeResponse, ReconcileError> {
        let chapter_lock = self.lock_for(scope.chapter_id);
        let _chapter_guard = chapter_lock.lock().await;
        let track_lock = self.lock_for(scope.track_id);
        let _track_guard = track_lock.lock().await;

        let (mut chapter, track) = self.load(scope)?;
        self.store.delete(EntityKind::Track, track.id)?;
        self.forget_lock(track.id);
        chapter.track_ids.retain(|id| *id != track.id);
        chapter.updated_at = Timestamp::now();
        self.store.write_chapter(&chapter)?;

        log::info!("track {} deleted from chapter {}", track.id, chapter.id);
        self.channels
            .publish(origin, TrackMessage::new(scope, TrackMessageData::Deleted(track.clone())))
            .await;
        Ok(ChangeResponse::Deleted(track))
    }

    /// Reconcile a client delta. Version conflicts and unapplicable changes
    /// are answered with the current track, not an error.
    pub async fn submit(&self, origin: Uuid, scope: TrackScope, delta: &Delta) -> Result<ChangeResponse, ReconcileError> {
        let lock = self.lock_for(scope.track_id);
        let _guard = lock.lock().await;

        let (_, mut track) = self.load(scope)?;
        match reconcile(&mut track, delta, self.history_cap) {
            Reconciliation::Accepted(stamped) => {
                self.store.write_track(&track)?;
                log::debug!(
                    "track {} accepted {} changes from {}, now v{}",
                    track.id,
                    stamped.steps.len(),
                    delta.client_id,
                    track.version
                );
                self.channels
                    .publish(origin, TrackMessage::updated(scope, stamped.clone()))
                    .await;
                Ok(ChangeResponse::Applied(stamped))
            }
            Reconciliation::Noop => Ok(ChangeResponse::Applied(Delta::new(track.version, delta.client_id, vec![]))),
            Reconciliation::Rejected(Rejection::VersionConflict { expected, got }) => {
                log::debug!(
                    "track {} rejected delta from {}: at v{got}, track is v{expected}",
                    track.id,
                    delta.client_id
                );
                Ok(ChangeResponse::Current(track))
            }
            Reconciliation::Rejected(Rejection::Unapplicable(e)) => {
                log::warn!("track {} rejected delta from {}: {e}", track.id, delta.client_id);
                Ok(ChangeResponse::Current(track))
            }
        }
    }

    pub async fn handle(&self, origin: Uuid, message: TrackMessage) -> Result<ChangeResponse, ReconcileError> {
        match message.data {
            TrackMessageData::Created(track) => self.create_track(origin, message.scope, track).await,
            TrackMessageData::Updated(delta) => self.submit(origin, message.scope, &delta).await,
            TrackMessageData::Deleted(_) => self.delete_track(origin, message.scope).await,
        }
    }

    pub fn pull(&self, scope: TrackScope) -> Result<Track, ReconcileError> {
        self.load(scope).map(|(_, track)| track)
    }

    /// Deltas after `since` when the history still covers them, else the
    /// whole track.
    pub fn catch_up(&self, scope: TrackScope, since: u64) -> Result<PullResponse, ReconcileError> {
        let track = self.pull(scope)?;
        if since > track.version {
            return Ok(PullResponse::Snapshot(track));
        }
        Ok(match track.history.since(since) {
            Some(deltas) => PullResponse::Deltas(deltas),
            None => PullResponse::Snapshot(track),
        })
    }

    fn load(&self, scope: TrackScope) -> Result<(Chapter, Track), ReconcileError> {
        let chapter = self.read_chapter(scope.chapter_id)?;
        if !chapter.contains(scope.track_id) {
            return Err(ReconcileError::NotInChapter {
                chapter_id: scope.chapter_id,
                track_id: scope.track_id,
            });
        }
        let track = self.store.read_track(scope.track_id)?.ok_or(ReconcileError::NotFound {
            kind: EntityKind::Track,
            id: scope.track_id,
        })?;
        Ok((chapter, track))
    }
}
