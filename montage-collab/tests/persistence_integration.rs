//! Persistence integration tests.
//!
//! Verifies:
//! - Accepted deltas survive a reopen of the RocksDB store
//! - History survives too, so catch-up works after a restart
//! - Chapters and their track lists persist
//! - Media tracks round-trip through compressed storage

use std::sync::Arc;

use montage_collab::{
    ChannelRegistry, EntityStoreExt, PullResponse, Reconciler, RocksStore, ServerConfig, StoreConfig, SyncServer,
    TrackScope,
};
use montage_core::{
    Change, ChangeResponse, Chapter, Delta, DocNode, MediaContent, NodeType, Patch, Segment, SegmentKind, Step,
    Timestamp, Track, TrackContent, TrackKind,
};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_reconciler(path: &std::path::Path, history_cap: usize) -> Reconciler {
    let store = RocksStore::open(StoreConfig::for_testing(path)).unwrap();
    Reconciler::new(Arc::new(store), Arc::new(ChannelRegistry::new(16)), history_cap)
}

async fn create_track(reconciler: &Reconciler, track: Track) -> TrackScope {
    let chapter = reconciler.create_chapter(Chapter::new(Uuid::new_v4())).await.unwrap();
    let scope = TrackScope::new(chapter.id, track.id);
    reconciler.create_track(Uuid::nil(), scope, track).await.unwrap();
    scope
}

fn space(version: u64) -> Delta {
    let node = DocNode::new(NodeType::Space).with_attr("n", version);
    Delta::new(version, Uuid::new_v4(), vec![Change::Step(Step::insert(1, vec![node]))])
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_accepted_deltas_survive_reopen() {
    let dir = tempdir().unwrap();
    let (scope, before) = {
        let reconciler = open_reconciler(dir.path(), 1000);
        let scope = create_track(&reconciler, Track::empty_document(Uuid::new_v4())).await;
        for v in 0..10 {
            let response = reconciler.submit(Uuid::nil(), scope, &space(v)).await.unwrap();
            assert!(matches!(response, ChangeResponse::Applied(_)));
        }
        (scope, reconciler.pull(scope).unwrap())
    };

    let reconciler = open_reconciler(dir.path(), 1000);
    let after = reconciler.pull(scope).unwrap();
    assert_eq!(after, before);
    assert_eq!(after.version, 10);

    // the reopened track keeps accepting from where it left off
    let response = reconciler.submit(Uuid::nil(), scope, &space(10)).await.unwrap();
    assert!(matches!(response, ChangeResponse::Applied(d) if d.version == 11));
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let scope = {
        let reconciler = open_reconciler(dir.path(), 4);
        let scope = create_track(&reconciler, Track::empty_document(Uuid::new_v4())).await;
        for v in 0..6 {
            reconciler.submit(Uuid::nil(), scope, &space(v)).await.unwrap();
        }
        scope
    };

    let reconciler = open_reconciler(dir.path(), 4);
    let PullResponse::Deltas(deltas) = reconciler.catch_up(scope, 3).unwrap() else {
        panic!("history should cover version 3");
    };
    assert_eq!(deltas.iter().map(|d| d.version).collect::<Vec<_>>(), vec![4, 5, 6]);
    assert!(matches!(reconciler.catch_up(scope, 1).unwrap(), PullResponse::Snapshot(_)));
}

#[tokio::test]
async fn test_chapter_membership_persists() {
    let dir = tempdir().unwrap();
    let (chapter_id, kept, deleted) = {
        let reconciler = open_reconciler(dir.path(), 1000);
        let kept = create_track(&reconciler, Track::empty_document(Uuid::new_v4())).await;
        let deleted = TrackScope::new(kept.chapter_id, Uuid::new_v4());
        reconciler
            .create_track(Uuid::nil(), deleted, Track::empty_document(deleted.track_id))
            .await
            .unwrap();
        reconciler.delete_track(Uuid::nil(), deleted).await.unwrap();
        (kept.chapter_id, kept, deleted)
    };

    let reconciler = open_reconciler(dir.path(), 1000);
    assert_eq!(reconciler.read_chapter(chapter_id).unwrap().track_ids, vec![kept.track_id]);
    assert!(reconciler.pull(deleted).is_err());
}

#[tokio::test]
async fn test_media_track_roundtrip() {
    let dir = tempdir().unwrap();
    let track_id = Uuid::new_v4();
    let mut segment = Segment::new(track_id, SegmentKind::Frame, "clip.mp4", 0.0, 4.0);
    segment.updated_at = Timestamp(1_000);
    let track = Track::new(track_id, TrackContent::Video(MediaContent::new().with_segment(segment.clone())));

    let scope = {
        let reconciler = open_reconciler(dir.path(), 1000);
        let scope = create_track(&reconciler, track).await;
        let mut moved = segment.clone();
        moved.offset = 2.5;
        moved.updated_at = Timestamp(2_000);
        let delta = Delta::new(0, Uuid::new_v4(), vec![Change::Patch(Patch::Updated(moved))]);
        reconciler.submit(Uuid::nil(), scope, &delta).await.unwrap();
        scope
    };

    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let stored = store.read_track(scope.track_id).unwrap().unwrap();
    assert_eq!(stored.kind(), TrackKind::Video);
    let media = stored.content.as_media().unwrap();
    assert_eq!(media.segments[&segment.id].offset, 2.5);
}

#[tokio::test]
async fn test_server_persistence_config() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::default()
    };
    let scope = {
        let server = SyncServer::new(config.clone()).unwrap();
        create_track(server.reconciler(), Track::empty_document(Uuid::new_v4())).await
    };
    let server = SyncServer::new(config).unwrap();
    assert_eq!(server.reconciler().pull(scope).unwrap().version, 0);
}
