//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use montage_collab::{
    ClientConfig, ClientError, ClientEvent, ConnectionState, ErrorCode, MessageType, PullRequest, PullResponse,
    ServerConfig, SyncClient, SyncMessage, SyncServer, TrackFilter, TrackMessage, TrackMessageData, TrackScope,
    TrackView, DEFAULT_HISTORY_CAP,
};
use montage_core::{
    Change, ChangeResponse, Chapter, Delta, DocNode, MediaContent, NodeType, Patch, Registry, Segment, SegmentKind,
    Step, Timestamp, Track, TrackContent,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port; returns its URL.
async fn start_test_server() -> (String, Arc<SyncServer>) {
    start_server(64, DEFAULT_HISTORY_CAP).await
}

async fn start_server(broadcast_capacity: usize, history_cap: usize) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity,
        history_cap,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn connected_client(url: &str) -> SyncClient {
    let mut client = SyncClient::new(Uuid::new_v4(), ClientConfig::new(url), Arc::new(Registry::standard()));
    client.connect().await.unwrap();
    client
}

/// A chapter holding one empty document track.
async fn setup_track(client: &SyncClient) -> TrackScope {
    let chapter = client.create_chapter(Chapter::new(Uuid::new_v4())).await.unwrap();
    let scope = TrackScope::new(chapter.id, Uuid::new_v4());
    client
        .create_track(scope, Track::empty_document(scope.track_id))
        .await
        .unwrap();
    scope
}

/// Next binary frame, decoded.
async fn next_message<S>(ws: &mut S) -> SyncMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Message::Binary(data) = ws.next().await.unwrap().unwrap() {
            return SyncMessage::decode(&data).unwrap();
        }
    }
}

fn space(label: &str) -> Change {
    Change::Step(Step::insert(1, vec![DocNode::new(NodeType::Space).with_attr("label", label)]))
}

/// Poll until every view has nothing pending and the same version.
async fn settle(clients: &[&SyncClient], track_id: Uuid) -> Vec<TrackView> {
    timeout(Duration::from_secs(5), async {
        loop {
            let mut views = Vec::new();
            for client in clients {
                views.push(client.view(track_id).await.unwrap());
            }
            let version = views[0].confirmed_version;
            if views.iter().all(|v| v.pending == 0 && v.confirmed_version == version) {
                return views;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not settle")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects() {
    let (url, server) = start_test_server().await;
    let mut client = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), Arc::new(Registry::standard()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ClientEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    // the first request proves the server side registered us
    setup_track(&client).await;
    assert_eq!(server.stats().await.active_connections, 1);
}

#[tokio::test]
async fn test_chapter_and_track_lifecycle() {
    let (url, _server) = start_test_server().await;
    let client = connected_client(&url).await;
    let scope = setup_track(&client).await;

    let chapter = client.read_chapter(scope.chapter_id).await.unwrap();
    assert_eq!(chapter.track_ids, vec![scope.track_id]);
    assert_eq!(client.open_track(scope).await.unwrap(), 0);

    let duplicate = client.create_track(scope, Track::empty_document(scope.track_id)).await;
    assert!(matches!(
        duplicate,
        Err(ClientError::Server {
            code: ErrorCode::AlreadyExists,
            ..
        })
    ));

    assert!(matches!(client.delete_track(scope).await, Ok(ChangeResponse::Deleted(_))));
    assert!(client.read_chapter(scope.chapter_id).await.unwrap().track_ids.is_empty());
}

#[tokio::test]
async fn test_open_unknown_track_is_not_found() {
    let (url, _server) = start_test_server().await;
    let client = connected_client(&url).await;
    let result = client.open_track(TrackScope::new(Uuid::new_v4(), Uuid::new_v4())).await;
    assert!(matches!(
        result,
        Err(ClientError::Server {
            code: ErrorCode::NotFound,
            ..
        })
    ));
}

#[tokio::test]
async fn test_single_client_edit_is_confirmed() {
    let (url, server) = start_test_server().await;
    let client = connected_client(&url).await;
    let scope = setup_track(&client).await;
    client.open_track(scope).await.unwrap();

    client.edit(scope.track_id, vec![space("a")]).await.unwrap();
    let views = settle(&[&client], scope.track_id).await;

    let stored = server.reconciler().pull(scope).unwrap();
    assert!(stored.version > 0);
    assert_eq!(views[0].confirmed_version, stored.version);
    assert_eq!(views[0].content, stored.content);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, server) = start_test_server().await;
    let alice = connected_client(&url).await;
    let bob = connected_client(&url).await;
    let scope = setup_track(&alice).await;
    alice.open_track(scope).await.unwrap();
    bob.open_track(scope).await.unwrap();

    // concurrent edits at the same position
    let (a, b) = tokio::join!(
        alice.edit(scope.track_id, vec![space("alice")]),
        bob.edit(scope.track_id, vec![space("bob")]),
    );
    a.unwrap();
    b.unwrap();
    for i in 0..3 {
        alice.edit(scope.track_id, vec![space(&format!("a{i}"))]).await.unwrap();
        bob.edit(scope.track_id, vec![space(&format!("b{i}"))]).await.unwrap();
    }

    let views = settle(&[&alice, &bob], scope.track_id).await;
    let stored = server.reconciler().pull(scope).unwrap();
    assert_eq!(views[0].content, views[1].content);
    assert_eq!(views[0].content, stored.content);
    assert_eq!(views[0].confirmed_version, stored.version);

    let montage_core::TrackContent::Document(page) = stored.content else {
        panic!("document track");
    };
    // 8 spaces inserted into the one paragraph
    assert_eq!(page.content[0].content.len(), 8);
}

#[tokio::test]
async fn test_remote_edit_emits_synced_event() {
    let (url, _server) = start_test_server().await;
    let alice = connected_client(&url).await;
    let mut bob = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), Arc::new(Registry::standard()));
    let mut events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    let scope = setup_track(&alice).await;
    alice.open_track(scope).await.unwrap();
    bob.open_track(scope).await.unwrap();
    alice.edit(scope.track_id, vec![space("x")]).await.unwrap();

    let synced = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Synced { track_id, version } = event {
                return (track_id, version);
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(synced.0, scope.track_id);
    assert!(synced.1 > 0);
}

#[tokio::test]
async fn test_stale_raw_delta_gets_current_track() {
    let (url, server) = start_test_server().await;
    let client = connected_client(&url).await;
    let scope = setup_track(&client).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let stale = TrackMessage::updated(scope, Delta::new(5, Uuid::new_v4(), vec![space("late")]));
    let request = SyncMessage::change(Uuid::new_v4(), 42, &stale).unwrap();
    ws.send(Message::Binary(request.encode().unwrap().into())).await.unwrap();

    let reply = next_message(&mut ws).await;
    assert_eq!(reply.request_id, 42);
    let response: ChangeResponse = reply.body(MessageType::Ack).unwrap();
    let ChangeResponse::Current(track) = response else {
        panic!("expected current, got {response:?}");
    };
    assert_eq!(track.version, 0);
    assert_eq!(server.reconciler().pull(scope).unwrap(), track);
}

#[tokio::test]
async fn test_raw_subscriber_sees_creation_and_catch_up() {
    let (url, _server) = start_test_server().await;
    let client = connected_client(&url).await;
    let chapter = client.create_chapter(Chapter::new(Uuid::new_v4())).await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let me = Uuid::new_v4();
    let subscribe = SyncMessage::subscribe(me, 1, &TrackFilter::chapter(chapter.id)).unwrap();
    ws.send(Message::Binary(subscribe.encode().unwrap().into())).await.unwrap();

    assert_eq!(next_message(&mut ws).await.msg_type, MessageType::Subscribe);

    let scope = TrackScope::new(chapter.id, Uuid::new_v4());
    client
        .create_track(scope, Track::empty_document(scope.track_id))
        .await
        .unwrap();
    let created = next_message(&mut ws).await;
    assert_eq!(created.msg_type, MessageType::Broadcast);
    let message: TrackMessage = created.body(MessageType::Broadcast).unwrap();
    assert!(matches!(message.data, TrackMessageData::Created(_)));

    let pull = SyncMessage::pull(me, 2, &PullRequest { scope, since: Some(0) }).unwrap();
    ws.send(Message::Binary(pull.encode().unwrap().into())).await.unwrap();
    let reply = next_message(&mut ws).await;
    assert_eq!(reply.request_id, 2);
    assert_eq!(reply.body::<PullResponse>(MessageType::Snapshot).unwrap(), PullResponse::Deltas(vec![]));
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let ping = SyncMessage::ping(Uuid::new_v4());
    ws.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), next_message(&mut ws)).await.unwrap();
    assert_eq!(reply.msg_type, MessageType::Pong);
}

/// Burst deltas from another writer past a one-slot broadcast buffer and
/// check the open client recovers.
async fn lagging_client_catches_up(history_cap: usize) {
    let (url, server) = start_server(1, history_cap).await;
    let mut client = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), Arc::new(Registry::standard()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let scope = setup_track(&client).await;
    client.open_track(scope).await.unwrap();

    // nothing else runs until the burst is done, so the forwarder falls behind
    let writer = Uuid::new_v4();
    tokio::task::unconstrained(async {
        for v in 0..8u64 {
            let delta = Delta::new(v, writer, vec![space(&format!("w{v}"))]);
            let response = server.reconciler().submit(writer, scope, &delta).await.unwrap();
            assert!(matches!(response, ChangeResponse::Applied(_)));
        }
    })
    .await;

    let lagged = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::OutOfSync { track_id } = event {
                return track_id;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(lagged, scope.track_id);

    let stored = server.reconciler().pull(scope).unwrap();
    assert_eq!(stored.version, 8);
    let view = timeout(Duration::from_secs(5), async {
        loop {
            let view = client.view(scope.track_id).await.unwrap();
            if view.confirmed_version == stored.version {
                return view;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not catch up");
    assert_eq!(view.pending, 0);
    assert_eq!(view.content, stored.content);
}

#[tokio::test]
async fn test_lagged_client_catches_up_from_history() {
    lagging_client_catches_up(DEFAULT_HISTORY_CAP).await;
}

#[tokio::test]
async fn test_lagged_client_beyond_history_pulls_snapshot() {
    lagging_client_catches_up(2).await;
}

#[tokio::test]
async fn test_media_update_conflict_converges_to_newer_segment() {
    let (url, server) = start_test_server().await;
    // no stamping: the edits carry their own timestamps
    let registry = Arc::new(Registry::empty());
    let mut alice = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), registry.clone());
    let mut bob = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), registry);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    let chapter = alice.create_chapter(Chapter::new(Uuid::new_v4())).await.unwrap();
    let scope = TrackScope::new(chapter.id, Uuid::new_v4());
    let mut clip = Segment::new(scope.track_id, SegmentKind::Frame, "clip.mp4", 0.0, 4.0);
    clip.updated_at = Timestamp(1_000);
    let track = Track::new(scope.track_id, TrackContent::Video(MediaContent::new().with_segment(clip.clone())));
    alice.create_track(scope, track).await.unwrap();
    alice.open_track(scope).await.unwrap();
    bob.open_track(scope).await.unwrap();

    let mut newer = clip.clone();
    newer.src = "alice.mp4".into();
    newer.offset = 1.5;
    newer.updated_at = Timestamp(3_000);
    let mut older = clip.clone();
    older.src = "bob.mp4".into();
    older.offset = 9.0;
    older.updated_at = Timestamp(2_000);

    let (a, b) = tokio::join!(
        alice.edit(scope.track_id, vec![Change::Patch(Patch::Updated(newer.clone()))]),
        bob.edit(scope.track_id, vec![Change::Patch(Patch::Updated(older))]),
    );
    a.unwrap();
    b.unwrap();

    let views = settle(&[&alice, &bob], scope.track_id).await;
    let stored = server.reconciler().pull(scope).unwrap();
    assert_eq!(stored.content.as_media().unwrap().segments[&clip.id], newer);
    for view in &views {
        assert_eq!(view.content, stored.content);
        assert_eq!(view.confirmed_version, stored.version);
    }
}

#[tokio::test]
async fn test_chapter_list_update_delete() {
    let (url, server) = start_test_server().await;
    let owner = connected_client(&url).await;
    let mut watcher = SyncClient::new(Uuid::new_v4(), ClientConfig::new(&url), Arc::new(Registry::standard()));
    let mut events = watcher.take_event_rx().unwrap();
    watcher.connect().await.unwrap();

    let scope = setup_track(&owner).await;
    let other = owner.create_chapter(Chapter::new(Uuid::new_v4())).await.unwrap();
    let listed: Vec<Uuid> = owner.list_chapters().await.unwrap().iter().map(|c| c.id).collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&scope.chapter_id) && listed.contains(&other.id));

    let project = Uuid::new_v4();
    let updated = owner
        .update_chapter(scope.chapter_id, serde_json::json!({ "projectId": project }))
        .await
        .unwrap();
    assert_eq!(updated.project_id, Some(project));
    assert_eq!(watcher.read_chapter(scope.chapter_id).await.unwrap(), updated);

    watcher.open_track(scope).await.unwrap();
    owner.open_track(scope).await.unwrap();
    let deleted = owner.delete_chapter(scope.chapter_id).await.unwrap();
    assert_eq!(deleted.track_ids, vec![scope.track_id]);
    assert!(matches!(owner.view(scope.track_id).await, Err(ClientError::TrackNotOpen(_))));

    let gone = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::TrackDeleted { scope } = event {
                return scope;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(gone, scope);
    assert!(server.reconciler().pull(scope).is_err());
    assert!(matches!(
        owner.read_chapter(scope.chapter_id).await,
        Err(ClientError::Server {
            code: ErrorCode::NotFound,
            ..
        })
    ));
    assert_eq!(owner.list_chapters().await.unwrap(), vec![other]);
}
