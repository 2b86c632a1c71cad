//! WebSocket sync client.
//!
//! A [`SyncClient`] is a handle; the connection is owned by a driver task
//! holding one [`SyncEngine`] per open track. Edits, acknowledgments and
//! broadcasts are serialized through that task, so a replica never sees
//! two changes at once. At most one batch per track is in flight; edits
//! made meanwhile queue behind it.
//!
//! A reconnect starts from nothing: open tracks must be opened again,
//! which pulls a fresh snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use montage_core::{
    Change, ChangeResponse, Chapter, Registry, SegmentChanges, SyncConfig, SyncEngine, SyncError, SyncOutcome,
    Timestamp, Track, TrackContent,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ChapterRequest, ErrorCode, ErrorPayload, MessageType, ProtocolError, PullRequest, PullResponse, SyncMessage,
    TrackFilter, TrackMessage, TrackMessageData, TrackScope,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub request_timeout: Duration,
    /// Events buffered for the application
    pub event_capacity: usize,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(10),
            event_capacity: 256,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The replica's segments changed through a remote delta or an ack.
    SegmentsChanged { track_id: Uuid, changes: SegmentChanges },
    /// The confirmed version advanced.
    Synced { track_id: Uuid, version: u64 },
    /// Pending edits were discarded and the replica replaced by the
    /// server's state.
    Resynced { track_id: Uuid, version: u64 },
    /// The server dropped broadcasts for this track; a catch-up pull follows.
    OutOfSync { track_id: Uuid },
    TrackCreated { scope: TrackScope },
    TrackDeleted { scope: TrackScope },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("track {0} is not open")]
    TrackNotOpen(Uuid),
}

impl From<ErrorPayload> for ClientError {
    fn from(e: ErrorPayload) -> Self {
        Self::Server {
            code: e.code,
            message: e.message,
        }
    }
}

/// What an open track looks like locally.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackView {
    pub scope: TrackScope,
    pub confirmed_version: u64,
    pub content: TrackContent,
    pub pending: usize,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Chapter(ChapterRequest, Reply<Chapter>),
    ListChapters(Reply<Vec<Chapter>>),
    CreateTrack(TrackScope, Track, Reply<ChangeResponse>),
    DeleteTrack(TrackScope, Reply<ChangeResponse>),
    Open(TrackScope, Reply<u64>),
    Close(Uuid, Reply<()>),
    Edit(Uuid, Vec<Change>, Reply<SegmentChanges>),
    View(Uuid, Reply<TrackView>),
    Shutdown,
}

/// The sync client.
pub struct SyncClient {
    client_id: Uuid,
    config: ClientConfig,
    registry: Arc<Registry>,
    state: Arc<RwLock<ConnectionState>>,
    commands: Option<mpsc::Sender<Command>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(client_id: Uuid, config: ClientConfig, registry: Arc<Registry>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            client_id,
            config,
            registry,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            commands: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and spawn the writer and driver tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connection(e.to_string()));
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (command_tx, command_rx) = mpsc::channel(64);
        self.commands = Some(command_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(ClientEvent::Connected);
        log::info!("client {} connected to {}", self.client_id, self.config.server_url);

        let driver = Driver {
            client_id: self.client_id,
            registry: self.registry.clone(),
            sync_config: self.config.sync.clone(),
            out: out_tx,
            events: self.event_tx.clone(),
            tracks: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
        };
        let state = self.state.clone();
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            driver.run(command_rx, ws_reader).await;
            *state.write().await = ConnectionState::Disconnected;
            let _ = events.try_send(ClientEvent::Disconnected);
        });
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown).await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ClientError> {
        let commands = self.commands.as_ref().ok_or(ClientError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        commands.send(build(tx)).await.map_err(|_| ClientError::NotConnected)?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn create_chapter(&self, chapter: Chapter) -> Result<Chapter, ClientError> {
        self.request(|reply| Command::Chapter(ChapterRequest::Create(chapter), reply))
            .await
    }

    pub async fn read_chapter(&self, id: Uuid) -> Result<Chapter, ClientError> {
        self.request(|reply| Command::Chapter(ChapterRequest::Read(id), reply)).await
    }

    pub async fn list_chapters(&self) -> Result<Vec<Chapter>, ClientError> {
        self.request(Command::ListChapters).await
    }

    /// Shallow-merge `data` into the chapter's fields.
    pub async fn update_chapter(&self, id: Uuid, data: serde_json::Value) -> Result<Chapter, ClientError> {
        self.request(|reply| Command::Chapter(ChapterRequest::Update { id, data }, reply))
            .await
    }

    /// Delete the chapter and its tracks. Open tracks in it are closed.
    pub async fn delete_chapter(&self, id: Uuid) -> Result<Chapter, ClientError> {
        self.request(|reply| Command::Chapter(ChapterRequest::Delete(id), reply))
            .await
    }

    pub async fn create_track(&self, scope: TrackScope, track: Track) -> Result<ChangeResponse, ClientError> {
        self.request(|reply| Command::CreateTrack(scope, track, reply)).await
    }

    pub async fn delete_track(&self, scope: TrackScope) -> Result<ChangeResponse, ClientError> {
        self.request(|reply| Command::DeleteTrack(scope, reply)).await
    }

    /// Subscribe to a track and load its snapshot. Returns the version.
    pub async fn open_track(&self, scope: TrackScope) -> Result<u64, ClientError> {
        self.request(|reply| Command::Open(scope, reply)).await
    }

    pub async fn close_track(&self, track_id: Uuid) -> Result<(), ClientError> {
        self.request(|reply| Command::Close(track_id, reply)).await
    }

    /// Apply changes to the local replica and queue them for the server.
    pub async fn edit(&self, track_id: Uuid, changes: Vec<Change>) -> Result<SegmentChanges, ClientError> {
        self.request(|reply| Command::Edit(track_id, changes, reply)).await
    }

    pub async fn view(&self, track_id: Uuid) -> Result<TrackView, ClientError> {
        self.request(|reply| Command::View(track_id, reply)).await
    }
}

/// A request awaiting its reply from the server.
enum Pending {
    Chapter(Reply<Chapter>),
    Chapters(Reply<Vec<Chapter>>),
    ChapterDeleted(Uuid, Reply<Chapter>),
    Entity(Reply<ChangeResponse>),
    Subscribed,
    Open(TrackScope, Reply<u64>),
    Resync(Uuid),
    Send(Uuid),
}

struct OpenTrack {
    scope: TrackScope,
    engine: SyncEngine,
}

struct Driver {
    client_id: Uuid,
    registry: Arc<Registry>,
    sync_config: SyncConfig,
    out: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<ClientEvent>,
    tracks: HashMap<Uuid, OpenTrack>,
    pending: HashMap<u64, Pending>,
    next_request: u64,
}

impl Driver {
    async fn run<R>(mut self, mut commands: mpsc::Receiver<Command>, mut reader: R)
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(message) => self.on_message(message).await,
                        Err(e) => log::warn!("client {} failed to decode message: {e}", self.client_id),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::error!("client {} connection error: {e}", self.client_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
        log::info!("client {} disconnected", self.client_id);
    }

    /// Send a request, registering what to do with its reply.
    async fn send(
        &mut self,
        pending: Pending,
        build: impl FnOnce(u64) -> Result<SyncMessage, ProtocolError>,
    ) -> Result<(), (Pending, ClientError)> {
        let request_id = self.next_request;
        self.next_request += 1;
        let bytes = match build(request_id).and_then(|m| m.encode()) {
            Ok(bytes) => bytes,
            Err(e) => return Err((pending, e.into())),
        };
        self.pending.insert(request_id, pending);
        if self.out.send(bytes).await.is_err() {
            let pending = self.pending.remove(&request_id);
            return Err((pending.unwrap_or(Pending::Subscribed), ClientError::NotConnected));
        }
        Ok(())
    }

    /// Events are dropped rather than stalling the driver when the
    /// application stops reading them.
    async fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("client {} event buffer full, dropped {event:?}", self.client_id);
        }
    }

    async fn on_command(&mut self, command: Command) {
        let client_id = self.client_id;
        let failed = match command {
            Command::Chapter(request, reply) => {
                let pending = match request {
                    ChapterRequest::Delete(chapter_id) => Pending::ChapterDeleted(chapter_id, reply),
                    _ => Pending::Chapter(reply),
                };
                self.send(pending, |id| SyncMessage::chapter_request(client_id, id, &request))
                    .await
                    .err()
            }
            Command::ListChapters(reply) => self
                .send(Pending::Chapters(reply), |id| {
                    SyncMessage::chapter_request(client_id, id, &ChapterRequest::List)
                })
                .await
                .err(),
            Command::CreateTrack(scope, track, reply) => self
                .send(Pending::Entity(reply), |id| {
                    SyncMessage::change(client_id, id, &TrackMessage::new(scope, TrackMessageData::Created(track)))
                })
                .await
                .err(),
            Command::DeleteTrack(scope, reply) => {
                let track = Track::empty_document(scope.track_id);
                self.send(Pending::Entity(reply), |id| {
                    SyncMessage::change(client_id, id, &TrackMessage::new(scope, TrackMessageData::Deleted(track)))
                })
                .await
                .err()
            }
            Command::Open(scope, reply) => {
                let filter = TrackFilter::scope(scope);
                match self
                    .send(Pending::Subscribed, |id| SyncMessage::subscribe(client_id, id, &filter))
                    .await
                {
                    Err((_, e)) => {
                        let _ = reply.send(Err(e));
                        None
                    }
                    Ok(()) => self
                        .send(Pending::Open(scope, reply), |id| {
                            SyncMessage::pull(client_id, id, &PullRequest { scope, since: None })
                        })
                        .await
                        .err(),
                }
            }
            Command::Close(track_id, reply) => {
                let result = match self.tracks.remove(&track_id) {
                    Some(open) => {
                        let filter = TrackFilter::scope(open.scope);
                        self.send(Pending::Subscribed, |id| SyncMessage::unsubscribe(client_id, id, &filter))
                            .await
                            .map_err(|(_, e)| e)
                    }
                    None => Err(ClientError::TrackNotOpen(track_id)),
                };
                let _ = reply.send(result);
                None
            }
            Command::Edit(track_id, changes, reply) => {
                let result = match self.tracks.get_mut(&track_id) {
                    Some(open) => open
                        .engine
                        .apply_local(changes, Timestamp::now())
                        .map_err(ClientError::from),
                    None => Err(ClientError::TrackNotOpen(track_id)),
                };
                let applied = result.is_ok();
                let _ = reply.send(result);
                if applied {
                    self.flush(track_id).await;
                }
                None
            }
            Command::View(track_id, reply) => {
                let view = self
                    .tracks
                    .get(&track_id)
                    .map(|open| TrackView {
                        scope: open.scope,
                        confirmed_version: open.engine.confirmed_version(),
                        content: open.engine.local_content(),
                        pending: open.engine.unconfirmed().len(),
                    })
                    .ok_or(ClientError::TrackNotOpen(track_id));
                let _ = reply.send(view);
                None
            }
            Command::Shutdown => None,
        };
        if let Some((pending, e)) = failed {
            self.fail(pending, e).await;
        }
    }

    /// Complete a pending request with an error.
    async fn fail(&mut self, pending: Pending, e: ClientError) {
        match pending {
            Pending::Chapter(reply) | Pending::ChapterDeleted(_, reply) => {
                let _ = reply.send(Err(e));
            }
            Pending::Chapters(reply) => {
                let _ = reply.send(Err(e));
            }
            Pending::Entity(reply) => {
                let _ = reply.send(Err(e));
            }
            Pending::Open(_, reply) => {
                let _ = reply.send(Err(e));
            }
            Pending::Send(track_id) => {
                if let Some(open) = self.tracks.get_mut(&track_id) {
                    open.engine.send_failed();
                }
                self.emit(ClientEvent::Error(e.to_string())).await;
            }
            Pending::Resync(_) | Pending::Subscribed => self.emit(ClientEvent::Error(e.to_string())).await,
        }
    }

    /// Send the track's queued changes if nothing is in flight.
    async fn flush(&mut self, track_id: Uuid) {
        let client_id = self.client_id;
        let Some(open) = self.tracks.get_mut(&track_id) else {
            return;
        };
        let scope = open.scope;
        let Some(delta) = open.engine.begin_send() else {
            return;
        };
        let message = TrackMessage::updated(scope, delta);
        match self
            .send(Pending::Send(track_id), |id| SyncMessage::change(client_id, id, &message))
            .await
        {
            Ok(()) => {
                if let Some(open) = self.tracks.get_mut(&track_id) {
                    open.engine.mark_sent();
                }
            }
            Err((pending, e)) => self.fail(pending, e).await,
        }
    }

    /// Ask for what the replica is missing: the deltas after `since`, or
    /// the whole track when `since` is `None` or history no longer covers it.
    async fn pull(&mut self, scope: TrackScope, since: Option<u64>) {
        let client_id = self.client_id;
        let sent = self
            .send(Pending::Resync(scope.track_id), |id| {
                SyncMessage::pull(client_id, id, &PullRequest { scope, since })
            })
            .await;
        if let Err((pending, e)) = sent {
            self.fail(pending, e).await;
        }
    }

    async fn on_outcome(&mut self, track_id: Uuid, outcome: Result<SyncOutcome, SyncError>) {
        let Some(open) = self.tracks.get(&track_id) else {
            return;
        };
        let version = open.engine.confirmed_version();
        let scope = open.scope;
        match outcome {
            Ok(SyncOutcome::Applied(changes)) => {
                if !changes.is_empty() {
                    self.emit(ClientEvent::SegmentsChanged { track_id, changes }).await;
                }
                self.emit(ClientEvent::Synced { track_id, version }).await;
            }
            Ok(SyncOutcome::Reset(changes)) => {
                self.emit(ClientEvent::Resynced { track_id, version }).await;
                if !changes.is_empty() {
                    self.emit(ClientEvent::SegmentsChanged { track_id, changes }).await;
                }
            }
            Ok(SyncOutcome::Retry) | Ok(SyncOutcome::Ignored) => {}
            Ok(SyncOutcome::NeedsSnapshot) => {
                log::info!("client {} catching up track {track_id} from v{version}", self.client_id);
                self.pull(scope, Some(version)).await;
            }
            Err(e) => {
                log::warn!("client {} failed to apply to track {track_id}: {e}", self.client_id);
                self.emit(ClientEvent::Error(e.to_string())).await;
                self.pull(scope, None).await;
            }
        }
        self.flush(track_id).await;
    }

    async fn on_message(&mut self, message: SyncMessage) {
        match message.msg_type {
            MessageType::Broadcast => match message.body::<TrackMessage>(MessageType::Broadcast) {
                Ok(broadcast) => self.on_broadcast(broadcast).await,
                Err(e) => log::warn!("client {} got a bad broadcast: {e}", self.client_id),
            },
            MessageType::Error if message.request_id == 0 => {
                // unsolicited: a subscription lagged
                if let Ok(error) = message.body::<ErrorPayload>(MessageType::Error) {
                    log::warn!("client {} out of sync: {}", self.client_id, error.message);
                    let lagged: Vec<(TrackScope, u64)> = self
                        .tracks
                        .values()
                        .filter(|open| error.filter.is_none_or(|f| f.matches(&open.scope)))
                        .map(|open| (open.scope, open.engine.confirmed_version()))
                        .collect();
                    for (scope, version) in lagged {
                        self.emit(ClientEvent::OutOfSync {
                            track_id: scope.track_id,
                        })
                        .await;
                        self.pull(scope, Some(version)).await;
                    }
                }
            }
            MessageType::Pong => {}
            _ => match self.pending.remove(&message.request_id) {
                Some(pending) => self.on_reply(pending, message).await,
                None => log::debug!(
                    "client {} got {:?} for unknown request {}",
                    self.client_id,
                    message.msg_type,
                    message.request_id
                ),
            },
        }
    }

    async fn on_broadcast(&mut self, broadcast: TrackMessage) {
        let scope = broadcast.scope;
        match broadcast.data {
            TrackMessageData::Updated(delta) => {
                let Some(open) = self.tracks.get_mut(&scope.track_id) else {
                    return;
                };
                let outcome = open.engine.receive_remote(&delta);
                self.on_outcome(scope.track_id, outcome).await;
            }
            TrackMessageData::Created(_) => self.emit(ClientEvent::TrackCreated { scope }).await,
            TrackMessageData::Deleted(_) => {
                self.tracks.remove(&scope.track_id);
                self.emit(ClientEvent::TrackDeleted { scope }).await;
            }
        }
    }

    async fn on_reply(&mut self, pending: Pending, message: SyncMessage) {
        if message.msg_type == MessageType::Error {
            let error = match message.body::<ErrorPayload>(MessageType::Error) {
                Ok(error) => ClientError::from(error),
                Err(e) => e.into(),
            };
            return self.fail(pending, error).await;
        }
        match pending {
            Pending::Chapter(reply) => {
                let _ = reply.send(message.body(MessageType::Chapter).map_err(ClientError::from));
            }
            Pending::Chapters(reply) => {
                let _ = reply.send(message.body(MessageType::Chapter).map_err(ClientError::from));
            }
            Pending::ChapterDeleted(chapter_id, reply) => {
                self.tracks.retain(|_, open| open.scope.chapter_id != chapter_id);
                let _ = reply.send(message.body(MessageType::Chapter).map_err(ClientError::from));
            }
            Pending::Entity(reply) => {
                let _ = reply.send(message.body(MessageType::Ack).map_err(ClientError::from));
            }
            Pending::Subscribed => {}
            Pending::Open(scope, reply) => {
                let result = self.open(scope, &message);
                let _ = reply.send(result);
            }
            Pending::Resync(track_id) => match message.body::<PullResponse>(MessageType::Snapshot) {
                Ok(PullResponse::Snapshot(track)) => {
                    let Some(open) = self.tracks.get_mut(&track_id) else {
                        return;
                    };
                    let outcome = open.engine.resync(&track);
                    self.on_outcome(track_id, outcome).await;
                }
                Ok(PullResponse::Deltas(deltas)) => {
                    for delta in deltas {
                        let Some(open) = self.tracks.get_mut(&track_id) else {
                            return;
                        };
                        let scope = open.scope;
                        match open.engine.receive_remote(&delta) {
                            // history did not line up with the replica
                            Ok(SyncOutcome::NeedsSnapshot) => return self.pull(scope, None).await,
                            outcome => self.on_outcome(track_id, outcome).await,
                        }
                    }
                }
                Err(e) => self.emit(ClientEvent::Error(e.to_string())).await,
            },
            Pending::Send(track_id) => {
                let response = match message.body::<ChangeResponse>(MessageType::Ack) {
                    Ok(response) => response,
                    Err(e) => return self.fail(Pending::Send(track_id), e.into()).await,
                };
                let Some(open) = self.tracks.get_mut(&track_id) else {
                    return;
                };
                let outcome = open.engine.receive_response(&response);
                self.on_outcome(track_id, outcome).await;
            }
        }
    }

    fn open(&mut self, scope: TrackScope, message: &SyncMessage) -> Result<u64, ClientError> {
        let track = match message.body::<PullResponse>(MessageType::Snapshot)? {
            PullResponse::Snapshot(track) => track,
            PullResponse::Deltas(_) => {
                return Err(ProtocolError::Deserialization("expected a track snapshot".into()).into())
            }
        };
        let engine = SyncEngine::new(self.client_id, &track, self.registry.clone(), self.sync_config.clone())?;
        let version = engine.confirmed_version();
        self.tracks.insert(scope.track_id, OpenTrack { scope, engine });
        log::debug!("client {} opened track {} at v{version}", self.client_id, scope.track_id);
        Ok(version)
    }
}
