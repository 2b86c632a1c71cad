//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                      ┌── ChannelRegistry ──┬── track groups
//!            ├── connection task ───┤                     └── chapter groups
//! Client B ──┘        │             └── Reconciler ── EntityStore (RocksDB / memory)
//!                     │
//!                     └── one forwarding task per subscription
//! ```
//!
//! Each connection runs a select loop over its socket and an outgoing
//! queue. Requests are answered inline; subscription forwarders feed the
//! queue with broadcasts from other clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastError, ChannelRegistry, Subscription};
use crate::protocol::{
    ChapterRequest, ErrorCode, ErrorPayload, MessageType, ProtocolError, PullRequest, PullResponse, SyncMessage,
    TrackFilter, TrackMessage,
};
use crate::reconciler::{ReconcileError, Reconciler, DEFAULT_HISTORY_CAP};
use crate::storage::{EntityStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Deltas kept per track for catch-up
    pub history_cap: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            history_cap: DEFAULT_HISTORY_CAP,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SyncServer {
    config: ServerConfig,
    reconciler: Arc<Reconciler>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured store and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn EntityStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn EntityStore>) -> Self {
        let channels = Arc::new(ChannelRegistry::new(config.broadcast_capacity));
        let reconciler = Arc::new(Reconciler::new(store, channels, config.history_cap));
        Self {
            config,
            reconciler,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let reconciler = self.reconciler.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, reconciler, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        reconciler: Arc<Reconciler>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("websocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
        let mut connection = Connection {
            reconciler,
            out_tx,
            forwarders: HashMap::new(),
        };

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let request = match SyncMessage::decode(&data) {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        if let Some(reply) = connection.dispatch(request).await {
                            if let Err(e) = send_message(&mut ws_sender, &reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("websocket error from {addr}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                },
                Some(out) = out_rx.recv() => {
                    if let Err(e) = send_message(&mut ws_sender, &out).await {
                        break Err(e);
                    }
                }
            }
        };

        connection.close();
        stats.write().await.active_connections -= 1;
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }
}

/// Per-connection request handling and subscription bookkeeping.
struct Connection {
    reconciler: Arc<Reconciler>,
    out_tx: mpsc::UnboundedSender<SyncMessage>,
    forwarders: HashMap<TrackFilter, JoinHandle<()>>,
}

impl Connection {
    /// Answer one request. Returns the reply to send, if any.
    async fn dispatch(&mut self, request: SyncMessage) -> Option<SyncMessage> {
        let request_id = request.request_id;
        let reply = match request.msg_type {
            MessageType::Subscribe => self.subscribe(&request).await,
            MessageType::Unsubscribe => self.unsubscribe(&request),
            MessageType::Pull => self.pull(&request),
            MessageType::Change => self.change(&request).await,
            MessageType::Chapter => self.chapter(&request).await,
            MessageType::Ping => return Some(SyncMessage::pong(Uuid::nil())),
            other => {
                log::debug!("unhandled message type {other:?} from {}", request.client_id);
                return None;
            }
        };
        let reply = reply.or_else(|error| {
            log::debug!("request {request_id} from {} failed: {}", request.client_id, error.message);
            SyncMessage::error(request_id, &error)
        });
        match reply {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::error!("failed to encode reply to request {request_id}: {e}");
                None
            }
        }
    }

    async fn subscribe(&mut self, request: &SyncMessage) -> Result<SyncMessage, ErrorPayload> {
        let filter: TrackFilter = request.body(MessageType::Subscribe).map_err(bad_request)?;
        let subscription = self
            .reconciler
            .channels()
            .subscribe(filter, Some(request.client_id))
            .await
            .map_err(|e| ErrorPayload::new(ErrorCode::BadRequest, e.to_string()))?;
        let handle = tokio::spawn(forward(subscription, self.out_tx.clone()));
        if let Some(previous) = self.forwarders.insert(filter, handle) {
            previous.abort();
        }
        SyncMessage::subscribe(Uuid::nil(), request.request_id, &filter).map_err(internal)
    }

    fn unsubscribe(&mut self, request: &SyncMessage) -> Result<SyncMessage, ErrorPayload> {
        let filter: TrackFilter = request.body(MessageType::Unsubscribe).map_err(bad_request)?;
        if let Some(handle) = self.forwarders.remove(&filter) {
            handle.abort();
        }
        SyncMessage::unsubscribe(Uuid::nil(), request.request_id, &filter).map_err(internal)
    }

    fn pull(&self, request: &SyncMessage) -> Result<SyncMessage, ErrorPayload> {
        let pull: PullRequest = request.body(MessageType::Pull).map_err(bad_request)?;
        let response = match pull.since {
            Some(since) => self.reconciler.catch_up(pull.scope, since),
            None => self.reconciler.pull(pull.scope).map(PullResponse::Snapshot),
        }
        .map_err(rejected)?;
        SyncMessage::snapshot(request.request_id, &response).map_err(internal)
    }

    async fn change(&self, request: &SyncMessage) -> Result<SyncMessage, ErrorPayload> {
        let message: TrackMessage = request.body(MessageType::Change).map_err(bad_request)?;
        let response = self
            .reconciler
            .handle(request.client_id, message)
            .await
            .map_err(rejected)?;
        SyncMessage::ack(request.request_id, &response).map_err(internal)
    }

    async fn chapter(&self, request: &SyncMessage) -> Result<SyncMessage, ErrorPayload> {
        let chapter_request: ChapterRequest = request.body(MessageType::Chapter).map_err(bad_request)?;
        let reply = self
            .reconciler
            .handle_chapter(request.client_id, chapter_request)
            .await
            .map_err(rejected)?;
        SyncMessage::chapter(request.request_id, &reply).map_err(internal)
    }

    fn close(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

async fn send_message<S>(sink: &mut S, message: &SyncMessage) -> Result<(), ServerError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(message.encode()?.into())).await?;
    Ok(())
}

/// Push a subscription's broadcasts onto the connection's outgoing queue.
async fn forward(mut subscription: Subscription, out: mpsc::UnboundedSender<SyncMessage>) {
    loop {
        let message = match subscription.recv().await {
            Ok(published) => SyncMessage::broadcast(published.origin, &published.message),
            Err(BroadcastError::Lagged(missed)) => {
                let mut error = ErrorPayload::new(ErrorCode::OutOfSync, format!("missed {missed} messages"));
                error.filter = Some(*subscription.filter());
                SyncMessage::error(0, &error)
            }
            Err(_) => break,
        };
        match message {
            Ok(message) => {
                if out.send(message).is_err() {
                    break;
                }
            }
            Err(e) => log::error!("failed to encode broadcast: {e}"),
        }
    }
}

fn bad_request(e: ProtocolError) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::BadRequest, e.to_string())
}

fn internal(e: ProtocolError) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::Internal, e.to_string())
}

fn rejected(e: ReconcileError) -> ErrorPayload {
    if let ReconcileError::Store(store) = &e {
        log::error!("store failure: {store}");
    }
    ErrorPayload::new(e.code(), e.to_string())
}
