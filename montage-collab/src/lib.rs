//! # montage-collab: networked track synchronization
//!
//! Moves `montage-core` deltas between editors and the authoritative
//! server over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncEngine  │                     │ Reconciler  │──► EntityStore
//! │ (per track) │                     │ (authority) │    (RocksDB)
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ ChannelRegistry │
//!                                   │ (track/chapter) │
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary envelope (bincode) around JSON track messages
//! - [`broadcast`]: per-track and per-chapter fan-out with backpressure
//! - [`reconciler`]: serialized per-track acceptance, persistence, publishing
//! - [`storage`]: entity store trait, in-memory and RocksDB implementations
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client driving one engine per open track

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastError, BroadcastGroup, BroadcastStats, ChannelKey, ChannelRegistry, Published, Subscription};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, SyncClient, TrackView};
pub use protocol::{
    ChapterReply, ChapterRequest, ErrorCode, ErrorPayload, MessageType, ProtocolError, PullRequest, PullResponse, SyncMessage,
    TrackFilter, TrackMessage, TrackMessageData, TrackScope,
};
pub use reconciler::{ReconcileError, Reconciler, DEFAULT_HISTORY_CAP};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{EntityKind, EntityStore, EntityStoreExt, MemoryStore, RocksStore, StoreConfig, StoreError};
