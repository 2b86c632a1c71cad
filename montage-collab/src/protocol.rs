//! Binary envelope protocol carrying JSON track messages.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────────┐
//! │ msg_type │ client_id │ request_id │ payload      │
//! │ 1 byte   │ 16 bytes  │ varint     │ JSON, varlen │
//! └──────────┴───────────┴────────────┴──────────────┘
//! ```
//!
//! Requests carry a client-chosen `request_id`; the reply (`Snapshot`,
//! `Ack`, `Chapter` or `Error`) echoes it. Broadcasts use request id 0 and
//! carry the originating client in `client_id`.

use montage_core::{ChangeResponse, Chapter, Delta, Track};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Start receiving track messages matching a [`TrackFilter`];
    /// echoed back once the subscription is live
    Subscribe = 1,
    /// Stop receiving messages for a filter; echoed back
    Unsubscribe = 2,
    /// Request a track snapshot, or the deltas since a version
    Pull = 3,
    /// Reply to `Pull`
    Snapshot = 4,
    /// A [`TrackMessage`] submitted by a client
    Change = 5,
    /// Reply to `Change`: a [`ChangeResponse`]
    Ack = 6,
    /// A reconciled [`TrackMessage`] fanned out to subscribers
    Broadcast = 7,
    /// Reply to any request that failed
    Error = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
    /// Chapter create / read / list / update / delete request, and its reply
    Chapter = 11,
}

/// Which chapter and track a message concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackScope {
    pub chapter_id: Uuid,
    pub track_id: Uuid,
}

impl TrackScope {
    pub fn new(chapter_id: Uuid, track_id: Uuid) -> Self {
        Self { chapter_id, track_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum TrackMessageData {
    Created(Track),
    Updated(Delta),
    Deleted(Track),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMessage {
    #[serde(rename = "where")]
    pub scope: TrackScope,
    pub data: TrackMessageData,
}

impl TrackMessage {
    pub fn new(scope: TrackScope, data: TrackMessageData) -> Self {
        Self { scope, data }
    }

    pub fn updated(scope: TrackScope, delta: Delta) -> Self {
        Self::new(scope, TrackMessageData::Updated(delta))
    }
}

/// Subscription filter: a chapter, a track, or a track within a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<Uuid>,
}

impl TrackFilter {
    pub fn chapter(chapter_id: Uuid) -> Self {
        Self {
            chapter_id: Some(chapter_id),
            track_id: None,
        }
    }

    pub fn track(track_id: Uuid) -> Self {
        Self {
            chapter_id: None,
            track_id: Some(track_id),
        }
    }

    pub fn scope(scope: TrackScope) -> Self {
        Self {
            chapter_id: Some(scope.chapter_id),
            track_id: Some(scope.track_id),
        }
    }

    pub fn matches(&self, scope: &TrackScope) -> bool {
        self.chapter_id.is_none_or(|c| c == scope.chapter_id) && self.track_id.is_none_or(|t| t == scope.track_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(rename = "where")]
    pub scope: TrackScope,
    /// Ask for deltas after this version instead of a full snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

/// Reply to a pull: missed deltas when history still covers them,
/// otherwise the whole track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum PullResponse {
    Deltas(Vec<Delta>),
    Snapshot(Track),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "lowercase")]
pub enum ChapterRequest {
    Create(Chapter),
    Read(Uuid),
    List,
    /// Shallow-merge `data` into the chapter. `id`, `trackIds` and
    /// `createdAt` are not writable this way.
    Update {
        id: Uuid,
        data: serde_json::Value,
    },
    /// Remove the chapter and every track in it.
    Delete(Uuid),
}

/// Reply to a [`ChapterRequest`]: one chapter, or all of them for `List`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChapterReply {
    One(Chapter),
    Many(Vec<Chapter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    BadRequest,
    /// A subscriber fell behind the broadcast buffer and must pull.
    OutOfSync,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// Set for `OutOfSync`: the subscription that lagged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TrackFilter>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            filter: None,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    /// Correlates a reply with its request; 0 for unsolicited messages.
    pub request_id: u64,
    /// JSON payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Build a message whose payload is `body` as JSON.
    pub fn json<T: Serialize>(
        msg_type: MessageType,
        client_id: Uuid,
        request_id: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            client_id,
            request_id,
            payload,
        })
    }

    fn empty(msg_type: MessageType, client_id: Uuid, request_id: u64) -> Self {
        Self {
            msg_type,
            client_id,
            request_id,
            payload: Vec::new(),
        }
    }

    pub fn subscribe(client_id: Uuid, request_id: u64, filter: &TrackFilter) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Subscribe, client_id, request_id, filter)
    }

    pub fn unsubscribe(client_id: Uuid, request_id: u64, filter: &TrackFilter) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Unsubscribe, client_id, request_id, filter)
    }

    pub fn pull(client_id: Uuid, request_id: u64, request: &PullRequest) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Pull, client_id, request_id, request)
    }

    pub fn snapshot(request_id: u64, response: &PullResponse) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Snapshot, Uuid::nil(), request_id, response)
    }

    pub fn change(client_id: Uuid, request_id: u64, message: &TrackMessage) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Change, client_id, request_id, message)
    }

    pub fn ack(request_id: u64, response: &ChangeResponse) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Ack, Uuid::nil(), request_id, response)
    }

    pub fn broadcast(origin: Uuid, message: &TrackMessage) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Broadcast, origin, 0, message)
    }

    pub fn chapter_request(client_id: Uuid, request_id: u64, request: &ChapterRequest) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Chapter, client_id, request_id, request)
    }

    pub fn chapter(request_id: u64, reply: &ChapterReply) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Chapter, Uuid::nil(), request_id, reply)
    }

    pub fn error(request_id: u64, error: &ErrorPayload) -> Result<Self, ProtocolError> {
        Self::json(MessageType::Error, Uuid::nil(), request_id, error)
    }

    pub fn ping(client_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, client_id, 0)
    }

    pub fn pong(client_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, client_id, 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON payload, checking the message type first.
    pub fn body<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                found: self.msg_type,
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedType { expected: MessageType, found: MessageType },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
