//! Entity persistence for chapters and tracks.
//!
//! ```text
//! ┌────────────┐   read / write / update   ┌──────────────────────────┐
//! │ Reconciler │ ────────────────────────► │ EntityStore              │
//! └────────────┘        (JSON values)      │  ├─ MemoryStore (tests)  │
//!                                          │  └─ RocksStore           │
//!                                          │      CF "chapters"       │
//!                                          │      CF "tracks"         │
//!                                          └──────────────────────────┘
//! ```
//!
//! Values are plain JSON documents keyed by entity id. `update` is a
//! shallow merge of top-level fields: reading an entity back returns the
//! last successfully written or merged value.

pub mod rocks;

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use montage_core::{Chapter, Track};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Chapter,
    Track,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Chapter, EntityKind::Track];

    /// Column family / table name.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Chapter => "chapters",
            EntityKind::Track => "tracks",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Chapter => "chapter",
            EntityKind::Track => "track",
        })
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("{kind} {id} is not a JSON object")]
    NotAnObject { kind: EntityKind, id: Uuid },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Key-value JSON store keyed by entity id.
pub trait EntityStore: Send + Sync {
    fn read(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError>;

    fn write(&self, kind: EntityKind, id: Uuid, value: &Value) -> Result<(), StoreError>;

    /// Returns whether the entity existed.
    fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError>;

    fn list(&self, kind: EntityKind) -> Result<Vec<Uuid>, StoreError>;

    /// Shallow-merge `partial`'s top-level fields into the stored object
    /// and return the merged value.
    fn update(&self, kind: EntityKind, id: Uuid, partial: &Value) -> Result<Value, StoreError> {
        let mut current = self
            .read(kind, id)?
            .ok_or(StoreError::NotFound { kind, id })?;
        match (current.as_object_mut(), partial.as_object()) {
            (Some(target), Some(fields)) => {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            _ => return Err(StoreError::NotAnObject { kind, id }),
        }
        self.write(kind, id, &current)?;
        Ok(current)
    }
}

/// Typed access on top of any [`EntityStore`].
pub trait EntityStoreExt: EntityStore {
    fn read_as<T: DeserializeOwned>(&self, kind: EntityKind, id: Uuid) -> Result<Option<T>, StoreError> {
        self.read(kind, id)?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    fn write_as<T: Serialize>(&self, kind: EntityKind, id: Uuid, entity: &T) -> Result<(), StoreError> {
        self.write(kind, id, &serde_json::to_value(entity)?)
    }

    fn read_track(&self, id: Uuid) -> Result<Option<Track>, StoreError> {
        self.read_as(EntityKind::Track, id)
    }

    fn write_track(&self, track: &Track) -> Result<(), StoreError> {
        self.write_as(EntityKind::Track, track.id, track)
    }

    fn read_chapter(&self, id: Uuid) -> Result<Option<Chapter>, StoreError> {
        self.read_as(EntityKind::Chapter, id)
    }

    fn write_chapter(&self, chapter: &Chapter) -> Result<(), StoreError> {
        self.write_as(EntityKind::Chapter, chapter.id, chapter)
    }
}

impl<S: EntityStore + ?Sized> EntityStoreExt for S {}

/// In-process store; the default when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<(EntityKind, Uuid), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Database("memory store lock poisoned".into())
    }
}

impl EntityStore for MemoryStore {
    fn read(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.get(&(kind, id)).cloned())
    }

    fn write(&self, kind: EntityKind, id: Uuid, value: &Value) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        tables.insert((kind, id), value.clone());
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        Ok(tables.remove(&(kind, id)).is_some())
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.keys().filter(|(k, _)| *k == kind).map(|(_, id)| *id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_read_write_delete() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.read(EntityKind::Track, id).unwrap(), None);

        store.write(EntityKind::Track, id, &json!({"version": 1})).unwrap();
        assert_eq!(store.read(EntityKind::Track, id).unwrap(), Some(json!({"version": 1})));
        // kinds are separate tables
        assert_eq!(store.read(EntityKind::Chapter, id).unwrap(), None);
        assert_eq!(store.list(EntityKind::Track).unwrap(), vec![id]);

        assert!(store.delete(EntityKind::Track, id).unwrap());
        assert!(!store.delete(EntityKind::Track, id).unwrap());
    }

    #[test]
    fn test_update_is_shallow_merge() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .write(EntityKind::Chapter, id, &json!({"a": 1, "nested": {"x": 1, "y": 2}}))
            .unwrap();
        let merged = store
            .update(EntityKind::Chapter, id, &json!({"b": 2, "nested": {"x": 5}}))
            .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 5}}));
        assert_eq!(store.read(EntityKind::Chapter, id).unwrap(), Some(merged));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.update(EntityKind::Track, id, &json!({"a": 1})),
            Err(StoreError::NotFound { kind: EntityKind::Track, id })
        );
    }

    #[test]
    fn test_typed_helpers() {
        let store = MemoryStore::new();
        let track = Track::empty_document(Uuid::new_v4());
        store.write_track(&track).unwrap();
        assert_eq!(store.read_track(track.id).unwrap(), Some(track));

        let chapter = Chapter::new(Uuid::new_v4());
        store.write_chapter(&chapter).unwrap();
        assert_eq!(store.read_chapter(chapter.id).unwrap(), Some(chapter));
    }
}
