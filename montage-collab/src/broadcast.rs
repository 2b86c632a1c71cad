//! Per-track and per-chapter fan-out of reconciled track messages.
//!
//! Every accepted change is published once to its track's group and once
//! to its chapter's group. Each subscriber owns an independent receiver
//! buffering up to `capacity` messages; a subscriber that falls further
//! behind gets [`BroadcastError::Lagged`] and must catch up with a pull.
//!
//! Dropping a [`Subscription`] cancels it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{TrackFilter, TrackMessage};

/// A reconciled message and the connection that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub origin: Uuid,
    pub message: TrackMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Track(Uuid),
    Chapter(Uuid),
}

impl ChannelKey {
    /// The narrowest channel carrying everything `filter` selects.
    pub fn for_filter(filter: &TrackFilter) -> Option<Self> {
        match (filter.track_id, filter.chapter_id) {
            (Some(track), _) => Some(Self::Track(track)),
            (None, Some(chapter)) => Some(Self::Chapter(chapter)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    #[error("subscription filter names neither a chapter nor a track")]
    EmptyFilter,
    #[error("subscriber lagged behind by {0} messages")]
    Lagged(u64),
    #[error("channel closed")]
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One multicast channel: a track or a chapter.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Published>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Returns the number of receivers the message was queued for.
    pub fn send(&self, published: Arc<Published>) -> usize {
        let count = self.sender.send(published).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

/// A live subscription. Receives messages matching its filter, skipping
/// those published by its own origin.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Published>>,
    filter: TrackFilter,
    origin: Option<Uuid>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn filter(&self) -> &TrackFilter {
        &self.filter
    }

    /// Wait for the next matching message.
    pub async fn recv(&mut self) -> Result<Arc<Published>, BroadcastError> {
        loop {
            match self.receiver.recv().await {
                Ok(published) => {
                    if Some(published.origin) == self.origin || !self.filter.matches(&published.message.scope) {
                        continue;
                    }
                    return Ok(published);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.stats.messages_dropped.fetch_add(missed, Ordering::Relaxed);
                    log::warn!("subscriber {:?} lagged by {missed} messages", self.origin);
                    return Err(BroadcastError::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BroadcastError::Closed),
            }
        }
    }
}

/// Maps track and chapter ids to their broadcast groups.
pub struct ChannelRegistry {
    groups: Arc<RwLock<HashMap<ChannelKey, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, key: ChannelKey) -> Arc<BroadcastGroup> {
        {
            let groups = self.groups.read().await;
            if let Some(group) = groups.get(&key) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write().await;
        // another task may have created it meanwhile
        if let Some(group) = groups.get(&key) {
            return group.clone();
        }
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        groups.insert(key, group.clone());
        group
    }

    /// Subscribe to the messages selected by `filter`. With `origin` set,
    /// messages published by that origin are not delivered.
    pub async fn subscribe(&self, filter: TrackFilter, origin: Option<Uuid>) -> Result<Subscription, BroadcastError> {
        let key = ChannelKey::for_filter(&filter).ok_or(BroadcastError::EmptyFilter)?;
        let group = self.get_or_create(key).await;
        log::debug!("subscribed {origin:?} to {key:?}");
        Ok(Subscription {
            receiver: group.sender.subscribe(),
            filter,
            origin,
            stats: group.stats.clone(),
        })
    }

    /// Fan a message out to its track's and chapter's subscribers.
    /// Returns the number of receivers reached.
    pub async fn publish(&self, origin: Uuid, message: TrackMessage) -> usize {
        let keys = [
            ChannelKey::Track(message.scope.track_id),
            ChannelKey::Chapter(message.scope.chapter_id),
        ];
        let published = Arc::new(Published { origin, message });
        let groups = self.groups.read().await;
        let reached = keys
            .iter()
            .filter_map(|key| groups.get(key))
            .map(|group| group.send(published.clone()))
            .sum();
        log::trace!("published change from {origin} to {reached} receivers");
        reached
    }

    pub async fn stats(&self, key: ChannelKey) -> Option<BroadcastStats> {
        self.groups.read().await.get(&key).map(|g| g.stats())
    }

    /// Drop groups nobody subscribes to. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut groups = self.groups.write().await;
        let before = groups.len();
        groups.retain(|_, group| group.subscriber_count() > 0);
        before - groups.len()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackScope;
    use montage_core::Delta;

    fn message(scope: TrackScope, version: u64) -> TrackMessage {
        TrackMessage::updated(scope, Delta::new(version, Uuid::nil(), vec![]))
    }

    #[tokio::test]
    async fn test_track_and_chapter_fan_out() {
        let channels = ChannelRegistry::new(16);
        let scope = TrackScope::new(Uuid::new_v4(), Uuid::new_v4());

        let mut by_track = channels.subscribe(TrackFilter::track(scope.track_id), None).await.unwrap();
        let mut by_chapter = channels.subscribe(TrackFilter::chapter(scope.chapter_id), None).await.unwrap();

        let reached = channels.publish(Uuid::new_v4(), message(scope, 1)).await;
        assert_eq!(reached, 2);
        assert_eq!(by_track.recv().await.unwrap().message, message(scope, 1));
        assert_eq!(by_chapter.recv().await.unwrap().message, message(scope, 1));
    }

    #[tokio::test]
    async fn test_origin_is_skipped() {
        let channels = ChannelRegistry::new(16);
        let scope = TrackScope::new(Uuid::new_v4(), Uuid::new_v4());
        let me = Uuid::new_v4();
        let mut sub = channels.subscribe(TrackFilter::scope(scope), Some(me)).await.unwrap();

        channels.publish(me, message(scope, 1)).await;
        channels.publish(Uuid::new_v4(), message(scope, 2)).await;
        let got = sub.recv().await.unwrap();
        assert_eq!(got.message, message(scope, 2));
    }

    #[tokio::test]
    async fn test_filter_excludes_other_chapter() {
        let channels = ChannelRegistry::new(16);
        let track = Uuid::new_v4();
        let ours = TrackScope::new(Uuid::new_v4(), track);
        let mut sub = channels.subscribe(TrackFilter::scope(ours), None).await.unwrap();

        channels.publish(Uuid::nil(), message(TrackScope::new(Uuid::new_v4(), track), 1)).await;
        channels.publish(Uuid::nil(), message(ours, 2)).await;
        assert_eq!(sub.recv().await.unwrap().message, message(ours, 2));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let channels = ChannelRegistry::new(2);
        let scope = TrackScope::new(Uuid::new_v4(), Uuid::new_v4());
        let mut sub = channels.subscribe(TrackFilter::track(scope.track_id), None).await.unwrap();

        for v in 1..=5 {
            channels.publish(Uuid::nil(), message(scope, v)).await;
        }
        assert_eq!(sub.recv().await, Err(BroadcastError::Lagged(3)));
        let stats = channels.stats(ChannelKey::Track(scope.track_id)).await.unwrap();
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        // the receiver resumes at the oldest buffered message
        assert_eq!(sub.recv().await.unwrap().message, message(scope, 4));
    }

    #[tokio::test]
    async fn test_drop_cancels_and_prune_removes_group() {
        let channels = ChannelRegistry::new(4);
        let track = Uuid::new_v4();
        let sub = channels.subscribe(TrackFilter::track(track), None).await.unwrap();
        assert_eq!(channels.prune().await, 0);
        drop(sub);
        assert_eq!(channels.prune().await, 1);
        assert_eq!(channels.group_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_filter_rejected() {
        let channels = ChannelRegistry::new(4);
        assert!(matches!(
            channels.subscribe(TrackFilter::default(), None).await,
            Err(BroadcastError::EmptyFilter)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let channels = Arc::new(ChannelRegistry::new(16));
        let key = ChannelKey::Chapter(Uuid::new_v4());
        let mut handles = vec![];
        for _ in 0..10 {
            let channels = channels.clone();
            handles.push(tokio::spawn(async move { channels.get_or_create(key).await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(channels.group_count().await, 1);
    }
}
