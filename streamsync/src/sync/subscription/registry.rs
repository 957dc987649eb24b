// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::errors::SyncError;
use crate::sync::subscription::Subscription;
use crate::types::StreamId;

/// Index of which session is interested in which stream.
pub trait Registry: Send + Sync {
    fn add_subscription(&self, subscription: Arc<Subscription>);

    /// Removes the session from every stream. Streams left without subscribers stay until the
    /// next cleanup.
    fn remove_subscription(&self, sync_id: &str);

    /// Returns `(should_add, should_backfill)`: the first subscriber of a stream has to register
    /// it upstream, later subscribers only need a backfill.
    fn add_stream_to_subscription(&self, sync_id: &str, stream_id: StreamId) -> (bool, bool);

    /// Returns true when the last subscriber left and the stream has to be removed upstream.
    fn remove_stream_from_subscription(&self, sync_id: &str, stream_id: &StreamId) -> bool;

    fn get_subscriptions_for_stream(&self, stream_id: &StreamId) -> Vec<Arc<Subscription>>;

    fn get_subscription_by_id(&self, sync_id: &str) -> Option<Arc<Subscription>>;

    /// Drops all subscribers of a stream which went down.
    fn on_stream_down(&self, stream_id: &StreamId);

    /// Returns the number of streams and subscriptions.
    fn get_stats(&self) -> (usize, usize);

    /// Removes streams without subscribers and reports each of them to the callback.
    fn cleanup_unused_streams(&self, callback: Option<&dyn Fn(StreamId)>);

    /// Shuts down every session and clears the registry.
    fn cancel_all(&self, err: SyncError);
}

type StreamSubscribers = HashMap<StreamId, Vec<Arc<Subscription>>>;

/// Registry with stream entries spread over independently locked shards.
pub struct ShardedRegistry {
    shards: Vec<RwLock<StreamSubscribers>>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl ShardedRegistry {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, stream_id: &StreamId) -> &RwLock<StreamSubscribers> {
        let mut hasher = DefaultHasher::new();
        stream_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

impl Registry for ShardedRegistry {
    fn add_subscription(&self, subscription: Arc<Subscription>) {
        self.subscriptions
            .write()
            .insert(subscription.sync_id().to_owned(), subscription);
    }

    fn remove_subscription(&self, sync_id: &str) {
        if self.subscriptions.write().remove(sync_id).is_none() {
            return;
        }

        for shard in &self.shards {
            for subscribers in shard.write().values_mut() {
                subscribers.retain(|subscription| subscription.sync_id() != sync_id);
            }
        }
    }

    fn add_stream_to_subscription(&self, sync_id: &str, stream_id: StreamId) -> (bool, bool) {
        let subscription = match self.get_subscription_by_id(sync_id) {
            Some(subscription) => subscription,
            None => return (false, false),
        };

        let mut shard = self.shard(&stream_id).write();

        match shard.get_mut(&stream_id) {
            None => {
                shard.insert(stream_id, vec![subscription]);
                (true, false)
            }
            Some(subscribers) => {
                if subscribers
                    .iter()
                    .any(|subscriber| subscriber.sync_id() == sync_id)
                {
                    return (false, false);
                }

                // Stream is still synced, even when all earlier subscribers left
                subscription.start_initializing(stream_id);
                subscribers.push(subscription);
                (false, true)
            }
        }
    }

    fn remove_stream_from_subscription(&self, sync_id: &str, stream_id: &StreamId) -> bool {
        let mut shard = self.shard(stream_id).write();

        let subscribers = match shard.get_mut(stream_id) {
            Some(subscribers) => subscribers,
            None => return false,
        };

        let count = subscribers.len();
        subscribers.retain(|subscriber| subscriber.sync_id() != sync_id);
        if subscribers.len() == count {
            return false;
        }

        if subscribers.is_empty() {
            shard.remove(stream_id);
            return true;
        }

        false
    }

    fn get_subscriptions_for_stream(&self, stream_id: &StreamId) -> Vec<Arc<Subscription>> {
        self.shard(stream_id)
            .read()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    fn get_subscription_by_id(&self, sync_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(sync_id).cloned()
    }

    fn on_stream_down(&self, stream_id: &StreamId) {
        self.shard(stream_id).write().remove(stream_id);
    }

    fn get_stats(&self) -> (usize, usize) {
        let streams = self.shards.iter().map(|shard| shard.read().len()).sum();
        (streams, self.subscriptions.read().len())
    }

    fn cleanup_unused_streams(&self, callback: Option<&dyn Fn(StreamId)>) {
        let mut removed = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write();
            shard.retain(|stream_id, subscribers| {
                if subscribers.is_empty() {
                    removed.push(*stream_id);
                    false
                } else {
                    true
                }
            });
        }

        if !removed.is_empty() {
            debug!("Removed {} streams without subscribers", removed.len());
        }

        if let Some(callback) = callback {
            for stream_id in removed {
                callback(stream_id);
            }
        }
    }

    fn cancel_all(&self, err: SyncError) {
        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();

        for shard in &self.shards {
            shard.write().clear();
        }

        for subscription in subscriptions {
            subscription.shutdown(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rstest::rstest;

    use crate::errors::{ErrorCode, SyncError};
    use crate::sync::client::ModifyRequest;
    use crate::sync::subscription::{StreamModifier, Subscription};
    use crate::sync::CancelHandle;
    use crate::test_utils::{random_stream_id, stream_id};
    use crate::types::{StreamId, StreamKind};

    use super::{Registry, ShardedRegistry};

    struct NoopModifier;

    #[async_trait]
    impl StreamModifier for NoopModifier {
        async fn modify(&self, _request: ModifyRequest) -> Result<(), SyncError> {
            Ok(())
        }

        async fn debug_drop_stream(&self, _stream_id: &StreamId) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn subscribe(registry: &Arc<ShardedRegistry>, sync_id: &str) -> Arc<Subscription> {
        let subscription = Subscription::new(
            sync_id,
            CancelHandle::new(),
            16,
            registry.clone(),
            Arc::new(NoopModifier),
        );
        registry.add_subscription(subscription.clone());
        subscription
    }

    #[rstest]
    fn first_subscriber_adds_others_backfill(stream_id: StreamId) {
        let registry = Arc::new(ShardedRegistry::new(16));
        subscribe(&registry, "a");
        let b = subscribe(&registry, "b");

        assert_eq!(registry.add_stream_to_subscription("a", stream_id), (true, false));
        assert_eq!(registry.add_stream_to_subscription("b", stream_id), (false, true));
        assert!(b.is_initializing(&stream_id));

        // Idempotent for sessions which already subscribed
        assert_eq!(registry.add_stream_to_subscription("b", stream_id), (false, false));
        assert_eq!(registry.get_subscriptions_for_stream(&stream_id).len(), 2);

        // Unknown sessions can not subscribe
        assert_eq!(registry.add_stream_to_subscription("c", stream_id), (false, false));
    }

    #[rstest]
    fn last_removal_unregisters(stream_id: StreamId) {
        let registry = Arc::new(ShardedRegistry::new(16));
        subscribe(&registry, "a");
        subscribe(&registry, "b");
        registry.add_stream_to_subscription("a", stream_id);
        registry.add_stream_to_subscription("b", stream_id);

        assert!(!registry.remove_stream_from_subscription("a", &stream_id));
        assert!(!registry.remove_stream_from_subscription("a", &stream_id));

        let remaining = registry.get_subscriptions_for_stream(&stream_id);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sync_id(), "b");

        assert!(registry.remove_stream_from_subscription("b", &stream_id));
        assert_eq!(registry.get_stats(), (0, 2));
    }

    #[rstest]
    fn removed_subscription_leaves_entry_for_cleanup(stream_id: StreamId) {
        let registry = Arc::new(ShardedRegistry::new(4));
        subscribe(&registry, "a");
        registry.add_stream_to_subscription("a", stream_id);

        registry.remove_subscription("a");
        assert_eq!(registry.get_stats(), (1, 0));
        assert!(registry.get_subscription_by_id("a").is_none());

        // A new subscriber joins the still synced stream with a backfill
        subscribe(&registry, "b");
        assert_eq!(registry.add_stream_to_subscription("b", stream_id), (false, true));
        registry.remove_subscription("b");

        let removed = Mutex::new(Vec::new());
        let callback: &dyn Fn(StreamId) = &|stream_id| removed.lock().push(stream_id);
        registry.cleanup_unused_streams(Some(callback));
        assert_eq!(*removed.lock(), vec![stream_id]);
        assert_eq!(registry.get_stats(), (0, 0));
    }

    #[rstest]
    fn stream_down_drops_all_subscribers(stream_id: StreamId) {
        let registry = Arc::new(ShardedRegistry::new(4));
        subscribe(&registry, "a");
        subscribe(&registry, "b");
        registry.add_stream_to_subscription("a", stream_id);
        registry.add_stream_to_subscription("b", stream_id);

        registry.on_stream_down(&stream_id);

        assert!(registry.get_subscriptions_for_stream(&stream_id).is_empty());
        assert_eq!(registry.add_stream_to_subscription("b", stream_id), (true, false));
    }

    #[test]
    fn cancel_all_shuts_down_sessions() {
        let registry = Arc::new(ShardedRegistry::new(2));
        let a = subscribe(&registry, "a");
        registry.add_stream_to_subscription("a", random_stream_id());

        registry.cancel_all(SyncError::Canceled("node stopped".into()));

        assert!(a.is_closed());
        assert!(a.messages().is_closed());
        assert_eq!(a.cancel_handle().cause().unwrap().code(), ErrorCode::Canceled);
        assert_eq!(registry.get_stats(), (0, 0));
    }

    proptest! {
        #[test]
        fn sharding_keeps_subscriber_counts(
            shards in 1usize..32,
            picks in prop::collection::vec((0usize..4, 0u8..8), 1..64),
        ) {
            let registry = Arc::new(ShardedRegistry::new(shards));
            let sessions = ["a", "b", "c", "d"];
            for sync_id in sessions {
                subscribe(&registry, sync_id);
            }

            let mut expected = std::collections::HashMap::<StreamId, std::collections::HashSet<&str>>::new();
            for (session, stream) in picks {
                let stream_id = StreamId::new(StreamKind::Channel, [stream; 31]);
                let sync_id = sessions[session];
                let subscribers = expected.entry(stream_id).or_default();
                let (add, backfill) = registry.add_stream_to_subscription(sync_id, stream_id);

                if subscribers.insert(sync_id) {
                    prop_assert_eq!(add, subscribers.len() == 1);
                    prop_assert_eq!(backfill, subscribers.len() > 1);
                } else {
                    prop_assert_eq!((add, backfill), (false, false));
                }
            }

            for (stream_id, subscribers) in expected.iter() {
                prop_assert_eq!(
                    registry.get_subscriptions_for_stream(stream_id).len(),
                    subscribers.len()
                );
            }
            prop_assert_eq!(registry.get_stats(), (expected.len(), sessions.len()));
        }
    }
}
