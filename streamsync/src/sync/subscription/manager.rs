// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::bus::{ServiceMessage, ServiceSender};
use crate::config::Configuration;
use crate::errors::{ErrorCode, SyncError};
use crate::nodes::NodeRegistry;
use crate::store::StreamStore;
use crate::sync::client::SyncerSet;
use crate::sync::subscription::{Distributor, Registry, ShardedRegistry, Subscription};
use crate::sync::{BoundedQueue, CancelHandle};
use crate::types::{StreamId, SyncOp, SyncStreamsResponse};

/// Owns the syncers of a node and distributes their updates to all subscriptions.
pub struct Manager {
    config: Configuration,
    messages: Arc<BoundedQueue<SyncStreamsResponse>>,
    registry: Arc<ShardedRegistry>,
    distributor: Distributor,
    syncers: Arc<SyncerSet>,
    cancel: CancelHandle,
    tx: ServiceSender,
}

impl Manager {
    pub fn new(
        config: Configuration,
        store: Arc<dyn StreamStore>,
        node_registry: Arc<dyn NodeRegistry>,
        tx: ServiceSender,
    ) -> Self {
        let cancel = CancelHandle::new();
        let messages = Arc::new(BoundedQueue::new(config.sync.common_buffer_size));
        let registry = Arc::new(ShardedRegistry::new(config.sync.registry_shards));

        let syncers = Arc::new(SyncerSet::new(
            config.sync.clone(),
            config.node_address,
            store,
            node_registry,
            messages.clone(),
            cancel.clone(),
        ));

        Self {
            distributor: Distributor::new(registry.clone()),
            config,
            messages,
            registry,
            syncers,
            cancel,
            tx,
        }
    }

    /// Creates a subscription for a new client session. Cancelling the handle ends the session.
    pub fn subscribe(&self, sync_id: &str, cancel: CancelHandle) -> Arc<Subscription> {
        let subscription = Subscription::new(
            sync_id,
            cancel,
            self.config.sync.subscription_buffer_size,
            self.registry.clone(),
            self.syncers.clone(),
        );

        self.registry.add_subscription(subscription.clone());
        subscription
    }

    pub fn registry(&self) -> &Arc<ShardedRegistry> {
        &self.registry
    }

    pub fn syncers(&self) -> &Arc<SyncerSet> {
        &self.syncers
    }

    /// Stops the manager, its syncers and every subscription.
    pub fn stop(&self) {
        self.cancel
            .cancel(SyncError::Canceled("Sync manager stopped".into()));
    }

    /// Distributes updates until the manager gets stopped. Returns once all syncers finished.
    pub async fn run(&self) -> Result<(), SyncError> {
        let (_, result) = tokio::join!(self.syncers.run(), self.distribute_updates());
        result
    }

    async fn distribute_updates(&self) -> Result<(), SyncError> {
        let period = self.config.sync.registry_cleanup_interval();
        let mut cleanup = interval_at(Instant::now() + period, period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut batch = Vec::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = cleanup.tick() => {
                    self.cleanup_streams().await;
                    continue;
                }
                _ = self.messages.wait() => (),
            }

            let mut messages = match self.messages.drain_batch(batch) {
                Some(messages) => messages,
                None => break,
            };

            for message in messages.drain(..) {
                self.distribute(message);
            }

            batch = messages;
        }

        let cause = self
            .cancel
            .cause()
            .unwrap_or_else(|| SyncError::Canceled("Sync manager stopped".into()));

        info!("Sync manager stopped: {}", cause);
        self.registry.cancel_all(cause.clone());
        self.messages.close();

        if cause.code() == ErrorCode::Canceled {
            Ok(())
        } else {
            Err(cause)
        }
    }

    fn distribute(&self, message: SyncStreamsResponse) {
        let stream_id = match message.stream_id() {
            Some(stream_id) => stream_id,
            None => {
                warn!("Dropping syncer message {:?} without stream", message.op);
                return;
            }
        };

        if message.op == SyncOp::Down {
            let _ = self.tx.send(ServiceMessage::StreamDown(stream_id));
        }

        if message.target_sync_ids.is_empty() {
            self.distributor.distribute_message(stream_id, message);
        } else {
            self.distributor
                .distribute_backfill_message(stream_id, message);
        }
    }

    /// Removes streams from the syncers which lost their last subscriber when a session ended.
    async fn cleanup_streams(&self) {
        let unused = {
            let unused: Mutex<Vec<StreamId>> = Mutex::new(Vec::new());
            let collect: &dyn Fn(StreamId) = &|stream_id| unused.lock().push(stream_id);
            self.registry.cleanup_unused_streams(Some(collect));
            unused.into_inner()
        };

        for stream_id in unused {
            self.stop_unused_stream(stream_id).await;
        }
    }

    /// Stops syncing a stream removed from the registry, unless a session added it again since.
    async fn stop_unused_stream(&self, stream_id: StreamId) {
        let registry = &self.registry;
        let result = self
            .syncers
            .remove_unused_stream("cleanup", stream_id, |stream_id| {
                !registry.get_subscriptions_for_stream(stream_id).is_empty()
            })
            .await;

        match result {
            Ok(true) => debug!("Stopped syncing unused stream {}", stream_id),
            Ok(false) => debug!("Stream {} got subscribed again, keep syncing", stream_id),
            Err(err) => warn!("Could not stop syncing stream {}: {}", stream_id, err),
        }
    }
}
