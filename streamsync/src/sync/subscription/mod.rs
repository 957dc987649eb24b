// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client sessions and the fan-out of syncer updates to them.
mod distributor;
mod manager;
mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;

use crate::errors::SyncError;
use crate::sync::client::{ModifyRequest, StatusHandler, SyncerSet};
use crate::sync::{BoundedQueue, CancelHandle};
use crate::types::{Backfill, EventHash, StreamId, SyncStreamOpStatus, SyncStreamsResponse};

pub use distributor::Distributor;
pub use manager::Manager;
pub use registry::{Registry, ShardedRegistry};

/// Narrow view on the syncer set a subscription needs to change its streams.
#[async_trait]
pub trait StreamModifier: Send + Sync {
    async fn modify(&self, request: ModifyRequest) -> Result<(), SyncError>;

    async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<(), SyncError>;
}

#[async_trait]
impl StreamModifier for SyncerSet {
    async fn modify(&self, request: ModifyRequest) -> Result<(), SyncError> {
        SyncerSet::modify(self, request).await
    }

    async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<(), SyncError> {
        SyncerSet::debug_drop_stream(self, stream_id).await
    }
}

/// What to do with a live update for a subscriber.
#[derive(Debug, PartialEq)]
pub(crate) enum LiveFilter {
    /// Subscriber waits for its backfill.
    Skip,

    Deliver,

    /// Deliver without the events the backfill already contained.
    Strip(HashSet<EventHash>),
}

#[derive(Debug, Default)]
struct StreamState {
    /// Streams added to an already synced stream which did not receive their backfill yet.
    initializing: HashSet<StreamId>,

    /// Event hashes of delivered backfills, removed from the next live update.
    backfill_events: HashMap<StreamId, HashSet<EventHash>>,
}

/// State of one client session.
pub struct Subscription {
    sync_id: String,
    messages: BoundedQueue<SyncStreamsResponse>,
    cancel: CancelHandle,
    closed: AtomicBool,
    state: Mutex<StreamState>,
    registry: Arc<dyn Registry>,
    syncers: Arc<dyn StreamModifier>,
}

impl Subscription {
    pub fn new(
        sync_id: &str,
        cancel: CancelHandle,
        buffer_size: usize,
        registry: Arc<dyn Registry>,
        syncers: Arc<dyn StreamModifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync_id: sync_id.to_owned(),
            messages: BoundedQueue::new(buffer_size),
            cancel,
            closed: AtomicBool::new(false),
            state: Mutex::new(StreamState::default()),
            registry,
            syncers,
        })
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    /// Outbound queue of this session.
    pub fn messages(&self) -> &BoundedQueue<SyncStreamsResponse> {
        &self.messages
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues a message for the client. A full queue cancels the session.
    pub fn send(&self, message: SyncStreamsResponse) {
        if self.is_closed() {
            return;
        }

        if let Err(err) = self.messages.push(message) {
            error!("Cancel sync {}, client can not keep up: {}", self.sync_id, err);
            self.cancel.cancel(err.into());
            self.closed.store(true, Ordering::SeqCst);
            self.messages.close();
        }
    }

    /// Cancels the session with the given cause and stops accepting messages.
    pub fn shutdown(&self, err: SyncError) {
        self.cancel.cancel(err);
        self.closed.store(true, Ordering::SeqCst);
        self.messages.close();
    }

    /// Removes the session from the registry and stops accepting messages.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.registry.remove_subscription(&self.sync_id);
        self.messages.close();
        debug!("Closed subscription {}", self.sync_id);
    }

    /// Adds, removes and backfills streams of this session.
    ///
    /// Streams which are new to the node get registered with the syncers, streams other sessions
    /// already sync only need a backfill. Failed adds are rolled back out of the registry.
    pub async fn modify(self: &Arc<Self>, request: ModifyRequest) -> Result<(), SyncError> {
        request.validate()?;

        let adding_failure_handler: StatusHandler = {
            let subscription = self.clone();
            let report = request.adding_failure_handler.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                subscription
                    .registry
                    .remove_stream_from_subscription(&subscription.sync_id, &status.stream_id);
                subscription.forget_stream(&status.stream_id);
                report(status)
            })
        };

        let mut to_add = Vec::new();
        let mut implicit_backfills = Vec::new();
        for cookie in &request.to_add {
            match self
                .registry
                .add_stream_to_subscription(&self.sync_id, cookie.stream_id)
            {
                (true, _) => to_add.push(cookie.clone()),
                (false, true) => implicit_backfills.push(cookie.clone()),
                (false, false) => (),
            }
        }

        let to_remove: Vec<StreamId> = request
            .to_remove
            .iter()
            .filter(|stream_id| {
                let removed = self
                    .registry
                    .remove_stream_from_subscription(&self.sync_id, stream_id);
                self.forget_stream(stream_id);
                removed
            })
            .copied()
            .collect();

        let implicit: HashSet<StreamId> = implicit_backfills
            .iter()
            .map(|cookie| cookie.stream_id)
            .collect();

        // Backfills this session needs for joining a synced stream count as adds
        let backfilling_failure_handler: StatusHandler = {
            let adding = adding_failure_handler.clone();
            let backfilling = request.backfilling_failure_handler.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                if implicit.contains(&status.stream_id) {
                    adding(status)
                } else {
                    backfilling(status)
                }
            })
        };

        let mut to_backfill = request.to_backfill.clone();
        if !implicit_backfills.is_empty() {
            to_backfill.push(Backfill {
                sync_id: self.sync_id.clone(),
                streams: implicit_backfills,
            });
        }

        let modification = ModifyRequest {
            sync_id: self.sync_id.clone(),
            to_add,
            to_remove,
            to_backfill,
            adding_failure_handler,
            removing_failure_handler: request.removing_failure_handler.clone(),
            backfilling_failure_handler,
        };

        if modification.is_empty() {
            return Ok(());
        }

        self.syncers.modify(modification).await
    }

    pub async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<(), SyncError> {
        self.syncers.debug_drop_stream(stream_id).await
    }

    pub(crate) fn start_initializing(&self, stream_id: StreamId) {
        let mut state = self.state.lock();
        state.initializing.insert(stream_id);
        state.backfill_events.remove(&stream_id);
    }

    #[cfg(test)]
    pub(crate) fn is_initializing(&self, stream_id: &StreamId) -> bool {
        self.state.lock().initializing.contains(stream_id)
    }

    /// Decides how the next live update of the stream gets delivered. Backfill hashes are used
    /// once.
    pub(crate) fn live_filter(&self, stream_id: &StreamId) -> LiveFilter {
        let mut state = self.state.lock();

        if state.initializing.contains(stream_id) {
            return LiveFilter::Skip;
        }

        match state.backfill_events.remove(stream_id) {
            Some(hashes) => LiveFilter::Strip(hashes),
            None => LiveFilter::Deliver,
        }
    }

    /// Marks the backfill of an initializing stream as delivered.
    pub(crate) fn finish_initializing(&self, stream_id: StreamId, hashes: HashSet<EventHash>) {
        let mut state = self.state.lock();

        if state.initializing.remove(&stream_id) {
            state.backfill_events.insert(stream_id, hashes);
        }
    }

    pub(crate) fn forget_stream(&self, stream_id: &StreamId) {
        let mut state = self.state.lock();
        state.initializing.remove(stream_id);
        state.backfill_events.remove(stream_id);
    }
}
