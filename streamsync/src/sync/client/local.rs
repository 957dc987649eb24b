// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::errors::SyncError;
use crate::store::{LocalStream, StreamListener, StreamStore};
use crate::sync::client::{backfill_targets, MessageQueue, StreamsSyncer, UnsubscribeStream};
use crate::sync::CancelHandle;
use crate::types::{
    ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamAndCookie, StreamId, SyncCookie,
    SyncStreamOpStatus, SyncStreamsResponse,
};

/// Syncer for streams this node replicates itself.
///
/// Subscribes to streams in the local stream store and turns their callbacks into messages on
/// the shared queue.
pub struct LocalSyncer {
    local_address: NodeAddress,
    store: Arc<dyn StreamStore>,
    messages: MessageQueue,
    unsubscribe: UnsubscribeStream,

    /// Cancels this syncer only.
    cancel: CancelHandle,

    /// Cancelled when a message could not be queued, which stops every syncer of the set.
    session: CancelHandle,

    streams: Mutex<HashMap<StreamId, Arc<dyn LocalStream>>>,
    stopped: AtomicBool,

    /// Serializes modifications so the stopped state can't change halfway through one.
    modify_lock: tokio::sync::Mutex<()>,

    this: Weak<LocalSyncer>,
}

impl LocalSyncer {
    pub fn new(
        local_address: NodeAddress,
        store: Arc<dyn StreamStore>,
        messages: MessageQueue,
        unsubscribe: UnsubscribeStream,
        session: CancelHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local_address,
            store,
            messages,
            unsubscribe,
            cancel: session.child(),
            session,
            streams: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            modify_lock: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    fn listener(&self) -> Result<Arc<dyn StreamListener>, SyncError> {
        match self.this.upgrade() {
            Some(this) => {
                let listener: Arc<dyn StreamListener> = this;
                Ok(listener)
            }
            None => Err(SyncError::Canceled("Local syncer dropped".into())),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Number of streams currently watched.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn send(&self, message: SyncStreamsResponse) {
        if let Err(err) = self.messages.push(message) {
            error!("Local syncer could not queue message: {}", err);
            self.session.cancel(err.into());
        }
    }

    async fn add_stream(&self, cookie: &SyncCookie) -> Result<(), SyncError> {
        if self.streams.lock().contains_key(&cookie.stream_id) {
            return Ok(());
        }

        let stream = self
            .store
            .get_stream_wait_for_local(&cookie.stream_id)
            .await?;
        stream.subscribe(cookie, self.listener()?).await?;

        self.streams.lock().insert(cookie.stream_id, stream);
        debug!("Local syncer watches stream {}", cookie.stream_id);

        Ok(())
    }

    fn remove_stream(&self, stream_id: &StreamId) -> Result<(), SyncError> {
        let stream = self.streams.lock().remove(stream_id);

        if let Some(stream) = stream {
            stream.unsubscribe(&self.listener()?);
            debug!("Local syncer stopped watching stream {}", stream_id);
        }

        Ok(())
    }

    async fn backfill(
        &self,
        cookie: &SyncCookie,
        request_sync_id: &str,
        backfill_sync_id: &str,
    ) -> Result<(), SyncError> {
        let stream = self
            .store
            .get_stream_wait_for_local(&cookie.stream_id)
            .await?;
        let targets = backfill_targets(request_sync_id, backfill_sync_id);

        stream
            .updates_since_cookie(cookie, &mut |update| {
                let message = SyncStreamsResponse::update(update).with_targets(targets.clone());
                self.messages.push(message).map_err(SyncError::from)
            })
            .await
    }
}

#[async_trait]
impl StreamsSyncer for LocalSyncer {
    fn address(&self) -> NodeAddress {
        self.local_address
    }

    async fn run(&self) {
        self.cancel.cancelled().await;
        self.stopped.store(true, Ordering::SeqCst);

        let streams: Vec<Arc<dyn LocalStream>> =
            self.streams.lock().drain().map(|(_, stream)| stream).collect();

        if let Ok(listener) = self.listener() {
            for stream in streams {
                stream.unsubscribe(&listener);
            }
        }
    }

    async fn modify(
        &self,
        request: ModifySyncRequest,
    ) -> Result<(ModifySyncResponse, bool), SyncError> {
        let _guard = self.modify_lock.lock().await;

        if self.is_stopped() {
            return Err(SyncError::Canceled("Local syncer stopped".into()));
        }

        let mut response = ModifySyncResponse::default();

        for cookie in &request.add_streams {
            if let Err(err) = self.add_stream(cookie).await {
                warn!("Failed adding stream {} to local sync: {}", cookie.stream_id, err);
                response
                    .adds
                    .push(SyncStreamOpStatus::new(cookie.stream_id, &err));
            }
        }

        for stream_id in &request.remove_streams {
            if let Err(err) = self.remove_stream(stream_id) {
                response.removals.push(SyncStreamOpStatus::new(*stream_id, &err));
            }
        }

        if let Some(backfill) = &request.backfill_streams {
            for cookie in &backfill.streams {
                if let Err(err) = self
                    .backfill(cookie, &request.sync_id, &backfill.sync_id)
                    .await
                {
                    response
                        .backfills
                        .push(SyncStreamOpStatus::new(cookie.stream_id, &err));
                }
            }
        }

        let stopped = self.is_empty();
        if stopped {
            self.stopped.store(true, Ordering::SeqCst);
            self.cancel
                .cancel(SyncError::Canceled("Local syncer has no streams left".into()));
        }

        Ok((response, stopped))
    }

    async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<bool, SyncError> {
        let stream = self.streams.lock().remove(stream_id);

        match stream {
            Some(stream) => {
                stream.unsubscribe(&self.listener()?);
                (self.unsubscribe)(*stream_id);
                self.send(SyncStreamsResponse::down(*stream_id));
                Ok(false)
            }
            None => Err(SyncError::NotFound(format!(
                "Stream {} not part of local sync",
                stream_id
            ))),
        }
    }
}

impl StreamListener for LocalSyncer {
    fn on_update(&self, update: StreamAndCookie) {
        if self.is_stopped() {
            return;
        }

        self.send(SyncStreamsResponse::update(update));
    }

    fn on_sync_down(&self, stream_id: StreamId) {
        if self.streams.lock().remove(&stream_id).is_none() {
            return;
        }

        debug!("Local stream {} went down", stream_id);
        (self.unsubscribe)(stream_id);
        self.send(SyncStreamsResponse::down(stream_id));
    }
}
