// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::SyncConfiguration;
use crate::errors::SyncError;
use crate::nodes::{StreamServiceClient, SyncResponseStream};
use crate::sync::client::{MessageQueue, StreamsSyncer, UnsubscribeStream};
use crate::sync::CancelHandle;
use crate::types::{
    ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamId, SyncCookie, SyncOp,
    SyncStreamOpStatus, SyncStreamsResponse,
};

#[derive(Debug, Default)]
struct RemoteState {
    /// Streams the remote confirmed to sync.
    watched: HashSet<StreamId>,

    /// Additions not yet sent to the remote.
    pending_add: Vec<SyncCookie>,

    /// Removals not yet sent to the remote.
    pending_remove: Vec<StreamId>,

    /// Additions sent to the remote but not confirmed yet.
    in_flight: Vec<StreamId>,

    /// Set once the syncer has no streams left and accepts no further modifications.
    stopped: bool,
}

impl RemoteState {
    fn has_pending(&self) -> bool {
        !self.pending_add.is_empty() || !self.pending_remove.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.watched.is_empty() && self.in_flight.is_empty() && !self.has_pending()
    }

    fn is_known(&self, stream_id: &StreamId) -> bool {
        self.watched.contains(stream_id) || self.in_flight.contains(stream_id)
    }

    /// Streams which will be watched after the pending changes got applied.
    fn candidates(&self) -> HashSet<StreamId> {
        let mut streams = self.watched.clone();
        streams.extend(self.in_flight.iter().copied());
        streams.extend(self.pending_add.iter().map(|cookie| cookie.stream_id));
        for stream_id in &self.pending_remove {
            streams.remove(stream_id);
        }
        streams
    }
}

/// Syncer receiving updates from the sync endpoint of another node.
///
/// Stream additions and removals are collected and sent to the remote in periodic batches,
/// backfills are forwarded right away. The remote session is pinged when it was quiet for a
/// while and considered dead when nothing arrived for longer than the activity deadline.
pub struct RemoteSyncer {
    remote_address: NodeAddress,

    /// Id of the session on the remote node.
    sync_id: String,

    client: Arc<dyn StreamServiceClient>,
    messages: MessageQueue,
    unsubscribe: UnsubscribeStream,
    config: SyncConfiguration,
    cancel: CancelHandle,
    session: CancelHandle,
    responses: Mutex<Option<SyncResponseStream>>,
    state: Mutex<RemoteState>,
    last_activity: Mutex<Instant>,
    terminated: AtomicBool,
}

impl RemoteSyncer {
    /// Opens a sync session on the remote node.
    ///
    /// The remote has to confirm the session with a NEW message within the startup timeout,
    /// otherwise this fails with [`SyncError::Unavailable`].
    pub async fn new(
        remote_address: NodeAddress,
        client: Arc<dyn StreamServiceClient>,
        messages: MessageQueue,
        unsubscribe: UnsubscribeStream,
        session: CancelHandle,
        config: SyncConfiguration,
    ) -> Result<Arc<Self>, SyncError> {
        let startup = async {
            let mut responses = client.sync_streams(Vec::new()).await?;

            match responses.next().await {
                Some(Ok(message)) if message.op == SyncOp::New && !message.sync_id.is_empty() => {
                    Ok((message.sync_id, responses))
                }
                Some(Ok(message)) => Err(SyncError::Unavailable(format!(
                    "Unexpected first sync message {:?} from {}",
                    message.op, remote_address
                ))),
                Some(Err(err)) => Err(err),
                None => Err(SyncError::Unavailable(format!(
                    "Sync stream of {} closed before it started",
                    remote_address
                ))),
            }
        };

        let (sync_id, responses) = match timeout(config.remote_startup_timeout(), startup).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                return Err(SyncError::Unavailable(format!(
                    "Could not start sync with {}: {}",
                    remote_address,
                    err.message()
                )))
            }
            Err(_) => {
                return Err(SyncError::Unavailable(format!(
                    "Remote {} did not start sync in time",
                    remote_address
                )))
            }
        };

        debug!("Started remote sync {} with {}", sync_id, remote_address);

        Ok(Arc::new(Self {
            remote_address,
            sync_id,
            client,
            messages,
            unsubscribe,
            cancel: session.child(),
            session,
            config,
            responses: Mutex::new(Some(responses)),
            state: Mutex::new(RemoteState::default()),
            last_activity: Mutex::new(Instant::now()),
            terminated: AtomicBool::new(false),
        }))
    }

    /// Id of the sync session on the remote node.
    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    /// Streams currently synced or about to be synced through this remote.
    pub fn streams(&self) -> HashSet<StreamId> {
        self.state.lock().candidates()
    }

    fn send(&self, message: SyncStreamsResponse) -> bool {
        if self.session.is_cancelled() {
            return false;
        }

        match self.messages.push(message) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Cancel sync, could not queue message from remote {}: {}",
                    self.remote_address, err
                );
                self.session.cancel(err.into());
                false
            }
        }
    }

    /// Stops the syncer after the remote became unreachable. All streams are reported DOWN so
    /// clients can re-add them through another node.
    fn terminate(&self, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let streams: Vec<StreamId> = {
            let mut state = self.state.lock();
            state.stopped = true;
            let mut streams: Vec<StreamId> = state.watched.drain().collect();
            streams.append(&mut state.in_flight);
            streams.extend(state.pending_add.drain(..).map(|cookie| cookie.stream_id));
            state.pending_remove.clear();
            streams
        };

        for stream_id in streams {
            debug!(
                "Stream {} down, remote {} unavailable",
                stream_id, self.remote_address
            );
            (self.unsubscribe)(stream_id);
            if !self.send(SyncStreamsResponse::down(stream_id)) {
                break;
            }
        }

        self.cancel
            .cancel(SyncError::Unavailable(format!("{} {}", self.remote_address, reason)));
    }

    fn handle_message(&self, message: SyncStreamsResponse) {
        match message.op {
            SyncOp::Update => {
                self.send(message);
            }
            SyncOp::Down => {
                let stream_id = match message.stream_id() {
                    Some(stream_id) => stream_id,
                    None => return,
                };

                let is_empty = {
                    let mut state = self.state.lock();
                    state.watched.remove(&stream_id);
                    state.is_idle()
                };

                (self.unsubscribe)(stream_id);
                self.send(message);

                if is_empty {
                    self.state.lock().stopped = true;
                    self.cancel
                        .cancel(SyncError::Canceled("Remote syncer has no streams left".into()));
                }
            }
            SyncOp::Pong | SyncOp::New => (),
            SyncOp::Close => {
                debug!("Remote {} closed sync {}", self.remote_address, self.sync_id);
            }
        }
    }

    async fn receive(&self, mut responses: SyncResponseStream) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = responses.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    *self.last_activity.lock() = Instant::now();
                    self.handle_message(message);
                }
                Some(Err(err)) => {
                    warn!("Sync stream of remote {} failed: {}", self.remote_address, err);
                    break;
                }
                None => break,
            }
        }

        if !self.cancel.is_cancelled() {
            info!(
                "Remote node {} disconnected (sync {})",
                self.remote_address, self.sync_id
            );
            self.terminate("disconnected");
        }
    }

    async fn connection_alive(&self) {
        let period = self.config.remote_ping_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => (),
            }

            let idle = self.last_activity.lock().elapsed();

            if idle > self.config.remote_recent_activity_deadline() {
                warn!("Remote sync node {} timed out", self.remote_address);
                self.terminate("timed out");
                return;
            }

            if idle < self.config.remote_recent_activity_interval() {
                continue;
            }

            let nonce = hex::encode(rand::random::<[u8; 8]>());
            let ping = self.client.ping_sync(&self.sync_id, &nonce);

            match timeout(self.config.command_timeout(), ping).await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    error!("Ping sync with {} failed: {}", self.remote_address, err);
                    self.terminate("did not answer ping");
                    return;
                }
                Err(_) => {
                    error!("Ping sync with {} timed out", self.remote_address);
                    self.terminate("did not answer ping");
                    return;
                }
            }
        }
    }

    async fn stream_modifier(&self) {
        let period = self.config.remote_modify_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => (),
            }

            if let Err(err) = self.flush_pending().await {
                error!("Modify sync with {} failed: {}", self.remote_address, err);
                self.terminate("rejected modify sync");
                return;
            }
        }
    }

    /// Sends the collected additions and removals to the remote.
    async fn flush_pending(&self) -> Result<(), SyncError> {
        let (to_add, to_remove) = {
            let mut state = self.state.lock();

            if !state.has_pending() {
                let stop = state.stopped && state.is_idle();
                drop(state);
                if stop {
                    self.cancel
                        .cancel(SyncError::Canceled("Remote syncer has no streams left".into()));
                }
                return Ok(());
            }

            let to_add = std::mem::take(&mut state.pending_add);
            state.in_flight = to_add.iter().map(|cookie| cookie.stream_id).collect();
            (to_add, std::mem::take(&mut state.pending_remove))
        };

        let request = ModifySyncRequest {
            sync_id: self.sync_id.clone(),
            add_streams: to_add.clone(),
            remove_streams: to_remove.clone(),
            backfill_streams: None,
        };

        // In-flight streams stay tracked on failure, terminating reports them DOWN
        let response = match timeout(
            self.config.syncer_modify_timeout(),
            self.client.modify_sync(request),
        )
        .await
        {
            Ok(response) => response?,
            Err(_) => {
                return Err(SyncError::DeadlineExceeded(
                    "Modify sync timed out".into(),
                ))
            }
        };

        let failed_adds: HashMap<StreamId, SyncStreamOpStatus> = response
            .adds
            .into_iter()
            .map(|status| (status.stream_id, status))
            .collect();
        let failed_removals: HashSet<StreamId> = response
            .removals
            .iter()
            .map(|status| status.stream_id)
            .collect();

        let mut rejected = Vec::new();
        let is_empty = {
            let mut state = self.state.lock();
            if self.terminated.load(Ordering::SeqCst) {
                return Ok(());
            }
            state.in_flight.clear();

            for cookie in &to_add {
                match failed_adds.get(&cookie.stream_id) {
                    Some(status) => rejected.push(status.clone()),
                    None => {
                        state.watched.insert(cookie.stream_id);
                    }
                }
            }

            for stream_id in &to_remove {
                if failed_removals.contains(stream_id) {
                    warn!(
                        "Remote {} failed to remove stream {}",
                        self.remote_address, stream_id
                    );
                } else {
                    state.watched.remove(stream_id);
                }
            }

            let is_empty = state.is_idle();
            if is_empty {
                state.stopped = true;
            }
            is_empty
        };

        for status in rejected {
            warn!(
                "Remote {} rejected stream {}: {} {}",
                self.remote_address, status.stream_id, status.code, status.message
            );
            (self.unsubscribe)(status.stream_id);
            self.send(SyncStreamsResponse::down(status.stream_id));
        }

        if is_empty {
            self.cancel
                .cancel(SyncError::Canceled("Remote syncer has no streams left".into()));
        }

        Ok(())
    }

    async fn backfill(&self, request: &ModifySyncRequest) -> Vec<SyncStreamOpStatus> {
        let backfill = match &request.backfill_streams {
            Some(backfill) if !backfill.streams.is_empty() => backfill.clone(),
            _ => return Vec::new(),
        };

        let streams: Vec<StreamId> = backfill.streams.iter().map(|c| c.stream_id).collect();
        let remote_request = ModifySyncRequest {
            sync_id: self.sync_id.clone(),
            backfill_streams: Some(backfill),
            ..Default::default()
        };

        let result = timeout(
            self.config.syncer_modify_timeout(),
            self.client.modify_sync(remote_request),
        )
        .await;

        let err = match result {
            Ok(Ok(response)) => return response.backfills,
            Ok(Err(err)) => err,
            Err(_) => SyncError::DeadlineExceeded("Backfill timed out".into()),
        };

        streams
            .into_iter()
            .map(|stream_id| SyncStreamOpStatus::new(stream_id, &err))
            .collect()
    }
}

#[async_trait]
impl StreamsSyncer for RemoteSyncer {
    fn address(&self) -> NodeAddress {
        self.remote_address
    }

    async fn run(&self) {
        let responses = self.responses.lock().take();

        if let Some(responses) = responses {
            tokio::join!(
                self.receive(responses),
                self.connection_alive(),
                self.stream_modifier()
            );
        }

        // Release the session on the remote when we stopped on our own
        if !self.session.is_cancelled() {
            let cancel = self.client.cancel_sync(&self.sync_id);
            if let Err(err) = timeout(self.config.cancel_timeout(), cancel)
                .await
                .unwrap_or_else(|_| Err(SyncError::DeadlineExceeded("timed out".into())))
            {
                debug!(
                    "Could not cancel sync {} on {}: {}",
                    self.sync_id, self.remote_address, err
                );
            }
        }
    }

    async fn modify(
        &self,
        request: ModifySyncRequest,
    ) -> Result<(ModifySyncResponse, bool), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Canceled("Remote syncer stopped".into()));
        }

        let (stopped, stop_now) = {
            let mut state = self.state.lock();

            if state.stopped {
                return Err(SyncError::Canceled("Remote syncer stopped".into()));
            }

            for cookie in &request.add_streams {
                if let Some(pos) = state
                    .pending_remove
                    .iter()
                    .position(|stream_id| *stream_id == cookie.stream_id)
                {
                    state.pending_remove.remove(pos);
                } else if !state.is_known(&cookie.stream_id)
                    && !state
                        .pending_add
                        .iter()
                        .any(|pending| pending.stream_id == cookie.stream_id)
                {
                    state.pending_add.push(cookie.clone());
                }
            }

            for stream_id in &request.remove_streams {
                if let Some(pos) = state
                    .pending_add
                    .iter()
                    .position(|pending| pending.stream_id == *stream_id)
                {
                    state.pending_add.remove(pos);
                } else if state.is_known(stream_id) && !state.pending_remove.contains(stream_id)
                {
                    state.pending_remove.push(*stream_id);
                }
            }

            let stopped = state.candidates().is_empty();
            if stopped {
                state.stopped = true;
            }

            (stopped, stopped && !state.has_pending())
        };

        if stop_now {
            self.cancel
                .cancel(SyncError::Canceled("Remote syncer has no streams left".into()));
        }

        let response = ModifySyncResponse {
            backfills: self.backfill(&request).await,
            ..Default::default()
        };

        Ok((response, stopped))
    }

    async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<bool, SyncError> {
        self.client.debug_drop_stream(&self.sync_id, stream_id).await?;
        Ok(false)
    }
}
