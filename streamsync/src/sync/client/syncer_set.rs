// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use crate::config::SyncConfiguration;
use crate::errors::{ErrorCode, SyncError};
use crate::nodes::NodeRegistry;
use crate::store::StreamStore;
use crate::sync::client::{
    LocalSyncer, MessageQueue, ModifyRequest, RemoteSyncer, StatusHandler, StreamsSyncer,
    UnsubscribeStream,
};
use crate::sync::CancelHandle;
use crate::types::{
    Backfill, ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamId, SyncCookie,
    SyncStreamOpStatus,
};

type SyncerMap = HashMap<NodeAddress, Arc<dyn StreamsSyncer>>;

type StreamMap = HashMap<StreamId, Arc<dyn StreamsSyncer>>;

fn same_syncer(a: &Arc<dyn StreamsSyncer>, b: &Arc<dyn StreamsSyncer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Handler which collects statuses worth another attempt and reports all others.
fn retry_or_report(report: StatusHandler, retry: Arc<Mutex<HashSet<StreamId>>>) -> StatusHandler {
    Arc::new(move |status: SyncStreamOpStatus| match status.code {
        ErrorCode::NotFound | ErrorCode::Internal => {
            retry.lock().insert(status.stream_id);
        }
        _ => report(status),
    })
}

/// Modifications for the syncer of one node.
#[derive(Debug, Default)]
struct Batch {
    add: Vec<SyncCookie>,
    remove: Vec<StreamId>,
    backfills: Vec<Backfill>,
}

impl Batch {
    fn backfill(&mut self, sync_id: &str, cookie: SyncCookie) {
        match self
            .backfills
            .iter_mut()
            .find(|backfill| backfill.sync_id == sync_id)
        {
            Some(backfill) => backfill.streams.push(cookie),
            None => self.backfills.push(Backfill {
                sync_id: sync_id.to_owned(),
                streams: vec![cookie],
            }),
        }
    }

    /// A syncer request carries a single backfill, every further backfill gets its own request.
    fn into_requests(self, sync_id: &str) -> Vec<ModifySyncRequest> {
        let mut backfills = self.backfills.into_iter();

        let mut requests = vec![ModifySyncRequest {
            sync_id: sync_id.to_owned(),
            add_streams: self.add,
            remove_streams: self.remove,
            backfill_streams: backfills.next(),
        }];

        requests.extend(backfills.map(|backfill| ModifySyncRequest {
            sync_id: sync_id.to_owned(),
            backfill_streams: Some(backfill),
            ..Default::default()
        }));

        requests
    }
}

/// Failure handlers of one planned modification.
///
/// Streams can change their list while being planned: a backfill of an unsynced stream becomes
/// an add and an add of an already synced stream becomes a backfill. Failures are still
/// reported to the handler the stream was requested with.
struct Handlers {
    adding: StatusHandler,
    removing: StatusHandler,
    backfilling: StatusHandler,
    backfills_as_adds: HashSet<StreamId>,
    adds_as_backfills: HashSet<StreamId>,
}

impl Handlers {
    fn failed_add(&self, status: SyncStreamOpStatus) {
        if self.backfills_as_adds.contains(&status.stream_id) {
            (self.backfilling)(status)
        } else {
            (self.adding)(status)
        }
    }

    fn failed_removal(&self, status: SyncStreamOpStatus) {
        (self.removing)(status)
    }

    fn failed_backfill(&self, status: SyncStreamOpStatus) {
        if self.adds_as_backfills.contains(&status.stream_id) {
            (self.adding)(status)
        } else {
            (self.backfilling)(status)
        }
    }

    fn fail_all(&self, request: &ModifySyncRequest, err: &SyncError) {
        if let Some(backfill) = &request.backfill_streams {
            for cookie in &backfill.streams {
                self.failed_backfill(SyncStreamOpStatus::new(cookie.stream_id, err));
            }
        }

        for cookie in &request.add_streams {
            self.failed_add(SyncStreamOpStatus::new(cookie.stream_id, err));
        }

        for stream_id in &request.remove_streams {
            self.failed_removal(SyncStreamOpStatus::new(*stream_id, err));
        }
    }
}

/// Set of syncers shared by all subscriptions of a node.
///
/// Every synced stream is served by exactly one syncer, either the local one or the syncer of a
/// remote node. Syncers are created on demand and dropped once they have no streams left.
pub struct SyncerSet {
    local_address: NodeAddress,
    config: SyncConfiguration,
    store: Arc<dyn StreamStore>,
    node_registry: Arc<dyn NodeRegistry>,
    messages: MessageQueue,

    /// Cancelling this handle stops all syncers of the set.
    cancel: CancelHandle,

    syncers: Arc<tokio::sync::Mutex<SyncerMap>>,
    streams: Arc<RwLock<StreamMap>>,
    stream_locks: Mutex<HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>>,
    tasks: TaskTracker,
    stopped: AtomicBool,
}

impl SyncerSet {
    pub fn new(
        config: SyncConfiguration,
        local_address: NodeAddress,
        store: Arc<dyn StreamStore>,
        node_registry: Arc<dyn NodeRegistry>,
        messages: MessageQueue,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            local_address,
            config,
            store,
            node_registry,
            messages,
            cancel,
            syncers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            streams: Arc::new(RwLock::new(HashMap::new())),
            stream_locks: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Waits until the set got cancelled and all syncers finished.
    pub async fn run(&self) {
        self.cancel.cancelled().await;

        {
            let _syncers = self.syncers.lock().await;
            self.stopped.store(true, Ordering::SeqCst);
        }

        self.tasks.close();
        self.tasks.wait().await;
        debug!("All syncers stopped");
    }

    /// Address of the node the given stream is synced from.
    pub fn syncer_address(&self, stream_id: &StreamId) -> Option<NodeAddress> {
        self.streams
            .read()
            .get(stream_id)
            .map(|syncer| syncer.address())
    }

    /// Number of running syncers.
    pub async fn syncer_count(&self) -> usize {
        self.syncers.lock().await.len()
    }

    /// Applies the request. Per-stream failures are reported through the handlers of the request.
    ///
    /// Adds and backfills which failed because the stream could not be found or the node failed
    /// internally are tried once more without the node hinted in their cookie.
    pub async fn modify(&self, request: ModifyRequest) -> Result<(), SyncError> {
        request.validate()?;

        let retry_adds = Arc::new(Mutex::new(HashSet::new()));
        let retry_backfills = Arc::new(Mutex::new(HashSet::new()));

        let first = ModifyRequest {
            adding_failure_handler: retry_or_report(
                request.adding_failure_handler.clone(),
                retry_adds.clone(),
            ),
            backfilling_failure_handler: retry_or_report(
                request.backfilling_failure_handler.clone(),
                retry_backfills.clone(),
            ),
            ..request.clone()
        };
        self.modify_once(first).await?;

        let retry_adds = std::mem::take(&mut *retry_adds.lock());
        let retry_backfills = std::mem::take(&mut *retry_backfills.lock());
        if retry_adds.is_empty() && retry_backfills.is_empty() {
            return Ok(());
        }

        let mut retry = ModifyRequest {
            to_add: Vec::new(),
            to_remove: Vec::new(),
            to_backfill: Vec::new(),
            ..request.clone()
        };

        for stream_id in &retry_adds {
            let cookie = request
                .to_add
                .iter()
                .find(|cookie| cookie.stream_id == *stream_id)
                .map(SyncCookie::without_address)
                .unwrap_or_else(|| SyncCookie::new(*stream_id));
            retry.to_add.push(cookie);
        }

        for backfill in &request.to_backfill {
            let streams: Vec<SyncCookie> = backfill
                .streams
                .iter()
                .filter(|cookie| retry_backfills.contains(&cookie.stream_id))
                .map(SyncCookie::without_address)
                .collect();

            if !streams.is_empty() {
                retry.to_backfill.push(Backfill {
                    sync_id: backfill.sync_id.clone(),
                    streams,
                });
            }
        }

        debug!(
            "Retry {} adds and {} backfills of sync {} without node hint",
            retry.to_add.len(),
            retry.to_backfill.len(),
            request.sync_id
        );

        self.modify_once(retry).await
    }

    /// Adds a single stream, turning a failed status into an error.
    pub async fn add_stream(&self, sync_id: &str, cookie: SyncCookie) -> Result<(), SyncError> {
        let failure = Arc::new(Mutex::new(None));

        let mut request = ModifyRequest::new(sync_id);
        request.to_add.push(cookie);
        request.adding_failure_handler = {
            let failure = failure.clone();
            Arc::new(move |status: SyncStreamOpStatus| *failure.lock() = Some(status))
        };

        self.modify(request).await?;

        let failure = failure.lock().take();
        match failure {
            Some(status) => Err(status.to_error()),
            None => Ok(()),
        }
    }

    /// Removes a single stream, turning a failed status into an error.
    pub async fn remove_stream(&self, sync_id: &str, stream_id: StreamId) -> Result<(), SyncError> {
        let failure = Arc::new(Mutex::new(None));

        let mut request = ModifyRequest::new(sync_id);
        request.to_remove.push(stream_id);
        request.removing_failure_handler = {
            let failure = failure.clone();
            Arc::new(move |status: SyncStreamOpStatus| *failure.lock() = Some(status))
        };

        self.modify(request).await?;

        let failure = failure.lock().take();
        match failure {
            Some(status) => Err(status.to_error()),
            None => Ok(()),
        }
    }

    /// Stops syncing the stream unless `in_use` reports it still has subscribers.
    ///
    /// `in_use` is evaluated while the stream is locked. A concurrent add either ran before and
    /// keeps the stream synced, or runs after the removal and starts syncing it again.
    pub async fn remove_unused_stream(
        &self,
        sync_id: &str,
        stream_id: StreamId,
        in_use: impl FnOnce(&StreamId) -> bool + Send,
    ) -> Result<bool, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Canceled("Sync stopped".into()));
        }

        let guard = self.stream_lock(&stream_id).lock_owned().await;

        let syncer = self.streams.read().get(&stream_id).cloned();
        let syncer = match syncer {
            Some(syncer) if !in_use(&stream_id) => syncer,
            _ => {
                self.unlock_stream(&stream_id, guard);
                return Ok(false);
            }
        };

        let failure = Arc::new(Mutex::new(None));
        let report: StatusHandler = {
            let failure = failure.clone();
            Arc::new(move |status: SyncStreamOpStatus| *failure.lock() = Some(status))
        };
        let handlers = Handlers {
            adding: report.clone(),
            removing: report.clone(),
            backfilling: report,
            backfills_as_adds: HashSet::new(),
            adds_as_backfills: HashSet::new(),
        };

        let batch = Batch {
            remove: vec![stream_id],
            ..Default::default()
        };
        self.apply(syncer.address(), batch, sync_id, &handlers).await;
        self.unlock_stream(&stream_id, guard);

        let failure = failure.lock().take();
        match failure {
            Some(status) => Err(status.to_error()),
            None => Ok(true),
        }
    }

    /// Makes the syncer of the stream drop it, which emits a DOWN message for the stream.
    pub async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<(), SyncError> {
        let syncer = self.streams.read().get(stream_id).cloned().ok_or_else(|| {
            SyncError::NotFound(format!("Stream {} not part of sync operation", stream_id))
        })?;

        let stopped = syncer.debug_drop_stream(stream_id).await?;

        self.streams.write().remove(stream_id);
        if stopped {
            self.forget_syncer(&syncer).await;
        }

        Ok(())
    }

    async fn modify_once(&self, request: ModifyRequest) -> Result<(), SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Canceled("Sync stopped".into()));
        }

        let stream_ids: BTreeSet<StreamId> = request
            .to_add
            .iter()
            .map(|cookie| cookie.stream_id)
            .chain(request.to_remove.iter().copied())
            .collect();
        let mut locked = self.lock_streams(stream_ids).await;

        let mut batches: HashMap<NodeAddress, Batch> = HashMap::new();
        let mut to_add = request.to_add.clone();
        let mut backfills_as_adds = HashSet::new();
        let mut adds_as_backfills = HashSet::new();

        // Parallel modifications might lock a stream by adding or removing it
        for backfill in &request.to_backfill {
            for cookie in &backfill.streams {
                let stream_id = cookie.stream_id;

                if !locked.contains_key(&stream_id)
                    && self.wait_for_stream_unlock(&stream_id).await.is_err()
                {
                    (request.backfilling_failure_handler)(SyncStreamOpStatus::new(
                        stream_id,
                        &SyncError::Unavailable(
                            "Stream is temporarily unavailable for syncing".into(),
                        ),
                    ));
                    continue;
                }

                let syncer = self.streams.read().get(&stream_id).cloned();
                match syncer {
                    Some(syncer) => {
                        let address = syncer.address();
                        batches
                            .entry(address)
                            .or_default()
                            .backfill(&backfill.sync_id, cookie.copy_with_address(address));
                    }
                    None if locked.contains_key(&stream_id) => (),
                    None => {
                        // Stream is not synced yet, add it instead
                        let lock = self.stream_lock(&stream_id);
                        let wait = self.config.syncer_modify_timeout();
                        match timeout(wait, lock.lock_owned()).await {
                            Ok(guard) => {
                                locked.insert(stream_id, guard);
                                backfills_as_adds.insert(stream_id);
                                to_add.push(cookie.clone());
                            }
                            Err(_) => {
                                (request.backfilling_failure_handler)(SyncStreamOpStatus::new(
                                    stream_id,
                                    &SyncError::Unavailable(
                                        "Stream is temporarily unavailable for syncing".into(),
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
        }

        let handlers = Handlers {
            adding: request.adding_failure_handler.clone(),
            removing: request.removing_failure_handler.clone(),
            backfilling: request.backfilling_failure_handler.clone(),
            backfills_as_adds,
            adds_as_backfills: HashSet::new(),
        };

        for cookie in &to_add {
            let stream_id = cookie.stream_id;

            // Already synced streams only need the updates the subscription missed
            let syncer = self.streams.read().get(&stream_id).cloned();
            if let Some(syncer) = syncer {
                let address = syncer.address();
                batches
                    .entry(address)
                    .or_default()
                    .backfill(&request.sync_id, cookie.copy_with_address(address));
                adds_as_backfills.insert(stream_id);
                if let Some(guard) = locked.remove(&stream_id) {
                    self.unlock_stream(&stream_id, guard);
                }
                continue;
            }

            match self.select_node(cookie).await {
                Some(address) => batches
                    .entry(address)
                    .or_default()
                    .add
                    .push(cookie.copy_with_address(address)),
                None => handlers.failed_add(SyncStreamOpStatus::new(
                    stream_id,
                    &SyncError::Unavailable("No available node to sync stream".into()),
                )),
            }
        }

        for stream_id in &request.to_remove {
            let syncer = self.streams.read().get(stream_id).cloned();
            if let Some(syncer) = syncer {
                batches
                    .entry(syncer.address())
                    .or_default()
                    .remove
                    .push(*stream_id);
            }
        }

        let handlers = Handlers {
            adds_as_backfills,
            ..handlers
        };

        if !batches.is_empty() {
            join_all(
                batches
                    .into_iter()
                    .map(|(address, batch)| self.apply(address, batch, &request.sync_id, &handlers)),
            )
            .await;
        }

        for (stream_id, guard) in locked {
            self.unlock_stream(&stream_id, guard);
        }

        Ok(())
    }

    /// Forwards the batch to the syncer of the node and updates the stream mapping.
    async fn apply(&self, address: NodeAddress, batch: Batch, sync_id: &str, handlers: &Handlers) {
        for request in batch.into_requests(sync_id) {
            let (syncer, response) = match self.modify_syncer(address, request.clone()).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        "Modify sync {} on syncer {} failed: {}",
                        sync_id, address, err
                    );
                    handlers.fail_all(&request, &err);
                    continue;
                }
            };

            for status in response.backfills {
                handlers.failed_backfill(status);
            }

            let failed_adds: HashSet<StreamId> =
                response.adds.iter().map(|status| status.stream_id).collect();
            for status in response.adds {
                handlers.failed_add(status);
            }

            let failed_removals: HashSet<StreamId> = response
                .removals
                .iter()
                .map(|status| status.stream_id)
                .collect();
            for status in response.removals {
                handlers.failed_removal(status);
            }

            {
                let mut streams = self.streams.write();
                for cookie in &request.add_streams {
                    if !failed_adds.contains(&cookie.stream_id) {
                        streams.insert(cookie.stream_id, syncer.clone());
                    }
                }
                for stream_id in &request.remove_streams {
                    if !failed_removals.contains(stream_id) {
                        streams.remove(stream_id);
                    }
                }
            }
        }
    }

    /// Sends the request to the syncer of the node. A syncer which stopped in the meantime gets
    /// replaced by a fresh one once.
    async fn modify_syncer(
        &self,
        address: NodeAddress,
        request: ModifySyncRequest,
    ) -> Result<(Arc<dyn StreamsSyncer>, ModifySyncResponse), SyncError> {
        let syncer = self.get_or_create_syncer(address).await?;

        match self.modify_with_timeout(&syncer, request.clone()).await {
            Err(err) if err.code() == ErrorCode::Canceled && !self.stopped.load(Ordering::SeqCst) => {
                debug!("Syncer {} stopped, starting a new one", address);
                self.forget_syncer(&syncer).await;

                let syncer = self.get_or_create_syncer(address).await?;
                let response = self.modify_with_timeout(&syncer, request).await?;
                Ok((syncer, response))
            }
            result => Ok((syncer, result?)),
        }
    }

    async fn modify_with_timeout(
        &self,
        syncer: &Arc<dyn StreamsSyncer>,
        request: ModifySyncRequest,
    ) -> Result<ModifySyncResponse, SyncError> {
        let (response, stopped) =
            match timeout(self.config.syncer_modify_timeout(), syncer.modify(request)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SyncError::DeadlineExceeded(format!(
                        "Syncer {} did not apply modification in time",
                        syncer.address()
                    )))
                }
            };

        if stopped {
            self.forget_syncer(syncer).await;
        }

        Ok(response)
    }

    /// Picks the node a new stream is synced from: the node hinted in the cookie, this node when
    /// it hosts the stream, or the stream's remotes starting with its sticky peer.
    async fn select_node(&self, cookie: &SyncCookie) -> Option<NodeAddress> {
        if let Some(address) = cookie.node_address {
            if self.get_or_create_syncer(address).await.is_ok() {
                return Some(address);
            }
        }

        let stream = match self.store.get_stream_no_wait(&cookie.stream_id).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("Stream {} not available: {}", cookie.stream_id, err);
                return None;
            }
        };

        let (remotes, is_local) = stream.remotes_and_is_local();
        if is_local && self.get_or_create_syncer(self.local_address).await.is_ok() {
            return Some(self.local_address);
        }

        let mut candidate = stream.sticky_peer();
        for _ in 0..remotes.len() {
            let address = candidate?;
            match self.get_or_create_syncer(address).await {
                Ok(_) => return Some(address),
                Err(err) => {
                    debug!("Node {} not available for syncing: {}", address, err);
                    candidate = stream.advance_sticky_peer(&address);
                }
            }
        }

        None
    }

    async fn get_or_create_syncer(
        &self,
        address: NodeAddress,
    ) -> Result<Arc<dyn StreamsSyncer>, SyncError> {
        let mut syncers = self.syncers.lock().await;

        if let Some(syncer) = syncers.get(&address) {
            return Ok(syncer.clone());
        }

        let unsubscribe = self.unsubscribe_stream(address);
        let syncer: Arc<dyn StreamsSyncer> = if address == self.local_address {
            LocalSyncer::new(
                self.local_address,
                self.store.clone(),
                self.messages.clone(),
                unsubscribe,
                self.cancel.clone(),
            )
        } else {
            let client = self.node_registry.stream_service_client(&address)?;
            RemoteSyncer::new(
                address,
                client,
                self.messages.clone(),
                unsubscribe,
                self.cancel.clone(),
                self.config.clone(),
            )
            .await?
        };

        // Set might have been stopped while a remote session was started
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Canceled("Sync stopped".into()));
        }

        debug!("Start syncer for node {}", address);
        syncers.insert(address, syncer.clone());

        let task = syncer.clone();
        let syncers_map = self.syncers.clone();
        let streams = self.streams.clone();
        self.tasks.spawn(async move {
            task.run().await;

            {
                let mut syncers = syncers_map.lock().await;
                if syncers
                    .get(&address)
                    .map_or(false, |syncer| same_syncer(syncer, &task))
                {
                    syncers.remove(&address);
                }
            }

            streams.write().retain(|_, syncer| !same_syncer(syncer, &task));
            debug!("Syncer for node {} stopped", address);
        });

        Ok(syncer)
    }

    async fn forget_syncer(&self, syncer: &Arc<dyn StreamsSyncer>) {
        let address = syncer.address();
        let mut syncers = self.syncers.lock().await;

        if syncers
            .get(&address)
            .map_or(false, |current| same_syncer(current, syncer))
        {
            syncers.remove(&address);
        }
    }

    /// Syncers call this when they stopped watching a stream on their own.
    fn unsubscribe_stream(&self, address: NodeAddress) -> UnsubscribeStream {
        let streams = self.streams.clone();

        Arc::new(move |stream_id: StreamId| {
            let mut streams = streams.write();
            if streams
                .get(&stream_id)
                .map_or(false, |syncer| syncer.address() == address)
            {
                streams.remove(&stream_id);
            }
        })
    }

    fn stream_lock(&self, stream_id: &StreamId) -> Arc<tokio::sync::Mutex<()>> {
        self.stream_locks
            .lock()
            .entry(*stream_id)
            .or_default()
            .clone()
    }

    /// Locks all given streams in ascending order.
    async fn lock_streams(
        &self,
        stream_ids: BTreeSet<StreamId>,
    ) -> BTreeMap<StreamId, OwnedMutexGuard<()>> {
        let mut guards = BTreeMap::new();

        for stream_id in stream_ids {
            let guard = self.stream_lock(&stream_id).lock_owned().await;
            guards.insert(stream_id, guard);
        }

        guards
    }

    fn unlock_stream(&self, stream_id: &StreamId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.prune_lock(stream_id);
    }

    fn prune_lock(&self, stream_id: &StreamId) {
        let mut locks = self.stream_locks.lock();

        if locks
            .get(stream_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(stream_id);
        }
    }

    async fn wait_for_stream_unlock(&self, stream_id: &StreamId) -> Result<(), SyncError> {
        let lock = match self.stream_locks.lock().get(stream_id) {
            Some(lock) => lock.clone(),
            None => return Ok(()),
        };

        let result = timeout(self.config.syncer_modify_timeout(), lock.lock()).await;
        let unlocked = result.is_ok();
        drop(result);
        drop(lock);
        self.prune_lock(stream_id);

        if unlocked {
            Ok(())
        } else {
            Err(SyncError::Unavailable(
                "Stream is temporarily unavailable for syncing".into(),
            ))
        }
    }
}
