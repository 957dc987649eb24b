// SPDX-License-Identifier: AGPL-3.0-or-later

//! Syncers pull stream updates from one upstream each, either the local stream store or the sync
//! endpoint of a remote node, and write them into a shared message queue.
mod local;
mod remote;
mod syncer_set;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::sync::BoundedQueue;
use crate::types::{
    Backfill, ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamId, SyncCookie,
    SyncStreamOpStatus, SyncStreamsResponse,
};

pub use local::LocalSyncer;
pub use remote::RemoteSyncer;
pub use syncer_set::SyncerSet;

/// Queue all syncers of a set write their updates into.
pub type MessageQueue = Arc<BoundedQueue<SyncStreamsResponse>>;

/// Called with the status of a stream which could not be added, removed or backfilled.
pub type StatusHandler = Arc<dyn Fn(SyncStreamOpStatus) + Send + Sync>;

/// Informs the owner of a syncer that the syncer stopped watching a stream on its own.
pub type UnsubscribeStream = Arc<dyn Fn(StreamId) + Send + Sync>;

/// Handle to one upstream source of stream updates.
#[async_trait]
pub trait StreamsSyncer: Send + Sync {
    /// Address of the node this syncer receives updates from.
    fn address(&self) -> NodeAddress;

    /// Runs until the syncer got cancelled or lost its upstream.
    async fn run(&self);

    /// Applies adds, removals and backfills. Per-stream failures are reported in the response,
    /// the returned flag is set when the syncer has no streams left and stopped.
    ///
    /// Fails with [`SyncError::Canceled`] when the syncer already stopped.
    async fn modify(
        &self,
        request: ModifySyncRequest,
    ) -> Result<(ModifySyncResponse, bool), SyncError>;

    /// Makes the upstream drop the stream so a DOWN message gets emitted for it.
    async fn debug_drop_stream(&self, stream_id: &StreamId) -> Result<bool, SyncError>;
}

/// Modifications of the syncer set requested by one subscription.
#[derive(Clone)]
pub struct ModifyRequest {
    pub sync_id: String,
    pub to_add: Vec<SyncCookie>,
    pub to_remove: Vec<StreamId>,
    pub to_backfill: Vec<Backfill>,
    pub adding_failure_handler: StatusHandler,
    pub removing_failure_handler: StatusHandler,
    pub backfilling_failure_handler: StatusHandler,
}

impl ModifyRequest {
    /// Returns an empty request for the given sync id with failure handlers which ignore all
    /// errors.
    pub fn new(sync_id: &str) -> Self {
        let ignore: StatusHandler = Arc::new(|_| ());

        Self {
            sync_id: sync_id.to_owned(),
            to_add: Vec::new(),
            to_remove: Vec::new(),
            to_backfill: Vec::new(),
            adding_failure_handler: ignore.clone(),
            removing_failure_handler: ignore.clone(),
            backfilling_failure_handler: ignore,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_backfill.is_empty()
    }

    /// Checks the request before anything gets changed.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.is_empty() {
            return Err(SyncError::InvalidArgument(
                "Empty modify sync request".into(),
            ));
        }

        let mut seen = HashSet::new();
        for cookie in self.to_backfill.iter().flat_map(|backfill| &backfill.streams) {
            if !seen.insert(cookie.stream_id) {
                return Err(SyncError::InvalidArgument(
                    "Duplicate stream in backfill list".into(),
                ));
            }
        }

        let mut added = HashSet::with_capacity(self.to_add.len());
        for cookie in &self.to_add {
            if !added.insert(cookie.stream_id) {
                return Err(SyncError::InvalidArgument(
                    "Duplicate stream in add list".into(),
                ));
            }
        }

        let mut removed = HashSet::with_capacity(self.to_remove.len());
        for stream_id in &self.to_remove {
            if !removed.insert(*stream_id) {
                return Err(SyncError::InvalidArgument(
                    "Duplicate stream in remove list".into(),
                ));
            }

            if added.contains(stream_id) {
                return Err(SyncError::InvalidArgument(
                    "Stream in remove list is also in add list".into(),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ModifyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifyRequest")
            .field("sync_id", &self.sync_id)
            .field("to_add", &self.to_add)
            .field("to_remove", &self.to_remove)
            .field("to_backfill", &self.to_backfill)
            .finish()
    }
}

/// Stack of sync ids a backfill for `request` has to be routed through.
pub(crate) fn backfill_targets(request_sync_id: &str, backfill_sync_id: &str) -> Vec<String> {
    let mut targets = vec![request_sync_id.to_owned()];
    if !backfill_sync_id.is_empty() && backfill_sync_id != request_sync_id {
        targets.push(backfill_sync_id.to_owned());
    }
    targets
}
