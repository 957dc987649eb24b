// SPDX-License-Identifier: AGPL-3.0-or-later

//! Interface to the stream store holding the streams this node replicates.
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::types::{NodeAddress, StreamAndCookie, StreamId, SyncCookie};

/// Receives updates of streams a listener subscribed to.
///
/// Callbacks run while the stream holds its internal lock. Implementations must not block and
/// must never call back into any stream.
pub trait StreamListener: Send + Sync {
    /// New events or miniblocks were added to the stream.
    fn on_update(&self, update: StreamAndCookie);

    /// The stream stopped being available on this node. No further updates will follow.
    fn on_sync_down(&self, stream_id: StreamId);
}

/// Handle to a single stream in the store.
#[async_trait]
pub trait LocalStream: Send + Sync {
    fn stream_id(&self) -> StreamId;

    /// Registers a listener. It first receives everything since `cookie`, then live updates.
    async fn subscribe(
        &self,
        cookie: &SyncCookie,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(), SyncError>;

    /// Removes a listener, compared by pointer identity.
    fn unsubscribe(&self, listener: &Arc<dyn StreamListener>);

    /// Reads all updates after `cookie`. The callback gets invoked at least once, with an empty
    /// update when the cookie is already up to date.
    async fn updates_since_cookie(
        &self,
        cookie: &SyncCookie,
        callback: &mut (dyn FnMut(StreamAndCookie) -> Result<(), SyncError> + Send),
    ) -> Result<(), SyncError>;

    /// Remote nodes holding a replica and whether this node holds one too.
    fn remotes_and_is_local(&self) -> (Vec<NodeAddress>, bool);

    /// Currently preferred remote replica.
    fn sticky_peer(&self) -> Option<NodeAddress>;

    /// Moves the sticky peer to the next remote replica after `failed` did not respond.
    fn advance_sticky_peer(&self, failed: &NodeAddress) -> Option<NodeAddress>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Returns the stream once it is loaded on this node.
    async fn get_stream_wait_for_local(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<dyn LocalStream>, SyncError>;

    /// Returns the stream without waiting for it to load, `NotFound` when the node does not
    /// know about it.
    async fn get_stream_no_wait(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<dyn LocalStream>, SyncError>;
}
