// SPDX-License-Identifier: AGPL-3.0-or-later

//! Access to the streaming endpoint of other nodes.
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::SyncError;
use crate::types::{
    ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamId, SyncCookie,
    SyncStreamsResponse,
};

/// Server-streaming response of a sync session.
pub type SyncResponseStream = BoxStream<'static, Result<SyncStreamsResponse, SyncError>>;

/// Client of the sync RPC surface of one node.
#[async_trait]
pub trait StreamServiceClient: Send + Sync {
    /// Opens a session. The first message of the returned stream carries the new sync id.
    async fn sync_streams(&self, cookies: Vec<SyncCookie>) -> Result<SyncResponseStream, SyncError>;

    async fn modify_sync(&self, request: ModifySyncRequest)
        -> Result<ModifySyncResponse, SyncError>;

    async fn ping_sync(&self, sync_id: &str, nonce: &str) -> Result<(), SyncError>;

    async fn cancel_sync(&self, sync_id: &str) -> Result<(), SyncError>;

    async fn debug_drop_stream(&self, sync_id: &str, stream_id: &StreamId)
        -> Result<(), SyncError>;
}

/// Resolves node addresses into clients.
pub trait NodeRegistry: Send + Sync {
    fn stream_service_client(
        &self,
        address: &NodeAddress,
    ) -> Result<Arc<dyn StreamServiceClient>, SyncError>;
}
