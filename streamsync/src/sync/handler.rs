// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::bus::{ServiceMessage, ServiceSender};
use crate::config::SyncConfiguration;
use crate::errors::{ErrorCode, SyncError};
use crate::nodes::{StreamServiceClient, SyncResponseStream};
use crate::sync::operation::StreamSyncOperation;
use crate::sync::subscription::Manager;
use crate::sync::CancelHandle;
use crate::types::{ModifySyncRequest, ModifySyncResponse, StreamId, SyncCookie};

type Operations = Arc<Mutex<HashMap<String, Arc<StreamSyncOperation>>>>;

/// Random identifier of a new sync session.
fn generate_sync_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Entry point of the sync RPC surface. Opens sessions and routes calls to them by sync id.
#[derive(Clone)]
pub struct SyncHandler {
    config: SyncConfiguration,
    manager: Arc<Manager>,
    operations: Operations,
    tx: ServiceSender,
}

impl SyncHandler {
    pub fn new(config: SyncConfiguration, manager: Arc<Manager>, tx: ServiceSender) -> Self {
        Self {
            config,
            manager,
            operations: Arc::new(Mutex::new(HashMap::new())),
            tx,
        }
    }

    /// Opens a session for the given streams.
    ///
    /// The first message of the returned stream carries the sync id. Dropping the stream cancels
    /// the session.
    pub fn sync_streams(&self, cookies: Vec<SyncCookie>) -> SyncResponseStream {
        let sync_id = generate_sync_id();
        let root = CancelHandle::new();
        let operation = StreamSyncOperation::new(
            &sync_id,
            root.clone(),
            self.config.clone(),
            self.manager.clone(),
        );

        self.operations
            .lock()
            .insert(sync_id.clone(), operation.clone());

        let (tx, rx) = mpsc::channel(self.config.client_channel_capacity);

        info!("Start sync {} with {} streams", sync_id, cookies.len());
        let _ = self.tx.send(ServiceMessage::SyncStarted(sync_id.clone()));

        // Client dropped its end of the stream
        tokio::spawn({
            let tx = tx.clone();
            let root = root.clone();
            async move {
                tokio::select! {
                    _ = tx.closed() => {
                        root.cancel(SyncError::Canceled("Client closed the sync stream".into()))
                    }
                    _ = root.cancelled() => (),
                }
            }
        });

        tokio::spawn({
            let operations = self.operations.clone();
            let bus = self.tx.clone();
            async move {
                let result = operation.run(cookies, &tx).await;
                operations.lock().remove(&sync_id);

                if let Err(err) = result {
                    debug!("Sync {} failed: {}", sync_id, err);
                    if err.code() != ErrorCode::Canceled {
                        let _ = tx.try_send(Err(err));
                    }
                }

                root.cancel(SyncError::Canceled("Sync operation finished".into()));
                info!("Stopped sync {}", sync_id);
                let _ = bus.send(ServiceMessage::SyncStopped(sync_id));
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    pub async fn add_stream_to_sync(
        &self,
        sync_id: &str,
        cookie: SyncCookie,
    ) -> Result<(), SyncError> {
        self.operation(sync_id)?
            .add_stream_to_sync(sync_id, cookie)
            .await
    }

    pub async fn remove_stream_from_sync(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> Result<(), SyncError> {
        self.operation(sync_id)?
            .remove_stream_from_sync(sync_id, stream_id)
            .await
    }

    pub async fn modify_sync(
        &self,
        request: ModifySyncRequest,
    ) -> Result<ModifySyncResponse, SyncError> {
        self.operation(&request.sync_id)?
            .modify_sync(request)
            .await
    }

    pub async fn cancel_sync(&self, sync_id: &str) -> Result<(), SyncError> {
        self.operation(sync_id)?.cancel_sync(sync_id).await
    }

    pub async fn ping_sync(&self, sync_id: &str, nonce: &str) -> Result<(), SyncError> {
        self.operation(sync_id)?.ping_sync(sync_id, nonce).await
    }

    pub async fn debug_drop_stream(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> Result<(), SyncError> {
        self.operation(sync_id)?
            .debug_drop_stream(sync_id, stream_id)
            .await
    }

    /// Number of running sessions.
    pub fn active_syncs(&self) -> usize {
        self.operations.lock().len()
    }

    fn operation(&self, sync_id: &str) -> Result<Arc<StreamSyncOperation>, SyncError> {
        self.operations
            .lock()
            .get(sync_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("Sync operation {} not found", sync_id)))
    }
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("active_syncs", &self.active_syncs())
            .finish()
    }
}

/// Lets the handler of one node act as the remote endpoint of another node.
#[async_trait]
impl StreamServiceClient for SyncHandler {
    async fn sync_streams(
        &self,
        cookies: Vec<SyncCookie>,
    ) -> Result<SyncResponseStream, SyncError> {
        Ok(SyncHandler::sync_streams(self, cookies))
    }

    async fn modify_sync(
        &self,
        request: ModifySyncRequest,
    ) -> Result<ModifySyncResponse, SyncError> {
        SyncHandler::modify_sync(self, request).await
    }

    async fn ping_sync(&self, sync_id: &str, nonce: &str) -> Result<(), SyncError> {
        SyncHandler::ping_sync(self, sync_id, nonce).await
    }

    async fn cancel_sync(&self, sync_id: &str) -> Result<(), SyncError> {
        SyncHandler::cancel_sync(self, sync_id).await
    }

    async fn debug_drop_stream(
        &self,
        sync_id: &str,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        SyncHandler::debug_drop_stream(self, sync_id, *stream_id).await
    }
}
