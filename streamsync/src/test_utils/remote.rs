// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::errors::SyncError;
use crate::nodes::{NodeRegistry, StreamServiceClient, SyncResponseStream};
use crate::types::{
    ModifySyncRequest, ModifySyncResponse, NodeAddress, StreamId, SyncCookie,
    SyncStreamOpStatus, SyncStreamsResponse,
};

type ResponseSender = mpsc::UnboundedSender<Result<SyncStreamsResponse, SyncError>>;

/// Decrements the open stream counter when the response stream gets dropped.
struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted sync endpoint of a remote node.
///
/// Opens sessions named `remote-sync`, records modify requests and lets tests push messages into
/// or cut the response stream.
#[derive(Default)]
pub struct FakeRemoteClient {
    silent: bool,
    sender: Mutex<Option<ResponseSender>>,
    open_streams: Arc<AtomicUsize>,
    modify_requests: Mutex<Vec<ModifySyncRequest>>,
    rejected: Mutex<HashSet<StreamId>>,
    modify_error: Mutex<Option<SyncError>>,
    ignore_pings: AtomicBool,
    pings: AtomicUsize,
    cancelled: AtomicBool,
}

impl FakeRemoteClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Client which opens sessions but never confirms them.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            silent: true,
            ..Self::default()
        })
    }

    /// Pushes a message into the current response stream.
    pub fn send(&self, message: SyncStreamsResponse) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Ok(message));
        }
    }

    /// Ends the current response stream.
    pub fn disconnect(&self) {
        self.sender.lock().take();
    }

    /// Adds of this stream get rejected.
    pub fn reject(&self, stream_id: StreamId) {
        self.rejected.lock().insert(stream_id);
    }

    /// Every following modify call fails with the given error.
    pub fn fail_modify(&self, err: SyncError) {
        *self.modify_error.lock() = Some(err);
    }

    /// Pings get accepted but not answered with a PONG.
    pub fn ignore_pings(&self) {
        self.ignore_pings.store(true, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn modify_requests(&self) -> Vec<ModifySyncRequest> {
        self.modify_requests.lock().clone()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamServiceClient for FakeRemoteClient {
    async fn sync_streams(
        &self,
        _cookies: Vec<SyncCookie>,
    ) -> Result<SyncResponseStream, SyncError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        if !self.silent {
            let _ = sender.send(Ok(SyncStreamsResponse::new_sync("remote-sync")));
        }
        *self.sender.lock() = Some(sender);

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let open = OpenStream(self.open_streams.clone());

        Ok(UnboundedReceiverStream::new(receiver)
            .map(move |message| {
                let _open = &open;
                message
            })
            .boxed())
    }

    async fn modify_sync(
        &self,
        request: ModifySyncRequest,
    ) -> Result<ModifySyncResponse, SyncError> {
        if let Some(err) = self.modify_error.lock().clone() {
            return Err(err);
        }

        let rejected = self.rejected.lock().clone();
        let adds = request
            .add_streams
            .iter()
            .filter(|cookie| rejected.contains(&cookie.stream_id))
            .map(|cookie| {
                SyncStreamOpStatus::new(
                    cookie.stream_id,
                    &SyncError::NotFound("Stream not found".into()),
                )
            })
            .collect();

        self.modify_requests.lock().push(request);

        Ok(ModifySyncResponse {
            adds,
            ..Default::default()
        })
    }

    async fn ping_sync(&self, _sync_id: &str, nonce: &str) -> Result<(), SyncError> {
        self.pings.fetch_add(1, Ordering::SeqCst);

        if !self.ignore_pings.load(Ordering::SeqCst) {
            self.send(SyncStreamsResponse::pong(nonce));
        }

        Ok(())
    }

    async fn cancel_sync(&self, _sync_id: &str) -> Result<(), SyncError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.send(SyncStreamsResponse::close());
        Ok(())
    }

    async fn debug_drop_stream(
        &self,
        _sync_id: &str,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        self.send(SyncStreamsResponse::down(*stream_id));
        Ok(())
    }
}

/// Node registry resolving addresses to the clients tests registered.
#[derive(Default)]
pub struct TestNodeRegistry {
    clients: Mutex<HashMap<NodeAddress, Arc<dyn StreamServiceClient>>>,
}

impl TestNodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, address: NodeAddress, client: Arc<dyn StreamServiceClient>) {
        self.clients.lock().insert(address, client);
    }
}

impl NodeRegistry for TestNodeRegistry {
    fn stream_service_client(
        &self,
        address: &NodeAddress,
    ) -> Result<Arc<dyn StreamServiceClient>, SyncError> {
        self.clients
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| SyncError::Unavailable(format!("Node {} unreachable", address)))
    }
}
