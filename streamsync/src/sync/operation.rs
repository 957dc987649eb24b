// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadqueue::limited::Queue;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

use crate::config::SyncConfiguration;
use crate::errors::{ErrorCode, SyncError};
use crate::sync::client::ModifyRequest;
use crate::sync::subscription::{Manager, Subscription};
use crate::sync::CancelHandle;
use crate::types::{
    Backfill, ModifySyncRequest, ModifySyncResponse, StreamId, SyncCookie, SyncOp,
    SyncStreamOpStatus, SyncStreamsResponse,
};

/// Transport delivering the messages of a session to its client.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    async fn send(&self, message: SyncStreamsResponse) -> Result<(), SyncError>;
}

#[async_trait]
impl ResponseSender for mpsc::Sender<Result<SyncStreamsResponse, SyncError>> {
    async fn send(&self, message: SyncStreamsResponse) -> Result<(), SyncError> {
        mpsc::Sender::send(self, Ok(message))
            .await
            .map_err(|_| SyncError::Canceled("Client closed the sync stream".into()))
    }
}

enum Command {
    Modify(ModifyRequest),
    Ping(String),
    Cancel,
    DebugDrop(StreamId),
}

struct SubCommand {
    command: Command,
    reply: oneshot::Sender<Result<(), SyncError>>,
}

/// One client session. Commands of the session are processed one after another, messages of the
/// subscription get forwarded to the client transport.
pub struct StreamSyncOperation {
    sync_id: String,

    /// Cancelled when the client goes away.
    root: CancelHandle,

    /// Cancelled when the session ends for any reason.
    cancel: CancelHandle,

    commands: Queue<SubCommand>,
    config: SyncConfiguration,
    manager: Arc<Manager>,
}

impl StreamSyncOperation {
    pub fn new(
        sync_id: &str,
        root: CancelHandle,
        config: SyncConfiguration,
        manager: Arc<Manager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync_id: sync_id.to_owned(),
            cancel: root.child(),
            root,
            commands: Queue::new(config.command_queue_size),
            config,
            manager,
        })
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs the session until it got cancelled, the client went away or the transport failed.
    ///
    /// Returns `Ok` when the session ended with a CLOSE message.
    pub async fn run(
        &self,
        cookies: Vec<SyncCookie>,
        transport: &dyn ResponseSender,
    ) -> Result<(), SyncError> {
        debug!("Start sync operation {}", self.sync_id);

        let subscription = self.manager.subscribe(&self.sync_id, self.cancel.clone());

        if let Err(err) = transport
            .send(SyncStreamsResponse::new_sync(&self.sync_id))
            .await
        {
            self.cancel.cancel(err.clone());
            subscription.close();
            return Err(err);
        }

        let forward = async {
            let result = self.forward_messages(&subscription, transport).await;
            self.cancel
                .cancel(SyncError::Canceled("Sync operation stopped".into()));
            result
        };

        let (result, _, _) = tokio::join!(
            forward,
            self.process_commands(&subscription),
            self.add_initial_streams(&subscription, cookies),
        );

        subscription.close();

        match &result {
            Ok(()) => debug!("Sync operation {} closed", self.sync_id),
            Err(err) => debug!("Sync operation {} stopped: {}", self.sync_id, err),
        }

        result
    }

    pub async fn add_stream_to_sync(
        &self,
        sync_id: &str,
        cookie: SyncCookie,
    ) -> Result<(), SyncError> {
        self.check_sync_id(sync_id)?;

        let status = Arc::new(Mutex::new(None));
        let mut request = ModifyRequest::new(&self.sync_id);
        request.to_add = vec![cookie];
        request.adding_failure_handler = {
            let status = status.clone();
            Arc::new(move |failed: SyncStreamOpStatus| *status.lock() = Some(failed))
        };

        self.process(Command::Modify(request), self.config.modify_timeout())
            .await?;

        let status = status.lock().take();
        match status {
            Some(status) => Err(status.to_error()),
            None => Ok(()),
        }
    }

    pub async fn remove_stream_from_sync(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> Result<(), SyncError> {
        self.check_sync_id(sync_id)?;

        let status = Arc::new(Mutex::new(None));
        let mut request = ModifyRequest::new(&self.sync_id);
        request.to_remove = vec![stream_id];
        request.removing_failure_handler = {
            let status = status.clone();
            Arc::new(move |failed: SyncStreamOpStatus| *status.lock() = Some(failed))
        };

        self.process(Command::Modify(request), self.config.modify_timeout())
            .await?;

        let status = status.lock().take();
        match status {
            Some(status) => Err(status.to_error()),
            None => Ok(()),
        }
    }

    /// Adds, removes and backfills streams. Streams which failed are listed in the response, the
    /// call itself only fails when the request as a whole got rejected.
    pub async fn modify_sync(
        &self,
        request: ModifySyncRequest,
    ) -> Result<ModifySyncResponse, SyncError> {
        self.check_sync_id(&request.sync_id)?;

        let response = Arc::new(Mutex::new(ModifySyncResponse::default()));

        let mut modification = ModifyRequest::new(&self.sync_id);
        modification.to_add = request.add_streams;
        modification.to_remove = request.remove_streams;
        modification.to_backfill = request
            .backfill_streams
            .into_iter()
            .filter(|backfill: &Backfill| !backfill.streams.is_empty())
            .collect();
        modification.adding_failure_handler = {
            let response = response.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                response.lock().adds.push(status)
            })
        };
        modification.removing_failure_handler = {
            let response = response.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                response.lock().removals.push(status)
            })
        };
        modification.backfilling_failure_handler = {
            let response = response.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                response.lock().backfills.push(status)
            })
        };

        self.process(Command::Modify(modification), self.config.modify_timeout())
            .await?;

        let response = std::mem::take(&mut *response.lock());
        Ok(response)
    }

    /// Ends the session with a CLOSE message.
    pub async fn cancel_sync(&self, sync_id: &str) -> Result<(), SyncError> {
        self.check_sync_id(sync_id)?;

        if self.is_stopped() {
            return Ok(());
        }

        match self
            .process(Command::Cancel, self.config.cancel_timeout())
            .await
        {
            Err(err) if err.code() == ErrorCode::Canceled => Ok(()),
            result => result,
        }
    }

    /// Makes the session send a PONG with the given nonce.
    pub async fn ping_sync(&self, sync_id: &str, nonce: &str) -> Result<(), SyncError> {
        self.check_sync_id(sync_id)?;
        self.process(Command::Ping(nonce.to_owned()), self.config.command_timeout())
            .await
    }

    pub async fn debug_drop_stream(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> Result<(), SyncError> {
        self.check_sync_id(sync_id)?;
        self.process(Command::DebugDrop(stream_id), self.config.command_timeout())
            .await
    }

    fn check_sync_id(&self, sync_id: &str) -> Result<(), SyncError> {
        if sync_id != self.sync_id {
            return Err(SyncError::InvalidArgument(format!(
                "invalid syncId {}",
                sync_id
            )));
        }

        Ok(())
    }

    fn canceled(&self) -> SyncError {
        SyncError::Canceled(format!("sync operation {} cancelled", self.sync_id))
    }

    /// Why the session stopped. A client which went away takes precedence.
    fn stop_cause(&self) -> SyncError {
        if let Some(cause) = self.root.cause() {
            return cause;
        }

        self.cancel.cause().unwrap_or_else(|| self.canceled())
    }

    /// Hands a command to the command loop and waits for its reply.
    async fn process(&self, command: Command, timeout: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + timeout;
        let (reply, response) = oneshot::channel();

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.canceled()),
            submitted = timeout_at(deadline, self.commands.push(SubCommand { command, reply })) => {
                if submitted.is_err() {
                    error!("Sync operation {} command queue full", self.sync_id);
                    return Err(SyncError::DeadlineExceeded(
                        "sync operation command queue full".into(),
                    ));
                }
            }
        }

        tokio::select! {
            biased;

            reply = timeout_at(deadline, response) => match reply {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(self.canceled()),
                Err(_) => Err(SyncError::DeadlineExceeded(
                    "sync operation command timed out".into(),
                )),
            },
            _ = self.cancel.cancelled() => Err(self.canceled()),
        }
    }

    /// Registers the streams the client asked for when opening the session. Streams which can not
    /// be synced are reported to the client as DOWN.
    async fn add_initial_streams(&self, subscription: &Arc<Subscription>, cookies: Vec<SyncCookie>) {
        if cookies.is_empty() {
            return;
        }

        let mut request = ModifyRequest::new(&self.sync_id);
        request.to_add = cookies;
        request.adding_failure_handler = {
            let subscription = subscription.clone();
            let cancel = self.cancel.clone();
            Arc::new(move |status: SyncStreamOpStatus| {
                if !cancel.is_cancelled() {
                    subscription.send(SyncStreamsResponse::down(status.stream_id));
                }
            })
        };

        if let Err(err) = self
            .process(Command::Modify(request), self.config.modify_timeout())
            .await
        {
            if err.code() == ErrorCode::InvalidArgument {
                error!(
                    "Unable to add initial streams of sync {}: {}",
                    self.sync_id, err
                );
            }

            self.cancel.cancel(err);
        }
    }

    async fn process_commands(&self, subscription: &Arc<Subscription>) {
        loop {
            let SubCommand { command, reply } = tokio::select! {
                _ = self.cancel.cancelled() => return,
                command = self.commands.pop() => command,
            };

            match command {
                Command::Modify(request) => {
                    let _ = reply.send(subscription.modify(request).await);
                }
                Command::DebugDrop(stream_id) => {
                    let _ = reply.send(subscription.debug_drop_stream(&stream_id).await);
                }
                Command::Ping(nonce) => {
                    subscription.send(SyncStreamsResponse::pong(&nonce));
                    let _ = reply.send(Ok(()));
                }
                Command::Cancel => {
                    subscription.send(SyncStreamsResponse::close());
                    let _ = reply.send(Ok(()));
                    return;
                }
            }
        }
    }

    async fn forward_messages(
        &self,
        subscription: &Subscription,
        transport: &dyn ResponseSender,
    ) -> Result<(), SyncError> {
        let mut sent = 0;
        let mut batch = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(self.stop_cause()),
                _ = subscription.messages().wait() => (),
            }

            let mut messages = match subscription.messages().drain_batch(batch) {
                Some(messages) => messages,
                None if self.cancel.is_cancelled() => return Err(self.stop_cause()),
                None => {
                    // Queue got closed underneath us
                    let mut close = SyncStreamsResponse::close();
                    close.sync_id = self.sync_id.clone();
                    let _ = transport.send(close).await;
                    return Ok(());
                }
            };

            for mut message in messages.drain(..) {
                if self.cancel.is_cancelled() {
                    return Err(self.stop_cause());
                }

                message.sync_id = self.sync_id.clone();
                let op = message.op;

                if let Err(err) = transport.send(message).await {
                    warn!(
                        "Unable to send sync update to client of {}: {}",
                        self.sync_id, err
                    );
                    return Err(err);
                }

                sent += 1;

                if op == SyncOp::Close {
                    debug!("Sync operation {} sent {} messages", self.sync_id, sent);
                    return Ok(());
                }
            }

            batch = messages;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;
    use tokio::sync::mpsc;

    use crate::bus::create_service_sender;
    use crate::config::{Configuration, SyncConfiguration};
    use crate::errors::{ErrorCode, SyncError};
    use crate::sync::subscription::{Manager, Registry};
    use crate::sync::CancelHandle;
    use crate::test_utils::{
        node_address, random_stream_id, sync_config, MemoryStreamStore, TestNodeRegistry,
    };
    use crate::types::{
        ModifySyncRequest, NodeAddress, SyncCookie, SyncOp, SyncStreamsResponse,
    };

    use super::StreamSyncOperation;

    type Receiver = mpsc::Receiver<Result<SyncStreamsResponse, SyncError>>;

    struct Session {
        operation: Arc<StreamSyncOperation>,
        root: CancelHandle,
        rx: Receiver,
        handle: tokio::task::JoinHandle<Result<(), SyncError>>,
    }

    impl Session {
        async fn next(&mut self) -> SyncStreamsResponse {
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("no message within timeout")
                .expect("session channel closed")
                .expect("session failed")
        }
    }

    fn start(
        manager: &Arc<Manager>,
        config: &SyncConfiguration,
        sync_id: &str,
        cookies: Vec<SyncCookie>,
    ) -> Session {
        let root = CancelHandle::new();
        let operation =
            StreamSyncOperation::new(sync_id, root.clone(), config.clone(), manager.clone());
        let (tx, rx) = mpsc::channel(64);

        let handle = tokio::spawn({
            let operation = operation.clone();
            async move { operation.run(cookies, &tx).await }
        });

        Session {
            operation,
            root,
            rx,
            handle,
        }
    }

    fn setup(
        address: NodeAddress,
        config: &SyncConfiguration,
    ) -> (Arc<Manager>, Arc<MemoryStreamStore>) {
        let store = MemoryStreamStore::new(address);
        let manager = Arc::new(Manager::new(
            Configuration {
                node_address: address,
                sync: config.clone(),
            },
            store.clone(),
            TestNodeRegistry::new(),
            create_service_sender(64),
        ));

        tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        (manager, store)
    }

    #[rstest]
    #[tokio::test]
    async fn session_lifecycle(node_address: NodeAddress, sync_config: SyncConfiguration) {
        let (manager, store) = setup(node_address, &sync_config);
        let stream = store.create_local_stream(random_stream_id());
        let cookie = stream.cookie();
        stream.add_event(b"hello");

        let mut session = start(&manager, &sync_config, "session", vec![cookie]);

        let new = session.next().await;
        assert_eq!(new.op, SyncOp::New);
        assert_eq!(new.sync_id, "session");

        let update = session.next().await;
        assert_eq!(update.op, SyncOp::Update);
        assert_eq!(update.sync_id, "session");
        assert_eq!(update.stream_id(), Some(stream.stream_id()));

        session
            .operation
            .ping_sync("session", "nonce")
            .await
            .unwrap();
        let pong = session.next().await;
        assert_eq!(pong.op, SyncOp::Pong);
        assert_eq!(pong.pong_nonce.as_deref(), Some("nonce"));

        session.operation.cancel_sync("session").await.unwrap();
        assert_eq!(session.next().await.op, SyncOp::Close);
        session.handle.await.unwrap().unwrap();

        assert!(session.operation.is_stopped());
        assert_eq!(
            session
                .operation
                .ping_sync("session", "late")
                .await
                .unwrap_err()
                .code(),
            ErrorCode::Canceled
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_initial_stream_goes_down(
        node_address: NodeAddress,
        sync_config: SyncConfiguration,
    ) {
        let (manager, _store) = setup(node_address, &sync_config);
        let unknown = random_stream_id();

        let mut session = start(
            &manager,
            &sync_config,
            "session",
            vec![SyncCookie::new(unknown)],
        );

        assert_eq!(session.next().await.op, SyncOp::New);
        let down = session.next().await;
        assert_eq!(down.op, SyncOp::Down);
        assert_eq!(down.stream_id, Some(unknown));
    }

    #[rstest]
    #[tokio::test]
    async fn invalid_initial_streams_cancel_session(
        node_address: NodeAddress,
        sync_config: SyncConfiguration,
    ) {
        let (manager, _store) = setup(node_address, &sync_config);
        let stream_id = random_stream_id();

        let mut session = start(
            &manager,
            &sync_config,
            "session",
            vec![SyncCookie::new(stream_id), SyncCookie::new(stream_id)],
        );

        assert_eq!(session.next().await.op, SyncOp::New);
        let result = session.handle.await.unwrap();
        assert_eq!(result.unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[rstest]
    #[tokio::test]
    async fn reports_failed_streams(node_address: NodeAddress, sync_config: SyncConfiguration) {
        let (manager, store) = setup(node_address, &sync_config);
        let stream = store.create_local_stream(random_stream_id());
        let unknown = random_stream_id();

        let mut session = start(&manager, &sync_config, "session", Vec::new());
        assert_eq!(session.next().await.op, SyncOp::New);

        let response = session
            .operation
            .modify_sync(ModifySyncRequest {
                sync_id: "session".into(),
                add_streams: vec![stream.cookie(), SyncCookie::new(unknown)],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.adds.len(), 1);
        assert_eq!(response.adds[0].stream_id, unknown);
        assert!(response.removals.is_empty());

        let err = session
            .operation
            .add_stream_to_sync("session", SyncCookie::new(unknown))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        session
            .operation
            .remove_stream_from_sync("session", stream.stream_id())
            .await
            .unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_foreign_sync_id(node_address: NodeAddress, sync_config: SyncConfiguration) {
        let (manager, _store) = setup(node_address, &sync_config);
        let session = start(&manager, &sync_config, "session", Vec::new());

        let err = session.operation.ping_sync("other", "nonce").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(err.message(), "invalid syncId other");

        let err = session.operation.cancel_sync("other").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[rstest]
    #[tokio::test]
    async fn overflowing_client_buffer_fails_session(
        node_address: NodeAddress,
        sync_config: SyncConfiguration,
    ) {
        let sync_config = SyncConfiguration {
            subscription_buffer_size: 1,
            ..sync_config
        };
        let (manager, _store) = setup(node_address, &sync_config);

        let mut session = start(&manager, &sync_config, "session", Vec::new());
        assert_eq!(session.next().await.op, SyncOp::New);

        let subscription = manager
            .registry()
            .get_subscription_by_id("session")
            .unwrap();
        for nonce in ["1", "2", "3"] {
            subscription.send(SyncStreamsResponse::pong(nonce));
        }

        let result = tokio::time::timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().code(), ErrorCode::BufferFull);

        // Session did not end like a regular cancel
        while let Some(message) = session.rx.recv().await {
            assert_ne!(message.unwrap().op, SyncOp::Close);
        }
    }

    #[rstest]
    #[tokio::test]
    async fn client_going_away_stops_session(
        node_address: NodeAddress,
        sync_config: SyncConfiguration,
    ) {
        let (manager, _store) = setup(node_address, &sync_config);
        let mut session = start(&manager, &sync_config, "session", Vec::new());
        assert_eq!(session.next().await.op, SyncOp::New);

        session
            .root
            .cancel(SyncError::Canceled("client hung up".into()));

        let result = tokio::time::timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().message(), "client hung up");
        assert!(manager.registry().get_subscription_by_id("session").is_none());
    }
}
