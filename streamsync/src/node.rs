// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::bus::{create_service_sender, ServiceMessage};
use crate::config::Configuration;
use crate::context::Context;
use crate::manager::ServiceManager;
use crate::nodes::NodeRegistry;
use crate::store::StreamStore;
use crate::sync::subscription::Manager;
use crate::sync::{sync_service, SyncHandler};

/// Capacity of the internal broadcast channel used to communicate between services.
const SERVICE_BUS_CAPACITY: usize = 1024;

/// Main runtime of the sync engine of a stream node.
pub struct Node {
    context: Context,
    manager: ServiceManager<Context, ServiceMessage>,
}

impl Node {
    /// Start the sync engine with your configuration. Streams are read from `store`, other nodes
    /// get dialed through `node_registry`.
    pub async fn start(
        config: Configuration,
        store: Arc<dyn StreamStore>,
        node_registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        let tx = create_service_sender(SERVICE_BUS_CAPACITY);

        let sync_manager = Arc::new(Manager::new(
            config.clone(),
            store,
            node_registry,
            tx.clone(),
        ));
        let handler = SyncHandler::new(config.sync.clone(), sync_manager.clone(), tx.clone());

        // Create service manager with shared data between services
        let context = Context::new(config, sync_manager, handler);
        let mut manager = ServiceManager::<Context, ServiceMessage>::new(tx, context.clone());

        // Start syncers and the distribution of their updates
        manager.add("sync", sync_service);

        Self { context, manager }
    }

    /// Entry point for client sync sessions, also used by other nodes.
    pub fn handler(&self) -> &SyncHandler {
        &self.context.handler
    }

    /// Receiver of session and stream events of this node.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceMessage> {
        self.manager.subscribe()
    }

    /// This future resolves when at least one system service stopped.
    ///
    /// It can be used to exit the application as a stopped service usually means that something
    /// went wrong.
    pub async fn on_exit(&self) {
        self.manager.on_exit().await;
    }

    /// Close all running concurrent tasks and wait until they are fully shut down.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.context.config.node_address)
            .field("handler", self.handler())
            .finish()
    }
}
