// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Result;
use log::{debug, info};

use crate::bus::ServiceSender;
use crate::context::Context;
use crate::manager::Shutdown;

/// Runs the syncers and distributes their updates to client sessions until the node shuts down.
///
/// Returns an error when the sync manager stopped for any other reason than a shutdown.
pub async fn sync_service(context: Context, shutdown: Shutdown, _tx: ServiceSender) -> Result<()> {
    let manager = context.manager.clone();

    let run = manager.run();
    tokio::pin!(run);

    let stopped = tokio::select! {
        result = &mut run => Some(result),
        _ = shutdown => None,
    };

    match stopped {
        Some(result) => {
            // Manager stopped by itself, the node should go down as well
            result?;
            info!("Sync manager stopped unexpectedly");
        }
        None => {
            debug!(
                "Stop sync manager with {} active sessions",
                context.handler.active_syncs()
            );

            manager.stop();
            run.await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use crate::bus::{create_service_sender, ServiceMessage, ServiceSender};
    use crate::config::{Configuration, SyncConfiguration};
    use crate::context::Context;
    use crate::manager::ServiceManager;
    use crate::sync::subscription::Manager;
    use crate::sync::{CancelHandle, SyncHandler};
    use crate::test_utils::{node_address, sync_config, MemoryStreamStore, TestNodeRegistry};
    use crate::types::NodeAddress;

    use super::sync_service;

    fn context(config: Configuration, tx: ServiceSender) -> Context {
        let store = MemoryStreamStore::new(config.node_address);
        let registry = TestNodeRegistry::new();
        let manager = Arc::new(Manager::new(
            config.clone(),
            store,
            registry,
            tx.clone(),
        ));
        let handler = SyncHandler::new(config.sync.clone(), manager.clone(), tx);

        Context::new(config, manager, handler)
    }

    #[rstest]
    #[tokio::test]
    async fn stops_manager_on_shutdown(node_address: NodeAddress, sync_config: SyncConfiguration) {
        let tx = create_service_sender(64);
        let context = context(
            Configuration {
                node_address,
                sync: sync_config,
            },
            tx.clone(),
        );

        let subscription = context.manager.subscribe("session", CancelHandle::new());

        let mut manager = ServiceManager::<Context, ServiceMessage>::new(tx, context.clone());
        manager.add("sync", sync_service);

        manager.shutdown().await;

        assert!(subscription.is_closed());
        assert!(subscription.cancel_handle().is_cancelled());
    }

    #[rstest]
    #[tokio::test]
    async fn exits_when_manager_stops(node_address: NodeAddress, sync_config: SyncConfiguration) {
        let tx = create_service_sender(64);
        let context = context(
            Configuration {
                node_address,
                sync: sync_config,
            },
            tx.clone(),
        );

        let mut manager = ServiceManager::<Context, ServiceMessage>::new(tx, context.clone());
        manager.add("sync", sync_service);

        context.manager.stop();
        manager.on_exit().await;
        manager.shutdown().await;
    }
}
