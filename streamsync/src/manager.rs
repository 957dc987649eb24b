// SPDX-License-Identifier: AGPL-3.0-or-later

use std::future::Future;

use anyhow::Result;
use log::{error, info};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task;
use tokio::task::JoinHandle;
use triggered::{Listener, Trigger};

/// Sends messages through the communication bus between services.
pub type Sender<T> = broadcast::Sender<T>;

/// Receives shutdown signal for services so they can react accordingly.
pub type Shutdown = JoinHandle<()>;

/// Generic async service function receiving a shared context, the shutdown signal and access to
/// the communication bus.
#[async_trait::async_trait]
pub trait Service<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    async fn call(&self, context: D, shutdown: Shutdown, tx: Sender<M>) -> Result<()>;
}

#[async_trait::async_trait]
impl<FN, F, D, M> Service<D, M> for FN
where
    FN: Fn(D, Shutdown, Sender<M>) -> F + Sync,
    F: Future<Output = Result<()>> + Send + 'static,
    D: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    async fn call(&self, context: D, shutdown: Shutdown, tx: Sender<M>) -> Result<()> {
        (self)(context, shutdown, tx).await
    }
}

/// Wrapper around `Trigger` which fires as soon as `Signal` gets dropped, also when the task
/// holding it panicked.
#[derive(Clone)]
struct Signal(Trigger);

impl Signal {
    pub fn trigger(&self) {
        self.0.trigger();
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.trigger();
    }
}

/// Orchestrates the long-running services of a node.
///
/// Services share a context and a message bus. Stopped services (because of a panic, error or
/// successful return) fire an exit signal which can be awaited via `on_exit`.
pub struct ServiceManager<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    /// Shared, thread-safe context between services.
    context: D,

    /// Sender of our communication bus.
    tx: Sender<M>,

    exit_signal: Signal,
    exit_handle: Listener,

    /// Sender of shutdown signal.
    ///
    /// Every service holds a clone, the manager knows all services stopped once the channel
    /// got closed.
    shutdown_signal: broadcast::Sender<bool>,
}

impl<D, M> ServiceManager<D, M>
where
    D: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    /// Returns a new service manager using the given bus sender.
    ///
    /// The sender is passed in since parts of the context might need to publish on the bus
    /// themselves.
    pub fn new(tx: Sender<M>, context: D) -> Self {
        let (shutdown_signal, _) = broadcast::channel(16);
        let (exit_signal, exit_handle) = triggered::trigger();

        Self {
            context,
            tx,
            exit_signal: Signal(exit_signal),
            exit_handle,
            shutdown_signal,
        }
    }

    /// Adds a new service to the manager.
    ///
    /// Errors returned and panics by the service will send an exit signal.
    pub fn add<F: Service<D, M> + Send + Sync + Copy + 'static>(
        &mut self,
        name: &'static str,
        service: F,
    ) {
        let tx = self.tx.clone();

        let shutdown_tx = self.shutdown_signal.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        let signal = task::spawn(async move {
            let _ = shutdown_rx.recv().await;
        });

        let exit_signal = self.exit_signal.clone();
        let context = self.context.clone();

        task::spawn(async move {
            info!("Start {} service", name);

            let handle = service.call(context, signal, tx).await;

            // Signals the shutdown process that this service stopped
            drop(shutdown_tx);

            if let Err(err) = handle {
                error!("Error in {} service: {}", name, err);
                exit_signal.trigger();
            }

            // `exit_signal` fires on drop, also when this task panicked
        });
    }

    /// Receiver of all messages published on the bus from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<M> {
        self.tx.subscribe()
    }

    /// Future which resolves as soon as a service returned an error, panicked or stopped.
    pub async fn on_exit(&self) {
        self.exit_handle.clone().await;
    }

    /// Informs all services about graceful shutdown and waits until they all stopped.
    pub async fn shutdown(self) {
        info!("Received shutdown signal");

        let mut rx = self.shutdown_signal.subscribe();

        // Fails only when every service already stopped
        let _ = self.shutdown_signal.send(true);

        // Our own sender has to go as well, otherwise `recv` never reports the channel closed
        drop(self.shutdown_signal);

        loop {
            if let Err(RecvError::Closed) = rx.recv().await {
                break;
            }
        }
    }
}
