// SPDX-License-Identifier: AGPL-3.0-or-later

use std::ops::Deref;
use std::sync::Arc;

use crate::config::Configuration;
use crate::sync::subscription::Manager;
use crate::sync::SyncHandler;

/// Inner data shared across all services.
pub struct Data {
    /// Node configuration.
    pub config: Configuration,

    /// Syncers and subscriptions of this node.
    pub manager: Arc<Manager>,

    /// Sessions opened by clients.
    pub handler: SyncHandler,
}

impl Data {
    pub fn new(config: Configuration, manager: Arc<Manager>, handler: SyncHandler) -> Self {
        Self {
            config,
            manager,
            handler,
        }
    }
}

/// Data shared across all services.
pub struct Context(pub Arc<Data>);

impl Context {
    /// Returns a new instance of `Context`.
    pub fn new(config: Configuration, manager: Arc<Manager>, handler: SyncHandler) -> Self {
        Self(Arc::new(Data::new(config, manager, handler)))
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Deref for Context {
    type Target = Data;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
