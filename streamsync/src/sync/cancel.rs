// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::SyncError;

/// Cancellation token which remembers why it got cancelled.
///
/// Children get cancelled together with their parent and inherit its cause, while cancelling a
/// child leaves the parent untouched.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
    cause: Arc<Mutex<Option<SyncError>>>,
    parent: Option<Box<CancelHandle>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
            parent: None,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(Mutex::new(None)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Cancels the handle and all of its children. Only the first cause is kept.
    pub fn cancel(&self, err: SyncError) {
        {
            let mut cause = self.cause.lock();
            if cause.is_none() {
                *cause = Some(err);
            }
        }

        self.token.cancel();
    }

    /// Returns the reason this handle got cancelled, if it was.
    pub fn cause(&self) -> Option<SyncError> {
        if !self.token.is_cancelled() {
            return None;
        }

        if let Some(cause) = self.cause.lock().clone() {
            return Some(cause);
        }

        match &self.parent {
            Some(parent) => parent.cause(),
            None => Some(SyncError::Canceled("context canceled".into())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
