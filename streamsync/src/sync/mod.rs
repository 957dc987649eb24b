// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream synchronization: syncers pull updates from local and remote streams, subscriptions
//! fan them out to client sessions.
mod buffer;
mod cancel;
pub mod client;
mod handler;
mod operation;
mod service;
pub mod subscription;

pub use buffer::BoundedQueue;
pub use cancel::CancelHandle;
pub use handler::SyncHandler;
pub use operation::{ResponseSender, StreamSyncOperation};
pub use service::sync_service;
