// SPDX-License-Identifier: AGPL-3.0-or-later

//! # streamsync
//!
//! Stream synchronization engine of a replicated messaging node. Clients open sync sessions for
//! a set of streams and receive their updates. Streams hosted by this node are read from the
//! local stream store, all others are synced from the nodes replicating them.
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

mod bus;
mod config;
mod context;
mod errors;
mod manager;
mod node;
mod nodes;
mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use crate::bus::ServiceMessage;
pub use crate::config::{Configuration, SyncConfiguration};
pub use crate::errors::{ErrorCode, SyncError};
pub use crate::nodes::{NodeRegistry, StreamServiceClient, SyncResponseStream};
pub use crate::store::{LocalStream, StreamListener, StreamStore};
pub use node::Node;
