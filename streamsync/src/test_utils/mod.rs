// SPDX-License-Identifier: AGPL-3.0-or-later

mod fixtures;
mod helpers;
mod node;
mod remote;
mod store;

pub use fixtures::{cookie, node_address, random_stream_id, stream_id, sync_config};
pub use helpers::{init_logger, wait_for};
pub use node::TestCluster;
pub use remote::{FakeRemoteClient, TestNodeRegistry};
pub use store::{MemoryStream, MemoryStreamStore};
