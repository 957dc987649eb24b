// SPDX-License-Identifier: AGPL-3.0-or-later

use rstest::fixture;

use crate::config::SyncConfiguration;
use crate::types::{NodeAddress, StreamId, StreamKind, SyncCookie, STREAM_ID_LENGTH};

/// Channel stream id which is the same in every test.
#[fixture]
pub fn stream_id() -> StreamId {
    StreamId::new(StreamKind::Channel, [7; STREAM_ID_LENGTH - 1])
}

#[fixture]
pub fn node_address() -> NodeAddress {
    NodeAddress::new([1; 20])
}

#[fixture]
pub fn cookie(stream_id: StreamId) -> SyncCookie {
    SyncCookie::new(stream_id)
}

/// Sync configuration with intervals short enough for tests.
#[fixture]
pub fn sync_config() -> SyncConfiguration {
    SyncConfiguration {
        command_timeout_ms: 1_000,
        modify_timeout_ms: 2_000,
        cancel_timeout_ms: 1_000,
        syncer_modify_timeout_ms: 1_000,
        remote_startup_timeout_ms: 500,
        remote_ping_interval_ms: 50,
        remote_recent_activity_interval_ms: 1_000,
        remote_recent_activity_deadline_ms: 5_000,
        remote_modify_interval_ms: 10,
        registry_cleanup_interval_ms: 50,
        ..SyncConfiguration::default()
    }
}

/// Channel stream id which differs on every call.
pub fn random_stream_id() -> StreamId {
    StreamId::new(StreamKind::Channel, rand::random())
}
