// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use serde::Deserialize;

use crate::types::NodeAddress;

/// Configuration object holding all important variables of a stream node's sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Address of this node. Streams routed to this address are served from the local stream
    /// store, every other address is dialed through the node registry.
    pub node_address: NodeAddress,

    /// Sync engine configuration.
    pub sync: SyncConfiguration,
}

/// Buffer sizes, timeouts and intervals of the sync engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfiguration {
    /// Maximum number of pending messages for a single client session.
    ///
    /// A session which falls this far behind gets cancelled. The client needs to open a new
    /// session and re-add its streams.
    pub subscription_buffer_size: usize,

    /// Maximum number of pending messages in the queue all syncers write into, before they get
    /// distributed to the sessions.
    pub common_buffer_size: usize,

    /// Maximum number of client commands waiting to be processed by one session.
    pub command_queue_size: usize,

    /// Time a client command may take to be accepted and answered, in milliseconds.
    pub command_timeout_ms: u64,

    /// Like `command_timeout_ms` but for modify commands which might have to wait for remote
    /// nodes.
    pub modify_timeout_ms: u64,

    /// Like `command_timeout_ms` but for cancel commands.
    pub cancel_timeout_ms: u64,

    /// Time a single syncer gets to apply a modification, in milliseconds.
    pub syncer_modify_timeout_ms: u64,

    /// Time a remote node gets to confirm a new sync session, in milliseconds.
    pub remote_startup_timeout_ms: u64,

    /// How often the liveness of a remote sync session is checked, in milliseconds.
    pub remote_ping_interval_ms: u64,

    /// Remote sessions which sent a message within this window are not pinged, in milliseconds.
    pub remote_recent_activity_interval_ms: u64,

    /// Remote sessions which did not send anything within this window are considered dead, in
    /// milliseconds.
    pub remote_recent_activity_deadline_ms: u64,

    /// How often batched stream additions and removals are sent to a remote node, in
    /// milliseconds.
    pub remote_modify_interval_ms: u64,

    /// Number of independently locked shards of the subscription registry.
    pub registry_shards: usize,

    /// How often streams without subscribers are removed from the registry, in milliseconds.
    pub registry_cleanup_interval_ms: u64,

    /// Number of messages buffered between a session and its transport.
    pub client_channel_capacity: usize,
}

impl SyncConfiguration {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn modify_timeout(&self) -> Duration {
        Duration::from_millis(self.modify_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn syncer_modify_timeout(&self) -> Duration {
        Duration::from_millis(self.syncer_modify_timeout_ms)
    }

    pub fn remote_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_startup_timeout_ms)
    }

    pub fn remote_ping_interval(&self) -> Duration {
        Duration::from_millis(self.remote_ping_interval_ms)
    }

    pub fn remote_recent_activity_interval(&self) -> Duration {
        Duration::from_millis(self.remote_recent_activity_interval_ms)
    }

    pub fn remote_recent_activity_deadline(&self) -> Duration {
        Duration::from_millis(self.remote_recent_activity_deadline_ms)
    }

    pub fn remote_modify_interval(&self) -> Duration {
        Duration::from_millis(self.remote_modify_interval_ms)
    }

    pub fn registry_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.registry_cleanup_interval_ms)
    }
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            subscription_buffer_size: 2048,
            common_buffer_size: 10240,
            command_queue_size: 64,
            command_timeout_ms: 10_000,
            modify_timeout_ms: 30_000,
            cancel_timeout_ms: 15_000,
            syncer_modify_timeout_ms: 15_000,
            remote_startup_timeout_ms: 15_000,
            remote_ping_interval_ms: 3_000,
            remote_recent_activity_interval_ms: 15_000,
            remote_recent_activity_deadline_ms: 30_000,
            remote_modify_interval_ms: 2_000,
            registry_shards: 16,
            registry_cleanup_interval_ms: 5_000,
            client_channel_capacity: 64,
        }
    }
}
