// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::types::{NodeAddress, StreamId};

/// Position in a stream from which a client wants to continue receiving updates.
///
/// `node_address` optionally hints which node served the stream last. Syncers prefer it when
/// picking the upstream for the stream.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SyncCookie {
    pub stream_id: StreamId,
    pub node_address: Option<NodeAddress>,
    pub minipool_gen: i64,
    pub minipool_slot: i64,
}

impl SyncCookie {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            node_address: None,
            minipool_gen: 0,
            minipool_slot: 0,
        }
    }

    pub fn copy_with_address(&self, node_address: NodeAddress) -> Self {
        Self {
            node_address: Some(node_address),
            ..self.clone()
        }
    }

    pub fn without_address(&self) -> Self {
        Self {
            node_address: None,
            ..self.clone()
        }
    }
}
