// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use bytes::Bytes;

use crate::errors::{ErrorCode, SyncError};
use crate::types::{StreamId, SyncCookie};

/// Hash identifying a single stream event.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EventHash([u8; 32]);

impl EventHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<EventHash {}>", hex::encode(&self.0[..6]))
    }
}

/// Signed event as it travels over the wire. The engine never looks inside `event`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub hash: EventHash,
    pub event: Bytes,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Miniblock {
    pub header: Option<Envelope>,
    pub events: Vec<Envelope>,
}

/// Update payload for one stream: new minipool events, sealed miniblocks and the cookie to
/// resume from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamAndCookie {
    pub events: Vec<Envelope>,
    pub miniblocks: Vec<Miniblock>,
    pub next_sync_cookie: Option<SyncCookie>,
    pub sync_reset: bool,
}

impl StreamAndCookie {
    pub fn stream_id(&self) -> Option<StreamId> {
        self.next_sync_cookie.as_ref().map(|cookie| cookie.stream_id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncOp {
    /// First message of a session, carries the assigned sync id.
    New,
    Update,
    /// Stream stopped being synced, the client should re-add it.
    Down,
    /// Last message of a session.
    Close,
    Pong,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncStreamsResponse {
    pub sync_id: String,
    pub op: SyncOp,
    pub stream: Option<StreamAndCookie>,
    /// Set on DOWN messages, which carry no stream payload.
    pub stream_id: Option<StreamId>,
    pub pong_nonce: Option<String>,
    /// Stack of sync ids a backfill is addressed to, outermost first. Empty for regular
    /// traffic.
    pub target_sync_ids: Vec<String>,
}

impl SyncStreamsResponse {
    fn empty(op: SyncOp) -> Self {
        Self {
            sync_id: String::new(),
            op,
            stream: None,
            stream_id: None,
            pong_nonce: None,
            target_sync_ids: Vec::new(),
        }
    }

    pub fn new_sync(sync_id: &str) -> Self {
        Self {
            sync_id: sync_id.to_owned(),
            ..Self::empty(SyncOp::New)
        }
    }

    pub fn update(stream: StreamAndCookie) -> Self {
        Self {
            stream: Some(stream),
            ..Self::empty(SyncOp::Update)
        }
    }

    pub fn down(stream_id: StreamId) -> Self {
        Self {
            stream_id: Some(stream_id),
            ..Self::empty(SyncOp::Down)
        }
    }

    pub fn close() -> Self {
        Self::empty(SyncOp::Close)
    }

    pub fn pong(nonce: &str) -> Self {
        Self {
            pong_nonce: Some(nonce.to_owned()),
            ..Self::empty(SyncOp::Pong)
        }
    }

    pub fn with_targets(mut self, target_sync_ids: Vec<String>) -> Self {
        self.target_sync_ids = target_sync_ids;
        self
    }

    /// Stream this message is about, either from the DOWN id or the update cookie.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
            .or_else(|| self.stream.as_ref().and_then(|stream| stream.stream_id()))
    }
}

/// Outcome of one stream inside a modify call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncStreamOpStatus {
    pub stream_id: StreamId,
    pub code: ErrorCode,
    pub message: String,
}

impl SyncStreamOpStatus {
    pub fn new(stream_id: StreamId, err: &SyncError) -> Self {
        Self {
            stream_id,
            code: err.code(),
            message: err.message().to_owned(),
        }
    }

    pub fn to_error(&self) -> SyncError {
        SyncError::new(self.code, self.message.clone())
    }
}

/// Streams to re-deliver from a cookie position to a specific (possibly nested) sync session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Backfill {
    pub sync_id: String,
    pub streams: Vec<SyncCookie>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModifySyncRequest {
    pub sync_id: String,
    pub add_streams: Vec<SyncCookie>,
    pub remove_streams: Vec<StreamId>,
    pub backfill_streams: Option<Backfill>,
}

/// Per-stream failures of a modify call. Streams not listed succeeded.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModifySyncResponse {
    pub adds: Vec<SyncStreamOpStatus>,
    pub removals: Vec<SyncStreamOpStatus>,
    pub backfills: Vec<SyncStreamOpStatus>,
}

impl ModifySyncResponse {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removals.is_empty() && self.backfills.is_empty()
    }
}
