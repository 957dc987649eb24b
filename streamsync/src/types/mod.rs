// SPDX-License-Identifier: AGPL-3.0-or-later

mod cookie;
mod message;
mod node_address;
mod stream_id;

pub use cookie::SyncCookie;
pub use message::{
    Backfill, Envelope, EventHash, Miniblock, ModifySyncRequest, ModifySyncResponse,
    StreamAndCookie, SyncOp, SyncStreamOpStatus, SyncStreamsResponse,
};
pub use node_address::{NodeAddress, NODE_ADDRESS_LENGTH};
pub use stream_id::{StreamId, StreamKind, STREAM_ID_LENGTH};
