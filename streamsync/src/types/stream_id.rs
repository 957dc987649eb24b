// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use crate::errors::StreamIdError;
use crate::types::NodeAddress;

/// Length of every stream identifier in bytes.
pub const STREAM_ID_LENGTH: usize = 32;

/// Type tag stored in the first byte of a [`StreamId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamKind {
    Space,
    Channel,
    Media,
    Dm,
    Gdm,
    UserInbox,
    UserSettings,
    User,
    UserMetadata,
}

impl StreamKind {
    pub fn tag(&self) -> u8 {
        match self {
            StreamKind::Space => 0x10,
            StreamKind::Channel => 0x20,
            StreamKind::Media => 0xff,
            StreamKind::Dm => 0x88,
            StreamKind::Gdm => 0x77,
            StreamKind::UserInbox => 0xa1,
            StreamKind::UserSettings => 0xa5,
            StreamKind::User => 0xa8,
            StreamKind::UserMetadata => 0xad,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, StreamIdError> {
        let kind = match tag {
            0x10 => StreamKind::Space,
            0x20 => StreamKind::Channel,
            0xff => StreamKind::Media,
            0x88 => StreamKind::Dm,
            0x77 => StreamKind::Gdm,
            0xa1 => StreamKind::UserInbox,
            0xa5 => StreamKind::UserSettings,
            0xa8 => StreamKind::User,
            0xad => StreamKind::UserMetadata,
            _ => return Err(StreamIdError::UnknownKind(tag)),
        };

        Ok(kind)
    }

    /// User-scoped streams are addressed by the owner's address instead of a content hash.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            StreamKind::UserInbox
                | StreamKind::UserSettings
                | StreamKind::User
                | StreamKind::UserMetadata
        )
    }
}

/// Identifier of a replicated stream.
///
/// The first byte is a [`StreamKind`] tag. User-scoped streams embed a 20 byte address right
/// after the tag followed by zero padding, content streams carry 31 bytes of hash.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; STREAM_ID_LENGTH]);

impl StreamId {
    /// Returns a content stream id from a kind and the hash bytes following the tag.
    pub fn new(kind: StreamKind, hash: [u8; STREAM_ID_LENGTH - 1]) -> Self {
        let mut bytes = [0u8; STREAM_ID_LENGTH];
        bytes[0] = kind.tag();
        bytes[1..].copy_from_slice(&hash);
        Self(bytes)
    }

    /// Returns the id of a user-scoped stream owned by `address`.
    pub fn for_user(kind: StreamKind, address: &NodeAddress) -> Self {
        let mut bytes = [0u8; STREAM_ID_LENGTH];
        bytes[0] = kind.tag();
        bytes[1..1 + address.as_bytes().len()].copy_from_slice(address.as_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamIdError> {
        if bytes.len() != STREAM_ID_LENGTH {
            return Err(StreamIdError::InvalidLength {
                expected: STREAM_ID_LENGTH,
                actual: bytes.len(),
            });
        }

        StreamKind::from_tag(bytes[0])?;

        let mut inner = [0u8; STREAM_ID_LENGTH];
        inner.copy_from_slice(bytes);
        Ok(Self(inner))
    }

    pub fn kind(&self) -> StreamKind {
        // Tag got validated on construction
        StreamKind::from_tag(self.0[0]).unwrap_or(StreamKind::Media)
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<StreamId {}>", hex::encode(&self.0[..8]))
    }
}

impl FromStr for StreamId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&hex::decode(s)?)
    }
}

impl TryFrom<&[u8]> for StreamId {
    type Error = StreamIdError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}
