// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use thiserror::Error;

/// Status codes attached to per-stream operation results and to call-level errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Unavailable,
    Canceled,
    DeadlineExceeded,
    BufferFull,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::BufferFull => "BUFFER_FULL",
            ErrorCode::Internal => "INTERNAL",
        };

        write!(f, "{}", name)
    }
}

/// Errors surfaced by the stream synchronization engine.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SyncError {
    /// Malformed or duplicate stream lists, or a call addressed to the wrong sync id.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown sync id or stream which is not part of the sync operation.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No reachable node for a stream, session stopped or remote went away.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Sync operation got torn down while the call was in flight.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Internal command queue is saturated or a reply did not arrive in time.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Outbound message buffer reached its maximum size.
    #[error("Buffer full: {0}")]
    BufferFull(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Builds an error from a status code and message, for example when turning a failed
    /// per-stream status into a call-level error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();

        match code {
            ErrorCode::InvalidArgument => SyncError::InvalidArgument(message),
            ErrorCode::NotFound => SyncError::NotFound(message),
            ErrorCode::Unavailable => SyncError::Unavailable(message),
            ErrorCode::Canceled => SyncError::Canceled(message),
            ErrorCode::DeadlineExceeded => SyncError::DeadlineExceeded(message),
            ErrorCode::BufferFull => SyncError::BufferFull(message),
            ErrorCode::Internal => SyncError::Internal(message),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::Unavailable(_) => ErrorCode::Unavailable,
            SyncError::Canceled(_) => ErrorCode::Canceled,
            SyncError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            SyncError::BufferFull(_) => ErrorCode::BufferFull,
            SyncError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            SyncError::InvalidArgument(message)
            | SyncError::NotFound(message)
            | SyncError::Unavailable(message)
            | SyncError::Canceled(message)
            | SyncError::DeadlineExceeded(message)
            | SyncError::BufferFull(message)
            | SyncError::Internal(message) => message,
        }
    }
}

/// Errors returned when pushing into a [`BoundedQueue`](crate::sync::BoundedQueue).
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Unavailable,

    #[error("Queue reached its maximum size")]
    BufferFull,
}

impl From<QueueError> for SyncError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unavailable => SyncError::Unavailable(err.to_string()),
            QueueError::BufferFull => SyncError::BufferFull(err.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamIdError {
    #[error("Stream id must be {expected} bytes long, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown stream type tag {0:#04x}")]
    UnknownKind(u8),

    #[error("Stream id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeAddressError {
    #[error("Node address must be {expected} bytes long, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Node address is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl From<StreamIdError> for SyncError {
    fn from(err: StreamIdError) -> Self {
        SyncError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ErrorCode, QueueError, SyncError};

    #[rstest]
    #[case(ErrorCode::InvalidArgument)]
    #[case(ErrorCode::NotFound)]
    #[case(ErrorCode::Unavailable)]
    #[case(ErrorCode::Canceled)]
    #[case(ErrorCode::DeadlineExceeded)]
    #[case(ErrorCode::BufferFull)]
    #[case(ErrorCode::Internal)]
    fn code_survives_status_conversion(#[case] code: ErrorCode) {
        let err = SyncError::new(code, "boom");
        assert_eq!(err.code(), code);
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn queue_errors_map_to_sync_errors() {
        assert_eq!(
            SyncError::from(QueueError::BufferFull).code(),
            ErrorCode::BufferFull
        );
        assert_eq!(
            SyncError::from(QueueError::Unavailable).code(),
            ErrorCode::Unavailable
        );
    }
}
