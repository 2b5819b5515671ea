//! Error types for the storage service.

use crate::ident::{RegionId, TargetId};
use crate::types::ProviderId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for storage service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every error, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown target, region, provider or pool.
    NotFound,
    /// Target path or target id collision.
    AlreadyExists,
    /// Target capacity exhausted.
    OutOfSpace,
    /// Offset/size exceeds region capacity or persisted size.
    OutOfBounds,
    /// Identifier string failed to decode.
    MalformedIdentifier,
    /// Pool file corrupt or incompatible.
    InvalidFormat,
    /// Operation disabled by server configuration.
    Unsupported,
    /// Durable storage error.
    IoFailure,
    /// Destination write/persist failed during migration.
    MigrationFailed,
    /// Transport or endpoint unreachable.
    ConnectionFailure,
    /// The operation timed out.
    Timeout,
    /// Internal or protocol error.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Main error type for the storage service.
#[derive(Error, Debug)]
pub enum Error {
    /// No target with this id is attached.
    #[error("target not found: {0}")]
    TargetNotFound(TargetId),

    /// No live region with this id in the target.
    #[error("region not found: {0}")]
    RegionNotFound(RegionId),

    /// No provider registered under this id.
    #[error("provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// No exposed bulk buffer with this handle.
    #[error("bulk handle not found: {0}")]
    BulkHandleNotFound(u64),

    /// Backing pool file is absent.
    #[error("pool not found: {}", .0.display())]
    PoolNotFound(PathBuf),

    /// Path or target already in use.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Target cannot satisfy an allocation.
    #[error("out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: u64, available: u64 },

    /// Access range exceeds the allowed limit.
    #[error("out of bounds: offset {offset} + size {size} exceeds {limit}")]
    OutOfBounds { offset: u64, size: u64, limit: u64 },

    /// Identifier string failed to decode.
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// Pool file format errors.
    #[error("invalid pool format: {0}")]
    Format(#[from] FormatError),

    /// Operation not enabled on this server.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Durable storage I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Migration did not reach the destination-persisted point.
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Some targets could not be detached cleanly; all were detached.
    #[error("failed to detach {} target(s)", .0.len())]
    DetachFailed(Vec<(TargetId, Error)>),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Error reported by a remote provider.
    #[error("remote {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TargetNotFound(_)
            | Error::RegionNotFound(_)
            | Error::ProviderNotFound(_)
            | Error::BulkHandleNotFound(_)
            | Error::PoolNotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Error::MalformedIdentifier(_) => ErrorKind::MalformedIdentifier,
            Error::Format(_) => ErrorKind::InvalidFormat,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Io(_) => ErrorKind::IoFailure,
            Error::MigrationFailed(_) => ErrorKind::MigrationFailed,
            Error::Network(NetworkError::Serialization(_))
            | Error::Network(NetworkError::Deserialization(_))
            | Error::Network(NetworkError::UnexpectedMessage(_)) => ErrorKind::Internal,
            Error::Network(_) => ErrorKind::ConnectionFailure,
            Error::DetachFailed(errors) => errors
                .first()
                .map_or(ErrorKind::Internal, |(_, e)| e.kind()),
            Error::Timeout => ErrorKind::Timeout,
            Error::Remote { kind, .. } => *kind,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for an out-of-bounds error.
    pub(crate) fn out_of_bounds(offset: u64, size: u64, limit: u64) -> Self {
        Error::OutOfBounds {
            offset,
            size,
            limit,
        }
    }
}

/// Error as carried in an RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            // Keep the remote message as-is when relaying.
            Error::Remote { kind, message } => WireError {
                kind: *kind,
                message: message.clone(),
            },
            other => WireError {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Remote {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Peer answered with a message of the wrong type.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[source] io::Error),

    /// Address parse or lookup error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Pool file format errors.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Magic number mismatch.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Unsupported format version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// Header checksum mismatch.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// Structurally invalid header or extent.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// File shorter than its header claims.
    #[error("truncated pool: expected {expected} bytes, found {actual}")]
    Truncated { expected: u64, actual: u64 },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let rid = RegionId::from_raw(vec![0u8; 16]);
        assert_eq!(Error::RegionNotFound(rid).kind(), ErrorKind::NotFound);
        assert_eq!(Error::out_of_bounds(10, 10, 16).kind(), ErrorKind::OutOfBounds);
        assert_eq!(
            Error::OutOfSpace {
                requested: 1,
                available: 0
            }
            .kind(),
            ErrorKind::OutOfSpace
        );
        assert_eq!(Error::Format(FormatError::InvalidMagic).kind(), ErrorKind::InvalidFormat);
        assert_eq!(
            Error::Network(NetworkError::ConnectionClosed).kind(),
            ErrorKind::ConnectionFailure
        );
    }

    #[test]
    fn test_wire_round_trip_preserves_kind() {
        let err = Error::out_of_bounds(30, 8, 32);
        let wire = WireError::from(&err);
        assert_eq!(wire.kind, ErrorKind::OutOfBounds);

        let back = Error::from(wire.clone());
        assert_eq!(back.kind(), ErrorKind::OutOfBounds);

        // Relaying a remote error does not nest its message.
        let relayed = WireError::from(&back);
        assert_eq!(relayed, wire);
    }

    #[test]
    fn test_detach_failed_kind() {
        let tid = TargetId::generate();
        let err = Error::DetachFailed(vec![(tid, Error::Io(io::Error::other("disk gone")))]);
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(err.to_string().contains("1 target"));
    }
}
