//! # Networking Error Types
//!
//! All errors that can occur while packing, queueing, batching and routing
//! messages. None of them cross the frame queue boundary into the transport:
//! callers log and drop, or skip and continue.

use conduit_core::PoolError;
use thiserror::Error;

/// Errors that can occur in the transport core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// A write did not fit in the remaining buffer capacity.
    #[error("buffer overflow: tried to write {requested} bytes with {remaining} remaining")]
    Overflow {
        /// Bytes the write needed.
        requested: usize,
        /// Bytes left before the capacity limit.
        remaining: usize,
    },

    /// A read ran past the end of the data.
    #[error("read past end: needed {needed} bytes, {remaining} remaining")]
    ReadPastEnd {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left in the reader.
        remaining: usize,
    },

    /// A varint carried a tag outside the valid range for its width.
    #[error("malformed varint: tag {tag} invalid for {width}-bit value")]
    MalformedVarint {
        /// The tag found in the first byte.
        tag: u8,
        /// Bit width being decoded.
        width: u8,
    },

    /// Byte access attempted while a bitwise write or read is open.
    #[error("byte access while bitwise mode is active")]
    BitModeActive,

    /// A packed string was not valid UTF-8.
    #[error("packed string is not valid utf-8")]
    InvalidUtf8,

    /// A record consumed a different number of bytes than it declared.
    #[error("protocol desync: declared {declared} bytes, consumed {consumed}")]
    ProtocolDesync {
        /// Bytes declared by the record.
        declared: usize,
        /// Bytes actually consumed.
        consumed: usize,
    },

    /// A message kind tag is not known.
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u16),

    /// An update stage tag is not known.
    #[error("unknown update stage: {0}")]
    UnknownUpdateStage(u8),

    /// A delivery class tag is not known.
    #[error("unknown delivery class: {0}")]
    UnknownDelivery(u8),

    /// A client wrote a field it is not permitted to write (length-safe: skipped).
    #[error("client {sender} is not permitted to write field {field}")]
    UnauthorizedWrite {
        /// Client that sent the write.
        sender: u64,
        /// Index of the rejected field.
        field: usize,
    },

    /// A client wrote a field it is not permitted to write and the record
    /// cannot be skipped (no length safety).
    #[error("critical: client {sender} wrote field {field} without permission; record abandoned")]
    CriticalUnauthorizedWrite {
        /// Client that sent the write.
        sender: u64,
        /// Index of the rejected field.
        field: usize,
    },

    /// A field delta carried a different field count than the local set.
    #[error("field count mismatch: expected {expected}, received {received}")]
    FieldCountMismatch {
        /// Local field count.
        expected: usize,
        /// Field count on the wire.
        received: usize,
    },

    /// The addressed object is not known locally.
    #[error("unknown object: {0}")]
    UnknownObject(u64),

    /// Temporary targets are owned by the session and cannot be released.
    #[error("temporary rpc targets cannot be released")]
    TemporaryTargetRelease,

    /// A target reference no longer resolves.
    #[error("rpc target reference is stale or invalid")]
    InvalidTarget,

    /// `SendTo::SpecifiedInParams` was used without a target in the params.
    #[error("no target supplied for a params-specified rpc")]
    MissingTarget,

    /// No handler is registered for an rpc hash.
    #[error("unknown rpc hash: {0:#010x}")]
    UnknownRpc(u32),

    /// Two rpc names hash to the same value.
    #[error("rpc hash collision {hash:#010x}: '{existing}' and '{name}'")]
    DuplicateRpc {
        /// The colliding hash.
        hash: u32,
        /// Name already registered.
        existing: String,
        /// Name being registered.
        name: String,
    },

    /// An item cannot be framed inside a batch.
    #[error("batch item of {0} bytes cannot be framed")]
    InvalidBatchItem(usize),

    /// A proxy envelope was received by a peer that is not the relay.
    #[error("proxy envelope received by a non-server peer")]
    MisroutedProxy,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Slot pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for transport operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
