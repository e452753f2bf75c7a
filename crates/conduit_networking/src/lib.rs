//! # CONDUIT Networking - The RPC Transport Core
//!
//! Packs typed values into a compact binary form, records outgoing and
//! incoming messages per network tick into rollback-safe frame history,
//! coalesces them per destination and resolves who each replicated
//! procedure call is addressed to.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► packer ──► target resolver ──► frame queue ──► batcher ──► Transport
//!   (args)   (scratch)    (remote | local)   (per stage)    (per dest)
//!                              │
//!                              └── local: immediate dispatch or next-tick loopback
//!
//!  Transport ──► unbatch ──► frame queue (inbound) ──► MessageHandler (per stage)
//! ```
//!
//! ## Components
//!
//! - **Protocol**: tagged varints, bit-level writes, vector/rotation delta compression
//! - **Queue**: per-stage frame history with back-patched record lengths
//! - **Batching**: per-destination streams with length framing
//! - **Target**: routing policies, proxy relay through the server
//! - **Session**: explicit context passed to every operation (no globals)
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_networking::{NetworkSession, SessionRole, TransportConfig, UpdateStage};
//!
//! let mut session = NetworkSession::new(TransportConfig::default(), SessionRole::Host, 0)?;
//! for stage in UpdateStage::ALL {
//!     session.network_update(stage, &mut transport, &mut dispatcher);
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod batching;
pub mod config;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod target;
pub mod transport;

// Re-exports for convenience
pub use batching::{BatchBoundary, MessageBatcher};
pub use config::TransportConfig;
pub use dispatch::{CustomMessages, Dispatcher, MessageHandler, RpcBody, RpcContext, RpcDispatchTable};
pub use error::{NetworkError, NetworkResult};
pub use message::{Direction, MessageKind, NetworkDelivery, UpdateStage, WireHeader};
pub use protocol::{
    BitReader, BitWriter, BufferReader, CompressedVector3Delta, Packable, Quat,
    QuaternionCompressor, ScratchBuffer, Vec2, Vec3, Vec4, Vector3DeltaCompressor,
};
pub use queue::{FrameQueue, HistoryFrame, RecordHeader, ShutdownReport};
pub use session::{NetworkSession, ObjectRoute, RpcParams, SessionRole, SessionStats};
pub use target::{RpcTarget, RpcTargets, SendTo, TargetRef, TargetResolver};
pub use transport::{ChannelKind, MemoryHub, MemoryTransport, Transport};

/// Client id of the server. A host (server that is also a client) uses it
/// as its local id too.
pub const SERVER_CLIENT_ID: u64 = 0;

/// Default per-destination batch flush threshold in bytes.
pub const DEFAULT_BATCH_THRESHOLD: usize = 512;

/// Default size above which a batch is sent on the fragmented channel.
pub const DEFAULT_FRAGMENTATION_THRESHOLD: usize = 1024;

/// Default largest message body in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Largest item the batch length prefix can frame.
pub const MAX_BATCH_ITEM_SIZE: usize = u16::MAX as usize;
