//! # Transport Boundary
//!
//! The transport core never touches sockets. It hands finished batches to a
//! [`Transport`] and polls it for received ones.
//!
//! ## Design
//!
//! - One call per batch, addressed by client id
//! - The channel carries the delivery guarantee
//! - Polling is non-blocking

mod memory;

pub use memory::{Datagram, MemoryHub, MemoryTransport, RecordingTransport, TransportStats};

/// Delivery channel offered by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Fire and forget.
    Unreliable,
    /// Delivered, any order.
    Reliable,
    /// Delivered, in order.
    ReliableSequenced,
    /// Delivered in order, split across datagrams when needed.
    Fragmented,
}

/// Low-level transport used by a [`NetworkSession`](crate::NetworkSession).
pub trait Transport {
    /// Sends `bytes` to `client` on `channel`.
    fn send(&mut self, client: u64, bytes: &[u8], channel: ChannelKind);

    /// Returns the next received batch and its sender, if any.
    fn poll_receive(&mut self) -> Option<(u64, Vec<u8>)>;
}
