//! # In-Memory Transports
//!
//! Transports that never leave the process.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │          MemoryHub           │
//!                 │  RwLock<HashMap<id, Sender>> │
//!                 └──────┬───────────────┬───────┘
//!                        │ connect(0)    │ connect(1)
//!              ┌─────────▼─────┐   ┌─────▼─────────┐
//!              │MemoryTransport│   │MemoryTransport│
//!              │ inbox: Receiver│  │ inbox: Receiver│
//!              └───────────────┘   └───────────────┘
//! ```
//!
//! Every peer owns a crossbeam inbox; the hub's routing table is shared
//! behind a `parking_lot` lock so transports can live on different threads.
//! [`RecordingTransport`] captures sends for single-session tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use super::{ChannelKind, Transport};

/// One batch in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Sending client.
    pub sender: u64,
    /// Destination client.
    pub destination: u64,
    /// Batch bytes.
    pub bytes: Vec<u8>,
    /// Channel the batch was sent on.
    pub channel: ChannelKind,
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Sends to unknown or disconnected peers.
    pub send_errors: u64,
}

type Routes = Arc<RwLock<HashMap<u64, Sender<Datagram>>>>;

/// Routing table connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    routes: Routes,
}

impl MemoryHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` and returns its transport.
    ///
    /// Connecting an id twice replaces the earlier inbox.
    #[must_use]
    pub fn connect(&self, client: u64) -> MemoryTransport {
        let (sender, inbox) = crossbeam_channel::unbounded();
        if self.routes.write().insert(client, sender).is_some() {
            tracing::warn!("client {} reconnected to memory hub, old inbox dropped", client);
        }
        MemoryTransport {
            local_id: client,
            routes: Arc::clone(&self.routes),
            inbox,
            stats: TransportStats::default(),
        }
    }

    /// Removes `client`; sends to it are counted as errors afterwards.
    pub fn disconnect(&self, client: u64) {
        self.routes.write().remove(&client);
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.routes.read().len()
    }
}

/// One peer's end of a [`MemoryHub`].
pub struct MemoryTransport {
    local_id: u64,
    routes: Routes,
    inbox: Receiver<Datagram>,
    stats: TransportStats,
}

impl MemoryTransport {
    /// Client id of this end.
    #[must_use]
    pub const fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Returns statistics.
    #[must_use]
    pub const fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Batches waiting in the inbox.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, client: u64, bytes: &[u8], channel: ChannelKind) {
        let route = self.routes.read().get(&client).cloned();
        let delivered = route.is_some_and(|sender| {
            sender
                .send(Datagram {
                    sender: self.local_id,
                    destination: client,
                    bytes: bytes.to_vec(),
                    channel,
                })
                .is_ok()
        });

        if delivered {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += bytes.len() as u64;
        } else {
            self.stats.send_errors += 1;
            tracing::debug!("memory transport {}: no route to client {}", self.local_id, client);
        }
    }

    fn poll_receive(&mut self) -> Option<(u64, Vec<u8>)> {
        let datagram = self.inbox.try_recv().ok()?;
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.bytes.len() as u64;
        Some((datagram.sender, datagram.bytes))
    }
}

/// Transport that records every send and replays queued receives.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    /// Every batch handed to `send`, in order.
    pub sent: Vec<Datagram>,
    /// Batches returned by `poll_receive`, front first.
    pub incoming: VecDeque<(u64, Vec<u8>)>,
    /// Client id reported as the sender of recorded batches.
    pub local_id: u64,
}

impl RecordingTransport {
    /// Creates a recorder for `local_id`.
    #[must_use]
    pub fn new(local_id: u64) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    /// Queues a batch for the next `poll_receive`.
    pub fn push_incoming(&mut self, sender: u64, bytes: Vec<u8>) {
        self.incoming.push_back((sender, bytes));
    }

    /// Recorded batches addressed to `client`.
    pub fn sent_to(&self, client: u64) -> impl Iterator<Item = &Datagram> {
        self.sent.iter().filter(move |d| d.destination == client)
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, client: u64, bytes: &[u8], channel: ChannelKind) {
        self.sent.push(Datagram {
            sender: self.local_id,
            destination: client,
            bytes: bytes.to_vec(),
            channel,
        });
    }

    fn poll_receive(&mut self) -> Option<(u64, Vec<u8>)> {
        self.incoming.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_routes_between_peers() {
        let hub = MemoryHub::new();
        let mut server = hub.connect(0);
        let mut client = hub.connect(1);

        client.send(0, b"hello", ChannelKind::Reliable);
        assert_eq!(server.poll_receive(), Some((1, b"hello".to_vec())));
        assert_eq!(server.poll_receive(), None);
        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().bytes_received, 5);
    }

    #[test]
    fn test_send_to_unknown_peer_counts_error() {
        let hub = MemoryHub::new();
        let mut client = hub.connect(1);
        client.send(9, b"x", ChannelKind::Unreliable);

        assert_eq!(client.stats().send_errors, 1);
        assert_eq!(client.stats().packets_sent, 0);
    }

    #[test]
    fn test_hub_crosses_threads() {
        let hub = MemoryHub::new();
        let mut server = hub.connect(0);
        let remote = hub.clone();

        std::thread::spawn(move || {
            let mut client = remote.connect(5);
            client.send(0, &[1, 2, 3], ChannelKind::ReliableSequenced);
        })
        .join()
        .unwrap();

        assert_eq!(server.poll_receive(), Some((5, vec![1, 2, 3])));
        assert_eq!(hub.peer_count(), 2);
    }

    #[test]
    fn test_recording_transport() {
        let mut transport = RecordingTransport::new(3);
        transport.send(0, &[9], ChannelKind::Fragmented);
        transport.push_incoming(0, vec![7]);

        assert_eq!(transport.sent_to(0).count(), 1);
        assert_eq!(transport.sent[0].channel, ChannelKind::Fragmented);
        assert_eq!(transport.poll_receive(), Some((0, vec![7])));
    }
}
