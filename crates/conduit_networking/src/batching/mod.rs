//! # Batching Engine
//!
//! Coalesces outbound messages per destination so that many small messages
//! leave in one transport send.
//!
//! ## Stream Format
//!
//! ```text
//! ┌────────┬───────────┬────────┬───────────┬─────
//! │ length │ message 0 │ length │ message 1 │ ...
//! └────────┴───────────┴────────┴───────────┴─────
//!   len < 256    : [len]                    (1 byte)
//!   len >= 256   : [0][len % 256][len / 256] (3 bytes)
//! ```
//!
//! Zero marks the long form, which works because empty messages are never
//! framed.
//!
//! ## Flush Rules
//!
//! - [`BatchBoundary::FlushBeforeAppend`]: a stream never grows past the
//!   threshold unless it holds a single oversized item
//! - [`BatchBoundary::FlushAfterAppend`]: append first, flush once the
//!   stream reaches the threshold
//! - A delivery class change flushes the destination first
//! - Batches above the fragmentation threshold go out on
//!   [`ChannelKind::Fragmented`]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};
use crate::message::NetworkDelivery;
use crate::protocol::BufferReader;
use crate::transport::ChannelKind;
use crate::{DEFAULT_FRAGMENTATION_THRESHOLD, MAX_BATCH_ITEM_SIZE};

/// Marks the three-byte length form.
const LONG_LENGTH_MARKER: u8 = 0;

/// When a stream is flushed relative to the item that crosses the threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchBoundary {
    /// Flush the existing stream if the new item would push it past the
    /// threshold, then start a new stream with the item.
    #[default]
    FlushBeforeAppend,
    /// Append the item, then flush once the stream is at or past the
    /// threshold.
    FlushAfterAppend,
}

/// Batching counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Items appended to a stream (once per destination).
    pub items_queued: u64,
    /// Batches handed to the flush callback.
    pub batches_flushed: u64,
    /// Bytes handed to the flush callback.
    pub bytes_flushed: u64,
    /// Batches upgraded to the fragmented channel.
    pub fragmented_batches: u64,
}

/// Pending bytes for one destination.
#[derive(Debug, Default)]
struct SendStream {
    delivery: NetworkDelivery,
    bytes: Vec<u8>,
}

/// Per-destination batch builder.
#[derive(Debug)]
pub struct MessageBatcher {
    streams: BTreeMap<u64, SendStream>,
    boundary: BatchBoundary,
    fragmentation_threshold: usize,
    stats: BatchStats,
}

impl MessageBatcher {
    /// Creates a batcher.
    #[must_use]
    pub fn new(boundary: BatchBoundary, fragmentation_threshold: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            boundary,
            fragmentation_threshold,
            stats: BatchStats::default(),
        }
    }

    /// Boundary policy in use.
    #[must_use]
    pub const fn boundary(&self) -> BatchBoundary {
        self.boundary
    }

    /// Counters since creation.
    #[must_use]
    pub const fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Bytes waiting across all destinations.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.streams.values().map(|s| s.bytes.len()).sum()
    }

    /// Bytes waiting for `destination`.
    #[must_use]
    pub fn pending_for(&self, destination: u64) -> usize {
        self.streams.get(&destination).map_or(0, |s| s.bytes.len())
    }

    /// Appends `payload` to the stream of every destination, flushing
    /// streams as the boundary policy requires.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidBatchItem`] for empty payloads and
    /// payloads longer than a length prefix can express.
    pub fn queue_item<F>(
        &mut self,
        destinations: &[u64],
        payload: &[u8],
        delivery: NetworkDelivery,
        size_threshold: usize,
        mut on_flush: F,
    ) -> NetworkResult<()>
    where
        F: FnMut(u64, &[u8], ChannelKind),
    {
        let length = payload.len();
        if length == 0 || length > MAX_BATCH_ITEM_SIZE {
            tracing::warn!("rejected batch item of {} bytes", length);
            return Err(NetworkError::InvalidBatchItem(length));
        }
        let framed = framed_len(length);
        let fragmentation = self.fragmentation_threshold;

        for &destination in destinations {
            let stream = self.streams.entry(destination).or_default();
            let stats = &mut self.stats;

            if !stream.bytes.is_empty() && stream.delivery != delivery {
                flush_stream(destination, stream, fragmentation, stats, &mut on_flush);
            }
            if self.boundary == BatchBoundary::FlushBeforeAppend
                && !stream.bytes.is_empty()
                && stream.bytes.len() + framed > size_threshold
            {
                flush_stream(destination, stream, fragmentation, stats, &mut on_flush);
            }

            stream.delivery = delivery;
            push_length(&mut stream.bytes, length);
            stream.bytes.extend_from_slice(payload);
            stats.items_queued += 1;

            let full = match self.boundary {
                BatchBoundary::FlushBeforeAppend => stream.bytes.len() > size_threshold,
                BatchBoundary::FlushAfterAppend => stream.bytes.len() >= size_threshold,
            };
            if full {
                flush_stream(destination, stream, fragmentation, stats, &mut on_flush);
            }
        }
        Ok(())
    }

    /// Flushes every non-empty stream.
    pub fn flush_all<F>(&mut self, mut on_flush: F)
    where
        F: FnMut(u64, &[u8], ChannelKind),
    {
        for (&destination, stream) in &mut self.streams {
            if !stream.bytes.is_empty() {
                flush_stream(
                    destination,
                    stream,
                    self.fragmentation_threshold,
                    &mut self.stats,
                    &mut on_flush,
                );
            }
        }
    }

    /// Drops the stream of a destination that went away.
    pub fn remove_destination(&mut self, destination: u64) {
        if let Some(stream) = self.streams.remove(&destination) {
            if !stream.bytes.is_empty() {
                tracing::debug!(
                    "dropped {} pending bytes for departed client {}",
                    stream.bytes.len(),
                    destination
                );
            }
        }
    }

    /// Discards all pending streams, returning the bytes dropped.
    pub fn shutdown(&mut self) -> usize {
        let dropped = self.pending_bytes();
        if dropped > 0 {
            tracing::warn!("batcher shut down with {} unsent bytes", dropped);
        }
        self.streams.clear();
        dropped
    }

    /// Splits a received batch into messages.
    ///
    /// Returns the number of messages delivered. A truncated or malformed
    /// length ends the batch.
    pub fn receive_items<F>(batch: &[u8], mut on_item: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut reader = BufferReader::new(batch);
        let mut delivered = 0;
        while reader.remaining() > 0 {
            let item = pop_length(&mut reader).and_then(|length| reader.read_bytes(length));
            match item {
                Ok(bytes) => {
                    on_item(bytes);
                    delivered += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        "batch truncated after {} messages, {} bytes discarded: {}",
                        delivered,
                        reader.remaining(),
                        error
                    );
                    break;
                }
            }
        }
        delivered
    }
}

impl Default for MessageBatcher {
    fn default() -> Self {
        Self::new(BatchBoundary::default(), DEFAULT_FRAGMENTATION_THRESHOLD)
    }
}

fn flush_stream<F>(
    destination: u64,
    stream: &mut SendStream,
    fragmentation_threshold: usize,
    stats: &mut BatchStats,
    on_flush: &mut F,
) where
    F: FnMut(u64, &[u8], ChannelKind),
{
    let channel = if stream.bytes.len() > fragmentation_threshold {
        stats.fragmented_batches += 1;
        ChannelKind::Fragmented
    } else {
        stream.delivery.channel()
    };
    on_flush(destination, &stream.bytes, channel);
    stats.batches_flushed += 1;
    stats.bytes_flushed += stream.bytes.len() as u64;
    stream.bytes.clear();
}

/// Size of `length` bytes once framed.
#[inline]
#[must_use]
pub const fn framed_len(length: usize) -> usize {
    if length < 256 {
        length + 1
    } else {
        length + 3
    }
}

/// Appends the length prefix for an item of `length` bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn push_length(out: &mut Vec<u8>, length: usize) {
    debug_assert!(length > 0 && length <= MAX_BATCH_ITEM_SIZE);
    if length < 256 {
        out.push(length as u8);
    } else {
        out.extend_from_slice(&[LONG_LENGTH_MARKER, (length % 256) as u8, (length / 256) as u8]);
    }
}

/// Reads a length prefix.
///
/// # Errors
///
/// Returns [`NetworkError::ReadPastEnd`] when the prefix is truncated and
/// [`NetworkError::InvalidBatchItem`] for a zero long-form length.
pub fn pop_length(reader: &mut BufferReader<'_>) -> NetworkResult<usize> {
    let first = reader.read_byte()?;
    if first != LONG_LENGTH_MARKER {
        return Ok(usize::from(first));
    }
    let low = usize::from(reader.read_byte()?);
    let high = usize::from(reader.read_byte()?);
    let length = low + high * 256;
    if length == 0 {
        return Err(NetworkError::InvalidBatchItem(0));
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flushes = Vec<(u64, Vec<u8>, ChannelKind)>;

    fn collect(flushes: &mut Flushes) -> impl FnMut(u64, &[u8], ChannelKind) + '_ {
        move |dest, bytes, channel| flushes.push((dest, bytes.to_vec(), channel))
    }

    fn items_in(batch: &[u8]) -> Vec<Vec<u8>> {
        let mut items = Vec::new();
        MessageBatcher::receive_items(batch, |item| items.push(item.to_vec()));
        items
    }

    #[test]
    fn test_flush_before_append_three_items() {
        let mut batcher = MessageBatcher::new(BatchBoundary::FlushBeforeAppend, 1024);
        let mut flushes = Flushes::new();
        for fill in 1..=3u8 {
            batcher
                .queue_item(&[1], &[fill; 200], NetworkDelivery::Reliable, 512, collect(&mut flushes))
                .unwrap();
        }

        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1.len(), 402);
        assert_eq!(items_in(&flushes[0].1), vec![vec![1; 200], vec![2; 200]]);
        assert_eq!(batcher.pending_for(1), 201);

        batcher.flush_all(collect(&mut flushes));
        assert_eq!(flushes.len(), 2);
        assert_eq!(items_in(&flushes[1].1), vec![vec![3; 200]]);
        assert_eq!(batcher.pending_bytes(), 0);
    }

    #[test]
    fn test_flush_after_append_three_items() {
        let mut batcher = MessageBatcher::new(BatchBoundary::FlushAfterAppend, 1024);
        let mut flushes = Flushes::new();
        for fill in 1..=3u8 {
            batcher
                .queue_item(&[1], &[fill; 200], NetworkDelivery::Reliable, 512, collect(&mut flushes))
                .unwrap();
        }

        assert_eq!(flushes.len(), 1);
        assert_eq!(items_in(&flushes[0].1).len(), 3);
        assert_eq!(batcher.pending_bytes(), 0);
    }

    #[test]
    fn test_exact_threshold_does_not_flush() {
        let mut batcher = MessageBatcher::default();
        let mut flushes = Flushes::new();
        batcher
            .queue_item(&[2], &[0; 255], NetworkDelivery::Reliable, 512, collect(&mut flushes))
            .unwrap();
        batcher
            .queue_item(&[2], &[0; 255], NetworkDelivery::Reliable, 512, collect(&mut flushes))
            .unwrap();

        assert!(flushes.is_empty());
        assert_eq!(batcher.pending_for(2), 512);
    }

    #[test]
    fn test_oversized_item_goes_alone() {
        let mut batcher = MessageBatcher::default();
        let mut flushes = Flushes::new();
        batcher
            .queue_item(&[3], &[7; 10], NetworkDelivery::Unreliable, 512, collect(&mut flushes))
            .unwrap();
        batcher
            .queue_item(&[3], &[8; 600], NetworkDelivery::Unreliable, 512, collect(&mut flushes))
            .unwrap();

        assert_eq!(flushes.len(), 2);
        assert_eq!(items_in(&flushes[0].1), vec![vec![7; 10]]);
        assert_eq!(flushes[1].1.len(), 603);
        assert_eq!(flushes[1].2, ChannelKind::Unreliable);
    }

    #[test]
    fn test_delivery_change_flushes() {
        let mut batcher = MessageBatcher::default();
        let mut flushes = Flushes::new();
        batcher
            .queue_item(&[4], &[1], NetworkDelivery::Unreliable, 512, collect(&mut flushes))
            .unwrap();
        batcher
            .queue_item(&[4], &[2], NetworkDelivery::ReliableSequenced, 512, collect(&mut flushes))
            .unwrap();
        batcher.flush_all(collect(&mut flushes));

        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].2, ChannelKind::Unreliable);
        assert_eq!(flushes[1].2, ChannelKind::ReliableSequenced);
    }

    #[test]
    fn test_large_batch_upgraded_to_fragmented() {
        let mut batcher = MessageBatcher::new(BatchBoundary::FlushBeforeAppend, 1024);
        let mut flushes = Flushes::new();
        batcher
            .queue_item(&[5], &[0; 2000], NetworkDelivery::Reliable, 4096, collect(&mut flushes))
            .unwrap();
        batcher.flush_all(collect(&mut flushes));

        assert_eq!(flushes[0].2, ChannelKind::Fragmented);
        assert_eq!(batcher.stats().fragmented_batches, 1);
    }

    #[test]
    fn test_destinations_keep_order() {
        let mut batcher = MessageBatcher::default();
        let mut flushes = Flushes::new();
        for n in 0..5u8 {
            batcher
                .queue_item(&[1, 2], &[n], NetworkDelivery::Reliable, 512, collect(&mut flushes))
                .unwrap();
        }
        batcher.flush_all(collect(&mut flushes));

        assert_eq!(flushes.len(), 2);
        for (_, bytes, _) in &flushes {
            let items: Vec<u8> = items_in(bytes).into_iter().map(|i| i[0]).collect();
            assert_eq!(items, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_rejects_empty_and_huge_items() {
        let mut batcher = MessageBatcher::default();
        let sink = |_: u64, _: &[u8], _: ChannelKind| {};
        assert_eq!(
            batcher.queue_item(&[1], &[], NetworkDelivery::Reliable, 512, sink),
            Err(NetworkError::InvalidBatchItem(0))
        );
        let huge = vec![0; MAX_BATCH_ITEM_SIZE + 1];
        assert!(batcher
            .queue_item(&[1], &huge, NetworkDelivery::Reliable, 512, sink)
            .is_err());
    }

    #[test]
    fn test_length_prefix_forms() {
        let mut out = Vec::new();
        push_length(&mut out, 255);
        push_length(&mut out, 256);
        push_length(&mut out, 1000);
        assert_eq!(out, vec![255, 0, 0, 1, 0, 232, 3]);

        let mut reader = BufferReader::new(&out);
        assert_eq!(pop_length(&mut reader), Ok(255));
        assert_eq!(pop_length(&mut reader), Ok(256));
        assert_eq!(pop_length(&mut reader), Ok(1000));
    }

    #[test]
    fn test_truncated_batch_stops() {
        let mut batch = Vec::new();
        push_length(&mut batch, 3);
        batch.extend_from_slice(&[1, 2, 3]);
        push_length(&mut batch, 10);
        batch.extend_from_slice(&[4, 5]);

        assert_eq!(items_in(&batch), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_shutdown_discards_pending() {
        let mut batcher = MessageBatcher::default();
        batcher
            .queue_item(&[1], &[9; 4], NetworkDelivery::Reliable, 512, |_, _, _| {})
            .unwrap();
        assert_eq!(batcher.shutdown(), 5);
        assert_eq!(batcher.pending_bytes(), 0);
    }
}
