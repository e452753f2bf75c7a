//! # History Frames
//!
//! One accumulation buffer per (direction, stage, ring slot).
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────────┬──────────┬────────────┬─────────────┐
//! │ kind u16 │ time f32 │ sender u64 │ delivery u8 │   15 bytes, always
//! ├──────────┴──────────┴────────────┴─────────────┤
//! │ target_count u32 │ target u64 * count           │   outbound only
//! ├──────────────────┴─────────────────────────────┤
//! │ declared_length u64 (back-patched) │ payload    │
//! └────────────────────────────────────┴────────────┘
//! ```
//!
//! All fields are fixed-width little-endian. The length is written as a
//! zero placeholder and patched by [`FrameWrite::commit`]; a write that is
//! dropped without committing rolls the buffer back to the record start.

use crate::error::{NetworkError, NetworkResult};
use crate::message::{Direction, MessageKind, NetworkDelivery, UpdateStage};
use crate::protocol::{BufferReader, ScratchBuffer};

/// Bytes a record may need beyond its payload. Also the slack added to
/// `max_message_size` when sanity-checking declared lengths.
pub const RECORD_OVERHEAD: usize = 512;

/// Fixed part of every record header.
const FIXED_HEADER_SIZE: usize = 2 + 4 + 8 + 1;

/// Metadata written in front of a record's payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordHeader<'a> {
    /// Message kind.
    pub kind: MessageKind,
    /// Stage slot the record goes into.
    pub stage: UpdateStage,
    /// Client that produced the message.
    pub sender: u64,
    /// Delivery class.
    pub delivery: NetworkDelivery,
    /// Session time when the record was written.
    pub timestamp: f32,
    /// Destinations (outbound only; ignored for inbound).
    pub targets: &'a [u64],
}

/// Header of an item copied out by [`HistoryFrame::next_item`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ItemHeader {
    /// Message kind.
    pub kind: MessageKind,
    /// Client that produced the message.
    pub sender: u64,
    /// Delivery class.
    pub delivery: NetworkDelivery,
    /// Session time when the record was written.
    pub timestamp: f32,
}

/// A record viewed in place.
#[derive(Clone, Copy, Debug)]
pub struct FrameItem<'a> {
    /// Record metadata.
    pub header: ItemHeader,
    /// Packed destination ids.
    targets: &'a [u8],
    /// Payload bytes.
    pub payload: &'a [u8],
}

impl<'a> FrameItem<'a> {
    /// Destination ids of an outbound record.
    pub fn targets(&self) -> impl Iterator<Item = u64> + 'a {
        self.targets
            .chunks_exact(8)
            .map(|chunk| u64::from_le(bytemuck::pod_read_unaligned(chunk)))
    }

    /// Number of destinations.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len() / 8
    }
}

/// Position of an in-progress walk over a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCursor {
    record: usize,
}

/// One slot of frame history.
pub struct HistoryFrame {
    direction: Direction,
    stage: UpdateStage,
    buffer: ScratchBuffer,
    /// End offset of every committed record.
    record_ends: Vec<usize>,
    dirty: bool,
    has_loopback: bool,
    /// Declared lengths at or above this abort iteration.
    length_limit: usize,
    max_payload: usize,
}

impl HistoryFrame {
    /// Creates an empty frame holding at most `capacity` bytes.
    #[must_use]
    pub fn new(
        direction: Direction,
        stage: UpdateStage,
        capacity: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            direction,
            stage,
            buffer: ScratchBuffer::new(capacity),
            record_ends: Vec::new(),
            dirty: false,
            has_loopback: false,
            length_limit: max_message_size + RECORD_OVERHEAD,
            max_payload: max_message_size,
        }
    }

    /// Direction of this frame.
    #[inline]
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Stage of this frame.
    #[inline]
    #[must_use]
    pub const fn stage(&self) -> UpdateStage {
        self.stage
    }

    /// True once any record was committed since the last reset.
    #[inline]
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True while loopback records wait to be processed.
    #[inline]
    #[must_use]
    pub const fn has_loopback(&self) -> bool {
        self.has_loopback
    }

    /// Number of committed records.
    #[inline]
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_ends.len()
    }

    /// Bytes used by committed records.
    #[inline]
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.record_ends.last().copied().unwrap_or(0)
    }

    /// Raw frame bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Starts a record. The payload is written through the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the header does not fit.
    pub fn begin_write(
        &mut self,
        header: &RecordHeader<'_>,
        loopback: bool,
    ) -> NetworkResult<FrameWrite<'_>> {
        let start = self.byte_len();
        self.buffer.truncate(start);

        let written = self.write_header(header);
        if let Err(error) = written {
            self.buffer.truncate(start);
            return Err(error);
        }

        let length_at = self.buffer.position() - 8;
        Ok(FrameWrite {
            frame: self,
            start,
            length_at,
            loopback,
            committed: false,
        })
    }

    fn write_header(&mut self, header: &RecordHeader<'_>) -> NetworkResult<()> {
        let targets = match self.direction {
            Direction::Inbound => &[][..],
            Direction::Outbound => header.targets,
        };
        let overhead = FIXED_HEADER_SIZE + 8 + if self.direction == Direction::Outbound {
            4 + targets.len() * 8
        } else {
            0
        };
        self.buffer.ensure_remaining(overhead)?;

        self.buffer.write_u16_le(header.kind.as_u16())?;
        self.buffer.write_f32_le(header.timestamp)?;
        self.buffer.write_u64_le(header.sender)?;
        self.buffer.write_byte(header.delivery as u8)?;
        if self.direction == Direction::Outbound {
            let count = u32::try_from(targets.len()).map_err(|_| NetworkError::Overflow {
                requested: targets.len(),
                remaining: u32::MAX as usize,
            })?;
            self.buffer.write_u32_le(count)?;
            for target in targets {
                self.buffer.write_u64_le(*target)?;
            }
        }
        self.buffer.write_u64_le(0)
    }

    /// Marks loopback records as processed.
    #[inline]
    pub fn mark_consumed(&mut self) {
        self.has_loopback = false;
    }

    /// Empties the frame for reuse.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.record_ends.clear();
        self.dirty = false;
        self.has_loopback = false;
    }

    /// Cursor at the first record.
    #[must_use]
    pub const fn first_item(&self) -> FrameCursor {
        FrameCursor { record: 0 }
    }

    /// Copies the record at `cursor` into `payload`, returns its header and
    /// moves the cursor on.
    ///
    /// Returns `None` at the end of the frame and when a record is corrupt;
    /// a corrupt record ends the walk.
    pub fn next_item(&self, cursor: &mut FrameCursor, payload: &mut Vec<u8>) -> Option<ItemHeader> {
        let item = self.item_at(cursor.record)?;
        payload.clear();
        payload.extend_from_slice(item.payload);
        cursor.record += 1;
        Some(item.header)
    }

    /// Iterates committed records in place.
    pub fn items(&self) -> impl Iterator<Item = FrameItem<'_>> + '_ {
        (0..self.record_ends.len()).map_while(move |record| self.item_at(record))
    }

    fn item_at(&self, record: usize) -> Option<FrameItem<'_>> {
        let end = *self.record_ends.get(record)?;
        let start = if record == 0 {
            0
        } else {
            self.record_ends[record - 1]
        };
        match self.parse_record(&self.buffer.as_slice()[start..end]) {
            Ok(item) => Some(item),
            Err(error) => {
                tracing::warn!(
                    "{:?} frame for stage {:?}: record {} unreadable, iteration aborted: {}",
                    self.direction,
                    self.stage,
                    record,
                    error
                );
                None
            }
        }
    }

    fn parse_record<'a>(&self, bytes: &'a [u8]) -> NetworkResult<FrameItem<'a>> {
        let mut reader = BufferReader::new(bytes);
        let kind = MessageKind::try_from(reader.read_u16_le()?)?;
        let timestamp = reader.read_f32_le()?;
        let sender = reader.read_u64_le()?;
        let delivery = NetworkDelivery::try_from(reader.read_byte()?)?;

        let targets = if self.direction == Direction::Outbound {
            let count = reader.read_u32_le()? as usize;
            reader.read_bytes(count.saturating_mul(8))?
        } else {
            &[]
        };

        let declared = usize::try_from(reader.read_u64_le()?).unwrap_or(usize::MAX);
        if declared >= self.length_limit {
            return Err(NetworkError::ProtocolDesync {
                declared,
                consumed: reader.remaining(),
            });
        }
        let payload = reader.read_bytes(declared)?;

        Ok(FrameItem {
            header: ItemHeader {
                kind,
                sender,
                delivery,
                timestamp,
            },
            targets,
            payload,
        })
    }
}

/// An open record. Commit it or the record is rolled back on drop.
pub struct FrameWrite<'a> {
    frame: &'a mut HistoryFrame,
    start: usize,
    length_at: usize,
    loopback: bool,
    committed: bool,
}

impl FrameWrite<'_> {
    /// Buffer to write the payload into.
    #[inline]
    pub fn buffer(&mut self) -> &mut ScratchBuffer {
        &mut self.frame.buffer
    }

    /// Payload bytes written so far.
    #[inline]
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.frame.buffer.position() - (self.length_at + 8)
    }

    /// Back-patches the length and keeps the record.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the payload exceeds the
    /// maximum message size; the record is rolled back.
    pub fn commit(mut self) -> NetworkResult<usize> {
        let payload_len = self.payload_len();
        if payload_len > self.frame.max_payload {
            return Err(NetworkError::Overflow {
                requested: payload_len,
                remaining: self.frame.max_payload,
            });
        }
        self.frame
            .buffer
            .patch_u64_le(self.length_at, payload_len as u64)?;

        let end = self.frame.buffer.position();
        self.frame.buffer.truncate(end);
        self.frame.record_ends.push(end);
        self.frame.dirty = true;
        if self.loopback {
            self.frame.has_loopback = true;
        }
        self.committed = true;
        Ok(payload_len)
    }
}

impl Drop for FrameWrite<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.frame.buffer.truncate(self.start);
        }
    }
}
