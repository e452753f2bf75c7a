//! # Scratch Buffers
//!
//! Byte buffers with a hard capacity, a byte cursor and a bitwise sub-mode.
//!
//! ## Bitwise Mode
//!
//! ```text
//! buffer.begin_bit_write(13)?   // capacity for 13 bits checked once
//!   ├─ write_bit / write_bits   // no per-call capacity checks
//!   └─ finish() or drop         // pad to the byte boundary, back to byte mode
//! ```
//!
//! The [`BitWriter`] borrows the buffer mutably, so byte writes cannot
//! interleave with an open bitwise write. A writer that is leaked without
//! running its destructor leaves the buffer in bitwise mode and every byte
//! access then fails with [`NetworkError::BitModeActive`].

use conduit_core::Recyclable;

use crate::error::{NetworkError, NetworkResult};

/// Growable byte region with a hard capacity limit.
#[derive(Clone, Debug)]
pub struct ScratchBuffer {
    /// Written bytes (high-water mark).
    data: Vec<u8>,
    /// Byte cursor.
    position: usize,
    /// Hard limit on `data.len()`.
    capacity: usize,
    /// A bitwise write is open.
    bit_mode: bool,
}

impl ScratchBuffer {
    /// Creates an empty buffer that can hold at most `capacity` bytes.
    ///
    /// The full capacity is reserved upfront.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            position: 0,
            capacity,
            bit_mode: false,
        }
    }

    /// Number of bytes written (high-water mark).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hard capacity limit.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Byte cursor.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Bytes that can still be written at the cursor.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.position)
    }

    /// True while a bitwise write is open (or was leaked).
    #[inline]
    #[must_use]
    pub const fn in_bit_mode(&self) -> bool {
        self.bit_mode
    }

    /// The written bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Forgets all content and leaves bitwise mode.
    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
        self.bit_mode = false;
    }

    /// Drops everything past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.position = self.position.min(len);
    }

    /// Moves the cursor inside the written range.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when `position` is past the end.
    pub fn seek(&mut self, position: usize) -> NetworkResult<()> {
        if position > self.data.len() {
            return Err(NetworkError::ReadPastEnd {
                needed: position,
                remaining: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Checks that `bytes` can be written at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] or [`NetworkError::BitModeActive`].
    #[inline]
    pub fn ensure_remaining(&self, bytes: usize) -> NetworkResult<()> {
        if self.bit_mode {
            return Err(NetworkError::BitModeActive);
        }
        if bytes > self.remaining() {
            return Err(NetworkError::Overflow {
                requested: bytes,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Writes raw bytes at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the bytes do not fit.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        self.ensure_remaining(bytes.len())?;
        let end = self.position + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }

    /// Writes a single byte.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    #[inline]
    pub fn write_byte(&mut self, value: u8) -> NetworkResult<()> {
        self.write_bytes(&[value])
    }

    /// Writes a u16 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the value does not fit.
    #[inline]
    pub fn write_u16_le(&mut self, value: u16) -> NetworkResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a u32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the value does not fit.
    #[inline]
    pub fn write_u32_le(&mut self, value: u32) -> NetworkResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a u64 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the value does not fit.
    #[inline]
    pub fn write_u64_le(&mut self, value: u64) -> NetworkResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a f32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the value does not fit.
    #[inline]
    pub fn write_f32_le(&mut self, value: f32) -> NetworkResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes the low `count` bytes of `value`, little-endian.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the bytes do not fit.
    #[inline]
    pub fn write_partial(&mut self, value: u64, count: usize) -> NetworkResult<()> {
        debug_assert!(count <= 8);
        let bytes = value.to_le_bytes();
        self.write_bytes(&bytes[..count.min(8)])
    }

    /// Overwrites eight already-written bytes at `at` with `value`.
    ///
    /// Used to back-patch length placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when the range was never written.
    pub fn patch_u64_le(&mut self, at: usize, value: u64) -> NetworkResult<()> {
        let end = at + 8;
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(at..end)
            .ok_or(NetworkError::ReadPastEnd {
                needed: end,
                remaining: len,
            })?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Opens a bitwise write of at most `bit_budget` bits at the cursor.
    ///
    /// Capacity is validated once here; the returned writer performs no
    /// further checks and pads to the next byte boundary when finished or
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the bits cannot fit.
    pub fn begin_bit_write(&mut self, bit_budget: usize) -> NetworkResult<BitWriter<'_>> {
        let bytes = bit_budget.div_ceil(8);
        self.ensure_remaining(bytes)?;

        let original_len = self.data.len();
        let end = self.position + bytes;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.bit_mode = true;

        let start = self.position * 8;
        Ok(BitWriter {
            buffer: self,
            start,
            bit_position: start,
            limit: end * 8,
            original_len,
            finished: false,
        })
    }
}

impl Recyclable for ScratchBuffer {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// Open bitwise write on a [`ScratchBuffer`]. Bits are written LSB first.
pub struct BitWriter<'a> {
    buffer: &'a mut ScratchBuffer,
    /// Absolute bit position where the write opened.
    start: usize,
    /// Absolute bit cursor.
    bit_position: usize,
    /// Pre-validated bit limit.
    limit: usize,
    /// Buffer length before the write opened.
    original_len: usize,
    finished: bool,
}

impl BitWriter<'_> {
    /// Writes a single bit.
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(u64::from(bit), 1);
    }

    /// Writes the low `count` bits of `value` (`count <= 64`).
    ///
    /// A write that does not start on a byte boundary is merged into the
    /// partially filled byte without disturbing its other bits.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64, "at most 64 bits per call");
        debug_assert!(
            self.bit_position + count as usize <= self.limit,
            "bit budget exceeded"
        );

        let mut value = value;
        let mut remaining = count.min(64);
        while remaining > 0 {
            let index = self.bit_position >> 3;
            let shift = (self.bit_position & 7) as u32;
            let chunk = (8 - shift).min(remaining);
            let mask = ((1u16 << chunk) - 1) as u8;
            let bits = (value as u8) & mask;

            // Out-of-budget bits are dropped in release builds.
            if let Some(byte) = self.buffer.data.get_mut(index) {
                *byte = (*byte & !(mask << shift)) | (bits << shift);
            }

            value >>= chunk;
            remaining -= chunk;
            self.bit_position += chunk as usize;
        }
    }

    /// Writes a whole byte, which may straddle two bytes of the buffer.
    #[inline]
    pub fn write_byte(&mut self, value: u8) {
        self.write_bits(u64::from(value), 8);
    }

    /// Bits written so far.
    #[inline]
    #[must_use]
    pub const fn bits_written(&self) -> usize {
        self.bit_position - self.start
    }

    /// Pads to the next byte boundary and returns the buffer to byte mode.
    ///
    /// Returns the byte cursor after the padded bits.
    pub fn finish(mut self) -> usize {
        self.terminate();
        self.buffer.position
    }

    fn terminate(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let end = self.bit_position.div_ceil(8);
        self.buffer.data.truncate(self.original_len.max(end));
        self.buffer.position = end;
        self.buffer.bit_mode = false;
    }
}

impl Drop for BitWriter<'_> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Cursor over received bytes.
#[derive(Clone, Debug)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Creates a reader at the start of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Byte cursor.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Total length of the underlying data.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the underlying data is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left after the cursor.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Everything after the cursor, without consuming it.
    #[inline]
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Moves the cursor to an absolute position.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when `position` is past the end.
    pub fn seek(&mut self, position: usize) -> NetworkResult<()> {
        if position > self.data.len() {
            return Err(NetworkError::ReadPastEnd {
                needed: position,
                remaining: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Reads `count` bytes as a borrowed slice.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> NetworkResult<&'a [u8]> {
        if count > self.remaining() {
            return Err(NetworkError::ReadPastEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += count;
        Ok(&self.data[start..self.position])
    }

    /// Reads a fixed-size array.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer bytes remain.
    #[inline]
    pub fn read_array<const N: usize>(&mut self) -> NetworkResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Returns the next byte without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] at the end of the data.
    #[inline]
    pub fn peek_byte(&self) -> NetworkResult<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(NetworkError::ReadPastEnd {
                needed: 1,
                remaining: 0,
            })
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] at the end of the data.
    #[inline]
    pub fn read_byte(&mut self) -> NetworkResult<u8> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    /// Reads a u16 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer than 2 bytes remain.
    #[inline]
    pub fn read_u16_le(&mut self) -> NetworkResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads a u32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer than 4 bytes remain.
    #[inline]
    pub fn read_u32_le(&mut self) -> NetworkResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads a u64 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer than 8 bytes remain.
    #[inline]
    pub fn read_u64_le(&mut self) -> NetworkResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Reads a f32 in little-endian format.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer than 4 bytes remain.
    #[inline]
    pub fn read_f32_le(&mut self) -> NetworkResult<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads `count` bytes (at most 8) as the low bytes of a little-endian u64.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when fewer bytes remain.
    pub fn read_partial(&mut self, count: usize) -> NetworkResult<u64> {
        debug_assert!(count <= 8);
        let bytes = self.read_bytes(count.min(8))?;
        let mut out = [0u8; 8];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    /// Opens a bitwise read of at most `bit_budget` bits at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when the bits are not there.
    pub fn begin_bit_read(&mut self, bit_budget: usize) -> NetworkResult<BitReader<'_, 'a>> {
        let bytes = bit_budget.div_ceil(8);
        if bytes > self.remaining() {
            return Err(NetworkError::ReadPastEnd {
                needed: bytes,
                remaining: self.remaining(),
            });
        }
        let start = self.position * 8;
        Ok(BitReader {
            reader: self,
            bit_position: start,
            limit: start + bit_budget,
        })
    }
}

/// Open bitwise read on a [`BufferReader`]. Mirrors [`BitWriter`].
pub struct BitReader<'r, 'a> {
    reader: &'r mut BufferReader<'a>,
    bit_position: usize,
    limit: usize,
}

impl BitReader<'_, '_> {
    /// Reads a single bit.
    #[inline]
    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Reads `count` bits (`count <= 64`), LSB first.
    pub fn read_bits(&mut self, count: u32) -> u64 {
        debug_assert!(count <= 64, "at most 64 bits per call");
        debug_assert!(
            self.bit_position + count as usize <= self.limit,
            "bit budget exceeded"
        );

        let count = count.min(64);
        let mut result = 0u64;
        let mut filled = 0u32;
        while filled < count {
            let index = self.bit_position >> 3;
            let shift = (self.bit_position & 7) as u32;
            let chunk = (8 - shift).min(count - filled);
            let mask = ((1u16 << chunk) - 1) as u8;

            // Past-the-end bits read as zero in release builds.
            let byte = self.reader.data.get(index).copied().unwrap_or(0);
            result |= u64::from((byte >> shift) & mask) << filled;

            filled += chunk;
            self.bit_position += chunk as usize;
        }
        result
    }

    /// Reads a whole byte.
    #[inline]
    pub fn read_byte(&mut self) -> u8 {
        self.read_bits(8) as u8
    }

    /// Skips the padding to the next byte boundary and returns the cursor.
    pub fn finish(mut self) -> usize {
        self.terminate();
        self.reader.position
    }

    fn terminate(&mut self) {
        let end = self.bit_position.div_ceil(8).min(self.reader.data.len());
        self.reader.position = self.reader.position.max(end);
    }
}

impl Drop for BitReader<'_, '_> {
    fn drop(&mut self) {
        self.terminate();
    }
}
