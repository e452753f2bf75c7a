//! # Binary Packer
//!
//! Tagged little-endian varints for integers, zig-zag for signed values and
//! bit-reinterpreted floats.
//!
//! ## Varint Layout
//!
//! The low bits of the first byte hold a tag. Tags `1..=W` give the byte
//! count of a compact value stored shifted past the tag; tag `W + 1` means
//! the full-width value follows as `W` raw bytes.
//!
//! ```text
//! width  tag bits  compact max   full tag  full size
//!   16      2       2^14 - 1        3       1 + 2
//!   32      3       2^29 - 1        5       1 + 4
//!   64      4       2^60 - 1        9       1 + 8
//!
//! u32 300:  300 << 3 = 2400 = 0x0960, 2 bytes  →  0x0962  →  [0x62, 0x09]
//! ```

use crate::error::{NetworkError, NetworkResult};

use super::buffer::{BufferReader, ScratchBuffer};
use super::math::{Quat, Vec2, Vec3, Vec4};

/// Values with a packed wire representation.
pub trait Packable: Sized {
    /// Appends the packed form of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()>;

    /// Reads a packed value.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated or malformed input.
    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self>;
}

/// Appends the packed form of `value`.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the buffer is full.
#[inline]
pub fn write_packed<T: Packable>(buffer: &mut ScratchBuffer, value: &T) -> NetworkResult<()> {
    value.write_packed(buffer)
}

/// Reads a packed value.
///
/// # Errors
///
/// Returns an error for truncated or malformed input.
#[inline]
pub fn read_packed<T: Packable>(reader: &mut BufferReader<'_>) -> NetworkResult<T> {
    T::read_packed(reader)
}

// =============================================================================
// Varint core
// =============================================================================

/// Per-width varint parameters.
struct VarintWidth {
    /// Width in bits, reported in errors.
    bits: u8,
    /// Bits of the first byte used by the tag.
    tag_bits: u32,
    /// Bytes of the full-width form (also the largest compact byte count).
    full_bytes: usize,
}

impl VarintWidth {
    const fn tag_mask(&self) -> u8 {
        ((1u16 << self.tag_bits) - 1) as u8
    }

    const fn full_tag(&self) -> u8 {
        self.full_bytes as u8 + 1
    }

    const fn compact_max(&self) -> u64 {
        (1u64 << (self.bits as u32 - self.tag_bits)) - 1
    }
}

const U16: VarintWidth = VarintWidth {
    bits: 16,
    tag_bits: 2,
    full_bytes: 2,
};

const U32: VarintWidth = VarintWidth {
    bits: 32,
    tag_bits: 3,
    full_bytes: 4,
};

const U64: VarintWidth = VarintWidth {
    bits: 64,
    tag_bits: 4,
    full_bytes: 8,
};

/// Bytes needed to hold `value`; zero still takes one byte.
#[inline]
const fn used_bytes(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros() as usize).div_ceil(8)
    }
}

#[inline]
const fn varint_len(value: u64, width: &VarintWidth) -> usize {
    if value > width.compact_max() {
        1 + width.full_bytes
    } else {
        used_bytes(value << width.tag_bits)
    }
}

fn write_varint(buffer: &mut ScratchBuffer, value: u64, width: &VarintWidth) -> NetworkResult<()> {
    if value > width.compact_max() {
        buffer.ensure_remaining(1 + width.full_bytes)?;
        buffer.write_byte(width.full_tag())?;
        return buffer.write_partial(value, width.full_bytes);
    }

    let shifted = value << width.tag_bits;
    let count = used_bytes(shifted);
    buffer.write_partial(shifted | count as u64, count)
}

fn read_varint(reader: &mut BufferReader<'_>, width: &VarintWidth) -> NetworkResult<u64> {
    let tag = reader.peek_byte()? & width.tag_mask();

    if tag == width.full_tag() {
        reader.read_byte()?;
        return reader.read_partial(width.full_bytes);
    }
    if tag == 0 || usize::from(tag) > width.full_bytes {
        return Err(NetworkError::MalformedVarint {
            tag,
            width: width.bits,
        });
    }

    let raw = reader.read_partial(usize::from(tag))?;
    Ok(raw >> width.tag_bits)
}

/// Writes a tagged 16-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the buffer is full.
#[inline]
pub fn write_varint_u16(buffer: &mut ScratchBuffer, value: u16) -> NetworkResult<()> {
    write_varint(buffer, u64::from(value), &U16)
}

/// Writes a tagged 32-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the buffer is full.
#[inline]
pub fn write_varint_u32(buffer: &mut ScratchBuffer, value: u32) -> NetworkResult<()> {
    write_varint(buffer, u64::from(value), &U32)
}

/// Writes a tagged 64-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the buffer is full.
#[inline]
pub fn write_varint_u64(buffer: &mut ScratchBuffer, value: u64) -> NetworkResult<()> {
    write_varint(buffer, value, &U64)
}

/// Reads a tagged 16-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::MalformedVarint`] for a bad tag or
/// [`NetworkError::ReadPastEnd`] for truncated input.
#[inline]
pub fn read_varint_u16(reader: &mut BufferReader<'_>) -> NetworkResult<u16> {
    // The compact range and the full form both fit in 16 bits.
    read_varint(reader, &U16).map(|value| value as u16)
}

/// Reads a tagged 32-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::MalformedVarint`] for a bad tag or
/// [`NetworkError::ReadPastEnd`] for truncated input.
#[inline]
pub fn read_varint_u32(reader: &mut BufferReader<'_>) -> NetworkResult<u32> {
    read_varint(reader, &U32).map(|value| value as u32)
}

/// Reads a tagged 64-bit varint.
///
/// # Errors
///
/// Returns [`NetworkError::MalformedVarint`] for a bad tag or
/// [`NetworkError::ReadPastEnd`] for truncated input.
#[inline]
pub fn read_varint_u64(reader: &mut BufferReader<'_>) -> NetworkResult<u64> {
    read_varint(reader, &U64)
}

/// Encoded size of a 16-bit varint.
#[inline]
#[must_use]
pub const fn varint_len_u16(value: u16) -> usize {
    varint_len(value as u64, &U16)
}

/// Encoded size of a 32-bit varint.
#[inline]
#[must_use]
pub const fn varint_len_u32(value: u32) -> usize {
    varint_len(value as u64, &U32)
}

/// Encoded size of a 64-bit varint.
#[inline]
#[must_use]
pub const fn varint_len_u64(value: u64) -> usize {
    varint_len(value, &U64)
}

// =============================================================================
// Zig-zag
// =============================================================================

/// Zig-zag encodes a 16-bit signed value.
#[inline]
#[must_use]
pub const fn zigzag_encode_16(value: i16) -> u16 {
    ((value << 1) ^ (value >> 15)) as u16
}

/// Reverses [`zigzag_encode_16`].
#[inline]
#[must_use]
pub const fn zigzag_decode_16(value: u16) -> i16 {
    ((value >> 1) as i16) ^ -((value & 1) as i16)
}

/// Zig-zag encodes a 32-bit signed value.
#[inline]
#[must_use]
pub const fn zigzag_encode_32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Reverses [`zigzag_encode_32`].
#[inline]
#[must_use]
pub const fn zigzag_decode_32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Zig-zag encodes a 64-bit signed value.
#[inline]
#[must_use]
pub const fn zigzag_encode_64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Reverses [`zigzag_encode_64`].
#[inline]
#[must_use]
pub const fn zigzag_decode_64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// =============================================================================
// Packable implementations
// =============================================================================

impl Packable for u8 {
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        buffer.write_byte(*self)
    }

    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        reader.read_byte()
    }
}

impl Packable for i8 {
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        buffer.write_byte(*self as u8)
    }

    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        reader.read_byte().map(|byte| byte as i8)
    }
}

impl Packable for bool {
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        buffer.write_byte(u8::from(*self))
    }

    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        reader.read_byte().map(|byte| byte != 0)
    }
}

macro_rules! impl_packable_varint {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Packable for $ty {
            #[inline]
            fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
                $write(buffer, *self)
            }

            #[inline]
            fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
                $read(reader)
            }
        }
    };
}

/// Packs through a lossless mapping onto an unsigned varint.
macro_rules! impl_packable_mapped {
    ($ty:ty, $unsigned:ty, $encode:path, $decode:path) => {
        impl Packable for $ty {
            #[inline]
            fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
                $encode(*self).write_packed(buffer)
            }

            #[inline]
            fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
                <$unsigned>::read_packed(reader).map($decode)
            }
        }
    };
}

impl_packable_varint!(u16, write_varint_u16, read_varint_u16);
impl_packable_varint!(u32, write_varint_u32, read_varint_u32);
impl_packable_varint!(u64, write_varint_u64, read_varint_u64);
impl_packable_mapped!(i16, u16, zigzag_encode_16, zigzag_decode_16);
impl_packable_mapped!(i32, u32, zigzag_encode_32, zigzag_decode_32);
impl_packable_mapped!(i64, u64, zigzag_encode_64, zigzag_decode_64);
impl_packable_mapped!(f32, u32, f32::to_bits, f32::from_bits);
impl_packable_mapped!(f64, u64, f64::to_bits, f64::from_bits);

impl Packable for String {
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        let len = u32::try_from(self.len()).map_err(|_| NetworkError::Overflow {
            requested: self.len(),
            remaining: buffer.remaining(),
        })?;
        buffer.ensure_remaining(varint_len_u32(len) + self.len())?;
        write_varint_u32(buffer, len)?;
        buffer.write_bytes(self.as_bytes())
    }

    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        let len = read_varint_u32(reader)? as usize;
        let bytes = reader.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| NetworkError::InvalidUtf8)
    }
}

macro_rules! impl_packable_floats {
    ($ty:ident { $($field:ident),+ }) => {
        impl Packable for $ty {
            fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
                $( self.$field.write_packed(buffer)?; )+
                Ok(())
            }

            fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
                Ok(Self {
                    $( $field: f32::read_packed(reader)?, )+
                })
            }
        }
    };
}

impl_packable_floats!(Vec2 { x, y });
impl_packable_floats!(Vec3 { x, y, z });
impl_packable_floats!(Vec4 { x, y, z, w });
impl_packable_floats!(Quat { x, y, z, w });
