//! # Delta Compression
//!
//! Lossy compression for high-frequency vector and rotation changes.
//!
//! ## Vector Deltas (smallest two, 6 bytes)
//!
//! A delta is split into a unit direction and a magnitude. The direction's
//! largest component is dropped (it is rebuilt from the other two, which
//! are each at most √2/2 in size), the other two are quantized.
//!
//! ```text
//! header: u16
//! ┌────────┬────────────┬───┬──────────────────────────┐
//! │ 15..14 │ 13 12 11   │10 │ 9 ........ 0             │
//! │ largest│ sign bits  │ - │ magnitude fraction       │
//! └────────┴────────────┴───┴──────────────────────────┘
//! compressed: u32
//! ┌───┬──────────────┬───────┬──────────────────────────┐
//! │31 │ 30 ...... 22 │ 21..  │ 2P-1 ............ 0      │
//! │frac│ magnitude   │  -    │ two axes, P bits each    │
//! └───┴──────────────┴───────┴──────────────────────────┘
//! ```
//!
//! Magnitudes below 0.22 set the fractional flag: the 9-bit field then holds
//! hundredths and the header field hundred-thousandths. Otherwise the 9-bit
//! field holds whole units and the header field thousandths.
//!
//! The useful range is `0.001 ..= 255.0`. At the default 11-bit precision
//! the reconstruction error stays within
//! [`Vector3DeltaCompressor::precision_epsilon`]:
//!
//! ```text
//! magnitude   error bound
//!   255.0       0.265
//!    31.0       0.033
//!     1.0       0.0020
//!     0.001     0.0010
//! ```
//!
//! ## Rotations (smallest three, 4 bytes)
//!
//! [`QuaternionCompressor`] stores the largest component's index in 2 bits
//! and the other three in 10 bits each. q and -q are the same rotation, so
//! the largest component is made positive and needs no sign.

use crate::error::{NetworkError, NetworkResult};

use super::buffer::{BufferReader, ScratchBuffer};
use super::math::{Quat, Vec3};
use super::packer::Packable;

/// Lowest supported bits per compressed axis.
pub const MIN_DELTA_PRECISION: u8 = 4;

/// Highest supported bits per compressed axis.
pub const MAX_DELTA_PRECISION: u8 = 11;

/// Largest magnitude the 9-bit field can carry; bigger deltas are clamped.
pub const MAX_DELTA_MAGNITUDE: f32 = 511.999;

const SQRT_TWO_OVER_TWO: f32 = std::f32::consts::FRAC_1_SQRT_2;
const FRACTIONAL_LIMIT: f32 = 0.22;
const HEADER_FRACTION_MASK: u16 = 1023;
const MAGNITUDE_MASK: u32 = 511;
const MAGNITUDE_SHIFT: u32 = 22;
const FRACTIONAL_FLAG: u32 = 1 << 31;
const SIGN_SHIFT: u16 = 11;
const LARGEST_SIGN_BIT: u16 = 1 << (SIGN_SHIFT + 2);
const LARGEST_INDEX_SHIFT: u16 = 14;

/// A compressed vector delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompressedVector3Delta {
    /// Magnitude fraction, sign bits and largest-axis index.
    pub header: u16,
    /// Quantized axes, integer magnitude and fractional flag.
    pub compressed: u32,
}

impl CompressedVector3Delta {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    /// Index of the axis that was dropped.
    #[inline]
    #[must_use]
    pub const fn largest_index(&self) -> usize {
        (self.header >> LARGEST_INDEX_SHIFT) as usize
    }

    /// True when the magnitude was stored at fractional precision.
    #[inline]
    #[must_use]
    pub const fn is_fractional(&self) -> bool {
        self.compressed & FRACTIONAL_FLAG != 0
    }
}

impl Packable for CompressedVector3Delta {
    fn write_packed(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        buffer.ensure_remaining(Self::SIZE)?;
        buffer.write_u16_le(self.header)?;
        buffer.write_u32_le(self.compressed)
    }

    fn read_packed(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        Ok(Self {
            header: reader.read_u16_le()?,
            compressed: reader.read_u32_le()?,
        })
    }
}

/// Smallest-two compressor for vector deltas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vector3DeltaCompressor {
    precision: u8,
    mask: u32,
    encode_scale: f32,
    decode_scale: f32,
}

impl Vector3DeltaCompressor {
    /// Creates a compressor with `precision` bits per axis.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] outside
    /// [`MIN_DELTA_PRECISION`]`..=`[`MAX_DELTA_PRECISION`].
    pub fn new(precision: u8) -> NetworkResult<Self> {
        if !(MIN_DELTA_PRECISION..=MAX_DELTA_PRECISION).contains(&precision) {
            return Err(NetworkError::InvalidConfig(format!(
                "delta precision {precision} outside {MIN_DELTA_PRECISION}..={MAX_DELTA_PRECISION}"
            )));
        }
        let mask = (1u32 << precision) - 1;
        Ok(Self {
            precision,
            mask,
            encode_scale: mask as f32 / SQRT_TWO_OVER_TWO,
            decode_scale: SQRT_TWO_OVER_TWO / mask as f32,
        })
    }

    /// Bits per compressed axis.
    #[inline]
    #[must_use]
    pub const fn precision(&self) -> u8 {
        self.precision
    }

    /// Upper bound on `|decompress(compress(d)) - d|` for `|d| == magnitude`.
    #[must_use]
    pub fn precision_epsilon(&self, magnitude: f32) -> f32 {
        magnitude * 3.0 * self.decode_scale + 0.001
    }

    /// Compresses the change from `previous` to `current`.
    #[inline]
    #[must_use]
    pub fn compress_between(&self, previous: Vec3, current: Vec3) -> CompressedVector3Delta {
        self.compress(current - previous)
    }

    /// Compresses a delta.
    #[must_use]
    pub fn compress(&self, delta: Vec3) -> CompressedVector3Delta {
        let length = delta.magnitude();
        if !length.is_finite() || length <= f32::EPSILON {
            return CompressedVector3Delta::default();
        }

        let direction = delta * (1.0 / length);
        let magnitude = if length > MAX_DELTA_MAGNITUDE {
            tracing::warn!(
                "vector delta magnitude {} exceeds {}, clamping",
                length,
                MAX_DELTA_MAGNITUDE
            );
            MAX_DELTA_MAGNITUDE
        } else {
            length
        };

        let components = direction.to_array();
        let abs = components.map(f32::abs);
        let largest = if abs[0] >= abs[1] && abs[0] >= abs[2] {
            0
        } else if abs[1] >= abs[2] {
            1
        } else {
            2
        };

        let fractional = magnitude < FRACTIONAL_LIMIT;
        let scaled = if fractional { magnitude * 100.0 } else { magnitude };
        let whole = scaled.trunc();
        let fraction = ((scaled - whole) * 1000.0).round() as u16 & HEADER_FRACTION_MASK;

        let mut header = (largest as u16) << LARGEST_INDEX_SHIFT;
        header |= fraction;
        if components[largest] < 0.0 {
            header |= LARGEST_SIGN_BIT;
        }

        let mut compressed = ((whole as u32) & MAGNITUDE_MASK) << MAGNITUDE_SHIFT;
        if fractional {
            compressed |= FRACTIONAL_FLAG;
        }

        let mut axes = 0u32;
        let mut slot = 0u16;
        for axis in (0..3).filter(|&axis| axis != largest) {
            if components[axis] < 0.0 {
                header |= 1 << (SIGN_SHIFT + slot);
            }
            let quantized = ((self.encode_scale * abs[axis]).round() as u32).min(self.mask);
            axes = (axes << self.precision) | quantized;
            slot += 1;
        }
        compressed |= axes;

        CompressedVector3Delta { header, compressed }
    }

    /// Rebuilds a delta.
    #[must_use]
    pub fn decompress(&self, packed: &CompressedVector3Delta) -> Vec3 {
        let largest = packed.largest_index().min(2);

        let mut magnitude = ((packed.compressed >> MAGNITUDE_SHIFT) & MAGNITUDE_MASK) as f32;
        let fraction = f32::from(packed.header & HEADER_FRACTION_MASK);
        if packed.is_fractional() {
            magnitude = magnitude * 0.01 + fraction * 0.000_01;
        } else {
            magnitude += fraction * 0.001;
        }

        let mut components = [0.0f32; 3];
        let mut axes = packed.compressed;
        let mut slot = 1i32;
        let mut sum_of_squares = 0.0f32;
        for axis in (0..3).rev().filter(|&axis| axis != largest) {
            let negative = packed.header & (1 << (i32::from(SIGN_SHIFT) + slot)) != 0;
            let value = (axes & self.mask) as f32 * self.decode_scale;
            components[axis] = if negative { -value } else { value };
            sum_of_squares += value * value;
            axes >>= self.precision;
            slot -= 1;
        }

        let rebuilt = (1.0 - sum_of_squares).max(0.0).sqrt();
        components[largest] = if packed.header & LARGEST_SIGN_BIT != 0 {
            -rebuilt
        } else {
            rebuilt
        };

        Vec3::from_array(components) * magnitude
    }
}

impl Default for Vector3DeltaCompressor {
    fn default() -> Self {
        let mask = (1u32 << MAX_DELTA_PRECISION) - 1;
        Self {
            precision: MAX_DELTA_PRECISION,
            mask,
            encode_scale: mask as f32 / SQRT_TWO_OVER_TWO,
            decode_scale: SQRT_TWO_OVER_TWO / mask as f32,
        }
    }
}

/// Smallest-three rotation compressor (32 bits per quaternion).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuaternionCompressor;

impl QuaternionCompressor {
    const BITS: u32 = 10;
    const MASK: u32 = (1 << Self::BITS) - 1;
    const INDEX_SHIFT: u32 = 30;

    /// Compresses a rotation. The input is normalized first.
    #[must_use]
    pub fn compress(rotation: Quat) -> u32 {
        let mut components = rotation.normalized().to_array();

        let mut largest = 0;
        for index in 1..4 {
            if components[index].abs() > components[largest].abs() {
                largest = index;
            }
        }
        if components[largest] < 0.0 {
            components = components.map(|c| -c);
        }

        let mut packed = 0u32;
        for index in (0..4).filter(|&index| index != largest) {
            let unit = (components[index] / SQRT_TWO_OVER_TWO).clamp(-1.0, 1.0);
            let quantized = ((unit * 0.5 + 0.5) * Self::MASK as f32).round() as u32;
            packed = (packed << Self::BITS) | quantized.min(Self::MASK);
        }
        packed | ((largest as u32) << Self::INDEX_SHIFT)
    }

    /// Rebuilds a rotation.
    #[must_use]
    pub fn decompress(packed: u32) -> Quat {
        let largest = (packed >> Self::INDEX_SHIFT) as usize;
        let mut components = [0.0f32; 4];
        let mut bits = packed;
        let mut sum_of_squares = 0.0f32;

        for index in (0..4).rev().filter(|&index| index != largest) {
            let quantized = (bits & Self::MASK) as f32 / Self::MASK as f32;
            let value = (quantized * 2.0 - 1.0) * SQRT_TWO_OVER_TWO;
            components[index] = value;
            sum_of_squares += value * value;
            bits >>= Self::BITS;
        }
        components[largest] = (1.0 - sum_of_squares).max(0.0).sqrt();

        Quat::from_array(components).normalized()
    }
}
