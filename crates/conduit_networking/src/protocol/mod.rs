//! # Binary Protocol
//!
//! Everything that turns values into bytes and back.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ buffer       ScratchBuffer / BufferReader, bitwise sub-mode  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ packer       tagged varints, zig-zag, Packable              │
//! ├─────────────────────────────────────────────────────────────┤
//! │ compression  vector deltas (6 bytes), rotations (4 bytes)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ fields       replicated field deltas with length safety     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Philosophy
//!
//! - Every bit counts - small values take one byte
//! - Capacity is checked before writing, never after
//! - Decoding errors are values, never panics

mod buffer;
mod compression;
mod fields;
mod math;
mod packer;

pub use buffer::{BitReader, BitWriter, BufferReader, ScratchBuffer};
pub use compression::{
    CompressedVector3Delta, QuaternionCompressor, Vector3DeltaCompressor, MAX_DELTA_MAGNITUDE,
    MAX_DELTA_PRECISION, MIN_DELTA_PRECISION,
};
pub use fields::{read_field_delta, write_field_delta, FieldDeltaOutcome, FieldSet};
pub use math::{Quat, Vec2, Vec3, Vec4};
pub use packer::{
    read_packed, read_varint_u16, read_varint_u32, read_varint_u64, varint_len_u16,
    varint_len_u32, varint_len_u64, write_packed, write_varint_u16, write_varint_u32,
    write_varint_u64, zigzag_decode_16, zigzag_decode_32, zigzag_decode_64, zigzag_encode_16,
    zigzag_encode_32, zigzag_encode_64, Packable,
};
