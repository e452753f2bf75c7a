//! # Field Deltas
//!
//! Encoding for changes to an object's replicated fields.
//!
//! ```text
//! [u16 packed field_count]
//! length-safe:   per field  [u32 packed size][size bytes]   (size 0 = unchanged)
//! compact:       per field  [u8 dirty][field bytes if dirty]
//! ```
//!
//! With length safety a field the sender may not write, or one that reads
//! the wrong number of bytes, is skipped and the rest of the record is still
//! applied. Without it the reader cannot find the next field, so the record
//! is abandoned at the first bad field.

use crate::error::{NetworkError, NetworkResult};

use super::buffer::{BufferReader, ScratchBuffer};
use super::packer::{read_varint_u16, read_varint_u32, write_varint_u16, write_varint_u32};

/// Replicated fields of one object behaviour.
pub trait FieldSet {
    /// Number of fields.
    fn field_count(&self) -> usize;

    /// True when `field` changed since the last delta.
    fn is_dirty(&self, field: usize) -> bool;

    /// True when `sender` may write `field`.
    fn can_write(&self, field: usize, sender: u64) -> bool;

    /// Writes the current value of `field`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    fn write_field(&self, field: usize, buffer: &mut ScratchBuffer) -> NetworkResult<()>;

    /// Reads and applies a new value for `field`.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated or malformed input.
    fn read_field(&mut self, field: usize, reader: &mut BufferReader<'_>) -> NetworkResult<()>;
}

/// What a field delta did to the local field set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldDeltaOutcome {
    /// Fields applied.
    pub applied: Vec<usize>,
    /// Fields skipped (unauthorized or desynced), length-safe only.
    pub skipped: Vec<usize>,
    /// Error that ended the record early, if any.
    pub abandoned: Option<NetworkError>,
}

/// Writes the dirty fields of `fields`.
///
/// In length-safe mode each field is staged in `field_scratch` to learn its
/// size; the caller supplies it so no buffer is built per delta.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the delta, or one field in
/// `field_scratch`, does not fit.
pub fn write_field_delta(
    fields: &dyn FieldSet,
    buffer: &mut ScratchBuffer,
    field_scratch: &mut ScratchBuffer,
    length_safe: bool,
) -> NetworkResult<()> {
    let count = fields.field_count();
    let wire_count = u16::try_from(count).map_err(|_| NetworkError::Overflow {
        requested: count,
        remaining: usize::from(u16::MAX),
    })?;
    write_varint_u16(buffer, wire_count)?;

    for field in 0..count {
        let dirty = fields.is_dirty(field);
        if !length_safe {
            buffer.write_byte(u8::from(dirty))?;
            if dirty {
                fields.write_field(field, buffer)?;
            }
            continue;
        }

        if !dirty {
            write_varint_u32(buffer, 0)?;
            continue;
        }
        field_scratch.clear();
        fields.write_field(field, field_scratch)?;
        let size = u32::try_from(field_scratch.len()).map_err(|_| NetworkError::Overflow {
            requested: field_scratch.len(),
            remaining: buffer.remaining(),
        })?;
        write_varint_u32(buffer, size)?;
        buffer.write_bytes(field_scratch.as_slice())?;
    }
    Ok(())
}

/// Reads a field delta sent by `sender` and applies it to `fields`.
///
/// # Errors
///
/// Returns [`NetworkError::FieldCountMismatch`] when the record was built
/// for a different field layout; nothing is applied in that case.
pub fn read_field_delta(
    fields: &mut dyn FieldSet,
    reader: &mut BufferReader<'_>,
    sender: u64,
    length_safe: bool,
) -> NetworkResult<FieldDeltaOutcome> {
    let received = usize::from(read_varint_u16(reader)?);
    let expected = fields.field_count();
    if received != expected {
        tracing::warn!(
            "field delta from client {} has {} fields, expected {}",
            sender,
            received,
            expected
        );
        return Err(NetworkError::FieldCountMismatch { expected, received });
    }

    let mut outcome = FieldDeltaOutcome::default();
    for field in 0..expected {
        let step = if length_safe {
            read_sized_field(fields, reader, sender, field, &mut outcome)
        } else {
            read_compact_field(fields, reader, sender, field, &mut outcome)
        };
        if let Err(error) = step {
            outcome.abandoned = Some(error);
            break;
        }
    }
    Ok(outcome)
}

fn read_sized_field(
    fields: &mut dyn FieldSet,
    reader: &mut BufferReader<'_>,
    sender: u64,
    field: usize,
    outcome: &mut FieldDeltaOutcome,
) -> NetworkResult<()> {
    let size = read_varint_u32(reader)? as usize;
    if size == 0 {
        return Ok(());
    }
    if size > reader.remaining() {
        return Err(NetworkError::ReadPastEnd {
            needed: size,
            remaining: reader.remaining(),
        });
    }
    let end = reader.position() + size;

    if !fields.can_write(field, sender) {
        tracing::warn!(
            "{}",
            NetworkError::UnauthorizedWrite { sender, field }
        );
        outcome.skipped.push(field);
        return reader.seek(end);
    }

    // The field only ever sees its declared bytes.
    let mut field_reader = BufferReader::new(reader.read_bytes(size)?);
    match fields.read_field(field, &mut field_reader) {
        Ok(()) if field_reader.remaining() == 0 => outcome.applied.push(field),
        Ok(()) => {
            tracing::warn!(
                "{} in field {}",
                NetworkError::ProtocolDesync {
                    declared: size,
                    consumed: field_reader.position(),
                },
                field
            );
            outcome.skipped.push(field);
        }
        Err(error) => {
            tracing::warn!("field {} from client {} failed to read: {}", field, sender, error);
            outcome.skipped.push(field);
        }
    }
    Ok(())
}

fn read_compact_field(
    fields: &mut dyn FieldSet,
    reader: &mut BufferReader<'_>,
    sender: u64,
    field: usize,
    outcome: &mut FieldDeltaOutcome,
) -> NetworkResult<()> {
    if reader.read_byte()? == 0 {
        return Ok(());
    }
    if !fields.can_write(field, sender) {
        let error = NetworkError::CriticalUnauthorizedWrite { sender, field };
        tracing::error!("{}", error);
        return Err(error);
    }
    fields.read_field(field, reader)?;
    outcome.applied.push(field);
    Ok(())
}
