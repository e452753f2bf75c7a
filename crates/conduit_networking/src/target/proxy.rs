//! # Proxy Envelope
//!
//! A client cannot reach other clients directly. It wraps the message in a
//! proxy envelope addressed to the server, which unwraps it and forwards
//! the inner message to every listed destination.
//!
//! ```text
//! ┌────────────────┬──────────────────┬──────────┬──────────┬─────────────┬─────────┐
//! │ count (u16 pk) │ ids (u64 pk) * n │ kind u16 │ stage u8 │ delivery u8 │ payload │
//! └────────────────┴──────────────────┴──────────┴──────────┴─────────────┴─────────┘
//! ```

use crate::error::{NetworkError, NetworkResult};
use crate::message::{MessageKind, NetworkDelivery, UpdateStage};
use crate::protocol::{
    read_varint_u16, read_varint_u64, write_varint_u16, write_varint_u64, BufferReader,
    ScratchBuffer,
};

/// Metadata of the wrapped message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Kind of the wrapped message.
    pub kind: MessageKind,
    /// Stage the destinations process it in.
    pub stage: UpdateStage,
    /// Delivery class to forward it with.
    pub delivery: NetworkDelivery,
}

/// Writes a proxy envelope around `payload`.
///
/// # Errors
///
/// Returns [`NetworkError::Overflow`] when the envelope does not fit.
pub fn write_proxy(
    buffer: &mut ScratchBuffer,
    targets: &[u64],
    header: ProxyHeader,
    payload: &[u8],
) -> NetworkResult<()> {
    let count = u16::try_from(targets.len()).map_err(|_| NetworkError::Overflow {
        requested: targets.len(),
        remaining: usize::from(u16::MAX),
    })?;
    write_varint_u16(buffer, count)?;
    for &target in targets {
        write_varint_u64(buffer, target)?;
    }
    buffer.write_u16_le(header.kind.as_u16())?;
    buffer.write_byte(header.stage as u8)?;
    buffer.write_byte(header.delivery as u8)?;
    buffer.write_bytes(payload)
}

/// Reads a proxy envelope, filling `targets` and returning the wrapped
/// message.
///
/// # Errors
///
/// Returns [`NetworkError::InvalidTarget`] when the envelope lists more
/// than `max_targets` destinations, and decoding errors for malformed
/// input.
pub fn read_proxy<'a>(
    bytes: &'a [u8],
    max_targets: usize,
    targets: &mut Vec<u64>,
) -> NetworkResult<(ProxyHeader, &'a [u8])> {
    let mut reader = BufferReader::new(bytes);
    let count = usize::from(read_varint_u16(&mut reader)?);
    if count > max_targets {
        return Err(NetworkError::InvalidTarget);
    }
    targets.clear();
    for _ in 0..count {
        targets.push(read_varint_u64(&mut reader)?);
    }
    let header = ProxyHeader {
        kind: MessageKind::try_from(reader.read_u16_le()?)?,
        stage: UpdateStage::try_from(reader.read_byte()?)?,
        delivery: NetworkDelivery::try_from(reader.read_byte()?)?,
    };
    Ok((header, reader.rest()))
}
