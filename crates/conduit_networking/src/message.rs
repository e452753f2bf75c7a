//! # Message Vocabulary
//!
//! Message kinds, delivery classes, update stages and the per-message wire
//! header.
//!
//! ## Wire Header
//!
//! ```text
//! ┌──────────────┬────────────┬───────────────────────────┬─────────────┐
//! │ kind (u16 LE)│ stage (u8) │ origin (u64 LE, if flag)  │ payload ... │
//! └──────────────┴────────────┴───────────────────────────┴─────────────┘
//!   bit 15 of kind = ORIGIN_FLAG (set only by a relay)
//! ```

use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{BufferReader, ScratchBuffer};
use crate::transport::ChannelKind;

/// Bit set in the wire kind when an origin sender follows the stage byte.
pub const ORIGIN_FLAG: u16 = 0x8000;

/// Size of a wire header without an origin.
pub const WIRE_HEADER_SIZE: usize = 3;

/// Size of a wire header carrying an origin.
pub const MAX_WIRE_HEADER_SIZE: usize = WIRE_HEADER_SIZE + 8;

/// Kinds of message carried by the transport core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageKind {
    /// Client asks to join.
    ConnectionRequest = 0,
    /// Server accepted a client.
    ConnectionApproved = 1,
    /// Server-to-client procedure call.
    ClientRpc = 2,
    /// Client-to-server procedure call.
    ServerRpc = 3,
    /// Universal procedure call routed by target policy.
    Rpc = 4,
    /// Envelope asking the server to relay a message to other clients.
    Proxy = 5,
    /// Object spawn.
    CreateObject = 6,
    /// Object despawn.
    DestroyObject = 7,
    /// Ownership change.
    ChangeOwner = 8,
    /// Clock synchronisation.
    TimeSync = 9,
    /// Custom message without a name.
    UnnamedMessage = 10,
    /// Custom message addressed by name hash.
    NamedMessage = 11,
    /// Log line forwarded to the server.
    ServerLog = 12,
    /// Bulk state snapshot.
    SnapshotData = 13,
    /// Replicated field changes.
    NetworkVariableDelta = 14,
    /// Scene management event.
    SceneEvent = 15,
    /// Parenting change.
    ParentSync = 16,
}

impl MessageKind {
    /// The wire tag of this kind.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// True for kinds whose payload starts with a packed object id and must
    /// wait while that object is unknown locally.
    #[must_use]
    pub const fn addresses_object(self) -> bool {
        matches!(
            self,
            Self::ClientRpc
                | Self::ServerRpc
                | Self::Rpc
                | Self::ChangeOwner
                | Self::NetworkVariableDelta
                | Self::ParentSync
        )
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = NetworkError;

    fn try_from(value: u16) -> NetworkResult<Self> {
        Ok(match value {
            0 => Self::ConnectionRequest,
            1 => Self::ConnectionApproved,
            2 => Self::ClientRpc,
            3 => Self::ServerRpc,
            4 => Self::Rpc,
            5 => Self::Proxy,
            6 => Self::CreateObject,
            7 => Self::DestroyObject,
            8 => Self::ChangeOwner,
            9 => Self::TimeSync,
            10 => Self::UnnamedMessage,
            11 => Self::NamedMessage,
            12 => Self::ServerLog,
            13 => Self::SnapshotData,
            14 => Self::NetworkVariableDelta,
            15 => Self::SceneEvent,
            16 => Self::ParentSync,
            other => return Err(NetworkError::UnknownMessageKind(other)),
        })
    }
}

/// Delivery guarantee requested for a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkDelivery {
    /// Fire and forget.
    Unreliable = 0,
    /// Delivered, any order.
    #[default]
    Reliable = 1,
    /// Delivered, in order.
    ReliableSequenced = 2,
    /// Delivered in order, may exceed one datagram.
    ReliableFragmentedSequenced = 3,
}

impl NetworkDelivery {
    /// The transport channel that provides this delivery class.
    #[inline]
    #[must_use]
    pub const fn channel(self) -> ChannelKind {
        match self {
            Self::Unreliable => ChannelKind::Unreliable,
            Self::Reliable => ChannelKind::Reliable,
            Self::ReliableSequenced => ChannelKind::ReliableSequenced,
            Self::ReliableFragmentedSequenced => ChannelKind::Fragmented,
        }
    }
}

impl TryFrom<u8> for NetworkDelivery {
    type Error = NetworkError;

    fn try_from(value: u8) -> NetworkResult<Self> {
        match value {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::Reliable),
            2 => Ok(Self::ReliableSequenced),
            3 => Ok(Self::ReliableFragmentedSequenced),
            other => Err(NetworkError::UnknownDelivery(other)),
        }
    }
}

/// Points in the host frame at which queued messages are processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum UpdateStage {
    /// Start of frame, before anything else.
    Initialization = 0,
    /// Transport polling happens here.
    EarlyUpdate = 1,
    /// Fixed-rate simulation step.
    FixedUpdate = 2,
    /// Before the variable-rate update.
    PreUpdate = 3,
    /// Variable-rate update.
    #[default]
    Update = 4,
    /// Before late update.
    PreLateUpdate = 5,
    /// End of frame; outbound traffic is flushed here.
    PostLateUpdate = 6,
}

impl UpdateStage {
    /// Number of stages.
    pub const COUNT: usize = 7;

    /// Every stage in frame order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Initialization,
        Self::EarlyUpdate,
        Self::FixedUpdate,
        Self::PreUpdate,
        Self::Update,
        Self::PreLateUpdate,
        Self::PostLateUpdate,
    ];

    /// Dense index of this stage.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for UpdateStage {
    type Error = NetworkError;

    fn try_from(value: u8) -> NetworkResult<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(NetworkError::UnknownUpdateStage(value))
    }
}

/// Direction of a frame history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received, or looped back locally.
    Inbound,
    /// Waiting to be sent.
    Outbound,
}

/// Header that precedes every message inside a transport batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    /// Message kind.
    pub kind: MessageKind,
    /// Stage the receiver processes the message in.
    pub stage: UpdateStage,
    /// Original sender when the message was forwarded by a relay.
    pub origin: Option<u64>,
}

impl WireHeader {
    /// A header without origin.
    #[must_use]
    pub const fn new(kind: MessageKind, stage: UpdateStage) -> Self {
        Self {
            kind,
            stage,
            origin: None,
        }
    }

    /// Encoded size of this header.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        if self.origin.is_some() {
            MAX_WIRE_HEADER_SIZE
        } else {
            WIRE_HEADER_SIZE
        }
    }

    /// Writes the header.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    pub fn write(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        let mut tag = self.kind.as_u16();
        if self.origin.is_some() {
            tag |= ORIGIN_FLAG;
        }
        buffer.write_u16_le(tag)?;
        buffer.write_byte(self.stage as u8)?;
        if let Some(origin) = self.origin {
            buffer.write_u64_le(origin)?;
        }
        Ok(())
    }

    /// Reads a header.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated input or unknown kind/stage tags.
    pub fn read(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        let tag = reader.read_u16_le()?;
        let kind = MessageKind::try_from(tag & !ORIGIN_FLAG)?;
        let stage = UpdateStage::try_from(reader.read_byte()?)?;
        let origin = if tag & ORIGIN_FLAG == 0 {
            None
        } else {
            Some(reader.read_u64_le()?)
        };
        Ok(Self {
            kind,
            stage,
            origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in 0..=16u16 {
            let kind = MessageKind::try_from(tag).unwrap();
            assert_eq!(kind.as_u16(), tag);
        }
        assert_eq!(
            MessageKind::try_from(17),
            Err(NetworkError::UnknownMessageKind(17))
        );
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(UpdateStage::ALL[UpdateStage::PostLateUpdate.index()], UpdateStage::PostLateUpdate);
        assert!(UpdateStage::try_from(7).is_err());
    }

    #[test]
    fn test_wire_header_layout() {
        let mut buffer = ScratchBuffer::new(32);
        WireHeader::new(MessageKind::Rpc, UpdateStage::Update)
            .write(&mut buffer)
            .unwrap();
        assert_eq!(buffer.as_slice(), &[4, 0, 4]);

        let mut reader = BufferReader::new(buffer.as_slice());
        let header = WireHeader::read(&mut reader).unwrap();
        assert_eq!(header, WireHeader::new(MessageKind::Rpc, UpdateStage::Update));
    }

    #[test]
    fn test_wire_header_origin_flag() {
        let mut buffer = ScratchBuffer::new(32);
        let header = WireHeader {
            kind: MessageKind::Rpc,
            stage: UpdateStage::FixedUpdate,
            origin: Some(7),
        };
        header.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), header.encoded_len());
        assert_eq!(buffer.as_slice()[1], 0x80);

        let mut reader = BufferReader::new(buffer.as_slice());
        assert_eq!(WireHeader::read(&mut reader).unwrap(), header);
    }

    #[test]
    fn test_delivery_channels() {
        assert_eq!(NetworkDelivery::Unreliable.channel(), ChannelKind::Unreliable);
        assert_eq!(
            NetworkDelivery::ReliableFragmentedSequenced.channel(),
            ChannelKind::Fragmented
        );
        assert!(NetworkDelivery::try_from(9).is_err());
    }
}
