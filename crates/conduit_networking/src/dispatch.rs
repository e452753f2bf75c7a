//! # Message Dispatch
//!
//! Delivers processed messages to user code.
//!
//! ## Procedure Calls
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┬───────────────┬──────┐
//! │ object id (u64 pk) │ behaviour index (u16 pk) │ rpc hash u32  │ args │
//! └────────────────────┴──────────────────────────┴───────────────┴──────┘
//! ```
//!
//! The hash is FNV-1a 32 of the procedure name, computed once at
//! registration; dispatch is a single map lookup.
//!
//! ## Custom Messages
//!
//! Named messages carry the FNV-1a 64 hash of their name in front of the
//! payload. Unnamed messages go to one catch-all handler.

use std::collections::HashMap;

use crate::error::{NetworkError, NetworkResult};
use crate::message::{MessageKind, UpdateStage};
use crate::protocol::{read_varint_u16, read_varint_u64, write_varint_u16, write_varint_u64};
use crate::protocol::{BufferReader, ScratchBuffer};

/// Receives every processed message.
pub trait MessageHandler {
    /// Handles one message.
    fn handle(&mut self, kind: MessageKind, sender: u64, payload: &[u8], stage: UpdateStage);
}

impl<F> MessageHandler for F
where
    F: FnMut(MessageKind, u64, &[u8], UpdateStage),
{
    fn handle(&mut self, kind: MessageKind, sender: u64, payload: &[u8], stage: UpdateStage) {
        self(kind, sender, payload, stage);
    }
}

const FNV_OFFSET_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;
const FNV_OFFSET_64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME_64: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 32 bits.
#[must_use]
pub const fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_32;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME_32);
        i += 1;
    }
    hash
}

/// FNV-1a, 64 bits.
#[must_use]
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME_64);
        i += 1;
    }
    hash
}

/// Stable hash of a procedure name.
#[inline]
#[must_use]
pub const fn rpc_hash(name: &str) -> u32 {
    fnv1a_32(name.as_bytes())
}

/// Addressing prefix of a procedure call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcBody {
    /// Object the call is made on.
    pub object_id: u64,
    /// Behaviour of the object that owns the procedure.
    pub behaviour_index: u16,
    /// Hash of the procedure name.
    pub rpc_hash: u32,
}

impl RpcBody {
    /// Writes the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    pub fn write(&self, buffer: &mut ScratchBuffer) -> NetworkResult<()> {
        write_varint_u64(buffer, self.object_id)?;
        write_varint_u16(buffer, self.behaviour_index)?;
        buffer.write_u32_le(self.rpc_hash)
    }

    /// Reads the prefix.
    ///
    /// # Errors
    ///
    /// Returns decoding errors for truncated or malformed input.
    pub fn read(reader: &mut BufferReader<'_>) -> NetworkResult<Self> {
        Ok(Self {
            object_id: read_varint_u64(reader)?,
            behaviour_index: read_varint_u16(reader)?,
            rpc_hash: reader.read_u32_le()?,
        })
    }

    /// Object id of an encoded call, without decoding the rest.
    ///
    /// # Errors
    ///
    /// Returns decoding errors for truncated or malformed input.
    pub fn peek_object(payload: &[u8]) -> NetworkResult<u64> {
        read_varint_u64(&mut BufferReader::new(payload))
    }
}

/// What a procedure handler is told about the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcContext {
    /// Client that made the call.
    pub sender: u64,
    /// Object the call is made on.
    pub object_id: u64,
    /// Behaviour index on that object.
    pub behaviour_index: u16,
    /// Stage the call is processed in.
    pub stage: UpdateStage,
}

/// Procedure handler; reads its own arguments.
pub type RpcHandler = Box<dyn FnMut(&RpcContext, &mut BufferReader<'_>) -> NetworkResult<()>>;

/// Procedure handlers keyed by name hash.
#[derive(Default)]
pub struct RpcDispatchTable {
    handlers: HashMap<u32, (String, RpcHandler)>,
}

impl RpcDispatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name` and returns its hash.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::DuplicateRpc`] when the hash is taken, by
    /// the same name or a colliding one.
    pub fn register<F>(&mut self, name: &str, handler: F) -> NetworkResult<u32>
    where
        F: FnMut(&RpcContext, &mut BufferReader<'_>) -> NetworkResult<()> + 'static,
    {
        let hash = rpc_hash(name);
        if let Some((existing, _)) = self.handlers.get(&hash) {
            return Err(NetworkError::DuplicateRpc {
                hash,
                existing: existing.clone(),
                name: name.to_string(),
            });
        }
        self.handlers
            .insert(hash, (name.to_string(), Box::new(handler)));
        Ok(hash)
    }

    /// Removes the handler for `name`.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(&rpc_hash(name)).is_some()
    }

    /// True when a handler exists for `hash`.
    #[must_use]
    pub fn contains(&self, hash: u32) -> bool {
        self.handlers.contains_key(&hash)
    }

    /// Number of registered procedures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decodes a call and runs its handler.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownRpc`] for unregistered hashes and any
    /// error the handler returns.
    pub fn dispatch(&mut self, sender: u64, stage: UpdateStage, payload: &[u8]) -> NetworkResult<()> {
        let mut reader = BufferReader::new(payload);
        let body = RpcBody::read(&mut reader)?;
        let (_, handler) = self
            .handlers
            .get_mut(&body.rpc_hash)
            .ok_or(NetworkError::UnknownRpc(body.rpc_hash))?;
        let context = RpcContext {
            sender,
            object_id: body.object_id,
            behaviour_index: body.behaviour_index,
            stage,
        };
        handler(&context, &mut reader)
    }
}

/// Custom message handler: sender and payload.
pub type CustomHandler = Box<dyn FnMut(u64, &[u8])>;

/// Named and unnamed message handlers.
#[derive(Default)]
pub struct CustomMessages {
    named: HashMap<u64, CustomHandler>,
    unnamed: Option<CustomHandler>,
}

impl CustomMessages {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a named message is addressed by.
    #[inline]
    #[must_use]
    pub const fn name_hash(name: &str) -> u64 {
        fnv1a_64(name.as_bytes())
    }

    /// Registers the handler for `name`, replacing any previous one.
    pub fn register_named<F>(&mut self, name: &str, handler: F) -> u64
    where
        F: FnMut(u64, &[u8]) + 'static,
    {
        let hash = Self::name_hash(name);
        if self.named.insert(hash, Box::new(handler)).is_some() {
            tracing::debug!("replaced handler for named message '{}'", name);
        }
        hash
    }

    /// Removes the handler for `name`.
    pub fn unregister_named(&mut self, name: &str) -> bool {
        self.named.remove(&Self::name_hash(name)).is_some()
    }

    /// Sets the handler for unnamed messages.
    pub fn set_unnamed_handler<F>(&mut self, handler: F)
    where
        F: FnMut(u64, &[u8]) + 'static,
    {
        self.unnamed = Some(Box::new(handler));
    }

    /// Writes the body of a named message.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`] when the buffer is full.
    pub fn write_named(buffer: &mut ScratchBuffer, name: &str, data: &[u8]) -> NetworkResult<()> {
        buffer.write_u64_le(Self::name_hash(name))?;
        buffer.write_bytes(data)
    }

    /// Runs the handler a named message is addressed to. Messages with no
    /// handler are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ReadPastEnd`] when the hash is truncated.
    pub fn handle_named(&mut self, sender: u64, payload: &[u8]) -> NetworkResult<()> {
        let mut reader = BufferReader::new(payload);
        let hash = reader.read_u64_le()?;
        match self.named.get_mut(&hash) {
            Some(handler) => handler(sender, reader.rest()),
            None => tracing::debug!("no handler for named message {:#018x}", hash),
        }
        Ok(())
    }

    /// Runs the unnamed message handler, if any.
    pub fn handle_unnamed(&mut self, sender: u64, payload: &[u8]) {
        if let Some(handler) = self.unnamed.as_mut() {
            handler(sender, payload);
        }
    }
}

/// Routes processed messages to procedures, custom messages and a fallback.
#[derive(Default)]
pub struct Dispatcher {
    /// Procedure handlers.
    pub rpcs: RpcDispatchTable,
    /// Custom message handlers.
    pub custom: CustomMessages,
    fallback: Option<Box<dyn MessageHandler>>,
    failures: u64,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives every message kind the dispatcher does not handle itself.
    pub fn set_fallback(&mut self, handler: impl MessageHandler + 'static) {
        self.fallback = Some(Box::new(handler));
    }

    /// Messages that failed to dispatch.
    #[must_use]
    pub const fn failures(&self) -> u64 {
        self.failures
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&mut self, kind: MessageKind, sender: u64, payload: &[u8], stage: UpdateStage) {
        let result = match kind {
            MessageKind::Rpc | MessageKind::ClientRpc | MessageKind::ServerRpc => {
                self.rpcs.dispatch(sender, stage, payload)
            }
            MessageKind::NamedMessage => self.custom.handle_named(sender, payload),
            MessageKind::UnnamedMessage => {
                self.custom.handle_unnamed(sender, payload);
                Ok(())
            }
            _ => {
                match self.fallback.as_mut() {
                    Some(fallback) => fallback.handle(kind, sender, payload, stage),
                    None => tracing::debug!("unhandled {:?} from client {}", kind, sender),
                }
                Ok(())
            }
        };
        if let Err(error) = result {
            self.failures += 1;
            tracing::warn!("{:?} from client {} dropped: {}", kind, sender, error);
        }
    }
}
