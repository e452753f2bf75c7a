//! # Deferred Messages
//!
//! Messages addressed to an object that is not spawned locally yet wait
//! here until the object appears or their time runs out.
//!
//! ```text
//! receive ──► unknown object ──► defer(object, message, tick)
//!                                   │
//!          object_spawned(object) ──┴──► ready ──► processed next
//!          purge_expired(tick)    ──────► dropped (warn)
//! ```

use std::collections::HashMap;

use crate::message::{MessageKind, UpdateStage};

/// A message waiting for its object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredMessage {
    /// Message kind.
    pub kind: MessageKind,
    /// Client that sent it.
    pub sender: u64,
    /// Stage it was meant for.
    pub stage: UpdateStage,
    /// Message payload.
    pub payload: Vec<u8>,
    /// Tick it was deferred on.
    deferred_at: u64,
}

impl DeferredMessage {
    /// Wraps a message.
    #[must_use]
    pub fn new(kind: MessageKind, sender: u64, stage: UpdateStage, payload: &[u8]) -> Self {
        Self {
            kind,
            sender,
            stage,
            payload: payload.to_vec(),
            deferred_at: 0,
        }
    }
}

/// Messages waiting for objects, keyed by object id.
#[derive(Debug)]
pub struct DeferredMessages {
    enabled: bool,
    timeout_ticks: u64,
    max_messages: usize,
    waiting: HashMap<u64, Vec<DeferredMessage>>,
    ready: Vec<DeferredMessage>,
    count: usize,
}

impl DeferredMessages {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(enabled: bool, timeout_ticks: u64, max_messages: usize) -> Self {
        Self {
            enabled,
            timeout_ticks,
            max_messages,
            waiting: HashMap::new(),
            ready: Vec::new(),
            count: 0,
        }
    }

    /// Buffers `message` for `object_id`. Returns false when it was
    /// dropped instead.
    pub fn defer(&mut self, object_id: u64, mut message: DeferredMessage, now: u64) -> bool {
        if !self.enabled {
            tracing::warn!(
                "{:?} for unknown object {} dropped, deferred messaging is disabled",
                message.kind,
                object_id
            );
            return false;
        }
        if self.count >= self.max_messages {
            tracing::warn!(
                "{:?} for unknown object {} dropped, {} messages already deferred",
                message.kind,
                object_id,
                self.count
            );
            return false;
        }
        message.deferred_at = now;
        self.waiting.entry(object_id).or_default().push(message);
        self.count += 1;
        true
    }

    /// Releases everything waiting for `object_id`, in arrival order.
    pub fn object_spawned(&mut self, object_id: u64) -> usize {
        let Some(messages) = self.waiting.remove(&object_id) else {
            return 0;
        };
        let released = messages.len();
        self.count -= released;
        self.ready.extend(messages);
        released
    }

    /// Takes the released messages.
    pub fn take_ready(&mut self) -> Vec<DeferredMessage> {
        std::mem::take(&mut self.ready)
    }

    /// Drops messages older than the timeout. Returns how many.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ticks;
        let mut purged = 0;
        self.waiting.retain(|object_id, messages| {
            let before = messages.len();
            messages.retain(|m| now.saturating_sub(m.deferred_at) < timeout);
            let dropped = before - messages.len();
            if dropped > 0 {
                tracing::warn!(
                    "dropped {} deferred messages for object {} that never spawned",
                    dropped,
                    object_id
                );
            }
            purged += dropped;
            !messages.is_empty()
        });
        self.count -= purged;
        purged
    }

    /// Messages still waiting for an object.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// True when nothing is waiting.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drops everything. Returns how many messages were waiting.
    pub fn clear(&mut self) -> usize {
        let dropped = self.count;
        self.waiting.clear();
        self.ready.clear();
        self.count = 0;
        dropped
    }
}
