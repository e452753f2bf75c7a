//! # Frame Queue
//!
//! Rollback-safe history of serialized messages, per direction and per
//! update stage.
//!
//! ## Design
//!
//! - Every frame buffer is allocated once and reused every tick
//! - Records are written in place; lengths are back-patched on commit
//! - A record is either fully recorded or not at all
//! - Loopback traffic is delayed exactly one tick via the next ring slot

mod container;
mod frame;

pub use container::{FrameQueue, ShutdownReport};
pub use frame::{
    FrameCursor, FrameItem, FrameWrite, HistoryFrame, ItemHeader, RecordHeader, RECORD_OVERHEAD,
};
