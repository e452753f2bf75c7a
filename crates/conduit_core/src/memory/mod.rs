//! # Memory Management
//!
//! Pre-allocated pools and recyclers for zero-allocation ticks.
//!
//! ## Design Philosophy
//!
//! Storage is reserved once at startup. During a tick:
//! - No heap allocations
//! - Stale handles are detected, never aliased
//! - Scratch objects are returned for reuse, never dropped

mod pool;
mod recycler;

pub use pool::{PoolError, SlotHandle, SlotPool};
pub use recycler::{Recyclable, Recycler};
