//! # CONDUIT Core
//!
//! Memory plumbing shared by the CONDUIT transport crates:
//! - Fixed-capacity slot pools with generation-checked handles
//! - Free-list recyclers that hand scratch objects out and take them back
//! - Fixed-depth rings that rotate through per-tick history slots
//!
//! ## Architecture Rules
//!
//! 1. **No heap allocations in the per-tick path** - storage is reserved up front
//! 2. **Handles, not references** - long-lived ids survive storage reuse safely
//! 3. **Single-threaded** - callers own the value, no internal locking

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod memory;
pub mod ring;

pub use memory::{PoolError, Recyclable, Recycler, SlotHandle, SlotPool};
pub use ring::{FrameRing, MIN_RING_DEPTH};
