//! # Frame Queue Container
//!
//! Two rings of per-stage history frames, one per direction.
//!
//! ```text
//!              ring slot 0            ring slot 1
//! Inbound   [stage 0..6 frames]    [stage 0..6 frames]  ◄─ loopback writes
//! Outbound  [stage 0..6 frames]    [stage 0..6 frames]     land in "next"
//! ```
//!
//! `advance` clears the current slot of a direction and rotates its ring.

use conduit_core::FrameRing;

use crate::config::TransportConfig;
use crate::error::NetworkResult;
use crate::message::{Direction, UpdateStage};

use super::frame::{FrameWrite, HistoryFrame, RecordHeader};

/// One history frame per update stage.
type StageFrames = Box<[HistoryFrame]>;

/// What [`FrameQueue::shutdown`] found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames that still held records.
    pub drained_frames: usize,
    /// Frames that still held unprocessed loopback records.
    pub loopback_frames: usize,
}

/// Per-direction, per-stage frame history.
pub struct FrameQueue {
    inbound: FrameRing<StageFrames>,
    outbound: FrameRing<StageFrames>,
    processed: [u64; 2],
}

impl FrameQueue {
    /// Allocates every frame upfront.
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        let build = |direction: Direction| {
            FrameRing::new(config.history_depth, |_| {
                UpdateStage::ALL
                    .iter()
                    .map(|&stage| {
                        HistoryFrame::new(
                            direction,
                            stage,
                            config.frame_buffer_size,
                            config.max_message_size,
                        )
                    })
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
        };
        Self {
            inbound: build(Direction::Inbound),
            outbound: build(Direction::Outbound),
            processed: [0; 2],
        }
    }

    #[inline]
    fn ring(&self, direction: Direction) -> &FrameRing<StageFrames> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    #[inline]
    fn ring_mut(&mut self, direction: Direction) -> &mut FrameRing<StageFrames> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    /// Number of ring slots per direction.
    #[must_use]
    pub fn history_depth(&self) -> usize {
        self.inbound.depth()
    }

    /// Starts a record in the frame for `header.stage`.
    ///
    /// Inbound loopback records go into the next ring slot so they are
    /// processed on the following tick.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Overflow`](crate::NetworkError::Overflow)
    /// when the frame is full.
    pub fn begin_write(
        &mut self,
        direction: Direction,
        header: &RecordHeader<'_>,
        loopback: bool,
    ) -> NetworkResult<FrameWrite<'_>> {
        let stage = if header.stage == UpdateStage::Initialization {
            tracing::warn!("messages cannot be queued for Initialization, using EarlyUpdate");
            UpdateStage::EarlyUpdate
        } else {
            header.stage
        };

        let ring = self.ring_mut(direction);
        let frames = if loopback && direction == Direction::Inbound {
            ring.next_mut()
        } else {
            ring.current_mut()
        };
        frames[stage.index()].begin_write(header, loopback)
    }

    /// Current frame of `direction` for `stage`.
    #[must_use]
    pub fn frame(&self, direction: Direction, stage: UpdateStage) -> &HistoryFrame {
        &self.ring(direction).current()[stage.index()]
    }

    /// Mutable current frame of `direction` for `stage`.
    pub fn frame_mut(&mut self, direction: Direction, stage: UpdateStage) -> &mut HistoryFrame {
        &mut self.ring_mut(direction).current_mut()[stage.index()]
    }

    /// Frame of `direction` for `stage` in the next ring slot.
    #[must_use]
    pub fn next_frame(&self, direction: Direction, stage: UpdateStage) -> &HistoryFrame {
        &self.ring(direction).next()[stage.index()]
    }

    /// Ends the tick for `direction`: clears the current slot and rotates.
    ///
    /// A frame still holding unconsumed loopback records is kept.
    pub fn advance(&mut self, direction: Direction) {
        let ring = self.ring_mut(direction);
        for frame in ring.current_mut().iter_mut() {
            if frame.is_dirty() && !frame.has_loopback() {
                frame.reset();
            }
        }
        ring.rotate();
        self.processed[direction as usize] += 1;
    }

    /// Number of `advance` calls for `direction`.
    #[must_use]
    pub const fn processed_frames(&self, direction: Direction) -> u64 {
        self.processed[direction as usize]
    }

    /// Empties every frame and reports what was left behind.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for direction in [Direction::Inbound, Direction::Outbound] {
            for frames in self.ring_mut(direction).iter_mut() {
                for frame in frames.iter_mut() {
                    if frame.has_loopback() {
                        report.loopback_frames += 1;
                        tracing::warn!(
                            "shutdown with unprocessed loopback records in {:?} stage {:?}",
                            direction,
                            frame.stage()
                        );
                    }
                    if frame.record_count() > 0 {
                        report.drained_frames += 1;
                    }
                    frame.reset();
                }
            }
        }
        report
    }
}
