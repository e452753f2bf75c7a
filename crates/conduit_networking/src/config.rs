//! # Transport Configuration
//!
//! Every tunable of the transport core in one struct. Loaded once at
//! startup, either built in code or parsed from TOML:
//!
//! ```toml
//! history_depth = 3
//! batch_threshold = 1024
//! batch_boundary = "flush_after_append"
//! ```
//!
//! Missing keys take their defaults. `validate` runs after parsing.

use serde::{Deserialize, Serialize};

use crate::batching::BatchBoundary;
use crate::error::{NetworkError, NetworkResult};
use crate::message::MAX_WIRE_HEADER_SIZE;
use crate::protocol::{MAX_DELTA_PRECISION, MIN_DELTA_PRECISION};
use crate::{
    DEFAULT_BATCH_THRESHOLD, DEFAULT_FRAGMENTATION_THRESHOLD, DEFAULT_MAX_MESSAGE_SIZE,
    MAX_BATCH_ITEM_SIZE,
};

/// Configuration for a [`NetworkSession`](crate::NetworkSession).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of frame history slots per direction (minimum 2).
    pub history_depth: usize,
    /// Largest payload accepted for a single message, in bytes.
    pub max_message_size: usize,
    /// Capacity of each per-stage frame buffer, in bytes.
    pub frame_buffer_size: usize,
    /// Flush threshold for a per-destination batch, in bytes.
    pub batch_threshold: usize,
    /// Batches larger than this go out on the fragmented channel.
    pub fragmentation_threshold: usize,
    /// Coalesce outbound messages per destination.
    pub batching_enabled: bool,
    /// When a batch flushes relative to the item that crosses the threshold.
    pub batch_boundary: BatchBoundary,
    /// Prefix each field delta with its size so bad fields can be skipped.
    pub ensure_length_safety: bool,
    /// Buffer messages for objects that are not spawned yet.
    pub deferred_messaging: bool,
    /// Ticks a deferred message waits before it is dropped.
    pub deferred_timeout_ticks: u64,
    /// Upper bound on buffered deferred messages.
    pub max_deferred_messages: usize,
    /// Bits per compressed axis for vector deltas.
    pub delta_precision: u8,
    /// Upper bound on peers; also bounds target lists read off the wire.
    pub max_clients: usize,
    /// Persistent rpc targets that can be allocated at once.
    pub max_persistent_targets: usize,
}

impl TransportConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            history_depth: 2,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            frame_buffer_size: 64 * 1024,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            fragmentation_threshold: DEFAULT_FRAGMENTATION_THRESHOLD,
            batching_enabled: true,
            batch_boundary: BatchBoundary::FlushBeforeAppend,
            ensure_length_safety: true,
            deferred_messaging: true,
            deferred_timeout_ticks: 60,
            max_deferred_messages: 1024,
            delta_precision: MAX_DELTA_PRECISION,
            max_clients: 512,
            max_persistent_targets: 256,
        }
    }

    /// Parses a configuration from TOML and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] when the text does not parse
    /// or a value is out of range.
    pub fn from_toml_str(text: &str) -> NetworkResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| NetworkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> NetworkResult<()> {
        let fail = |reason: String| Err(NetworkError::InvalidConfig(reason));

        if self.history_depth < 2 {
            return fail(format!("history_depth {} is below 2", self.history_depth));
        }
        if self.max_message_size == 0 {
            return fail("max_message_size must be non-zero".to_string());
        }
        if self.max_message_size + MAX_WIRE_HEADER_SIZE > MAX_BATCH_ITEM_SIZE {
            return fail(format!(
                "max_message_size {} exceeds the batch item limit {MAX_BATCH_ITEM_SIZE}",
                self.max_message_size
            ));
        }
        if self.frame_buffer_size < self.max_message_size + crate::queue::RECORD_OVERHEAD {
            return fail(format!(
                "frame_buffer_size {} cannot hold one max-size message",
                self.frame_buffer_size
            ));
        }
        if self.batch_threshold == 0 {
            return fail("batch_threshold must be non-zero".to_string());
        }
        if self.fragmentation_threshold < self.batch_threshold {
            return fail(format!(
                "fragmentation_threshold {} is below batch_threshold {}",
                self.fragmentation_threshold, self.batch_threshold
            ));
        }
        if !(MIN_DELTA_PRECISION..=MAX_DELTA_PRECISION).contains(&self.delta_precision) {
            return fail(format!(
                "delta_precision {} outside {MIN_DELTA_PRECISION}..={MAX_DELTA_PRECISION}",
                self.delta_precision
            ));
        }
        if self.max_clients == 0 {
            return fail("max_clients must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}
