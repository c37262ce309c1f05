/*!
Common error types for the Enttec output library.
*/

use thiserror::Error;

use crate::message::FrameError;
use crate::params::ParameterField;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, DmxError>;

/// Comprehensive error type for all port operations
#[derive(Error, Debug)]
pub enum DmxError {
    /// Malformed widget message
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    /// Parameter rejected before transmission
    #[error("Parameter {field} out of range: {value} (expected {min}..={max})")]
    OutOfRangeParameter {
        field: ParameterField,
        value: u32,
        min: u32,
        max: u32,
    },

    /// Channel value outside 0-255
    #[error("Invalid value {value} for channel {channel} (expected 0..=255)")]
    InvalidChannelValue { channel: usize, value: i64 },

    /// Channel level outside 0.0-1.0
    #[error("Invalid level {level} for channel {channel} (expected 0.0..=1.0)")]
    InvalidChannelLevel { channel: usize, level: f32 },

    /// Channel number outside 1-512
    #[error("Channel {0} does not exist (expected 1..=512)")]
    NoSuchChannel(usize),

    /// More values than the universe holds
    #[error("Too many channel values: {count} (at most {max} fit from channel {first})")]
    ChannelOverflow { first: usize, count: usize, max: usize },

    /// I/O errors on the transport
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Start requested before the device is usable
    #[error("Port not ready: {0}")]
    NotReady(String),
}

impl DmxError {
    /// Create a new not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Whether this error was caused by rejected caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::OutOfRangeParameter { .. }
                | Self::InvalidChannelValue { .. }
                | Self::InvalidChannelLevel { .. }
                | Self::NoSuchChannel(_)
                | Self::ChannelOverflow { .. }
        )
    }
}
