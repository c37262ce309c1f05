/*!
# Enttec DMX USB Pro Output

This crate drives DMX512 fixtures through an Enttec-compatible USB-to-DMX
widget. It encodes the widget's framed serial protocol and keeps a continuous
stream of DMX frames flowing to the device at a configurable refresh rate.

## Core Types

- [`Message`] / [`MessageLabel`] - Host-to-widget protocol messages
- [`StreamDecoder`] - Incremental frame extraction from a byte stream
- [`ChannelBuffer`] - Start code + 512 channels with tear-free snapshots
- [`Parameters`] / [`ParameterSet`] - Validated widget timing parameters
- [`OutputScheduler`] - Background transmission loop
- [`EnttecProPort`] / [`UnthreadedEnttecProPort`] - Public port controllers

## Modules

- [`message`] - Frame encoding and decoding
- [`stream`] - Buffered decoding of partial and concatenated frames
- [`channels`] - Shared channel buffer
- [`params`] - Widget parameters and dirty tracking
- [`transport`] - Byte-stream transports (serial and in-memory)
- [`scheduler`] - Continuous output loop
- [`port`] - Port capability traits and controllers
- [`error`] - Common error types
*/

pub mod channels;
pub mod error;
pub mod message;
pub mod params;
pub mod port;
pub mod scheduler;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use channels::{ChannelBuffer, Snapshot};
pub use error::{DmxError, Result};
pub use message::{FrameError, Message, MessageLabel};
pub use params::{ParameterField, ParameterSet, Parameters, WidgetParameters};
pub use port::{
    DmxOutputPort, EnttecProPort, PortState, PortStatus, SendOnDemand, UnthreadedEnttecProPort,
};
pub use scheduler::{OutputEvent, OutputOptions, OutputScheduler};
pub use stream::StreamDecoder;
pub use transport::{Connector, MemoryConnector, SerialConnector, Transport};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// First byte of every widget message
    pub const START_OF_MESSAGE: u8 = 0x7E;

    /// Last byte of every widget message
    pub const END_OF_MESSAGE: u8 = 0xE7;

    /// Start delimiter, label and 16-bit length
    pub const HEADER_LEN: usize = 4;

    /// Header plus end delimiter
    pub const FRAMING_OVERHEAD: usize = HEADER_LEN + 1;

    /// Largest payload the 16-bit length field can describe
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

    /// Number of DMX channels in a universe
    pub const DMX_CHANNELS: usize = 512;

    /// Start code + 512 channels
    pub const DMX_FRAME_LEN: usize = DMX_CHANNELS + 1;

    /// Null start code used for dimmer data
    pub const DMX_START_CODE: u8 = 0x00;

    /// Minimum number of slots per packet to respect the minimum time between breaks
    pub const MIN_DMX_SLOTS: usize = 24;

    /// Length of the set-parameters payload
    pub const SET_PARAMS_LEN: usize = 5;

    /// Break and mark-after-break are expressed in units of 10.67 µs
    pub const TIMING_UNIT_NANOS: u64 = 10_670;
}
