/*!
Widget message framing.

Every message exchanged with the widget is laid out as
`0x7E, label, length LSB, length MSB, payload..., 0xE7`. This module encodes
and decodes single messages; [`crate::stream`] builds incremental decoding
on top of [`decode_prefix`].
*/

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::{
    END_OF_MESSAGE, FRAMING_OVERHEAD, HEADER_LEN, MAX_PAYLOAD_LEN, START_OF_MESSAGE,
};

/// Message labels understood by the widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageLabel {
    ReprogramFirmware = 1,
    ProgramFlashPage = 2,
    GetParameters = 3,
    SetParameters = 4,
    ReceivedDmx = 5,
    OutputOnlySendDmx = 6,
    RdmSendDmx = 7,
}

impl MessageLabel {
    /// All labels in wire order
    pub const ALL: [MessageLabel; 7] = [
        Self::ReprogramFirmware,
        Self::ProgramFlashPage,
        Self::GetParameters,
        Self::SetParameters,
        Self::ReceivedDmx,
        Self::OutputOnlySendDmx,
        Self::RdmSendDmx,
    ];

    /// Parse a label from its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ReprogramFirmware),
            2 => Some(Self::ProgramFlashPage),
            3 => Some(Self::GetParameters),
            4 => Some(Self::SetParameters),
            5 => Some(Self::ReceivedDmx),
            6 => Some(Self::OutputOnlySendDmx),
            7 => Some(Self::RdmSendDmx),
            _ => None,
        }
    }

    /// Wire value of this label
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::ReprogramFirmware => "reprogram firmware",
            Self::ProgramFlashPage => "program flash page",
            Self::GetParameters => "get parameters",
            Self::SetParameters => "set parameters",
            Self::ReceivedDmx => "received DMX",
            Self::OutputOnlySendDmx => "send DMX",
            Self::RdmSendDmx => "RDM send DMX",
        }
    }
}

impl fmt::Display for MessageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// Errors that can occur while framing or unframing a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Missing start delimiter 0x7E (found {found:?})")]
    MissingStart { found: Option<u8> },

    #[error("Missing end delimiter 0xE7 (found {found:?})")]
    MissingEnd { found: Option<u8> },

    #[error("Declared payload length {declared} does not match {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Message too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Unknown message label: {0}")]
    UnknownLabel(u8),

    #[error("Payload of {0} bytes exceeds the 65535 byte limit")]
    PayloadTooLarge(usize),

    #[error("Incomplete message: {needed} more bytes needed")]
    Incomplete { needed: usize },
}

impl FrameError {
    /// True when the input was a valid prefix and more bytes are needed
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// A single widget message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub label: MessageLabel,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message from a label and payload
    pub fn new(label: MessageLabel, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            label,
            payload: payload.into(),
        }
    }

    /// Create an output-only DMX message; `data` starts with the start code
    pub fn send_dmx(data: &[u8]) -> Self {
        Self::new(MessageLabel::OutputOnlySendDmx, data)
    }

    /// Encode this message into its wire form
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self.label, &self.payload)
    }

    /// Number of bytes this message occupies on the wire
    pub fn encoded_len(&self) -> usize {
        self.payload.len() + FRAMING_OVERHEAD
    }
}

/// Encode a message: `[0x7E, label, len LSB, len MSB, payload..., 0xE7]`
pub fn encode(label: MessageLabel, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(payload.len() + FRAMING_OVERHEAD);
    buf.put_u8(START_OF_MESSAGE);
    buf.put_u8(label.as_u8());
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.put_u8(END_OF_MESSAGE);

    Ok(buf.freeze())
}

/// Decode exactly one message occupying the whole of `bytes`
pub fn decode(bytes: &[u8]) -> Result<Message, FrameError> {
    match bytes.first() {
        Some(&START_OF_MESSAGE) => {}
        found => return Err(FrameError::MissingStart { found: found.copied() }),
    }

    match bytes.last() {
        Some(&END_OF_MESSAGE) if bytes.len() > 1 => {}
        found => return Err(FrameError::MissingEnd { found: found.copied() }),
    }

    if bytes.len() < FRAMING_OVERHEAD {
        return Err(FrameError::Truncated { len: bytes.len() });
    }

    let declared = declared_len(bytes);
    let available = bytes.len() - FRAMING_OVERHEAD;
    if declared != available {
        return Err(FrameError::LengthMismatch { declared, available });
    }

    let label = MessageLabel::from_u8(bytes[1]).ok_or(FrameError::UnknownLabel(bytes[1]))?;

    Ok(Message::new(label, &bytes[HEADER_LEN..HEADER_LEN + declared]))
}

/// Decode the first message at the start of `bytes`.
///
/// Returns the message and the number of bytes it consumed. A valid but
/// unfinished prefix yields [`FrameError::Incomplete`].
pub fn decode_prefix(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
    let Some(&first) = bytes.first() else {
        return Err(FrameError::Incomplete { needed: FRAMING_OVERHEAD });
    };
    if first != START_OF_MESSAGE {
        return Err(FrameError::MissingStart { found: Some(first) });
    }

    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Incomplete {
            needed: FRAMING_OVERHEAD - bytes.len(),
        });
    }

    let label = MessageLabel::from_u8(bytes[1]).ok_or(FrameError::UnknownLabel(bytes[1]))?;
    let declared = declared_len(bytes);
    let total = declared + FRAMING_OVERHEAD;

    if bytes.len() < total {
        return Err(FrameError::Incomplete {
            needed: total - bytes.len(),
        });
    }

    let end = bytes[total - 1];
    if end != END_OF_MESSAGE {
        return Err(FrameError::MissingEnd { found: Some(end) });
    }

    Ok((Message::new(label, &bytes[HEADER_LEN..HEADER_LEN + declared]), total))
}

/// Little-endian payload length from a header; caller guarantees 4 bytes
fn declared_len(bytes: &[u8]) -> usize {
    u16::from_le_bytes([bytes[2], bytes[3]]) as usize
}
