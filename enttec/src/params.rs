/*!
Widget output parameters.

Break and mark-after-break time are in units of 10.67 µs. The refresh rate is
the number of DMX packets the widget should emit per second, and the register
count (sent as the widget's user size) limits how many channels go out in
each packet.
*/

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{DmxError, Result};
use crate::message::{encode, FrameError, MessageLabel};
use crate::protocol::{DMX_CHANNELS, SET_PARAMS_LEN, TIMING_UNIT_NANOS};

/// Individually validated parameter fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterField {
    BreakTime,
    MarkAfterBreak,
    RefreshRate,
    RegisterCount,
}

impl ParameterField {
    /// Documented device range for this field
    pub fn range(self) -> RangeInclusive<u32> {
        match self {
            Self::BreakTime => 9..=127,
            Self::MarkAfterBreak => 1..=127,
            Self::RefreshRate => 1..=40,
            Self::RegisterCount => 1..=DMX_CHANNELS as u32,
        }
    }

    /// Check a value against the range, rejecting rather than clamping
    pub fn validate(self, value: u32) -> Result<()> {
        let range = self.range();
        if range.contains(&value) {
            Ok(())
        } else {
            Err(DmxError::OutOfRangeParameter {
                field: self,
                value,
                min: *range.start(),
                max: *range.end(),
            })
        }
    }
}

impl fmt::Display for ParameterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BreakTime => "break time",
            Self::MarkAfterBreak => "mark-after-break time",
            Self::RefreshRate => "refresh rate",
            Self::RegisterCount => "register count",
        };
        f.write_str(name)
    }
}

/// Validated widget parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Break time in 10.67 µs units (9-127)
    pub break_time: u8,
    /// Mark-after-break time in 10.67 µs units (1-127)
    pub mark_after_break: u8,
    /// Packets per second (1-40)
    pub refresh_rate: u8,
    /// Channels transmitted per packet (1-512)
    pub register_count: u16,
}

impl Parameters {
    /// Build and validate a parameter set
    pub fn new(
        break_time: u8,
        mark_after_break: u8,
        refresh_rate: u8,
        register_count: u16,
    ) -> Result<Self> {
        let params = Self {
            break_time,
            mark_after_break,
            refresh_rate,
            register_count,
        };
        params.validate()?;
        Ok(params)
    }

    /// Validate every field
    pub fn validate(&self) -> Result<()> {
        ParameterField::BreakTime.validate(self.break_time.into())?;
        ParameterField::MarkAfterBreak.validate(self.mark_after_break.into())?;
        ParameterField::RefreshRate.validate(self.refresh_rate.into())?;
        ParameterField::RegisterCount.validate(self.register_count.into())?;
        Ok(())
    }

    /// Serialize as userSizeLSB, userSizeMSB, breakTime, markAfterBreak, refreshRate
    pub fn to_payload(&self) -> [u8; SET_PARAMS_LEN] {
        let [size_lsb, size_msb] = self.register_count.to_le_bytes();
        [size_lsb, size_msb, self.break_time, self.mark_after_break, self.refresh_rate]
    }

    /// Parse and validate a set-parameters payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() != SET_PARAMS_LEN {
            return Err(FrameError::LengthMismatch {
                declared: SET_PARAMS_LEN,
                available: payload.len(),
            }
            .into());
        }

        Self::new(
            payload[2],
            payload[3],
            payload[4],
            u16::from_le_bytes([payload[0], payload[1]]),
        )
    }

    /// Encoded set-parameters message
    pub fn to_frame(&self) -> Result<Bytes> {
        Ok(encode(MessageLabel::SetParameters, &self.to_payload())?)
    }

    /// Physical break duration
    pub fn break_duration(&self) -> Duration {
        Duration::from_nanos(u64::from(self.break_time) * TIMING_UNIT_NANOS)
    }

    /// Physical mark-after-break duration
    pub fn mark_after_break_duration(&self) -> Duration {
        Duration::from_nanos(u64::from(self.mark_after_break) * TIMING_UNIT_NANOS)
    }

    /// Time between two DMX packets at the configured refresh rate
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / u32::from(self.refresh_rate.max(1))
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            break_time: 9,
            mark_after_break: 1,
            refresh_rate: 40,
            register_count: DMX_CHANNELS as u16,
        }
    }
}

/// Parameters reported by the widget in reply to a get-parameters request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetParameters {
    pub firmware_version: u16,
    pub break_time: u8,
    pub mark_after_break: u8,
    pub refresh_rate: u8,
    pub user_config: Vec<u8>,
}

impl WidgetParameters {
    /// Parse a get-parameters reply payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < SET_PARAMS_LEN {
            return Err(FrameError::Truncated { len: payload.len() }.into());
        }

        Ok(Self {
            firmware_version: u16::from_le_bytes([payload[0], payload[1]]),
            break_time: payload[2],
            mark_after_break: payload[3],
            refresh_rate: payload[4],
            user_config: payload[SET_PARAMS_LEN..].to_vec(),
        })
    }
}

/// Current parameters and the generation counters used for dirty tracking
#[derive(Debug)]
struct ParamState {
    current: Parameters,
    generation: u64,
    acknowledged: u64,
}

/// Parameters shared between a port and its output loop.
///
/// Every accepted change bumps a generation counter. The output loop takes
/// the pending parameters together with their generation and acknowledges
/// that generation once the device has them, so a change that races with a
/// transmission stays dirty and is sent on the next cycle.
#[derive(Debug)]
pub struct ParameterSet {
    state: Mutex<ParamState>,
}

impl ParameterSet {
    /// Create a set holding `params`; new sets start dirty
    pub fn new(params: Parameters) -> Self {
        Self {
            state: Mutex::new(ParamState {
                current: params,
                generation: 1,
                acknowledged: 0,
            }),
        }
    }

    /// Current parameters
    pub fn current(&self) -> Parameters {
        self.lock().current
    }

    /// Validate and store all four fields
    pub fn set(
        &self,
        break_time: u8,
        mark_after_break: u8,
        refresh_rate: u8,
        register_count: u16,
    ) -> Result<()> {
        let params = Parameters::new(break_time, mark_after_break, refresh_rate, register_count)?;
        self.store(params);
        Ok(())
    }

    /// Validate and store a complete parameter set
    pub fn replace(&self, params: Parameters) -> Result<()> {
        params.validate()?;
        self.store(params);
        Ok(())
    }

    /// Set break time in 10.67 µs units (9-127)
    pub fn set_break_time(&self, time: u8) -> Result<()> {
        ParameterField::BreakTime.validate(time.into())?;
        self.modify(|p| p.break_time = time);
        Ok(())
    }

    /// Set mark-after-break time in 10.67 µs units (1-127)
    pub fn set_mark_after_break(&self, time: u8) -> Result<()> {
        ParameterField::MarkAfterBreak.validate(time.into())?;
        self.modify(|p| p.mark_after_break = time);
        Ok(())
    }

    /// Set refresh rate in packets per second (1-40)
    pub fn set_refresh_rate(&self, rate: u8) -> Result<()> {
        ParameterField::RefreshRate.validate(rate.into())?;
        self.modify(|p| p.refresh_rate = rate);
        Ok(())
    }

    /// Set the number of transmitted channels (1-512)
    pub fn set_register_count(&self, count: u16) -> Result<()> {
        ParameterField::RegisterCount.validate(count.into())?;
        self.modify(|p| p.register_count = count);
        Ok(())
    }

    /// Force the current parameters to be sent again
    pub fn mark_dirty(&self) {
        self.lock().generation += 1;
    }

    /// Whether the device may hold stale parameters
    pub fn is_dirty(&self) -> bool {
        let state = self.lock();
        state.generation != state.acknowledged
    }

    /// Parameters still to be sent, with the generation to acknowledge
    pub fn pending(&self) -> Option<(Parameters, u64)> {
        let state = self.lock();
        (state.generation != state.acknowledged).then_some((state.current, state.generation))
    }

    /// Record that `generation` reached the device
    pub fn acknowledge(&self, generation: u64) {
        let mut state = self.lock();
        if generation > state.acknowledged {
            state.acknowledged = generation;
        }
        if state.generation != state.acknowledged {
            debug!("Parameters changed during transmission, still dirty");
        }
    }

    /// Encoded set-parameters message for the current parameters
    pub fn to_frame(&self) -> Result<Bytes> {
        self.current().to_frame()
    }

    fn store(&self, params: Parameters) {
        let mut state = self.lock();
        state.current = params;
        state.generation += 1;
    }

    fn modify(&self, apply: impl FnOnce(&mut Parameters)) {
        let mut state = self.lock();
        apply(&mut state.current);
        state.generation += 1;
    }

    fn lock(&self) -> MutexGuard<'_, ParamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::new(Parameters::default())
    }
}
