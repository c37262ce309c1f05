/*!
Port capabilities and controllers.

[`DmxOutputPort`] is the surface a lighting console talks to. Operations that
do not apply to a given port type fall back to the trait's no-op defaults.
[`EnttecProPort`] keeps a background output loop running while started;
[`UnthreadedEnttecProPort`] transmits only when asked through
[`SendOnDemand`].
*/

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channels::{format_channels, Snapshot};
use crate::error::{DmxError, Result};
use crate::params::Parameters;
use crate::protocol::DMX_CHANNELS;
use crate::scheduler::{OutputCycle, OutputEvent, OutputOptions, OutputScheduler, OutputShared};
use crate::transport::{Connector, SerialConnector, Transport};

/// Capacity of the output event channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Point-in-time summary of a port for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatus {
    pub device: String,
    pub state: PortState,
    pub parameters: Parameters,
    pub parameters_dirty: bool,
    pub buffer_version: u64,
    pub frames_sent: u64,
    pub parameter_frames_sent: u64,
    pub write_errors: u64,
}

/// Operations a lighting console can perform on a DMX output port
pub trait DmxOutputPort: Send {
    /// Write channel values starting at channel 1; each must be 0-255
    fn render_frame(&self, channels: &[i32]) -> Result<()>;

    /// Set a single 1-based channel
    fn set_channel(&self, channel: usize, value: u8) -> Result<()>;

    /// Set a single 1-based channel from a 0.0-1.0 level
    fn set_channel_level(&self, channel: usize, level: f32) -> Result<()>;

    /// Current output parameters
    fn parameters(&self) -> Parameters;

    /// Validate and apply new output parameters
    fn set_parameters(&self, params: Parameters) -> Result<()>;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn is_started(&self) -> bool {
        false
    }

    fn is_ready_to_start(&self) -> bool {
        false
    }

    /// Human readable state for diagnostics
    fn state_description(&self) -> String;
}

/// Ports that can transmit the current buffer on request
pub trait SendOnDemand {
    fn send(&mut self) -> Result<()>;
}

/// Channel buffer, parameters and connector shared by both port variants
struct PortCore {
    connector: Box<dyn Connector>,
    shared: Arc<OutputShared>,
    options: OutputOptions,
    events_tx: Sender<OutputEvent>,
    events_rx: Receiver<OutputEvent>,
}

impl PortCore {
    fn new(connector: Box<dyn Connector>, params: Parameters, options: OutputOptions) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        Self {
            connector,
            shared: Arc::new(OutputShared::new(params)),
            options,
            events_tx,
            events_rx,
        }
    }

    fn render_frame(&self, channels: &[i32]) -> Result<()> {
        if channels.len() > DMX_CHANNELS {
            return Err(DmxError::ChannelOverflow {
                first: 1,
                count: channels.len(),
                max: DMX_CHANNELS,
            });
        }

        let mut values = [0u8; DMX_CHANNELS];
        for (i, (&value, slot)) in channels.iter().zip(values.iter_mut()).enumerate() {
            *slot = u8::try_from(value).map_err(|_| DmxError::InvalidChannelValue {
                channel: i + 1,
                value: value.into(),
            })?;
        }

        self.shared.channels.update(&values[..channels.len()])?;
        Ok(())
    }

    fn render_bytes(&self, channels: &[u8]) -> Result<()> {
        self.shared.channels.update(channels)?;
        Ok(())
    }

    fn set_channel(&self, channel: usize, value: u8) -> Result<()> {
        self.shared.channels.update_at(channel, &[value])?;
        Ok(())
    }

    fn set_channel_level(&self, channel: usize, level: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(DmxError::InvalidChannelLevel { channel, level });
        }
        self.set_channel(channel, (level * 255.0).round() as u8)
    }

    /// Open a transport, reporting every failure as `NotReady`
    fn open_transport(&self) -> Result<Box<dyn Transport>> {
        if !self.connector.is_ready() {
            let device = self.connector.describe();
            return Err(DmxError::not_ready(format!("{} is not configured", device)));
        }

        debug!("Opening {}", self.connector.describe());
        let transport = self.connector.open().map_err(|e| match e {
            DmxError::NotReady(_) => e,
            other => DmxError::not_ready(format!("{}: {}", self.connector.describe(), other)),
        })?;

        // A freshly opened device has not seen our parameters
        self.shared.params.mark_dirty();
        Ok(transport)
    }

    fn status(&self, state: PortState) -> PortStatus {
        let stats = &self.shared.stats;
        PortStatus {
            device: self.connector.describe(),
            state,
            parameters: self.shared.params.current(),
            parameters_dirty: self.shared.params.is_dirty(),
            buffer_version: self.shared.channels.version(),
            frames_sent: stats.frames_sent(),
            parameter_frames_sent: stats.parameter_frames_sent(),
            write_errors: stats.write_errors(),
        }
    }

    fn describe(&self, state: PortState) -> String {
        let status = self.status(state);
        let params = status.parameters;
        format!(
            "{}: {}, {} channels @ {} Hz, break {}, MAB {}{}, {} frames sent, {} write errors",
            status.device,
            status.state,
            params.register_count,
            params.refresh_rate,
            params.break_time,
            params.mark_after_break,
            if status.parameters_dirty { " (parameters pending)" } else { "" },
            status.frames_sent,
            status.write_errors,
        )
    }

    fn channel_dump(&self) -> String {
        let snapshot = self.shared.channels.snapshot();
        let count = usize::from(self.shared.params.current().register_count);
        format_channels(&snapshot.channels()[..count])
    }
}

/// Generates the accessors both port variants share
macro_rules! port_accessors {
    () => {
        /// Write raw byte values starting at channel 1
        pub fn render_bytes(&self, channels: &[u8]) -> Result<()> {
            self.core.render_bytes(channels)
        }

        /// Copy of the current channel buffer
        pub fn snapshot(&self) -> Snapshot {
            self.core.shared.channels.snapshot()
        }

        /// Set every channel to zero
        pub fn blackout(&self) {
            self.core.shared.channels.blackout();
        }

        /// Set break time in 10.67 µs units (9-127)
        pub fn set_break_time(&self, time: u8) -> Result<()> {
            self.core.shared.params.set_break_time(time)
        }

        /// Set mark-after-break time in 10.67 µs units (1-127)
        pub fn set_mark_after_break(&self, time: u8) -> Result<()> {
            self.core.shared.params.set_mark_after_break(time)
        }

        /// Set refresh rate in packets per second (1-40)
        pub fn set_refresh_rate(&self, rate: u8) -> Result<()> {
            self.core.shared.params.set_refresh_rate(rate)
        }

        /// Set the number of transmitted channels (1-512)
        pub fn set_register_count(&self, count: u16) -> Result<()> {
            self.core.shared.params.set_register_count(count)
        }

        /// Receiver for output loop events
        pub fn events(&self) -> Receiver<OutputEvent> {
            self.core.events_rx.clone()
        }

        /// Transmitted channels as hex rows
        pub fn channel_dump(&self) -> String {
            self.core.channel_dump()
        }

        /// Current state and counters
        pub fn status(&self) -> PortStatus {
            self.core.status(self.state())
        }
    };
}

/// Enttec DMX USB Pro port with a background output loop
pub struct EnttecProPort {
    core: PortCore,
    state: PortState,
    scheduler: Option<OutputScheduler>,
}

impl EnttecProPort {
    /// Create a stopped port with default parameters
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_options(connector, Parameters::default(), OutputOptions::default())
    }

    /// Create a stopped port for the serial device at `path`
    pub fn serial(path: impl Into<String>) -> Self {
        Self::new(SerialConnector::new(path))
    }

    pub fn with_options(
        connector: impl Connector + 'static,
        params: Parameters,
        options: OutputOptions,
    ) -> Self {
        Self {
            core: PortCore::new(Box::new(connector), params, options),
            state: PortState::Stopped,
            scheduler: None,
        }
    }

    /// Current state; a loop that died on its own reports `Stopped`
    pub fn state(&self) -> PortState {
        match (&self.state, &self.scheduler) {
            (PortState::Running, Some(scheduler)) if !scheduler.is_active() => PortState::Stopped,
            (state, _) => *state,
        }
    }

    port_accessors!();
}

impl DmxOutputPort for EnttecProPort {
    fn render_frame(&self, channels: &[i32]) -> Result<()> {
        self.core.render_frame(channels)
    }

    fn set_channel(&self, channel: usize, value: u8) -> Result<()> {
        self.core.set_channel(channel, value)
    }

    fn set_channel_level(&self, channel: usize, level: f32) -> Result<()> {
        self.core.set_channel_level(channel, level)
    }

    fn parameters(&self) -> Parameters {
        self.core.shared.params.current()
    }

    fn set_parameters(&self, params: Parameters) -> Result<()> {
        self.core.shared.params.replace(params)
    }

    fn start(&mut self) -> Result<()> {
        if self.scheduler.is_some() {
            debug!("{} is already open, restarting", self.core.connector.describe());
            self.stop();
        }

        self.state = PortState::Starting;

        let transport = match self.core.open_transport() {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to start {}: {}", self.core.connector.describe(), e);
                self.state = PortState::Stopped;
                return Err(e);
            }
        };

        let scheduler = OutputScheduler::start(
            transport,
            Arc::clone(&self.core.shared),
            self.core.options,
            Some(self.core.events_tx.clone()),
        );

        match scheduler {
            Ok(scheduler) => {
                self.scheduler = Some(scheduler);
                self.state = PortState::Running;
                info!("✅ {} is running", self.core.connector.describe());
                Ok(())
            }
            Err(e) => {
                self.state = PortState::Stopped;
                Err(DmxError::not_ready(format!("cannot spawn output loop: {}", e)))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            debug!("Stopping {}", self.core.connector.describe());
            // Joins the loop; dropping the returned transport closes the device
            drop(scheduler.stop());
            info!("🛑 {} stopped", self.core.connector.describe());
        }
        self.state = PortState::Stopped;
    }

    fn is_started(&self) -> bool {
        self.state() == PortState::Running
    }

    fn is_ready_to_start(&self) -> bool {
        self.core.connector.is_ready()
    }

    fn state_description(&self) -> String {
        self.core.describe(self.state())
    }
}

impl Drop for EnttecProPort {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            self.stop();
        }
    }
}

/// Enttec DMX USB Pro port that transmits only when [`SendOnDemand::send`] is called
pub struct UnthreadedEnttecProPort {
    core: PortCore,
    transport: Option<Box<dyn Transport>>,
    cycle: OutputCycle,
}

impl UnthreadedEnttecProPort {
    /// Create a stopped port with default parameters
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_options(connector, Parameters::default(), OutputOptions::default())
    }

    /// Create a stopped port for the serial device at `path`
    pub fn serial(path: impl Into<String>) -> Self {
        Self::new(SerialConnector::new(path))
    }

    pub fn with_options(
        connector: impl Connector + 'static,
        params: Parameters,
        options: OutputOptions,
    ) -> Self {
        let core = PortCore::new(Box::new(connector), params, options);
        let cycle = OutputCycle::new(options, Some(core.events_tx.clone()));
        Self {
            core,
            transport: None,
            cycle,
        }
    }

    pub fn state(&self) -> PortState {
        if self.transport.is_some() {
            PortState::Running
        } else {
            PortState::Stopped
        }
    }

    port_accessors!();
}

impl DmxOutputPort for UnthreadedEnttecProPort {
    fn render_frame(&self, channels: &[i32]) -> Result<()> {
        self.core.render_frame(channels)
    }

    fn set_channel(&self, channel: usize, value: u8) -> Result<()> {
        self.core.set_channel(channel, value)
    }

    fn set_channel_level(&self, channel: usize, level: f32) -> Result<()> {
        self.core.set_channel_level(channel, level)
    }

    fn parameters(&self) -> Parameters {
        self.core.shared.params.current()
    }

    fn set_parameters(&self, params: Parameters) -> Result<()> {
        self.core.shared.params.replace(params)
    }

    fn start(&mut self) -> Result<()> {
        if self.transport.is_some() {
            debug!("{} is already open, restarting", self.core.connector.describe());
            self.stop();
        }

        self.transport = Some(self.core.open_transport()?);
        info!("✅ {} is open for on-demand output", self.core.connector.describe());
        Ok(())
    }

    fn stop(&mut self) {
        if self.transport.take().is_some() {
            info!("🛑 {} closed", self.core.connector.describe());
        }
    }

    fn is_started(&self) -> bool {
        self.transport.is_some()
    }

    fn is_ready_to_start(&self) -> bool {
        self.core.connector.is_ready()
    }

    fn state_description(&self) -> String {
        self.core.describe(self.state())
    }
}

impl SendOnDemand for UnthreadedEnttecProPort {
    /// Send pending parameters and the current frame on the calling thread
    fn send(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            let device = self.core.connector.describe();
            return Err(DmxError::not_ready(format!("{} is not started", device)));
        };

        let report = self.cycle.run(&self.core.shared, transport.as_mut());
        match report.last_error {
            Some(error) if !report.frame_sent => Err(DmxError::Transport(io::Error::other(error))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageLabel;
    use crate::transport::MemoryConnector;

    #[test]
    fn test_render_frame_validates_values() {
        let port = EnttecProPort::new(MemoryConnector::new());

        port.render_frame(&[0, 128, 255]).unwrap();
        assert_eq!(&port.snapshot().data[1..4], &[0, 128, 255]);

        assert!(matches!(
            port.render_frame(&[1, 2, 256]),
            Err(DmxError::InvalidChannelValue { channel: 3, value: 256 })
        ));
        assert!(matches!(
            port.render_frame(&[-1]),
            Err(DmxError::InvalidChannelValue { channel: 1, value: -1 })
        ));
        // Rejected renders leave the buffer untouched
        assert_eq!(&port.snapshot().data[1..4], &[0, 128, 255]);

        assert!(matches!(port.render_frame(&[0; 513]), Err(DmxError::ChannelOverflow { .. })));
    }

    #[test]
    fn test_single_channel_writes() {
        let port = EnttecProPort::new(MemoryConnector::new());

        port.set_channel(5, 99).unwrap();
        port.set_channel_level(6, 1.0).unwrap();
        port.set_channel_level(7, 0.5).unwrap();

        let snapshot = port.snapshot();
        assert_eq!(snapshot.channel(5), Some(99));
        assert_eq!(snapshot.channel(6), Some(255));
        assert_eq!(snapshot.channel(7), Some(128));

        assert!(matches!(port.set_channel(0, 1), Err(DmxError::NoSuchChannel(0))));
        assert!(matches!(
            port.set_channel_level(1, 1.5),
            Err(DmxError::InvalidChannelLevel { .. })
        ));
        assert!(matches!(
            port.set_channel_level(1, f32::NAN),
            Err(DmxError::InvalidChannelLevel { .. })
        ));
    }

    #[test]
    fn test_start_without_device_path_is_not_ready() {
        let mut port = EnttecProPort::serial("");

        assert!(!port.is_ready_to_start());
        assert!(matches!(port.start(), Err(DmxError::NotReady(_))));
        assert_eq!(port.state(), PortState::Stopped);
        assert!(!port.is_started());
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let connector = MemoryConnector::new();
        let mut port = EnttecProPort::new(connector.clone());
        assert!(port.is_ready_to_start());

        port.start().unwrap();
        assert!(port.is_started());
        assert_eq!(connector.live_transports(), 1);

        // Starting again restarts on a fresh transport
        port.start().unwrap();
        assert!(port.is_started());
        assert_eq!(connector.open_count(), 2);
        assert_eq!(connector.live_transports(), 1);

        port.stop();
        assert!(!port.is_started());
        assert_eq!(connector.live_transports(), 0);
        assert!(port.state_description().contains("stopped"));
    }

    #[test]
    fn test_drop_stops_port() {
        let connector = MemoryConnector::new();
        {
            let mut port = EnttecProPort::new(connector.clone());
            port.start().unwrap();
        }
        assert_eq!(connector.live_transports(), 0);
    }

    #[test]
    fn test_state_description() {
        let port = EnttecProPort::with_options(
            MemoryConnector::new(),
            Parameters::new(24, 4, 30, 64).unwrap(),
            OutputOptions::default(),
        );
        let description = port.state_description();

        assert!(description.starts_with("in-memory DMX port: stopped"));
        assert!(description.contains("64 channels @ 30 Hz"));
        assert!(description.contains("break 24, MAB 4"));
        assert!(description.contains("parameters pending"));
    }

    #[test]
    fn test_channel_dump_uses_register_count() {
        let port = EnttecProPort::new(MemoryConnector::new());
        port.set_register_count(20).unwrap();
        port.render_bytes(&[0xFF; 20]).unwrap();

        let dump = port.channel_dump();
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.ends_with("017: ffffffff"));
    }

    #[test]
    fn test_unthreaded_send_on_demand() {
        let connector = MemoryConnector::new();
        let mut port = UnthreadedEnttecProPort::new(connector.clone());
        port.set_register_count(4).unwrap();
        port.render_frame(&[10, 20, 30, 40]).unwrap();

        assert!(matches!(port.send(), Err(DmxError::NotReady(_))));

        port.start().unwrap();
        port.send().unwrap();
        port.send().unwrap();

        let messages = connector.messages();
        let labels: Vec<MessageLabel> = messages.iter().map(|m| m.label).collect();
        assert_eq!(
            labels,
            vec![
                MessageLabel::SetParameters,
                MessageLabel::OutputOnlySendDmx,
                MessageLabel::OutputOnlySendDmx,
            ]
        );
        assert_eq!(messages[1].payload, vec![0, 10, 20, 30, 40]);

        port.stop();
        assert!(!port.is_started());
        assert_eq!(connector.live_transports(), 0);
    }

    /// Minimal port relying on the trait defaults
    struct NullPort;

    impl DmxOutputPort for NullPort {
        fn render_frame(&self, _channels: &[i32]) -> Result<()> {
            Ok(())
        }

        fn set_channel(&self, _channel: usize, _value: u8) -> Result<()> {
            Ok(())
        }

        fn set_channel_level(&self, _channel: usize, _level: f32) -> Result<()> {
            Ok(())
        }

        fn parameters(&self) -> Parameters {
            Parameters::default()
        }

        fn set_parameters(&self, _params: Parameters) -> Result<()> {
            Ok(())
        }

        fn state_description(&self) -> String {
            "null port".to_string()
        }
    }

    #[test]
    fn test_default_operations_are_no_ops() {
        let mut port = NullPort;

        port.start().unwrap();
        assert!(!port.is_started());
        assert!(!port.is_ready_to_start());
        port.stop();
    }
}
