/*!
Byte-stream transports.

A [`Connector`] knows how to open a device; the [`Transport`] it returns is
owned by whoever drives output (the background loop or an unthreaded port)
and is closed by dropping it.
*/

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::error::{DmxError, Result};
use crate::message::{decode, Message};
use crate::params::Parameters;

/// An open byte-stream connection to a widget
pub trait Transport: Send {
    /// Write one complete encoded message
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Apply break / mark-after-break timing at the physical layer.
    ///
    /// Widgets that generate their own break from the set-parameters message
    /// need nothing here.
    fn apply_timing(&mut self, _params: &Parameters) -> io::Result<()> {
        Ok(())
    }

    /// Human readable name of the connection
    fn description(&self) -> String;
}

/// Opens transports for a port
pub trait Connector: Send + Sync {
    /// Whether enough is configured to attempt `open`
    fn is_ready(&self) -> bool {
        true
    }

    /// Open a new transport
    fn open(&self) -> Result<Box<dyn Transport>>;

    /// Human readable name of the device
    fn describe(&self) -> String;
}

/// Connector for a USB serial device node
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub path: String,
    pub baud_rate: u32,
    pub write_timeout: Duration,
    /// Assert the break from the host before every message
    pub hardware_break: bool,
}

impl SerialConnector {
    /// Baud rate used when none is configured; the Pro widget ignores it over USB
    pub const DEFAULT_BAUD_RATE: u32 = 57_600;

    /// Create a connector for the device at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: Self::DEFAULT_BAUD_RATE,
            write_timeout: Duration::from_secs(1),
            hardware_break: false,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_hardware_break(mut self, enabled: bool) -> Self {
        self.hardware_break = enabled;
        self
    }
}

impl Connector for SerialConnector {
    fn is_ready(&self) -> bool {
        !self.path.trim().is_empty()
    }

    fn open(&self) -> Result<Box<dyn Transport>> {
        if !self.is_ready() {
            return Err(DmxError::not_ready("no device path configured"));
        }

        debug!("Attempting to open port at {}", self.path);

        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.write_timeout)
            .open()
            .map_err(|e| DmxError::not_ready(format!("cannot open {}: {}", self.path, e)))?;

        // Empty the port if there's something in there already
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| DmxError::not_ready(format!("cannot flush {}: {}", self.path, e)))?;

        info!("🔌 Opened serial port {} at {} baud", self.path, self.baud_rate);

        Ok(Box::new(SerialTransport {
            port,
            path: self.path.clone(),
            hardware_break: self.hardware_break,
            timing: None,
        }))
    }

    fn describe(&self) -> String {
        format!("Enttec DMX USB Pro at {}", self.path)
    }
}

/// Open serial connection to a widget
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    path: String,
    hardware_break: bool,
    timing: Option<(Duration, Duration)>,
}

impl SerialTransport {
    fn send_break(&mut self, brk: Duration, mab: Duration) -> io::Result<()> {
        self.port.set_break()?;
        thread::sleep(brk);
        self.port.clear_break()?;
        thread::sleep(mab);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.hardware_break {
            if let Some((brk, mab)) = self.timing {
                self.send_break(brk, mab)?;
            }
        }

        self.port.write_all(frame)?;
        // Wait for the port to finish sending
        self.port.flush()
    }

    fn apply_timing(&mut self, params: &Parameters) -> io::Result<()> {
        self.timing = Some((params.break_duration(), params.mark_after_break_duration()));
        if self.hardware_break {
            debug!(
                "Host break timing on {}: break {:?}, MAB {:?}",
                self.path,
                params.break_duration(),
                params.mark_after_break_duration()
            );
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.path.clone()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("Closing serial port {}", self.path);
    }
}

/// State shared by a [`MemoryConnector`] and the transports it opens
#[derive(Debug)]
struct MemoryLog {
    frames: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    written: AtomicUsize,
    opened: AtomicUsize,
    live: AtomicUsize,
}

impl MemoryLog {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            written: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    fn record(&self, frame: &[u8]) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        while frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame.to_vec());
        self.written.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that records written messages in memory.
///
/// Only the most recent `capacity` messages are kept, so long dry runs stay
/// bounded. Used for dry runs without hardware and in tests.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    log: Arc<MemoryLog>,
    trace_frames: bool,
}

impl MemoryConnector {
    /// Messages kept by [`MemoryConnector::new`]
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a connector with an empty log
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a connector keeping at most `capacity` messages (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Arc::new(MemoryLog::new(capacity)),
            trace_frames: false,
        }
    }

    /// Emit every written message as hex at trace level
    pub fn with_frame_tracing(mut self, enabled: bool) -> Self {
        self.trace_frames = enabled;
        self
    }

    /// Retained messages, oldest first
    pub fn frames(&self) -> Vec<Vec<u8>> {
        let frames = self.log.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.iter().cloned().collect()
    }

    /// Number of messages written, including evicted ones
    pub fn total_frames(&self) -> usize {
        self.log.written.load(Ordering::SeqCst)
    }

    /// Written messages decoded; undecodable entries are skipped
    pub fn messages(&self) -> Vec<Message> {
        self.frames().iter().filter_map(|f| decode(f).ok()).collect()
    }

    /// Number of transports opened
    pub fn open_count(&self) -> usize {
        self.log.opened.load(Ordering::SeqCst)
    }

    /// Number of transports not yet dropped
    pub fn live_transports(&self) -> usize {
        self.log.live.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn open(&self) -> Result<Box<dyn Transport>> {
        let index = self.log.opened.fetch_add(1, Ordering::SeqCst);
        self.log.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryTransport {
            log: Arc::clone(&self.log),
            index,
            trace_frames: self.trace_frames,
        }))
    }

    fn describe(&self) -> String {
        "in-memory DMX port".to_string()
    }
}

/// Transport opened by a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryTransport {
    log: Arc<MemoryLog>,
    index: usize,
    trace_frames: bool,
}

impl Transport for MemoryTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.trace_frames {
            trace!("memory#{} <- {}", self.index, hex::encode(frame));
        }
        self.log.record(frame);
        Ok(())
    }

    fn description(&self) -> String {
        format!("memory#{}", self.index)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.log.live.fetch_sub(1, Ordering::SeqCst);
    }
}
