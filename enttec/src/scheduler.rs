/*!
Continuous DMX output.

The output loop runs on its own thread once a port starts. Each cycle it
sends pending parameters, copies the channel buffer, writes one DMX message
and then waits out the rest of the refresh period. Transport errors are
reported and the loop carries on with the next cycle.
*/

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channels::{ChannelBuffer, Snapshot};
use crate::error::Result;
use crate::message::{Message, MessageLabel};
use crate::params::{ParameterSet, Parameters};
use crate::protocol::MIN_DMX_SLOTS;
use crate::transport::Transport;

/// Options for the output loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputOptions {
    /// Pad DMX payloads shorter than 24 slots with zeros
    pub pad_short_frames: bool,
}

/// Events reported by the output loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// The device accepted new parameters
    ParametersSent(Parameters),
    /// A write failed; the loop keeps running
    WriteFailed { label: MessageLabel, error: String },
    /// Writes succeed again after `failed_writes` consecutive failures
    Recovered { failed_writes: u64 },
}

/// Transmission counters
#[derive(Debug, Default)]
pub struct OutputStats {
    frames_sent: AtomicU64,
    parameter_frames_sent: AtomicU64,
    write_errors: AtomicU64,
}

impl OutputStats {
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn parameter_frames_sent(&self) -> u64 {
        self.parameter_frames_sent.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/// State shared between a port and its output loop
#[derive(Debug, Default)]
pub struct OutputShared {
    pub channels: ChannelBuffer,
    pub params: ParameterSet,
    pub stats: OutputStats,
}

impl OutputShared {
    pub fn new(params: Parameters) -> Self {
        Self {
            channels: ChannelBuffer::new(),
            params: ParameterSet::new(params),
            stats: OutputStats::default(),
        }
    }
}

/// What a single cycle managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub parameters_sent: bool,
    pub frame_sent: bool,
    pub failures: usize,
    pub last_error: Option<String>,
}

/// One transmission cycle: pending parameters, then the current DMX frame
pub struct OutputCycle {
    options: OutputOptions,
    events: Option<Sender<OutputEvent>>,
    consecutive_failures: u64,
}

impl OutputCycle {
    pub fn new(options: OutputOptions, events: Option<Sender<OutputEvent>>) -> Self {
        Self {
            options,
            events,
            consecutive_failures: 0,
        }
    }

    /// Run one cycle against `transport`
    pub fn run(&mut self, shared: &OutputShared, transport: &mut dyn Transport) -> CycleReport {
        let mut report = CycleReport::default();

        // 1. Pending parameters go out ahead of the frame
        if let Some((params, generation)) = shared.params.pending() {
            match Self::send_parameters(&params, transport) {
                Ok(()) => {
                    shared.params.acknowledge(generation);
                    shared.stats.parameter_frames_sent.fetch_add(1, Ordering::Relaxed);
                    report.parameters_sent = true;
                    debug!("Sent parameters {:?}", params);
                    self.record_success();
                    self.emit(OutputEvent::ParametersSent(params));
                }
                Err(e) => {
                    report.failures += 1;
                    report.last_error = Some(e.to_string());
                    self.record_failure(shared, MessageLabel::SetParameters, &e);
                }
            }
        }

        // 2. Newest channel values, truncated to the register count
        let register_count = usize::from(shared.params.current().register_count);
        let snapshot = shared.channels.snapshot();
        let payload = self.dmx_payload(&snapshot, register_count);

        match write_message(transport, &Message::send_dmx(&payload)) {
            Ok(()) => {
                shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                report.frame_sent = true;
                self.record_success();
            }
            Err(e) => {
                report.failures += 1;
                report.last_error = Some(e.to_string());
                self.record_failure(shared, MessageLabel::OutputOnlySendDmx, &e);
            }
        }

        report
    }

    /// Number of failed writes since the last success
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    fn send_parameters(params: &Parameters, transport: &mut dyn Transport) -> io::Result<()> {
        let message = Message::new(MessageLabel::SetParameters, params.to_payload());
        write_message(transport, &message)?;
        transport.apply_timing(params)
    }

    fn dmx_payload(&self, snapshot: &Snapshot, register_count: usize) -> Vec<u8> {
        let mut payload = snapshot.frame(register_count).to_vec();
        if self.options.pad_short_frames && payload.len() < MIN_DMX_SLOTS + 1 {
            payload.resize(MIN_DMX_SLOTS + 1, 0);
        }
        payload
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!("✅ DMX output recovered after {} failed writes", self.consecutive_failures);
            let failed_writes = self.consecutive_failures;
            self.consecutive_failures = 0;
            self.emit(OutputEvent::Recovered { failed_writes });
        }
    }

    fn record_failure(&mut self, shared: &OutputShared, label: MessageLabel, e: &io::Error) {
        shared.stats.write_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures += 1;

        if self.consecutive_failures == 1 {
            warn!("⚠️ Failed to write {} message: {}", label.name(), e);
        } else {
            debug!(
                "Failed to write {} message ({} in a row): {}",
                label.name(),
                self.consecutive_failures,
                e
            );
        }

        self.emit(OutputEvent::WriteFailed {
            label,
            error: e.to_string(),
        });
    }

    fn emit(&self, event: OutputEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                trace!("Output event channel full or closed, dropping event");
            }
        }
    }
}

/// Encode and write one message
fn write_message(transport: &mut dyn Transport, message: &Message) -> io::Result<()> {
    let frame = message.encode().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    trace!("Writing {} message, {} bytes", message.label, message.encoded_len());
    transport.write_frame(&frame)
}

/// Handle to a running output loop
pub struct OutputScheduler {
    active: Arc<AtomicBool>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<Box<dyn Transport>>>,
}

impl OutputScheduler {
    /// Spawn the output loop; it owns `transport` until [`stop`](Self::stop)
    pub fn start(
        transport: Box<dyn Transport>,
        shared: Arc<OutputShared>,
        options: OutputOptions,
        events: Option<Sender<OutputEvent>>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let active = Arc::new(AtomicBool::new(true));
        let active_loop = Arc::clone(&active);
        let cycle = OutputCycle::new(options, events);

        let handle = thread::Builder::new()
            .name("dmx-output".to_string())
            .spawn(move || output_loop(transport, shared, cycle, shutdown_rx, active_loop))?;

        Ok(Self {
            active,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Whether the loop is still transmitting
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Returns the transport released by the loop, or `None` if the loop was
    /// already stopped or its thread panicked.
    pub fn stop(&mut self) -> Option<Box<dyn Transport>> {
        // Disconnecting the channel wakes the loop out of its pacing wait
        drop(self.shutdown.take());

        let handle = self.handle.take()?;
        match handle.join() {
            Ok(transport) => Some(transport),
            Err(_) => {
                error!("DMX output thread panicked");
                self.active.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            drop(self.stop());
        }
    }
}

/// Body of the output thread
fn output_loop(
    mut transport: Box<dyn Transport>,
    shared: Arc<OutputShared>,
    mut cycle: OutputCycle,
    shutdown: Receiver<()>,
    active: Arc<AtomicBool>,
) -> Box<dyn Transport> {
    info!("🚀 DMX output loop started on {}", transport.description());

    let start_time = Instant::now();
    let mut cycles = 0u64;

    loop {
        let cycle_start = Instant::now();
        cycle.run(&shared, transport.as_mut());
        cycles += 1;

        // Best effort pacing: a slow write shortens the wait, never below zero
        let period = shared.params.current().frame_period();
        let wait = period.saturating_sub(cycle_start.elapsed());

        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    active.store(false, Ordering::SeqCst);

    let elapsed = start_time.elapsed();
    info!("📈 DMX output loop final stats:");
    info!("   Cycles: {}", cycles);
    info!("   DMX frames: {}", shared.stats.frames_sent());
    info!("   Parameter frames: {}", shared.stats.parameter_frames_sent());
    info!("   Write errors: {}", shared.stats.write_errors());
    info!("   Duration: {:.1}s", elapsed.as_secs_f64());

    transport
}
