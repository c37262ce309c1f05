/*!
# DMX Output Application

Drives DMX512 fixtures through an Enttec DMX USB Pro widget from the command
line, and offers small diagnostics for the widget's serial protocol.

## Features

- Continuous output at the configured refresh rate (threaded) or one frame
  per tick (unthreaded)
- Test patterns: same, rising, rainbow, strobe
- Dry runs against an in-memory port, no hardware needed
- Frame encoding and stream decoding for protocol debugging

## Usage

### Run a pattern
```bash
dmxout run --device /dev/ttyUSB0 --pattern rainbow --amplitude 200 --step 80
```

### Dry run with frame tracing
```bash
RUST_LOG=enttec=trace dmxout run --dry-run --frames 10
```

### Encode / decode frames
```bash
dmxout encode 255 128 0
dmxout decode "7e 06 04 00 00 ff 80 00 e7"
```
*/

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use enttec::message::encode;
use enttec::protocol::DMX_START_CODE;
use enttec::{
    DmxOutputPort, EnttecProPort, MemoryConnector, MessageLabel, OutputEvent, PortStatus,
    SendOnDemand, StreamDecoder, UnthreadedEnttecProPort, WidgetParameters,
};

mod config;
mod patterns;

use config::AppConfig;
use patterns::Pattern;

#[derive(Parser)]
#[command(name = "dmxout")]
#[command(about = "DMX512 output through an Enttec DMX USB Pro")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "dmxout.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Output a test pattern
    Run(RunArgs),

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dmxout.toml")]
        output: PathBuf,
    },

    /// Print the wire bytes of a DMX frame for the given channel values
    Encode {
        /// Channel values starting at channel 1
        #[arg(required = true)]
        channels: Vec<u8>,

        /// Also print the set-parameters message for this refresh rate
        #[arg(long)]
        refresh_rate: Option<u8>,
    },

    /// Decode a hex byte stream into widget messages
    Decode {
        /// Hex bytes; whitespace is ignored
        hex: String,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Serial device, overrides the config file
    #[arg(short, long)]
    device: Option<String>,

    /// Pattern to output
    #[arg(short, long, value_enum, default_value_t = Pattern::Same)]
    pattern: Pattern,

    /// Peak channel value
    #[arg(short, long, default_value_t = 255)]
    amplitude: u8,

    /// Ticks per cycle (rainbow) or value increment per tick (rising)
    #[arg(short, long, default_value_t = 40)]
    step: u32,

    /// Number of pattern ticks; runs until Ctrl+C when omitted
    #[arg(short, long)]
    frames: Option<u64>,

    /// Delay between pattern ticks in milliseconds
    #[arg(short, long, default_value_t = 25)]
    interval_ms: u64,

    /// Refresh rate in frames per second, overrides the config file
    #[arg(long)]
    refresh_rate: Option<u8>,

    /// Channels per frame, overrides the config file
    #[arg(long)]
    register_count: Option<u16>,

    /// Send one frame per tick from this thread instead of a background loop
    #[arg(long)]
    unthreaded: bool,

    /// Write to an in-memory port instead of the device
    #[arg(long)]
    dry_run: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            device: None,
            pattern: Pattern::Same,
            amplitude: 255,
            step: 40,
            frames: None,
            interval_ms: 25,
            refresh_rate: None,
            register_count: None,
            unthreaded: false,
            dry_run: false,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only command output
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Some(Commands::Run(args)) => run_output(&cli.config, args),
        Some(Commands::Config { output }) => generate_config_file(output),
        Some(Commands::Encode { channels, refresh_rate }) => encode_frame(&channels, refresh_rate),
        Some(Commands::Decode { hex }) => decode_stream(&hex),
        None => run_output(&cli.config, RunArgs::default()),
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        info!("📄 Loading configuration from {}", path.display());
        AppConfig::load_from_file(path)
    } else {
        info!("📄 No configuration at {}, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

/// Run a pattern on the configured port until done or interrupted
fn run_output(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(device) = &args.device {
        config.port.device_path = device.clone();
    }
    if let Some(rate) = args.refresh_rate {
        config.output.refresh_rate = rate;
    }
    if let Some(count) = args.register_count {
        config.output.register_count = count;
    }
    if args.unthreaded {
        config.output.threaded = false;
    }

    let params = config.parameters()?;
    let options = config.output_options();

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("🛑 Received Ctrl+C, shutting down gracefully...");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    let memory = MemoryConnector::new().with_frame_tracing(true);

    let status = if config.output.threaded {
        let mut port = if args.dry_run {
            EnttecProPort::with_options(memory.clone(), params, options)
        } else {
            EnttecProPort::with_options(config.connector(), params, options)
        };
        let events = port.events();

        play(&mut port, &args, &running, &events, |_| Ok(()))?;

        // Let the loop carry the blackout frame before stopping
        thread::sleep(port.parameters().frame_period() * 2);
        port.stop();
        log_events(&events);
        port.status()
    } else {
        let mut port = if args.dry_run {
            UnthreadedEnttecProPort::with_options(memory.clone(), params, options)
        } else {
            UnthreadedEnttecProPort::with_options(config.connector(), params, options)
        };
        let events = port.events();

        play(&mut port, &args, &running, &events, |port| port.send())?;

        port.stop();
        port.status()
    };

    log_status(&status);
    if args.dry_run {
        info!("🧪 Dry run wrote {} messages", memory.total_frames());
    }

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Render pattern ticks into `port`, then a blackout frame.
///
/// `send` runs after every render; unthreaded ports transmit there.
fn play<P, F>(
    port: &mut P,
    args: &RunArgs,
    running: &AtomicBool,
    events: &Receiver<OutputEvent>,
    mut send: F,
) -> Result<()>
where
    P: DmxOutputPort,
    F: FnMut(&mut P) -> enttec::Result<()>,
{
    if !port.is_ready_to_start() {
        bail!("Port is not ready: {}", port.state_description());
    }

    port.start().context("Failed to start DMX output")?;
    info!("🚀 Started {}", port.state_description());
    info!(
        "📈 Pattern {:?}, amplitude {}, step {}, interval {} ms",
        args.pattern, args.amplitude, args.step, args.interval_ms
    );

    let count = usize::from(port.parameters().register_count);
    let interval = Duration::from_millis(args.interval_ms);
    let mut tick = 0u64;

    while running.load(Ordering::SeqCst) && args.frames.map_or(true, |frames| tick < frames) {
        let values: Vec<i32> = args
            .pattern
            .render(tick, args.amplitude, args.step, count)
            .into_iter()
            .map(i32::from)
            .collect();
        if let Err(e) = port.render_frame(&values) {
            if e.is_validation() {
                bail!("Pattern {:?} produced unusable channel values: {}", args.pattern, e);
            }
            return Err(e.into());
        }

        if let Err(e) = send(port) {
            warn!("Frame {} not sent: {}", tick, e);
        }
        log_events(events);

        tick += 1;
        thread::sleep(interval);
    }

    // Leave the fixtures dark
    port.render_frame(&vec![0; count])?;
    if let Err(e) = send(port) {
        warn!("Blackout frame not sent: {}", e);
    }

    info!("✅ Pattern finished after {} ticks", tick);
    Ok(())
}

/// Drain pending loop events into the log
fn log_events(events: &Receiver<OutputEvent>) {
    for event in events.try_iter() {
        match event {
            OutputEvent::ParametersSent(params) => {
                info!(
                    "Widget parameters applied: break {}, MAB {}, {} Hz, {} channels",
                    params.break_time,
                    params.mark_after_break,
                    params.refresh_rate,
                    params.register_count
                );
            }
            OutputEvent::WriteFailed { label, error } => {
                debug!("{} write failed: {}", label, error)
            }
            OutputEvent::Recovered { failed_writes } => {
                debug!("Output recovered after {} failed writes", failed_writes)
            }
        }
    }
}

fn log_status(status: &PortStatus) {
    info!("📊 Output statistics for {}:", status.device);
    info!("   DMX frames sent: {}", status.frames_sent);
    info!("   Parameter frames sent: {}", status.parameter_frames_sent);
    info!("   Write errors: {}", status.write_errors);
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   dmxout --config {} run", output_path.display());

    Ok(())
}

/// Print the output-only DMX message for `channels`
fn encode_frame(channels: &[u8], refresh_rate: Option<u8>) -> Result<()> {
    if let Some(rate) = refresh_rate {
        let params = enttec::Parameters {
            refresh_rate: rate,
            register_count: u16::try_from(channels.len()).context("Too many channels")?,
            ..enttec::Parameters::default()
        };
        params.validate()?;
        println!("{}", hex::encode(params.to_frame()?));
    }

    let mut payload = Vec::with_capacity(channels.len() + 1);
    payload.push(DMX_START_CODE);
    payload.extend_from_slice(channels);

    let frame = encode(MessageLabel::OutputOnlySendDmx, &payload)?;
    println!("{}", hex::encode(&frame));
    Ok(())
}

/// Decode every message in a hex byte stream, skipping noise
fn decode_stream(input: &str) -> Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).context("Input is not valid hex")?;

    let mut decoder = StreamDecoder::new();
    decoder.push(&bytes);

    loop {
        match decoder.next_message() {
            Ok(Some(message)) => {
                println!(
                    "{} ({} bytes): {}",
                    message.label,
                    message.payload.len(),
                    hex::encode(&message.payload)
                );
                if message.label == MessageLabel::GetParameters && !message.payload.is_empty() {
                    let reply = WidgetParameters::from_payload(&message.payload)?;
                    println!("{}", serde_json::to_string_pretty(&reply)?);
                }
            }
            Ok(None) => break,
            Err(e) => warn!("Framing error: {}", e),
        }
    }

    let (decoded, skipped, errors) = decoder.stats();
    info!("Decoded {} messages, skipped {} bytes, {} framing errors", decoded, skipped, errors);
    if decoder.buffered() > 0 {
        warn!("{} trailing bytes form an incomplete message", decoder.buffered());
    }
    Ok(())
}
