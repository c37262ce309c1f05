/*!
Configuration management for the DMX output application.
*/

use anyhow::{Context, Result};
use enttec::{OutputOptions, Parameters, SerialConnector};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: PortConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validated widget parameters from the `[output]` section
    pub fn parameters(&self) -> Result<Parameters> {
        let output = &self.output;
        Parameters::new(
            output.break_time,
            output.mark_after_break,
            output.refresh_rate,
            output.register_count,
        )
        .with_context(|| "Invalid [output] parameters")
    }

    /// Loop options from the `[output]` section
    pub fn output_options(&self) -> OutputOptions {
        OutputOptions {
            pad_short_frames: self.output.pad_short_frames,
        }
    }

    /// Serial connector for the `[port]` section
    pub fn connector(&self) -> SerialConnector {
        SerialConnector::new(self.port.device_path.clone())
            .with_baud_rate(self.port.baud_rate)
            .with_write_timeout(Duration::from_millis(self.port.write_timeout_ms))
            .with_hardware_break(self.port.hardware_break)
    }
}

/// Serial device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Device node of the widget, e.g. /dev/ttyUSB0
    pub device_path: String,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,

    /// Generate break and mark-after-break from the host
    pub hardware_break: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/ttyUSB0".to_string(),
            baud_rate: SerialConnector::DEFAULT_BAUD_RATE,
            write_timeout_ms: 1000,
            hardware_break: false,
        }
    }
}

/// Output timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Break time in 10.67 µs units (9-127)
    pub break_time: u8,

    /// Mark-after-break time in 10.67 µs units (1-127)
    pub mark_after_break: u8,

    /// Frames per second (1-40)
    pub refresh_rate: u8,

    /// Channels transmitted per frame (1-512)
    pub register_count: u16,

    /// Pad short frames to the 24-slot DMX minimum
    pub pad_short_frames: bool,

    /// Run the background output loop; otherwise frames are sent on demand
    pub threaded: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let params = Parameters::default();
        Self {
            break_time: params.break_time,
            mark_after_break: params.mark_after_break,
            refresh_rate: params.refresh_rate,
            register_count: params.register_count,
            pad_short_frames: false,
            threaded: true,
        }
    }
}
