//! Output configuration
//!
//! Timing, limits and probe settings for the DMX output pipeline. Stored as
//! TOML; missing fields fall back to defaults so older files keep loading.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CoreError, Result};

/// USB vendor id of Future Technology Devices International
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// Minimum break length allowed by DMX512 (microseconds)
pub const MIN_BREAK_US: u64 = 88;

/// Settings for the USB-serial bridge probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialProbeConfig {
    /// Probe serial ports at all
    pub enabled: bool,
    /// USB vendor id a port must report to be treated as a DMX bridge
    pub vendor_id: u16,
}

impl Default for SerialProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_id: FTDI_VENDOR_ID,
        }
    }
}

/// Settings for the addressable USB-DMX probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbDmxProbeConfig {
    /// Probe device nodes at all
    pub enabled: bool,
    /// Directory holding the device nodes
    pub device_dir: PathBuf,
    /// File name prefix of the device nodes (`usbdmx0`, `usbdmx1`, ...)
    pub device_prefix: String,
}

impl Default for UsbDmxProbeConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(unix),
            device_dir: PathBuf::from("/dev"),
            device_prefix: "usbdmx".to_string(),
        }
    }
}

/// DMX output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Pause between two transmitted frames
    pub frame_interval_ms: u64,
    /// Wait before the first frame after open
    pub settle_delay_ms: u64,
    /// Length of the break that starts each frame
    pub break_time_us: u64,
    /// Write timeout for serial transports
    pub io_timeout_ms: u64,
    /// How long `close` waits for a transmission worker to stop
    pub stop_timeout_ms: u64,
    /// Maximum number of outputs a plugin registers
    pub max_outputs: usize,
    /// Number of universes in the patch
    pub universes: usize,
    /// Serial bridge probe
    pub serial: SerialProbeConfig,
    /// Addressable USB-DMX probe
    pub usbdmx: UsbDmxProbeConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 30,
            settle_delay_ms: 1000,
            break_time_us: 110,
            io_timeout_ms: 100,
            stop_timeout_ms: 500,
            max_outputs: 32,
            universes: 4,
            serial: SerialProbeConfig::default(),
            usbdmx: UsbDmxProbeConfig::default(),
        }
    }
}

impl OutputConfig {
    /// Frame interval as a duration
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Settle delay as a duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Break time as a duration
    pub fn break_time(&self) -> Duration {
        Duration::from_micros(self.break_time_us)
    }

    /// I/O timeout as a duration
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Stop timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Check values against protocol limits
    pub fn validate(&self) -> Result<()> {
        if self.frame_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "frame_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.break_time_us < MIN_BREAK_US {
            return Err(CoreError::InvalidConfig(format!(
                "break_time_us must be at least {} (got {})",
                MIN_BREAK_US, self.break_time_us
            )));
        }
        if self.max_outputs == 0 {
            return Err(CoreError::InvalidConfig(
                "max_outputs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("DMXFlow");
            p.push("output.toml");
            p
        })
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the default location); a missing file yields defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if path.exists() {
            tracing::info!("Loading output config from {:?}", path);
            Self::load(&path)
        } else {
            tracing::debug!("No output config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Write the config as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OutputConfig::default();
        assert_eq!(config.frame_interval(), Duration::from_millis(30));
        assert_eq!(config.break_time(), Duration::from_micros(110));
        assert_eq!(config.serial.vendor_id, FTDI_VENDOR_ID);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_break_rejected() {
        let config = OutputConfig {
            break_time_us: 40,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output.toml");
        fs::write(&path, "frame_interval_ms = 25\n[serial]\nenabled = false\n").unwrap();

        let config = OutputConfig::load(&path).unwrap();
        assert_eq!(config.frame_interval_ms, 25);
        assert!(!config.serial.enabled);
        assert_eq!(config.serial.vendor_id, FTDI_VENDOR_ID);
        assert_eq!(config.max_outputs, 32);
    }

    #[test]
    fn test_save_load_keeps_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("output.toml");
        let config = OutputConfig {
            settle_delay_ms: 0,
            universes: 8,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(OutputConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = OutputConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config, OutputConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "frame_interval_ms = \"fast\"").unwrap();
        assert!(matches!(
            OutputConfig::load(&path),
            Err(CoreError::ConfigParse(_))
        ));
    }
}
