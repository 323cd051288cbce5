//! DMXFlow Core - Domain Model for DMX512 Output
//!
//! This crate contains the data model shared by the output pipeline and its
//! hosts, including:
//! - Per-universe channel buffer (start code + 512 channels)
//! - Universe patch (universe -> plugin -> output)
//! - Output configuration (frame timing, probes, limits)
//! - Logging configuration

#![warn(missing_docs)]

use thiserror::Error;

pub mod config;
pub mod logging;
pub mod patch;
pub mod universe;

// --- Re-exports grouped by category ---

// Channel data
pub use universe::{ChannelBuffer, CHANNELS_PER_UNIVERSE, DEFAULT_START_CODE, FRAME_SIZE};

// Patch
pub use patch::{PatchMap, UniversePatch, PLUGIN_NONE};

// Configuration
pub use config::{OutputConfig, SerialProbeConfig, UsbDmxProbeConfig};
pub use logging::LogConfig;

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    /// Universe index outside the patch
    #[error("Universe out of range: {universe} (patch has {count} universes)")]
    UniverseOutOfRange {
        /// Requested universe (0-based)
        universe: u32,
        /// Number of universes in the patch
        count: usize,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_error_display() {
        let err = CoreError::UniverseOutOfRange {
            universe: 9,
            count: 4,
        };
        assert_eq!(
            err.to_string(),
            "Universe out of range: 9 (patch has 4 universes)"
        );
    }
}
