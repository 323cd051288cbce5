//! Error types for the output pipeline
use std::io;
use thiserror::Error;

/// Output pipeline errors
#[derive(Error, Debug)]
pub enum OutputError {
    /// Device absent or already claimed
    #[error("Hardware unavailable: {path}: {reason}")]
    HardwareUnavailable { path: String, reason: String },

    /// A line setup step failed after the handle was obtained
    #[error("Configuration failed on {path} ({step}): {reason}")]
    ConfigurationFailure {
        path: String,
        step: &'static str,
        reason: String,
    },

    /// A single read or write failed during steady-state operation
    #[error("Transient I/O error on {path}: {reason}")]
    TransientIo { path: String, reason: String },

    /// The device went away while in use
    #[error("Device disconnected: {path}: {reason}")]
    Disconnected { path: String, reason: String },

    /// Handle release failed
    #[error("Close failed on {path}: {reason}")]
    CloseFailure { path: String, reason: String },

    /// Operation not offered by this transport
    #[error("Operation not supported by {0} transport")]
    Unsupported(&'static str),

    /// Invalid parameter value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Patch or configuration error
    #[error(transparent)]
    Core(#[from] dmxflow_core::CoreError),
}

impl OutputError {
    /// Classify an I/O failure on an open device
    pub fn from_io(path: &str, err: io::Error) -> Self {
        if is_disconnect(&err) {
            Self::Disconnected {
                path: path.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::TransientIo {
                path: path.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Open failed before a handle existed
    pub fn unavailable(path: &str, reason: impl std::fmt::Display) -> Self {
        Self::HardwareUnavailable {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the device is gone rather than momentarily failing
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    is_missing_device(err)
        || matches!(
            err.kind(),
            io::ErrorKind::NotFound
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionAborted
        )
}

#[cfg(unix)]
fn is_missing_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO))
}

#[cfg(not(unix))]
fn is_missing_device(_err: &io::Error) -> bool {
    false
}

/// Result type for output operations
pub type Result<T> = std::result::Result<T, OutputError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OutputError::ConfigurationFailure {
            path: "/dev/ttyUSB0".to_string(),
            step: "set stop bits",
            reason: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration failed on /dev/ttyUSB0 (set stop bits): boom"
        );
    }

    #[test]
    fn test_io_classification() {
        let gone = OutputError::from_io("x", io::Error::new(io::ErrorKind::NotFound, "unplugged"));
        assert!(gone.is_disconnect());

        let slow = OutputError::from_io("x", io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(slow, OutputError::TransientIo { .. }));
        assert!(!slow.is_disconnect());
    }
}
