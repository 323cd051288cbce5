//! Transport drivers
//!
//! A transport owns the OS handle of one physical (or virtual) DMX interface.
//! Two styles exist:
//!
//! - **Streaming** transports (USB-serial bridges) know nothing about
//!   channels. The device's transmission worker pushes complete frames
//!   through [`DmxTransport::write_frame`] on a fixed cadence.
//! - **Addressable** transports (USB-DMX widgets with on-board memory) keep
//!   the frame in the interface itself. Each channel write is a synchronous
//!   [`DmxTransport::write_byte`] on the caller's thread.
//!
//! The [`loopback`] module backs both styles with in-memory links.

use dmxflow_core::FRAME_SIZE;

use crate::error::{OutputError, Result};

pub mod loopback;
pub mod serial_bridge;
pub mod usbdmx;

pub use serial_bridge::{
    LineConnector, LineSettings, SerialBridgeTransport, SerialFraming, SerialLine,
    SystemLineConnector,
};
pub use usbdmx::{DeviceType, MemoryConnector, MemoryPort, MemoryRegion, UsbDmxTransport};

#[cfg(unix)]
pub use usbdmx::SystemMemoryConnector;

/// Hardware family of a discovered interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareKind {
    /// FTDI-class USB-serial bridge driven as a raw 250 kbit/s line
    SerialBridge,
    /// Enttec DMX USB Pro: FTDI bridge with its own DMX engine
    EnttecPro,
    /// USB-DMX interface with addressable transmit memory
    UsbDmx,
}

impl HardwareKind {
    /// How the device must be fed
    pub fn mode(self) -> TransportMode {
        match self {
            Self::SerialBridge | Self::EnttecPro => TransportMode::Streaming,
            Self::UsbDmx => TransportMode::Addressable,
        }
    }

    /// Short label for status text
    pub fn label(self) -> &'static str {
        match self {
            Self::SerialBridge => "serial bridge",
            Self::EnttecPro => "Enttec Pro",
            Self::UsbDmx => "USB-DMX",
        }
    }
}

/// How channel data reaches the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Whole frames resent continuously by a worker thread
    Streaming,
    /// Individual channel writes into device memory
    Addressable,
}

/// Capability interface of a transport driver.
///
/// Streaming transports implement `write_frame`; addressable transports
/// implement `write_byte` and `read_byte`. The defaults report
/// [`OutputError::Unsupported`].
pub trait DmxTransport: Send {
    /// Hardware family
    fn kind(&self) -> HardwareKind;

    /// System path or identifier of the interface
    fn path(&self) -> &str;

    /// Whether a handle is currently held
    fn is_open(&self) -> bool;

    /// Acquire and configure the handle
    fn open(&mut self) -> Result<()>;

    /// Release the handle. Closing a closed transport succeeds.
    fn close(&mut self) -> Result<()>;

    /// Human-readable hardware label. Never fails; falls back to a generic
    /// label when the hardware cannot be queried.
    fn identify(&mut self) -> String;

    /// Transmit one complete frame (start code + 512 channels)
    fn write_frame(&mut self, _frame: &[u8; FRAME_SIZE]) -> Result<()> {
        Err(OutputError::Unsupported(self.kind().label()))
    }

    /// Write one channel into device memory
    fn write_byte(&mut self, _channel: u16, _value: u8) -> Result<()> {
        Err(OutputError::Unsupported(self.kind().label()))
    }

    /// Read one channel back from device memory
    fn read_byte(&mut self, _channel: u16) -> Result<u8> {
        Err(OutputError::Unsupported(self.kind().label()))
    }

    /// How the device must be fed
    fn mode(&self) -> TransportMode {
        self.kind().mode()
    }
}
