//! Addressable USB-DMX transport (Peperoni-style interfaces)
//!
//! The interface keeps its own transmit memory and refreshes the line by
//! itself. The host only pokes bytes into that memory: select the memory map
//! with an ioctl, seek to the channel offset, then read or write one byte.
//! No worker thread is involved; every access runs on the caller's thread.

use std::io;
use std::sync::Arc;

use super::{DmxTransport, HardwareKind};
use crate::error::{OutputError, Result};

// Vendor request bits of the interface firmware
const DMX_RX: i32 = 1 << 2;
const DMX_TX: i32 = 2 << 2;
const DMX_MEM: i32 = 0;

/// Transmit memory selector
pub const DMX_TX_MEM: i32 = DMX_TX | DMX_MEM;
/// Receive memory selector
pub const DMX_RX_MEM: i32 = DMX_RX | DMX_MEM;

/// ioctl: select the memory used by following read()/write() calls
pub const DMX_MEM_MAP_SET: u32 = 1;
/// ioctl: query the interface type
pub const DMX_TYPE_GET: u32 = 19;

/// Memory region addressed by reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    Transmit,
    Receive,
}

impl MemoryRegion {
    /// Selector value passed to `DMX_MEM_MAP_SET`
    pub fn selector(self) -> i32 {
        match self {
            Self::Transmit => DMX_TX_MEM,
            Self::Receive => DMX_RX_MEM,
        }
    }
}

/// Interface type reported by `DMX_TYPE_GET`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    XSwitch,
    Rodin1,
    Rodin2,
    UsbDmx21,
    Unknown(i32),
}

impl DeviceType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0x01 => Self::XSwitch,
            0x02 => Self::Rodin1,
            0x03 => Self::Rodin2,
            0x04 => Self::UsbDmx21,
            other => Self::Unknown(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::XSwitch => "XSwitch",
            Self::Rodin1 => "Rodin1",
            Self::Rodin2 => "Rodin2",
            Self::UsbDmx21 => "USBDMX21",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// Label used when the interface cannot be opened at all
pub const LABEL_UNAVAILABLE: &str = "Nothing";

/// Register-level operations of an open interface handle
pub trait MemoryPort: Send {
    fn set_memory_map(&mut self, region: MemoryRegion) -> io::Result<()>;
    fn seek(&mut self, offset: u64) -> io::Result<()>;
    fn read_byte(&mut self) -> io::Result<u8>;
    fn write_byte(&mut self, value: u8) -> io::Result<()>;
    /// Raw `DMX_TYPE_GET` value
    fn device_type(&mut self) -> io::Result<i32>;
    /// Release the handle
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens interface handles by path
pub trait MemoryConnector: Send + Sync {
    fn connect(&self, path: &str) -> io::Result<Box<dyn MemoryPort>>;
}

#[cfg(unix)]
mod system {
    use super::{MemoryConnector, MemoryPort, MemoryRegion, DMX_MEM_MAP_SET, DMX_TYPE_GET};
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Seek, SeekFrom, Write};
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    /// Connector for `/dev/usbdmx*` device nodes
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemMemoryConnector;

    impl MemoryConnector for SystemMemoryConnector {
        fn connect(&self, path: &str) -> io::Result<Box<dyn MemoryPort>> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(Box::new(DeviceNode { file }))
        }
    }

    struct DeviceNode {
        file: File,
    }

    impl MemoryPort for DeviceNode {
        fn set_memory_map(&mut self, region: MemoryRegion) -> io::Result<()> {
            let selector: libc::c_int = region.selector();
            // SAFETY: the descriptor is owned by `self.file` and the request
            // takes its argument by value.
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), DMX_MEM_MAP_SET as _, selector) };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn seek(&mut self, offset: u64) -> io::Result<()> {
            self.file.seek(SeekFrom::Start(offset)).map(|_| ())
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            let mut value = [0u8; 1];
            self.file.read_exact(&mut value)?;
            Ok(value[0])
        }

        fn write_byte(&mut self, value: u8) -> io::Result<()> {
            self.file.write_all(&[value])
        }

        fn device_type(&mut self) -> io::Result<i32> {
            let mut raw: libc::c_int = 0;
            // SAFETY: `raw` outlives the call and the driver writes one int.
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    DMX_TYPE_GET as _,
                    &mut raw as *mut libc::c_int,
                )
            };
            if ret == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(raw)
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            let fd = self.file.into_raw_fd();
            // SAFETY: ownership of `fd` was just taken from the File.
            if unsafe { libc::close(fd) } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(unix)]
pub use system::SystemMemoryConnector;

/// Addressable transport over a USB-DMX device node
pub struct UsbDmxTransport {
    path: String,
    connector: Arc<dyn MemoryConnector>,
    port: Option<Box<dyn MemoryPort>>,
}

impl UsbDmxTransport {
    /// Create a closed transport for the interface at `path`
    pub fn new(path: impl Into<String>, connector: Arc<dyn MemoryConnector>) -> Self {
        Self {
            path: path.into(),
            connector,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn MemoryPort>> {
        // Lazy open on first use
        if self.port.is_none() {
            self.open()?;
        }
        let path = &self.path;
        self.port
            .as_mut()
            .ok_or_else(|| OutputError::unavailable(path, "interface not open"))
    }
}

impl DmxTransport for UsbDmxTransport {
    fn kind(&self) -> HardwareKind {
        HardwareKind::UsbDmx
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        match self.connector.connect(&self.path) {
            Ok(port) => {
                self.port = Some(port);
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Unable to open USBDMX {}: {}", self.path, e);
                Err(OutputError::unavailable(&self.path, e))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.port.take() {
            Some(port) => port.close().map_err(|e| {
                tracing::warn!("Unable to close USBDMX {}: {}", self.path, e);
                OutputError::CloseFailure {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(()),
        }
    }

    fn identify(&mut self) -> String {
        let was_open = self.is_open();
        if self.open().is_err() {
            return LABEL_UNAVAILABLE.to_string();
        }

        let label = match self.port.as_mut().map(|p| p.device_type()) {
            Some(Ok(raw)) => DeviceType::from_raw(raw).label(),
            Some(Err(e)) => {
                tracing::debug!("Type query failed on {}: {}", self.path, e);
                DeviceType::Unknown(0).label()
            }
            None => LABEL_UNAVAILABLE,
        };

        if !was_open {
            let _ = self.close();
        }
        label.to_string()
    }

    fn write_byte(&mut self, channel: u16, value: u8) -> Result<()> {
        let path = self.path.clone();
        let port = self.port()?;
        port.set_memory_map(MemoryRegion::Transmit)
            .and_then(|_| port.seek(u64::from(channel)))
            .and_then(|_| port.write_byte(value))
            .map_err(|e| OutputError::from_io(&path, e))
    }

    fn read_byte(&mut self, channel: u16) -> Result<u8> {
        let path = self.path.clone();
        let port = self.port()?;
        port.set_memory_map(MemoryRegion::Transmit)
            .and_then(|_| port.seek(u64::from(channel)))
            .and_then(|_| port.read_byte())
            .map_err(|e| OutputError::from_io(&path, e))
    }
}
