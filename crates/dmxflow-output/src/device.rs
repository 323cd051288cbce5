//! One physical DMX interface
//!
//! A [`Device`] pairs a transport with the channel buffer of its universe.
//! Streaming devices get a transmission worker while open; addressable
//! devices forward each write to the hardware on the caller's thread and keep
//! the buffer as a shadow copy.
//!
//! Lock order: `link` before `buffer`. Streaming writes only take `buffer`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use dmxflow_core::{ChannelBuffer, FRAME_SIZE};

use crate::error::{OutputError, Result};
use crate::ids::OutputId;
use crate::probe::DiscoveredDevice;
use crate::transport::{DmxTransport, HardwareKind, TransportMode};
use crate::worker::{FrameTiming, FrameWorker, StopError};

const IO_ERROR_LOG_EVERY: u64 = 100;

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub output: OutputId,
    pub path: String,
    /// Hardware label from identification
    pub name: String,
    pub kind: HardwareKind,
    pub serial_number: Option<String>,
}

/// Lifecycle state reported to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Closed,
    /// Open and transmitting (streaming) or accepting writes (addressable)
    Running,
    /// Hardware vanished while open
    Lost,
    /// Worker never stopped; the device can no longer be used
    Detached,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "Closed",
            Self::Running => "Running",
            Self::Lost => "Disconnected",
            Self::Detached => "Not responding",
        };
        f.write_str(s)
    }
}

enum Link {
    Idle(Box<dyn DmxTransport>),
    Streaming(FrameWorker),
    Detached,
}

/// A DMX interface and the universe it outputs
pub struct Device {
    info: DeviceInfo,
    mode: TransportMode,
    timing: FrameTiming,
    buffer: Arc<Mutex<ChannelBuffer>>,
    link: Mutex<Link>,
    lost: AtomicBool,
    io_errors: AtomicU64,
}

impl Device {
    /// Wrap a closed transport. Identification runs here.
    pub fn new(
        output: OutputId,
        discovered: &DiscoveredDevice,
        mut transport: Box<dyn DmxTransport>,
        timing: FrameTiming,
    ) -> Self {
        let name = transport.identify();
        let info = DeviceInfo {
            output,
            path: discovered.path.clone(),
            name,
            kind: transport.kind(),
            serial_number: discovered.serial_number.clone(),
        };
        debug!("Output {}: {} at {}", output + 1, info.name, info.path);

        Self {
            mode: transport.mode(),
            info,
            timing,
            buffer: Arc::new(Mutex::new(ChannelBuffer::new())),
            link: Mutex::new(Link::Idle(transport)),
            lost: AtomicBool::new(false),
            io_errors: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn output(&self) -> OutputId {
        self.info.output
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Open the transport and, for streaming devices, start transmitting
    pub fn open(&self) -> Result<()> {
        let mut link = self.link.lock();

        // A worker that ended on its own (device lost) is cleaned up first
        if let Link::Streaming(worker) = &*link {
            if worker.is_running() && !worker.stats().is_lost() {
                return Ok(());
            }
            self.shutdown(&mut link)?;
        }

        match std::mem::replace(&mut *link, Link::Detached) {
            Link::Idle(mut transport) => {
                if let Err(e) = transport.open() {
                    warn!("Unable to open output {}: {}", self.info.output + 1, e);
                    *link = Link::Idle(transport);
                    return Err(e);
                }
                self.lost.store(false, Ordering::Relaxed);
                self.io_errors.store(0, Ordering::Relaxed);

                if self.mode == TransportMode::Addressable {
                    *link = Link::Idle(transport);
                    info!("Opened {} ({})", self.info.name, self.info.path);
                    return Ok(());
                }

                let name = format!("dmx-out-{}", self.info.output);
                match FrameWorker::spawn(name, transport, self.buffer.clone(), self.timing) {
                    Ok(worker) => {
                        *link = Link::Streaming(worker);
                        info!("Opened {} ({})", self.info.name, self.info.path);
                        Ok(())
                    }
                    Err((mut transport, e)) => {
                        if let Err(close_err) = transport.close() {
                            warn!("{}", close_err);
                        }
                        *link = Link::Idle(transport);
                        Err(OutputError::Io(e))
                    }
                }
            }
            running @ Link::Streaming(_) => {
                *link = running;
                Ok(())
            }
            Link::Detached => Err(OutputError::unavailable(
                &self.info.path,
                "a previous transmission thread never stopped",
            )),
        }
    }

    /// Stop transmission and release the handle. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let mut link = self.link.lock();
        self.shutdown(&mut link)
    }

    fn shutdown(&self, link: &mut Link) -> Result<()> {
        match std::mem::replace(link, Link::Detached) {
            Link::Idle(mut transport) => {
                let was_open = transport.is_open();
                let result = transport.close();
                *link = Link::Idle(transport);
                if was_open {
                    info!("Closed {} ({})", self.info.name, self.info.path);
                }
                result
            }
            Link::Streaming(worker) => {
                if worker.stats().is_lost() {
                    self.lost.store(true, Ordering::Relaxed);
                }
                self.stop_worker(worker, link)
            }
            Link::Detached => Ok(()),
        }
    }

    fn stop_worker(&self, worker: FrameWorker, link: &mut Link) -> Result<()> {
        match worker.stop(self.timing.stop_timeout) {
            Ok(mut transport) => {
                let result = transport.close();
                *link = Link::Idle(transport);
                info!("Closed {} ({})", self.info.name, self.info.path);
                result
            }
            Err(StopError::TimedOut) => {
                warn!(
                    "Transmission on {} did not stop within {:?}; detaching",
                    self.info.path, self.timing.stop_timeout
                );
                Err(OutputError::CloseFailure {
                    path: self.info.path.clone(),
                    reason: "transmission thread did not stop".to_string(),
                })
            }
            Err(StopError::Panicked) => Err(OutputError::CloseFailure {
                path: self.info.path.clone(),
                reason: "transmission thread panicked".to_string(),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        match &*self.link.lock() {
            Link::Idle(transport) => transport.is_open(),
            Link::Streaming(worker) => worker.is_running(),
            Link::Detached => false,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        match &*self.link.lock() {
            Link::Detached => DeviceStatus::Detached,
            Link::Streaming(worker) if worker.stats().is_lost() => DeviceStatus::Lost,
            // Ended without losing the device: the thread died
            Link::Streaming(worker) if !worker.is_running() => DeviceStatus::Detached,
            Link::Streaming(_) => DeviceStatus::Running,
            Link::Idle(_) if self.lost.load(Ordering::Relaxed) => DeviceStatus::Lost,
            Link::Idle(transport) if transport.is_open() => DeviceStatus::Running,
            Link::Idle(_) => DeviceStatus::Closed,
        }
    }

    /// Most recent transmission error of the running worker
    pub fn last_error(&self) -> Option<String> {
        match &*self.link.lock() {
            Link::Streaming(worker) => worker.stats().last_error(),
            _ => None,
        }
    }

    /// Frames transmitted since the last open (streaming only)
    pub fn frames_sent(&self) -> u64 {
        match &*self.link.lock() {
            Link::Streaming(worker) => worker.stats().frames_sent(),
            _ => 0,
        }
    }

    /// Set one channel (0-511)
    pub fn write(&self, channel: u16, value: u8) {
        if self.mode == TransportMode::Streaming {
            self.buffer.lock().write(channel, value);
            return;
        }

        let mut link = self.link.lock();
        self.buffer.lock().write(channel, value);
        if let Link::Idle(transport) = &mut *link {
            let result = transport.write_byte(channel, value);
            self.absorb(transport, result);
        }
    }

    /// Set consecutive channels starting at `address`
    pub fn write_range(&self, address: u16, values: &[u8]) {
        if self.mode == TransportMode::Streaming {
            self.buffer.lock().write_range(address, values);
            return;
        }

        let mut link = self.link.lock();
        self.buffer.lock().write_range(address, values);
        if let Link::Idle(transport) = &mut *link {
            for (channel, &value) in (address..).zip(values) {
                let result = transport.write_byte(channel, value);
                if !self.absorb(transport, result) {
                    break;
                }
            }
        }
    }

    /// Current value of one channel
    pub fn read(&self, channel: u16) -> u8 {
        if self.mode == TransportMode::Streaming {
            return self.buffer.lock().read(channel);
        }

        let mut link = self.link.lock();
        let shadow = self.buffer.lock().read(channel);
        match &mut *link {
            Link::Idle(transport) => match transport.read_byte(channel) {
                Ok(value) => value,
                Err(e) => {
                    debug!("Read-back failed on {}: {}", self.info.path, e);
                    if e.is_disconnect() {
                        self.mark_lost(transport, &e);
                    }
                    shadow
                }
            },
            _ => shadow,
        }
    }

    pub fn read_range(&self, address: u16, out: &mut [u8]) {
        if self.mode == TransportMode::Streaming {
            self.buffer.lock().read_range(address, out);
            return;
        }
        for (channel, slot) in (address..).zip(out.iter_mut()) {
            *slot = self.read(channel);
        }
    }

    /// Copy of the full frame buffer
    pub fn snapshot(&self) -> [u8; FRAME_SIZE] {
        self.buffer.lock().snapshot()
    }

    /// Log a hardware write failure; false when further writes are pointless
    fn absorb(&self, transport: &mut Box<dyn DmxTransport>, result: Result<()>) -> bool {
        let Err(e) = result else {
            // A lazy reopen found the hardware again
            self.lost.store(false, Ordering::Relaxed);
            return true;
        };
        if e.is_disconnect() {
            self.mark_lost(transport, &e);
            return false;
        }
        let count = self.io_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % IO_ERROR_LOG_EVERY == 0 {
            warn!("Write to output {} failed ({} so far): {}", self.info.output + 1, count, e);
        }
        !matches!(e, OutputError::HardwareUnavailable { .. })
    }

    /// Drop the dead handle so the next open has to find the hardware again
    fn mark_lost(&self, transport: &mut Box<dyn DmxTransport>, err: &OutputError) {
        if !self.lost.swap(true, Ordering::Relaxed) {
            warn!("{}", err);
        }
        if let Err(e) = transport.close() {
            debug!("Releasing {} after disconnect: {}", self.info.path, e);
        }
    }

    /// Multi-line status block
    pub fn info_text(&self) -> String {
        let mut text = format!("{}\n", self.info.name);
        text.push_str(&format!("  Output: {}\n", self.info.output + 1));
        text.push_str(&format!("  Path: {}\n", self.info.path));
        text.push_str(&format!("  Type: {}\n", self.info.kind.label()));
        if let Some(serial) = &self.info.serial_number {
            text.push_str(&format!("  Serial: {}\n", serial));
        }
        text.push_str(&format!("  Status: {}\n", self.status()));
        if self.mode == TransportMode::Streaming {
            text.push_str(&format!("  Frames sent: {}\n", self.frames_sent()));
        }
        if let Some(error) = self.last_error() {
            text.push_str(&format!("  Last error: {}\n", error));
        }
        text
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing {} on drop: {}", self.info.path, e);
        }
    }
}
