//! USB-serial bridge transport (FTDI-class chips)
//!
//! The bridge is driven as a plain UART at 250 kbit/s, 8 data bits, 2 stop
//! bits, no parity. Two framings exist:
//!
//! - [`SerialFraming::Break`]: plain bridges (Enttec Open and clones). DMX
//!   framing is produced in software: every frame starts with a line break,
//!   followed by the start code and the 512 channel bytes.
//! - [`SerialFraming::EnttecPro`]: widgets with their own DMX engine. Each
//!   frame is wrapped in a `0x7E <label> <len> ... 0xE7` message and the
//!   widget generates the break itself.
//!
//! State machine: `Closed -> Open -> Running -> Closed`. This type covers
//! `Closed`/`Open`; `Running` is the device's transmission worker owning the
//! open transport.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dmxflow_core::FRAME_SIZE;

use super::{DmxTransport, HardwareKind};
use crate::error::{OutputError, Result};

/// DMX512 line rate
pub const DMX_BAUD_RATE: u32 = 250_000;

/// Enttec Pro message delimiters
pub const PRO_START_OF_MESSAGE: u8 = 0x7E;
pub const PRO_END_OF_MESSAGE: u8 = 0xE7;
/// Enttec Pro label: output-only send DMX packet
pub const PRO_LABEL_SEND_DMX: u8 = 6;

/// How frames are put on the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialFraming {
    /// Software break, then start code and channel data
    #[default]
    Break,
    /// Enttec Pro "send DMX" message; the widget drives the line
    EnttecPro,
}

/// Wrap a frame in an Enttec Pro "send DMX" message
pub fn pro_packet(frame: &[u8; FRAME_SIZE]) -> Vec<u8> {
    let len = FRAME_SIZE as u16;
    let mut packet = Vec::with_capacity(FRAME_SIZE + 5);
    packet.push(PRO_START_OF_MESSAGE);
    packet.push(PRO_LABEL_SEND_DMX);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(frame);
    packet.push(PRO_END_OF_MESSAGE);
    packet
}

/// Frame carried by a complete Enttec Pro "send DMX" message
pub fn pro_payload(packet: &[u8]) -> Option<&[u8]> {
    let (&start, rest) = packet.split_first()?;
    let (&end, rest) = rest.split_last()?;
    if start != PRO_START_OF_MESSAGE || end != PRO_END_OF_MESSAGE || rest.len() < 3 {
        return None;
    }
    if rest[0] != PRO_LABEL_SEND_DMX {
        return None;
    }
    let len = usize::from(u16::from_le_bytes([rest[1], rest[2]]));
    let data = &rest[3..];
    (data.len() == len).then_some(data)
}

/// Line parameters applied on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Length of the frame-start break
    pub break_time: Duration,
    /// Per-call write timeout
    pub io_timeout: Duration,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: DMX_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::Two,
            parity: Parity::None,
            flow_control: FlowControl::None,
            break_time: Duration::from_micros(110),
            io_timeout: Duration::from_millis(100),
        }
    }
}

impl LineSettings {
    /// DMX line settings with timing taken from the output config
    pub fn from_config(config: &dmxflow_core::OutputConfig) -> Self {
        Self {
            break_time: config.break_time(),
            io_timeout: config.io_timeout(),
            ..Self::default()
        }
    }
}

/// Raw line operations of an open serial handle
pub trait SerialLine: Send {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;
    fn set_data_characteristics(
        &mut self,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> io::Result<()>;
    fn set_flow_control(&mut self, flow_control: FlowControl) -> io::Result<()>;
    /// Drive the request-to-send line
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
    /// Discard pending transmit and receive data
    fn purge(&mut self) -> io::Result<()>;
    fn set_break(&mut self) -> io::Result<()>;
    fn clear_break(&mut self) -> io::Result<()>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Release the handle
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens serial lines by path
pub trait LineConnector: Send + Sync {
    fn connect(&self, path: &str, timeout: Duration) -> io::Result<Box<dyn SerialLine>>;
}

/// Connector for real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLineConnector;

impl LineConnector for SystemLineConnector {
    fn connect(&self, path: &str, timeout: Duration) -> io::Result<Box<dyn SerialLine>> {
        let port = serialport::new(path, DMX_BAUD_RATE).timeout(timeout).open()?;
        Ok(Box::new(SystemLine { port }))
    }
}

struct SystemLine {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLine for SystemLine {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        Ok(self.port.set_baud_rate(baud_rate)?)
    }

    fn set_data_characteristics(
        &mut self,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> io::Result<()> {
        self.port.set_data_bits(data_bits)?;
        self.port.set_stop_bits(stop_bits)?;
        self.port.set_parity(parity)?;
        Ok(())
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> io::Result<()> {
        Ok(self.port.set_flow_control(flow_control)?)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        Ok(self.port.write_request_to_send(level)?)
    }

    fn purge(&mut self) -> io::Result<()> {
        Ok(self.port.clear(ClearBuffer::All)?)
    }

    fn set_break(&mut self) -> io::Result<()> {
        Ok(self.port.set_break()?)
    }

    fn clear_break(&mut self) -> io::Result<()> {
        Ok(self.port.clear_break()?)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        // serialport releases the descriptor on drop
        drop(self);
        Ok(())
    }
}

/// Streaming transport over a USB-serial bridge
pub struct SerialBridgeTransport {
    path: String,
    description: String,
    settings: LineSettings,
    framing: SerialFraming,
    connector: Arc<dyn LineConnector>,
    line: Option<Box<dyn SerialLine>>,
}

impl SerialBridgeTransport {
    /// Create a closed transport for the port at `path`
    pub fn new(
        path: impl Into<String>,
        description: impl Into<String>,
        settings: LineSettings,
        connector: Arc<dyn LineConnector>,
    ) -> Self {
        Self {
            path: path.into(),
            description: description.into(),
            settings,
            framing: SerialFraming::Break,
            connector,
            line: None,
        }
    }

    /// Use a different frame format
    pub fn with_framing(mut self, framing: SerialFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn framing(&self) -> SerialFraming {
        self.framing
    }

    /// Line settings applied on open
    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    fn configure(&self, line: &mut dyn SerialLine) -> Result<()> {
        let s = &self.settings;
        self.step("set baud rate", line.set_baud_rate(s.baud_rate))?;
        self.step(
            "set data characteristics",
            line.set_data_characteristics(s.data_bits, s.stop_bits, s.parity),
        )?;
        self.step("set flow control", line.set_flow_control(s.flow_control))?;
        // Holds half-duplex RS-485 converters in transmit mode
        self.step("clear RTS", line.set_rts(false))?;
        self.step("purge buffers", line.purge())?;
        Ok(())
    }

    fn step(&self, step: &'static str, result: io::Result<()>) -> Result<()> {
        result.map_err(|e| OutputError::ConfigurationFailure {
            path: self.path.clone(),
            step,
            reason: e.to_string(),
        })
    }
}

impl DmxTransport for SerialBridgeTransport {
    fn kind(&self) -> HardwareKind {
        match self.framing {
            SerialFraming::Break => HardwareKind::SerialBridge,
            SerialFraming::EnttecPro => HardwareKind::EnttecPro,
        }
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.line.is_some()
    }

    fn open(&mut self) -> Result<()> {
        if self.line.is_some() {
            return Ok(());
        }

        let mut line = self
            .connector
            .connect(&self.path, self.settings.io_timeout)
            .map_err(|e| OutputError::unavailable(&self.path, e))?;

        if let Err(e) = self.configure(line.as_mut()) {
            if let Err(close_err) = line.close() {
                tracing::warn!("Unable to release {} after failed setup: {}", self.path, close_err);
            }
            return Err(e);
        }

        tracing::debug!("Serial bridge {} configured for DMX", self.path);
        self.line = Some(line);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.line.take() {
            Some(line) => line.close().map_err(|e| OutputError::CloseFailure {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn identify(&mut self) -> String {
        match self.framing {
            SerialFraming::Break => format!("FTDI DMX Device: {}", self.description),
            SerialFraming::EnttecPro => self.description.clone(),
        }
    }

    fn write_frame(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()> {
        let path = &self.path;
        let break_time = self.settings.break_time;
        let line = self.line.as_mut().ok_or_else(|| OutputError::Disconnected {
            path: path.clone(),
            reason: "transport is closed".to_string(),
        })?;

        if self.framing == SerialFraming::EnttecPro {
            return line
                .write_all(&pro_packet(frame))
                .map_err(|e| OutputError::from_io(path, e));
        }

        let send = |line: &mut Box<dyn SerialLine>| -> io::Result<()> {
            line.set_break()?;
            thread::sleep(break_time);
            line.clear_break()?;
            line.write_all(&frame[..1])?;
            line.write_all(&frame[1..])
        };
        send(line).map_err(|e| OutputError::from_io(path, e))
    }
}
