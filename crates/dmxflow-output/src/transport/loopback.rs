//! In-memory virtual DMX bus
//!
//! [`LoopbackBus`] plays the role of the USB subsystem: virtual serial
//! bridges and virtual USB-DMX interfaces can be plugged in, unplugged and
//! made to fail. It hands out lines and memory ports through the same
//! connector traits the real drivers use, and records what was sent.

use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use dmxflow_core::{CHANNELS_PER_UNIVERSE, FRAME_SIZE};

use super::serial_bridge::{pro_payload, LineConnector, SerialLine};
use super::usbdmx::{MemoryConnector, MemoryPort, MemoryRegion};
use crate::probe::{serial_link, DeviceLink, DeviceProbe, DiscoveredDevice};

const SERIAL_PREFIX: &str = "loop://serial/";
const USBDMX_PREFIX: &str = "loop://usbdmx/";

/// Recorded line operations per device
const OP_HISTORY: usize = 4096;

/// One recorded serial line operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOp {
    BaudRate(u32),
    DataCharacteristics(DataBits, StopBits, Parity),
    FlowControl(FlowControl),
    Rts(bool),
    Purge,
    BreakOn,
    BreakOff,
    /// Number of bytes written
    Write(usize),
    Close,
}

/// Operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStep {
    BaudRate,
    DataCharacteristics,
    FlowControl,
    Rts,
    Purge,
    /// Serial writes and memory writes
    Write,
}

/// Injected failures for one virtual device
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackFaults {
    /// Connect attempts fail as if another process held the device
    pub refuse_open: bool,
    /// This operation fails on every call
    pub fail_step: Option<LineStep>,
    /// Handle release reports an error
    pub fail_close: bool,
    /// Serial writes block this long before completing
    pub hang_write: Option<Duration>,
}

enum NodeKind {
    Serial {
        description: String,
        serial_number: Option<String>,
        ops: VecDeque<LineOp>,
        pending: Vec<u8>,
        last_frame: Option<Vec<u8>>,
        frame_count: u64,
    },
    Memory {
        device_type: Option<i32>,
        region: Option<MemoryRegion>,
        position: usize,
        tx: Vec<u8>,
        rx: Vec<u8>,
    },
}

struct Node {
    path: String,
    plugged: bool,
    held: bool,
    faults: LoopbackFaults,
    kind: NodeKind,
}

#[derive(Default)]
struct BusState {
    nodes: Vec<Node>,
    next_serial: usize,
    next_memory: usize,
}

impl BusState {
    fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.path == path)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.path == path)
    }

    /// Node behind an open handle; unplugged nodes behave like a vanished device
    fn attached(&mut self, path: &str) -> io::Result<&mut Node> {
        match self.node_mut(path) {
            Some(node) if node.plugged && node.held => Ok(node),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, format!("{path} is gone"))),
        }
    }
}

/// Shared virtual bus. Clones refer to the same devices.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with `count` virtual serial bridges already plugged in
    pub fn with_serial_devices(count: usize) -> Self {
        let bus = Self::new();
        for i in 0..count {
            let serial = format!("LB{:06}", i + 1);
            bus.add_serial("Loopback DMX", Some(&serial));
        }
        bus
    }

    /// Plug in a virtual serial bridge, returning its path
    pub fn add_serial(&self, description: &str, serial_number: Option<&str>) -> String {
        let mut state = self.state.lock();
        let path = format!("{SERIAL_PREFIX}{}", state.next_serial);
        state.next_serial += 1;
        state.nodes.push(Node {
            path: path.clone(),
            plugged: true,
            held: false,
            faults: LoopbackFaults::default(),
            kind: NodeKind::Serial {
                description: description.to_string(),
                serial_number: serial_number.map(str::to_string),
                ops: VecDeque::new(),
                pending: Vec::with_capacity(FRAME_SIZE),
                last_frame: None,
                frame_count: 0,
            },
        });
        path
    }

    /// Plug in a virtual USB-DMX interface. `None` makes the type query fail.
    pub fn add_memory(&self, device_type: Option<i32>) -> String {
        let mut state = self.state.lock();
        let path = format!("{USBDMX_PREFIX}{}", state.next_memory);
        state.next_memory += 1;
        state.nodes.push(Node {
            path: path.clone(),
            plugged: true,
            held: false,
            faults: LoopbackFaults::default(),
            kind: NodeKind::Memory {
                device_type,
                region: None,
                position: 0,
                tx: vec![0; CHANNELS_PER_UNIVERSE],
                rx: vec![0; CHANNELS_PER_UNIVERSE],
            },
        });
        path
    }

    /// Pull the device. Open handles fail from now on and scans skip it.
    pub fn unplug(&self, path: &str) {
        if let Some(node) = self.state.lock().node_mut(path) {
            node.plugged = false;
        }
    }

    pub fn set_faults(&self, path: &str, faults: LoopbackFaults) {
        if let Some(node) = self.state.lock().node_mut(path) {
            node.faults = faults;
        }
    }

    /// Whether a handle to the device is currently open
    pub fn is_held(&self, path: &str) -> bool {
        self.state.lock().node(path).is_some_and(|n| n.held)
    }

    /// Recorded line operations, oldest first
    pub fn ops(&self, path: &str) -> Vec<LineOp> {
        match self.state.lock().node(path).map(|n| &n.kind) {
            Some(NodeKind::Serial { ops, .. }) => ops.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Number of complete frames transmitted since the device was added
    pub fn frame_count(&self, path: &str) -> u64 {
        match self.state.lock().node(path).map(|n| &n.kind) {
            Some(NodeKind::Serial { frame_count, .. }) => *frame_count,
            _ => 0,
        }
    }

    /// Most recent complete frame (start code + 512 channels)
    pub fn last_frame(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().node(path).map(|n| &n.kind) {
            Some(NodeKind::Serial { last_frame, .. }) => last_frame.clone(),
            _ => None,
        }
    }

    fn hang_time(&self, path: &str) -> Option<Duration> {
        self.state.lock().node(path).and_then(|n| n.faults.hang_write)
    }

    /// Transmit memory of a USB-DMX interface
    pub fn memory(&self, path: &str) -> Vec<u8> {
        match self.state.lock().node(path).map(|n| &n.kind) {
            Some(NodeKind::Memory { tx, .. }) => tx.clone(),
            _ => Vec::new(),
        }
    }

    fn claim(&self, path: &str, want_serial: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        let node = match state.node_mut(path) {
            Some(node) if node.plugged => node,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no device at {path}"),
                ))
            }
        };

        if matches!(node.kind, NodeKind::Serial { .. }) != want_serial {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} is a different kind of device"),
            ));
        }
        if node.faults.refuse_open || node.held {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{path} is busy"),
            ));
        }

        node.held = true;
        if let NodeKind::Memory { region, position, .. } = &mut node.kind {
            *region = None;
            *position = 0;
        }
        Ok(())
    }

    fn release(&self, path: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        let Some(node) = state.node_mut(path) else {
            return Ok(());
        };
        node.held = false;
        if let NodeKind::Serial { ops, .. } = &mut node.kind {
            push_op(ops, LineOp::Close);
        }
        if node.faults.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "release failed"));
        }
        Ok(())
    }
}

fn push_op(ops: &mut VecDeque<LineOp>, op: LineOp) {
    if ops.len() == OP_HISTORY {
        ops.pop_front();
    }
    ops.push_back(op);
}

fn injected(step: LineStep) -> io::Error {
    match step {
        LineStep::Write => io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
        other => io::Error::new(io::ErrorKind::Other, format!("{other:?} rejected")),
    }
}

impl LineConnector for LoopbackBus {
    fn connect(&self, path: &str, _timeout: Duration) -> io::Result<Box<dyn SerialLine>> {
        self.claim(path, true)?;
        Ok(Box::new(LoopbackLine {
            bus: self.clone(),
            path: path.to_string(),
        }))
    }
}

impl MemoryConnector for LoopbackBus {
    fn connect(&self, path: &str) -> io::Result<Box<dyn MemoryPort>> {
        self.claim(path, false)?;
        Ok(Box::new(LoopbackMemory {
            bus: self.clone(),
            path: path.to_string(),
        }))
    }
}

impl DeviceProbe for LoopbackBus {
    fn name(&self) -> &str {
        "loopback"
    }

    fn scan(&self) -> Vec<DiscoveredDevice> {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .filter(|n| n.plugged)
            .map(|n| match &n.kind {
                NodeKind::Serial {
                    description,
                    serial_number,
                    ..
                } => DiscoveredDevice {
                    path: n.path.clone(),
                    description: description.clone(),
                    serial_number: serial_number.clone(),
                    link: serial_link(description, Arc::new(self.clone())),
                },
                NodeKind::Memory { .. } => DiscoveredDevice {
                    path: n.path.clone(),
                    description: String::new(),
                    serial_number: None,
                    link: DeviceLink::Memory(Arc::new(self.clone())),
                },
            })
            .collect()
    }
}

/// Open serial handle. `path` is emptied once the handle is released.
struct LoopbackLine {
    bus: LoopbackBus,
    path: String,
}

impl Drop for LoopbackLine {
    fn drop(&mut self) {
        if !self.path.is_empty() {
            let _ = self.bus.release(&self.path);
        }
    }
}

impl LoopbackLine {
    fn apply(&self, step: Option<LineStep>, op: LineOp, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.bus.state.lock();
        let node = state.attached(&self.path)?;
        if let (Some(step), Some(failing)) = (step, node.faults.fail_step) {
            if step == failing {
                return Err(injected(step));
            }
        }

        let NodeKind::Serial {
            ops,
            pending,
            last_frame,
            frame_count,
            ..
        } = &mut node.kind
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a serial line"));
        };

        push_op(ops, op);
        match op {
            LineOp::BreakOn => pending.clear(),
            LineOp::Write(_) => {
                // Enttec Pro widgets get one framed packet and no break
                let packet = if pending.is_empty() { pro_payload(bytes) } else { None };
                if let Some(frame) = packet {
                    *last_frame = Some(frame.to_vec());
                    *frame_count += 1;
                    return Ok(());
                }
                pending.extend_from_slice(bytes);
                if pending.len() == FRAME_SIZE {
                    *last_frame = Some(std::mem::take(pending));
                    *frame_count += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl SerialLine for LoopbackLine {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.apply(Some(LineStep::BaudRate), LineOp::BaudRate(baud_rate), &[])
    }

    fn set_data_characteristics(
        &mut self,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> io::Result<()> {
        self.apply(
            Some(LineStep::DataCharacteristics),
            LineOp::DataCharacteristics(data_bits, stop_bits, parity),
            &[],
        )
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> io::Result<()> {
        self.apply(
            Some(LineStep::FlowControl),
            LineOp::FlowControl(flow_control),
            &[],
        )
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.apply(Some(LineStep::Rts), LineOp::Rts(level), &[])
    }

    fn purge(&mut self) -> io::Result<()> {
        self.apply(Some(LineStep::Purge), LineOp::Purge, &[])
    }

    fn set_break(&mut self) -> io::Result<()> {
        self.apply(None, LineOp::BreakOn, &[])
    }

    fn clear_break(&mut self) -> io::Result<()> {
        self.apply(None, LineOp::BreakOff, &[])
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(hang) = self.bus.hang_time(&self.path) {
            std::thread::sleep(hang);
        }
        self.apply(Some(LineStep::Write), LineOp::Write(bytes.len()), bytes)
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        let path = std::mem::take(&mut self.path);
        self.bus.release(&path)
    }
}

struct LoopbackMemory {
    bus: LoopbackBus,
    path: String,
}

impl Drop for LoopbackMemory {
    fn drop(&mut self) {
        if !self.path.is_empty() {
            let _ = self.bus.release(&self.path);
        }
    }
}

impl LoopbackMemory {
    fn with_memory<T>(
        &self,
        step: Option<LineStep>,
        f: impl FnOnce(&mut Option<MemoryRegion>, &mut usize, &mut Vec<u8>, &mut Vec<u8>) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut state = self.bus.state.lock();
        let node = state.attached(&self.path)?;
        if let (Some(step), Some(failing)) = (step, node.faults.fail_step) {
            if step == failing {
                return Err(injected(step));
            }
        }
        match &mut node.kind {
            NodeKind::Memory {
                region,
                position,
                tx,
                rx,
                ..
            } => f(region, position, tx, rx),
            NodeKind::Serial { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a memory interface",
            )),
        }
    }
}

fn selected<'a>(
    region: &Option<MemoryRegion>,
    tx: &'a mut Vec<u8>,
    rx: &'a mut Vec<u8>,
) -> io::Result<&'a mut Vec<u8>> {
    match region {
        Some(MemoryRegion::Transmit) => Ok(tx),
        Some(MemoryRegion::Receive) => Ok(rx),
        None => Err(io::Error::new(io::ErrorKind::InvalidInput, "no memory map selected")),
    }
}

fn out_of_memory() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "offset past end of memory")
}

impl MemoryPort for LoopbackMemory {
    fn set_memory_map(&mut self, selection: MemoryRegion) -> io::Result<()> {
        self.with_memory(None, |region, _, _, _| {
            *region = Some(selection);
            Ok(())
        })
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.with_memory(None, |_, position, _, _| {
            *position = usize::try_from(offset).map_err(|_| out_of_memory())?;
            Ok(())
        })
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.with_memory(None, |region, position, tx, rx| {
            let memory = selected(region, tx, rx)?;
            let value = *memory.get(*position).ok_or_else(out_of_memory)?;
            *position += 1;
            Ok(value)
        })
    }

    fn write_byte(&mut self, value: u8) -> io::Result<()> {
        self.with_memory(Some(LineStep::Write), |region, position, tx, rx| {
            let memory = selected(region, tx, rx)?;
            let slot = memory.get_mut(*position).ok_or_else(out_of_memory)?;
            *slot = value;
            *position += 1;
            Ok(())
        })
    }

    fn device_type(&mut self) -> io::Result<i32> {
        let mut state = self.bus.state.lock();
        let node = state.attached(&self.path)?;
        match node.kind {
            NodeKind::Memory {
                device_type: Some(raw),
                ..
            } => Ok(raw),
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "type query failed")),
        }
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        let path = std::mem::take(&mut self.path);
        self.bus.release(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_path_is_not_found() {
        let bus = LoopbackBus::new();
        let err = LineConnector::connect(&bus, "loop://serial/9", Duration::ZERO).err();
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    }

    #[test]
    fn test_second_open_is_refused() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let _first = LineConnector::connect(&bus, &path, Duration::ZERO).unwrap();
        assert!(LineConnector::connect(&bus, &path, Duration::ZERO).is_err());
    }

    #[test]
    fn test_frames_assembled_from_break_and_writes() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let mut line = LineConnector::connect(&bus, &path, Duration::ZERO).unwrap();

        let mut frame = vec![0u8; FRAME_SIZE];
        frame[3] = 9;
        line.set_break().unwrap();
        line.clear_break().unwrap();
        line.write_all(&frame[..1]).unwrap();
        assert_eq!(bus.frame_count(&path), 0);
        line.write_all(&frame[1..]).unwrap();

        assert_eq!(bus.frame_count(&path), 1);
        assert_eq!(bus.last_frame(&path), Some(frame));
    }

    #[test]
    fn test_unplug_breaks_open_handles_and_hides_device() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let mut line = LineConnector::connect(&bus, &path, Duration::ZERO).unwrap();

        bus.unplug(&path);
        let err = line.write_all(&[0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(bus.scan().is_empty());
    }

    #[test]
    fn test_memory_requires_map_selection() {
        let bus = LoopbackBus::new();
        let path = bus.add_memory(Some(1));
        let mut port = MemoryConnector::connect(&bus, &path).unwrap();

        assert!(port.write_byte(1).is_err());
        port.set_memory_map(MemoryRegion::Transmit).unwrap();
        port.seek(511).unwrap();
        port.write_byte(77).unwrap();
        assert!(port.write_byte(78).is_err());
        assert_eq!(bus.memory(&path)[511], 77);
    }

    #[test]
    fn test_dropped_handle_releases_device() {
        let bus = LoopbackBus::new();
        let serial = bus.add_serial("Loopback", None);
        let memory = bus.add_memory(Some(1));

        let line = LineConnector::connect(&bus, &serial, Duration::ZERO).unwrap();
        let port = MemoryConnector::connect(&bus, &memory).unwrap();
        assert!(bus.is_held(&serial) && bus.is_held(&memory));

        drop(line);
        drop(port);
        assert!(!bus.is_held(&serial));
        assert!(!bus.is_held(&memory));
        assert!(LineConnector::connect(&bus, &serial, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_closed_handle_releases_once() {
        let bus = LoopbackBus::new();
        let path = bus.add_serial("Loopback", None);
        let line = LineConnector::connect(&bus, &path, Duration::ZERO).unwrap();

        line.close().unwrap();
        let closes = bus.ops(&path).iter().filter(|op| **op == LineOp::Close).count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_pro_widget_scanned_as_pro_link() {
        let bus = LoopbackBus::new();
        bus.add_serial("DMX USB PRO", Some("EN1"));
        assert!(matches!(bus.scan()[0].link, DeviceLink::EnttecPro(_)));
    }

    #[test]
    fn test_scan_reports_devices_in_plug_order() {
        let bus = LoopbackBus::with_serial_devices(2);
        bus.add_memory(Some(4));

        let found = bus.scan();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].serial_number.as_deref(), Some("LB000001"));
        assert_eq!(found[2].path, "loop://usbdmx/0");
    }
}
