//! Output plugin interface and the USB DMX plugin
//!
//! A plugin exposes a list of numbered outputs. The host writes channel data
//! by `(output, channel)`; unknown outputs and out-of-range channels are
//! ignored at this boundary so a stale patch never takes the show down.

use std::sync::Arc;
use tracing::{debug, info, warn};

use dmxflow_core::{OutputConfig, CHANNELS_PER_UNIVERSE};

use crate::device::Device;
use crate::error::{OutputError, Result};
use crate::ids::{OutputId, SlotAllocator};
use crate::probe::{system_probes, DeviceProbe, TransportFactory};
use crate::worker::FrameTiming;

/// Host-facing interface of an output plugin
pub trait OutputPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Output descriptors `"<n>: <device name>"`, recomputed on every call
    fn outputs(&self) -> Box<dyn Iterator<Item = String> + '_>;

    fn output_count(&self) -> usize;

    /// Channels per output
    fn channels(&self) -> usize {
        CHANNELS_PER_UNIVERSE
    }

    /// Status of one output, or of the whole plugin for `None`
    fn info_text(&self, output: Option<OutputId>) -> String;

    fn open(&mut self, output: OutputId) -> Result<()>;

    fn close(&mut self, output: OutputId) -> Result<()>;

    fn is_open(&self, output: OutputId) -> bool;

    /// Rebuild the device list from the hardware currently present
    fn rescan_devices(&mut self);

    /// Apply new settings and rescan
    fn configure(&mut self, config: OutputConfig) -> Result<()>;

    fn write_channel(&self, output: OutputId, channel: u32, value: u8);

    fn write_range(&self, output: OutputId, address: u32, values: &[u8]);

    /// Unknown outputs read as zero
    fn read_channel(&self, output: OutputId, channel: u32) -> u8;

    fn read_range(&self, output: OutputId, address: u32, out: &mut [u8]);
}

/// Channel range check at the plugin boundary
fn span(address: u32, len: usize) -> Option<u16> {
    let end = (address as usize).checked_add(len)?;
    if address as usize >= CHANNELS_PER_UNIVERSE || end > CHANNELS_PER_UNIVERSE {
        return None;
    }
    u16::try_from(address).ok()
}

/// USB DMX interfaces: serial bridges and addressable USB-DMX widgets
pub struct UsbDmxOutput {
    config: OutputConfig,
    probes: Vec<Arc<dyn DeviceProbe>>,
    custom_probes: bool,
    factory: TransportFactory,
    allocator: SlotAllocator,
    devices: Vec<Device>,
}

impl UsbDmxOutput {
    pub const NAME: &'static str = "USB DMX Output";

    /// Plugin probing the system's serial ports and device nodes
    pub fn new(config: OutputConfig) -> Self {
        let probes = system_probes(&config);
        Self::build(config, probes, false)
    }

    /// Plugin using the given probes, e.g. a loopback bus
    pub fn with_probes(config: OutputConfig, probes: Vec<Arc<dyn DeviceProbe>>) -> Self {
        Self::build(config, probes, true)
    }

    fn build(config: OutputConfig, probes: Vec<Arc<dyn DeviceProbe>>, custom_probes: bool) -> Self {
        let mut plugin = Self {
            factory: TransportFactory::new(&config),
            allocator: SlotAllocator::new(config.max_outputs),
            config,
            probes,
            custom_probes,
            devices: Vec::new(),
        };
        plugin.rescan_devices();
        plugin
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn device(&self, output: OutputId) -> Option<&Device> {
        self.devices.get(output as usize)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn retire_devices(&mut self) {
        for device in self.devices.drain(..) {
            if let Err(e) = device.close() {
                warn!("Retiring output {}: {}", device.output() + 1, e);
            }
        }
    }
}

impl OutputPlugin for UsbDmxOutput {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn outputs(&self) -> Box<dyn Iterator<Item = String> + '_> {
        Box::new(
            self.devices
                .iter()
                .map(|d| format!("{}: {}", d.output() + 1, d.name())),
        )
    }

    fn output_count(&self) -> usize {
        self.devices.len()
    }

    fn info_text(&self, output: Option<OutputId>) -> String {
        match output {
            Some(output) => match self.device(output) {
                Some(device) => device.info_text(),
                None => format!("Output {}: not present\n", output + 1),
            },
            None => {
                let mut text = format!("{}\n", self.name());
                text.push_str(&format!("Active outputs: {}\n", self.devices.len()));
                if self.devices.is_empty() {
                    text.push_str("No devices found\n");
                }
                for device in &self.devices {
                    text.push_str(&format!(
                        "{}: {} [{}]\n",
                        device.output() + 1,
                        device.name(),
                        device.status()
                    ));
                }
                text
            }
        }
    }

    fn open(&mut self, output: OutputId) -> Result<()> {
        match self.device(output) {
            Some(device) => device.open(),
            None => Err(OutputError::InvalidParameter(format!(
                "no output {} on {}",
                output + 1,
                Self::NAME
            ))),
        }
    }

    fn close(&mut self, output: OutputId) -> Result<()> {
        match self.device(output) {
            Some(device) => device.close(),
            None => Ok(()),
        }
    }

    fn is_open(&self, output: OutputId) -> bool {
        self.device(output).is_some_and(Device::is_open)
    }

    fn rescan_devices(&mut self) {
        self.retire_devices();
        self.allocator.reset();

        let timing = FrameTiming::from_config(&self.config);
        let mut found = Vec::new();
        for probe in &self.probes {
            let hits = probe.scan();
            debug!("Probe '{}' found {} device(s)", probe.name(), hits.len());
            found.extend(hits);
        }

        for discovered in found {
            let Some(output) = self.allocator.allocate() else {
                warn!(
                    "Output limit of {} reached; ignoring {}",
                    self.allocator.capacity(),
                    discovered.path
                );
                break;
            };
            let transport = self.factory.build(&discovered);
            self.devices
                .push(Device::new(output, &discovered, transport, timing));
        }

        info!("{}: {} output(s) available", Self::NAME, self.devices.len());
    }

    fn configure(&mut self, config: OutputConfig) -> Result<()> {
        config.validate()?;

        if !self.custom_probes {
            self.probes = system_probes(&config);
        }
        self.factory = TransportFactory::new(&config);
        self.allocator = SlotAllocator::new(config.max_outputs);
        self.config = config;
        self.rescan_devices();
        Ok(())
    }

    fn write_channel(&self, output: OutputId, channel: u32, value: u8) {
        if let (Some(device), Some(channel)) = (self.device(output), span(channel, 1)) {
            device.write(channel, value);
        }
    }

    fn write_range(&self, output: OutputId, address: u32, values: &[u8]) {
        if let (Some(device), Some(address)) = (self.device(output), span(address, values.len())) {
            device.write_range(address, values);
        }
    }

    fn read_channel(&self, output: OutputId, channel: u32) -> u8 {
        match (self.device(output), span(channel, 1)) {
            (Some(device), Some(channel)) => device.read(channel),
            _ => 0,
        }
    }

    fn read_range(&self, output: OutputId, address: u32, out: &mut [u8]) {
        match (self.device(output), span(address, out.len())) {
            (Some(device), Some(address)) => device.read_range(address, out),
            _ => out.fill(0),
        }
    }
}

impl Drop for UsbDmxOutput {
    fn drop(&mut self) {
        self.retire_devices();
    }
}
