//! Hardware discovery
//!
//! A [`DeviceProbe`] lists candidate interfaces of one hardware family. The
//! plugin runs every configured probe on rescan and hands each hit to the
//! [`TransportFactory`], which builds the matching transport driver.

use std::path::PathBuf;
use std::sync::Arc;

use dmxflow_core::{OutputConfig, SerialProbeConfig, UsbDmxProbeConfig};

use crate::transport::{
    DmxTransport, HardwareKind, LineConnector, LineSettings, MemoryConnector,
    SerialBridgeTransport, SerialFraming, SystemLineConnector, UsbDmxTransport,
};

/// How to reach a discovered interface
#[derive(Clone)]
pub enum DeviceLink {
    /// Plain serial bridge, framed with a software break
    Serial(Arc<dyn LineConnector>),
    /// Serial bridge fronting an Enttec Pro DMX engine
    EnttecPro(Arc<dyn LineConnector>),
    Memory(Arc<dyn MemoryConnector>),
}

/// Link for a serial bridge, classified by its USB product string.
///
/// Pro widgets report "DMX USB PRO"; anything without a standalone "pro"
/// word is treated as a plain bridge.
pub fn serial_link(description: &str, connector: Arc<dyn LineConnector>) -> DeviceLink {
    let is_pro = description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case("pro"));
    if is_pro {
        DeviceLink::EnttecPro(connector)
    } else {
        DeviceLink::Serial(connector)
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial(_) => f.write_str("Serial"),
            Self::EnttecPro(_) => f.write_str("EnttecPro"),
            Self::Memory(_) => f.write_str("Memory"),
        }
    }
}

/// One interface found by a probe
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// System path or virtual identifier
    pub path: String,
    /// Product description as reported by the USB descriptor
    pub description: String,
    pub serial_number: Option<String>,
    pub link: DeviceLink,
}

impl DiscoveredDevice {
    pub fn kind(&self) -> HardwareKind {
        match self.link {
            DeviceLink::Serial(_) => HardwareKind::SerialBridge,
            DeviceLink::EnttecPro(_) => HardwareKind::EnttecPro,
            DeviceLink::Memory(_) => HardwareKind::UsbDmx,
        }
    }

    /// Description with the serial number appended when known
    pub fn label(&self) -> String {
        match &self.serial_number {
            Some(serial) => format!("{} (S/N: {})", self.description, serial),
            None => self.description.clone(),
        }
    }
}

/// Enumerates interfaces of one hardware family
pub trait DeviceProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Interfaces currently present, in a stable order
    fn scan(&self) -> Vec<DiscoveredDevice>;
}

/// Finds USB-serial bridges by USB vendor id
pub struct SerialBridgeProbe {
    vendor_id: u16,
    connector: Arc<dyn LineConnector>,
}

impl SerialBridgeProbe {
    pub fn new(config: &SerialProbeConfig) -> Self {
        Self {
            vendor_id: config.vendor_id,
            connector: Arc::new(SystemLineConnector),
        }
    }
}

impl DeviceProbe for SerialBridgeProbe {
    fn name(&self) -> &str {
        "serial bridge"
    }

    fn scan(&self) -> Vec<DiscoveredDevice> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!("Serial port enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let mut found: Vec<DiscoveredDevice> = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) if usb.vid == self.vendor_id => {
                    let description = usb.product.unwrap_or_else(|| "USB serial".to_string());
                    Some(DiscoveredDevice {
                        path: port.port_name,
                        link: serial_link(&description, self.connector.clone()),
                        description,
                        serial_number: usb.serial_number,
                    })
                }
                _ => None,
            })
            .collect();

        found.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!("Found {} serial bridge(s)", found.len());
        found
    }
}

/// Finds USB-DMX device nodes such as `/dev/usbdmx0`
pub struct UsbDmxProbe {
    device_dir: PathBuf,
    prefix: String,
    connector: Option<Arc<dyn MemoryConnector>>,
}

impl UsbDmxProbe {
    pub fn new(config: &UsbDmxProbeConfig) -> Self {
        #[cfg(unix)]
        let connector: Option<Arc<dyn MemoryConnector>> =
            Some(Arc::new(crate::transport::SystemMemoryConnector));
        #[cfg(not(unix))]
        let connector: Option<Arc<dyn MemoryConnector>> = None;

        Self {
            device_dir: config.device_dir.clone(),
            prefix: config.device_prefix.clone(),
            connector,
        }
    }
}

impl DeviceProbe for UsbDmxProbe {
    fn name(&self) -> &str {
        "USB-DMX"
    }

    fn scan(&self) -> Vec<DiscoveredDevice> {
        let Some(connector) = &self.connector else {
            return Vec::new();
        };

        let entries = match std::fs::read_dir(&self.device_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot list {}: {}", self.device_dir.display(), e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&self.prefix))
            })
            .collect();
        paths.sort();

        paths
            .into_iter()
            .map(|path| DiscoveredDevice {
                path: path.to_string_lossy().into_owned(),
                description: String::new(),
                serial_number: None,
                link: DeviceLink::Memory(connector.clone()),
            })
            .collect()
    }
}

/// Probes enabled by the output configuration
pub fn system_probes(config: &OutputConfig) -> Vec<Arc<dyn DeviceProbe>> {
    let mut probes: Vec<Arc<dyn DeviceProbe>> = Vec::new();
    if config.serial.enabled {
        probes.push(Arc::new(SerialBridgeProbe::new(&config.serial)));
    }
    if config.usbdmx.enabled {
        probes.push(Arc::new(UsbDmxProbe::new(&config.usbdmx)));
    }
    probes
}

/// Builds transport drivers for discovered interfaces
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    settings: LineSettings,
}

impl TransportFactory {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            settings: LineSettings::from_config(config),
        }
    }

    pub fn build(&self, device: &DiscoveredDevice) -> Box<dyn DmxTransport> {
        match &device.link {
            DeviceLink::Serial(connector) => Box::new(SerialBridgeTransport::new(
                device.path.clone(),
                device.label(),
                self.settings,
                connector.clone(),
            )),
            DeviceLink::EnttecPro(connector) => Box::new(
                SerialBridgeTransport::new(
                    device.path.clone(),
                    device.label(),
                    self.settings,
                    connector.clone(),
                )
                .with_framing(SerialFraming::EnttecPro),
            ),
            DeviceLink::Memory(connector) => {
                Box::new(UsbDmxTransport::new(device.path.clone(), connector.clone()))
            }
        }
    }
}
