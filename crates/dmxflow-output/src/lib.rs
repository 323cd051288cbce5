//! DMXFlow Output - DMX512 over USB
//!
//! This crate drives USB DMX interfaces and routes universes to them:
//! - **Serial bridges**: FTDI-class USB-serial chips, framed in software (or
//!   as Enttec Pro messages) and refreshed by a per-device transmission thread
//! - **USB-DMX widgets**: interfaces with on-board transmit memory, written
//!   channel by channel
//! - **Loopback**: an in-memory virtual bus for tests and dry runs
//! - **Router**: universe patch with plugin/output lookup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dmxflow_core::OutputConfig;
//! use dmxflow_output::{OutputRouter, UsbDmxOutput};
//!
//! let config = OutputConfig::default();
//! let mut router = OutputRouter::from_config(&config);
//! router.append_plugin(Box::new(UsbDmxOutput::new(config)));
//! router.set_patch(0, UsbDmxOutput::NAME, 0).ok();
//! router.write_range(0, 0, &[255, 128, 0]);
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Transport drivers (serial bridge, USB-DMX, loopback)
//! - [`worker`] - Transmission loop for streaming transports
//! - [`device`] - Device lifecycle and channel buffer ownership
//! - [`probe`] - Hardware discovery and transport factory
//! - [`plugin`] - Output plugin interface
//! - [`router`] - Universe patch routing
//! - [`error`] - Error types

#![allow(missing_docs)]

/// Device lifecycle
pub mod device;
/// Error types
pub mod error;
/// Output slot numbering
pub mod ids;
/// Output plugin interface
pub mod plugin;
/// Hardware discovery
pub mod probe;
/// Universe routing
pub mod router;
/// Transport drivers
pub mod transport;
/// Transmission worker
pub mod worker;

// Re-exports
pub use device::{Device, DeviceInfo, DeviceStatus};
pub use error::{OutputError, Result};
pub use ids::{OutputId, SlotAllocator};
pub use plugin::{OutputPlugin, UsbDmxOutput};
pub use probe::{
    serial_link, system_probes, DeviceLink, DeviceProbe, DiscoveredDevice, SerialBridgeProbe,
    TransportFactory, UsbDmxProbe,
};
pub use router::OutputRouter;
pub use transport::loopback::{LineOp, LineStep, LoopbackBus, LoopbackFaults};
pub use transport::{DmxTransport, HardwareKind, SerialFraming, TransportMode};
pub use worker::{FrameTiming, WorkerStats};
