//! Universe router
//!
//! Owns the registered plugins and the universe patch, and forwards channel
//! data written per universe to the patched plugin output.

use tracing::{info, warn};

use dmxflow_core::{OutputConfig, PatchMap, UniversePatch, PLUGIN_NONE};

use crate::error::{OutputError, Result};
use crate::ids::OutputId;
use crate::plugin::OutputPlugin;

/// Routes universes to plugin outputs
pub struct OutputRouter {
    plugins: Vec<Box<dyn OutputPlugin>>,
    patch: PatchMap,
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new(PatchMap::default().universes())
    }
}

impl OutputRouter {
    /// Router with `universes` unpatched universes
    pub fn new(universes: usize) -> Self {
        Self {
            plugins: Vec::new(),
            patch: PatchMap::new(universes),
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.universes)
    }

    /// Register a plugin. Returns false when one with the same name exists.
    pub fn append_plugin(&mut self, plugin: Box<dyn OutputPlugin>) -> bool {
        if self.plugin(plugin.name()).is_some() {
            warn!("Output plugin {} is already loaded", plugin.name());
            return false;
        }
        info!("Loaded output plugin: {}", plugin.name());
        self.plugins.push(plugin);
        true
    }

    pub fn plugin(&self, name: &str) -> Option<&dyn OutputPlugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| &**p)
    }

    fn plugin_mut(&mut self, name: &str) -> Option<&mut Box<dyn OutputPlugin>> {
        self.plugins.iter_mut().find(|p| p.name() == name)
    }

    pub fn universes(&self) -> usize {
        self.patch.universes()
    }

    /// Route `universe` to `output` of the named plugin.
    ///
    /// An unknown plugin name (or `"None"`) unpatches the universe. The
    /// output is opened here; open failures are logged and the patch is
    /// kept, so the universe starts working once the hardware returns.
    pub fn set_patch(&mut self, universe: u32, plugin_name: &str, output: OutputId) -> Result<()> {
        let previous = self
            .patch
            .get(universe)
            .cloned()
            .ok_or_else(|| {
                OutputError::InvalidParameter(format!(
                    "universe {} out of bounds (0..{})",
                    universe,
                    self.patch.universes()
                ))
            })?;

        let known = plugin_name != PLUGIN_NONE && self.plugin(plugin_name).is_some();
        if known {
            self.patch.set(universe, Some(plugin_name), Some(output))?;
        } else {
            if plugin_name != PLUGIN_NONE {
                warn!("No such output plugin: {}; universe {} unpatched", plugin_name, universe + 1);
            }
            self.patch.clear(universe)?;
        }

        self.release_if_unused(&previous);
        if known {
            self.open_patched(plugin_name, output);
        }
        Ok(())
    }

    fn open_patched(&mut self, plugin_name: &str, output: OutputId) {
        if let Some(plugin) = self.plugin_mut(plugin_name) {
            if let Err(e) = plugin.open(output) {
                warn!("Unable to open {} output {}: {}", plugin_name, output + 1, e);
            }
        }
    }

    /// Close the output behind `entry` unless another universe still uses it
    fn release_if_unused(&mut self, entry: &UniversePatch) {
        let (Some(name), Some(output)) = (entry.plugin.as_deref(), entry.output) else {
            return;
        };
        let still_used = self
            .patch
            .iter()
            .any(|p| p.plugin.as_deref() == Some(name) && p.output == Some(output));
        if still_used {
            return;
        }
        if let Some(plugin) = self.plugin_mut(name) {
            if let Err(e) = plugin.close(output) {
                warn!("Unable to close {} output {}: {}", name, output + 1, e);
            }
        }
    }

    fn route(&self, universe: u32) -> Option<(&dyn OutputPlugin, OutputId)> {
        let entry = self.patch.get(universe)?;
        let output = entry.output?;
        let plugin = self.plugin(entry.plugin.as_deref()?)?;
        Some((plugin, output))
    }

    /// Set one channel of a universe; unpatched universes ignore writes
    pub fn write_channel(&self, universe: u32, channel: u32, value: u8) {
        if let Some((plugin, output)) = self.route(universe) {
            plugin.write_channel(output, channel, value);
        }
    }

    pub fn write_range(&self, universe: u32, address: u32, values: &[u8]) {
        if let Some((plugin, output)) = self.route(universe) {
            plugin.write_range(output, address, values);
        }
    }

    pub fn read_channel(&self, universe: u32, channel: u32) -> u8 {
        match self.route(universe) {
            Some((plugin, output)) => plugin.read_channel(output, channel),
            None => 0,
        }
    }

    pub fn read_range(&self, universe: u32, address: u32, out: &mut [u8]) {
        match self.route(universe) {
            Some((plugin, output)) => plugin.read_range(output, address, out),
            None => out.fill(0),
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Output descriptors of a plugin; empty for unknown names
    pub fn plugin_outputs(&self, name: &str) -> Vec<String> {
        self.plugin(name)
            .map(|p| p.outputs().collect())
            .unwrap_or_default()
    }

    /// Plugin info text, or the patch table when no plugin is named
    pub fn plugin_status(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => match self.plugin(name) {
                Some(plugin) => plugin.info_text(None),
                None => format!("No such output plugin: {}\n", name),
            },
            None => self.patch.status_text(),
        }
    }

    /// Rescan a plugin's hardware and reopen every output still patched to it
    pub fn rescan_plugin(&mut self, name: &str) {
        let mut outputs: Vec<OutputId> = self
            .patch
            .universes_for_plugin(name)
            .filter_map(|u| self.patch.get(u).and_then(|p| p.output))
            .collect();
        outputs.sort_unstable();
        outputs.dedup();

        let Some(plugin) = self.plugin_mut(name) else {
            return;
        };
        plugin.rescan_devices();
        for output in outputs {
            if let Err(e) = plugin.open(output) {
                warn!("Unable to reopen {} output {}: {}", name, output + 1, e);
            }
        }
    }

    pub fn patch_map(&self) -> &PatchMap {
        &self.patch
    }

    /// Replace the patch with entries from a saved map and open the outputs
    /// it routes to. Entries for universes this router lacks are returned.
    pub fn load_patch_map(&mut self, map: PatchMap) -> Vec<UniversePatch> {
        let old: Vec<UniversePatch> = self.patch.iter().cloned().collect();
        self.patch = PatchMap::new(self.patch.universes());
        for entry in &old {
            self.release_if_unused(entry);
        }

        let rejected = self.patch.merge(map.iter().cloned());
        let entries: Vec<UniversePatch> = self.patch.iter().cloned().collect();
        for entry in entries {
            let (Some(name), Some(output)) = (entry.plugin, entry.output) else {
                continue;
            };
            if self.plugin(&name).is_some() {
                self.open_patched(&name, output);
            } else {
                warn!("Patched plugin {} is not loaded; universe {} unpatched", name, entry.universe + 1);
                // universe index came from this map, so clearing cannot fail
                let _ = self.patch.clear(entry.universe);
            }
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::UsbDmxOutput;
    use crate::transport::loopback::LoopbackBus;
    use std::sync::Arc;

    fn router(bus: &LoopbackBus) -> OutputRouter {
        let config = OutputConfig {
            frame_interval_ms: 2,
            settle_delay_ms: 0,
            ..Default::default()
        };
        let mut router = OutputRouter::from_config(&config);
        router.append_plugin(Box::new(UsbDmxOutput::with_probes(
            config,
            vec![Arc::new(bus.clone())],
        )));
        router
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let bus = LoopbackBus::new();
        let mut router = router(&bus);
        let again = UsbDmxOutput::with_probes(OutputConfig::default(), Vec::new());
        assert!(!router.append_plugin(Box::new(again)));
        assert_eq!(router.plugin_names(), vec![UsbDmxOutput::NAME.to_string()]);
    }

    #[test]
    fn test_set_patch_opens_output() {
        let bus = LoopbackBus::with_serial_devices(1);
        let mut router = router(&bus);

        router.set_patch(0, UsbDmxOutput::NAME, 0).unwrap();
        assert!(router.plugin(UsbDmxOutput::NAME).unwrap().is_open(0));

        router.write_channel(0, 0, 12);
        assert_eq!(router.read_channel(0, 0), 12);
    }

    #[test]
    fn test_unknown_plugin_unpatches() {
        let bus = LoopbackBus::with_serial_devices(1);
        let mut router = router(&bus);
        router.set_patch(0, UsbDmxOutput::NAME, 0).unwrap();

        router.set_patch(0, "Art-Net", 0).unwrap();
        assert!(!router.patch_map().get(0).unwrap().is_patched());
        assert!(!router.plugin(UsbDmxOutput::NAME).unwrap().is_open(0));
    }

    #[test]
    fn test_out_of_bounds_universe() {
        let bus = LoopbackBus::new();
        let mut router = router(&bus);
        assert!(matches!(
            router.set_patch(4, UsbDmxOutput::NAME, 0),
            Err(OutputError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unpatched_universe_ignores_writes() {
        let bus = LoopbackBus::with_serial_devices(1);
        let router = router(&bus);
        router.write_channel(1, 0, 255);
        assert_eq!(router.read_channel(1, 0), 0);
    }

    #[test]
    fn test_shared_output_stays_open() {
        let bus = LoopbackBus::with_serial_devices(1);
        let mut router = router(&bus);
        router.set_patch(0, UsbDmxOutput::NAME, 0).unwrap();
        router.set_patch(1, UsbDmxOutput::NAME, 0).unwrap();

        router.set_patch(0, PLUGIN_NONE, 0).unwrap();
        assert!(router.plugin(UsbDmxOutput::NAME).unwrap().is_open(0));
    }

    #[test]
    fn test_load_patch_map_drops_unknown_plugins() {
        let bus = LoopbackBus::with_serial_devices(1);
        let mut router = router(&bus);

        let mut saved = PatchMap::new(4);
        saved.set(0, Some(UsbDmxOutput::NAME), Some(0)).unwrap();
        saved.set(1, Some("Art-Net"), Some(0)).unwrap();

        let rejected = router.load_patch_map(saved);
        assert!(rejected.is_empty());
        assert!(router.patch_map().get(0).unwrap().is_patched());
        assert!(!router.patch_map().get(1).unwrap().is_patched());
        assert!(router.plugin(UsbDmxOutput::NAME).unwrap().is_open(0));
    }

    #[test]
    fn test_rescan_reopens_patched_outputs() {
        let bus = LoopbackBus::with_serial_devices(2);
        let mut router = router(&bus);
        router.set_patch(0, UsbDmxOutput::NAME, 1).unwrap();
        router.set_patch(2, UsbDmxOutput::NAME, 1).unwrap();

        router.rescan_plugin(UsbDmxOutput::NAME);
        let plugin = router.plugin(UsbDmxOutput::NAME).unwrap();
        assert!(plugin.is_open(1));
        assert!(!plugin.is_open(0));

        router.write_channel(2, 7, 99);
        assert_eq!(router.read_channel(0, 7), 99);
    }

    #[test]
    fn test_plugin_status() {
        let bus = LoopbackBus::new();
        let router = router(&bus);
        assert!(router.plugin_status(None).contains("Universe 1"));
        assert!(router
            .plugin_status(Some(UsbDmxOutput::NAME))
            .contains("No devices found"));
        assert!(router.plugin_status(Some("x")).contains("No such"));
    }
}
