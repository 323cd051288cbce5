//! Universe patch
//!
//! Maps each logical universe to a plugin output. Unpatched universes are
//! persisted with the [`PLUGIN_NONE`] marker instead of being left out, so a
//! saved patch always lists every universe.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::{CoreError, Result};

/// Plugin name stored for an unpatched universe
pub const PLUGIN_NONE: &str = "None";

/// Patch entry for one universe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniversePatch {
    /// Universe number (0-based)
    pub universe: u32,
    /// Plugin name, `None` when unpatched
    #[serde(with = "plugin_name")]
    pub plugin: Option<String>,
    /// Output index inside the plugin
    #[serde(default)]
    pub output: Option<u32>,
}

impl UniversePatch {
    /// Create an unpatched entry
    pub fn unpatched(universe: u32) -> Self {
        Self {
            universe,
            plugin: None,
            output: None,
        }
    }

    /// Whether this universe routes anywhere
    pub fn is_patched(&self) -> bool {
        self.plugin.is_some() && self.output.is_some()
    }
}

mod plugin_name {
    use super::PLUGIN_NONE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(plugin: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(plugin.as_deref().unwrap_or(PLUGIN_NONE))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let name = String::deserialize(d)?;
        if name.is_empty() || name == PLUGIN_NONE {
            Ok(None)
        } else {
            Ok(Some(name))
        }
    }
}

/// Fixed-size table of universe patches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMap {
    patches: Vec<UniversePatch>,
}

impl Default for PatchMap {
    fn default() -> Self {
        Self::new(4)
    }
}

impl PatchMap {
    /// Create a patch with `universes` unpatched entries
    pub fn new(universes: usize) -> Self {
        Self {
            patches: (0..universes as u32).map(UniversePatch::unpatched).collect(),
        }
    }

    /// Number of universes
    pub fn universes(&self) -> usize {
        self.patches.len()
    }

    /// Patch entry for a universe
    pub fn get(&self, universe: u32) -> Option<&UniversePatch> {
        self.patches.get(universe as usize)
    }

    /// Patch a universe to a plugin output; `None` unpatches it
    pub fn set(&mut self, universe: u32, plugin: Option<&str>, output: Option<u32>) -> Result<()> {
        let count = self.patches.len();
        let entry = self
            .patches
            .get_mut(universe as usize)
            .ok_or(CoreError::UniverseOutOfRange { universe, count })?;

        entry.plugin = plugin.map(str::to_string);
        entry.output = if entry.plugin.is_some() { output } else { None };
        Ok(())
    }

    /// Unpatch a universe
    pub fn clear(&mut self, universe: u32) -> Result<()> {
        self.set(universe, None, None)
    }

    /// Iterate over all entries in universe order
    pub fn iter(&self) -> impl Iterator<Item = &UniversePatch> {
        self.patches.iter()
    }

    /// Universes currently routed to the named plugin
    pub fn universes_for_plugin<'a>(&'a self, plugin: &'a str) -> impl Iterator<Item = u32> + 'a {
        self.patches
            .iter()
            .filter(move |p| p.plugin.as_deref() == Some(plugin))
            .map(|p| p.universe)
    }

    /// Copy entries from `entries` into this map.
    ///
    /// Entries for universes outside the map are skipped and returned.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = UniversePatch>) -> Vec<UniversePatch> {
        let mut rejected = Vec::new();
        for entry in entries {
            match self.patches.get_mut(entry.universe as usize) {
                Some(slot) => *slot = entry,
                None => {
                    tracing::warn!(
                        "Universe number out of bounds: {}. Unable to set patch.",
                        entry.universe
                    );
                    rejected.push(entry);
                }
            }
        }
        rejected
    }

    /// Plain-text mapping table, one row per universe
    pub fn status_text(&self) -> String {
        let mut info = String::from("Output mapping status\n");
        for patch in &self.patches {
            let plugin = patch.plugin.as_deref().unwrap_or(PLUGIN_NONE);
            let output = match (patch.plugin.as_ref(), patch.output) {
                (Some(_), Some(output)) => format!("Output {}", output + 1),
                _ => PLUGIN_NONE.to_string(),
            };
            let _ = writeln!(
                info,
                "Universe {:<3} {:<32} {}",
                patch.universe + 1,
                plugin,
                output
            );
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_map_is_unpatched() {
        let map = PatchMap::new(4);
        assert_eq!(map.universes(), 4);
        assert!(map.iter().all(|p| !p.is_patched()));
        assert_eq!(map.get(3).map(|p| p.universe), Some(3));
        assert!(map.get(4).is_none());
    }

    #[test]
    fn test_set_and_clear() {
        let mut map = PatchMap::new(2);
        map.set(1, Some("USB DMX Output"), Some(0)).unwrap();
        assert!(map.get(1).unwrap().is_patched());

        map.clear(1).unwrap();
        assert_eq!(map.get(1), Some(&UniversePatch::unpatched(1)));
    }

    #[test]
    fn test_set_without_plugin_drops_output() {
        let mut map = PatchMap::new(1);
        map.set(0, None, Some(3)).unwrap();
        assert_eq!(map.get(0).unwrap().output, None);
    }

    #[test]
    fn test_set_out_of_range() {
        let mut map = PatchMap::new(2);
        let err = map.set(2, Some("x"), Some(0)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UniverseOutOfRange {
                universe: 2,
                count: 2
            }
        ));
    }

    #[test]
    fn test_merge_skips_unknown_universes() {
        let mut map = PatchMap::new(2);
        let rejected = map.merge(vec![
            UniversePatch {
                universe: 0,
                plugin: Some("A".into()),
                output: Some(1),
            },
            UniversePatch {
                universe: 7,
                plugin: Some("B".into()),
                output: Some(0),
            },
        ]);

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].universe, 7);
        assert_eq!(map.get(0).unwrap().plugin.as_deref(), Some("A"));
    }

    #[test]
    fn test_universes_for_plugin() {
        let mut map = PatchMap::new(3);
        map.set(0, Some("A"), Some(0)).unwrap();
        map.set(2, Some("A"), Some(1)).unwrap();
        let found: Vec<u32> = map.universes_for_plugin("A").collect();
        assert_eq!(found, vec![0, 2]);
    }

    #[test]
    fn test_status_text_lists_every_universe() {
        let mut map = PatchMap::new(2);
        map.set(0, Some("USB DMX Output"), Some(0)).unwrap();
        let text = map.status_text();

        assert!(text.contains("Universe 1"));
        assert!(text.contains("USB DMX Output"));
        assert!(text.contains("Output 1"));
        assert!(text.contains("Universe 2"));
        assert!(text.contains(PLUGIN_NONE));
    }
}
