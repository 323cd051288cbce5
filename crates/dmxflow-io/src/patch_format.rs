//! On-disk format of a saved universe patch.
//!
//! A patch file wraps the [`PatchMap`] with a format version and timestamps.
//! RON and JSON are supported; the file extension selects the format.

use crate::error::{IoError, Result};
use chrono::{DateTime, Utc};
use dmxflow_core::PatchMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Current patch file format version.
pub const PATCH_FILE_VERSION: &str = "1.0.0";

/// Maximum accepted patch file size (1 MB).
pub const MAX_PATCH_FILE_SIZE: u64 = 1024 * 1024;

/// Serialization format of a patch file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    /// Rusty Object Notation (`.ron`, `.dmxpatch`)
    Ron,
    /// JSON (`.json`)
    Json,
}

impl PatchFormat {
    /// Format for a path, defaulting to RON when there is no extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("ron");

        match extension {
            "json" => Ok(Self::Json),
            "ron" | "dmxpatch" => Ok(Self::Ron),
            other => Err(IoError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Top-level structure of a saved patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchFile {
    /// Format version.
    pub version: String,
    /// Timestamps.
    pub metadata: PatchMetadata,
    /// Universe routing.
    pub patch: PatchMap,
}

/// Metadata stored alongside the patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchMetadata {
    /// When the patch file was first written.
    pub created_at: DateTime<Utc>,
    /// Last save.
    pub modified_at: DateTime<Utc>,
}

impl PatchFile {
    /// Wrap a patch map, stamping both timestamps with the current time.
    pub fn new(patch: PatchMap) -> Self {
        let now = Utc::now();
        Self {
            version: PATCH_FILE_VERSION.to_string(),
            metadata: PatchMetadata {
                created_at: now,
                modified_at: now,
            },
            patch,
        }
    }

    /// Read a patch file; the format follows the extension.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_limit(path, MAX_PATCH_FILE_SIZE)
    }

    fn load_with_limit(path: &Path, limit: u64) -> Result<Self> {
        let format = PatchFormat::from_path(path)?;

        let size = fs::metadata(path)?.len();
        if size > limit {
            return Err(IoError::FileTooLarge { size, limit });
        }

        let content = fs::read_to_string(path)?;
        let file = match format {
            PatchFormat::Json => serde_json::from_str(&content)?,
            PatchFormat::Ron => ron::from_str(&content)?,
        };
        Ok(file)
    }

    /// Write the patch file and bump `modified_at`.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let format = PatchFormat::from_path(path)?;
        self.metadata.modified_at = Utc::now();

        match format {
            PatchFormat::Json => {
                let file = File::create(path)?;
                serde_json::to_writer_pretty(file, self)?;
            }
            PatchFormat::Ron => {
                let s = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
                let mut file = File::create(path)?;
                file.write_all(s.as_bytes())?;
            }
        }

        tracing::debug!("Saved patch to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(PatchFormat::from_path(Path::new("a.json")).unwrap(), PatchFormat::Json);
        assert_eq!(PatchFormat::from_path(Path::new("a.ron")).unwrap(), PatchFormat::Ron);
        assert_eq!(PatchFormat::from_path(Path::new("patch")).unwrap(), PatchFormat::Ron);
        assert!(matches!(
            PatchFormat::from_path(Path::new("a.txt")),
            Err(IoError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_created_at_survives_resave() {
        let mut patch_file = PatchFile::new(PatchMap::new(2));
        let created = patch_file.metadata.created_at;

        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("ron");
        std::thread::sleep(std::time::Duration::from_millis(10));
        patch_file.save(&path).unwrap();

        let loaded = PatchFile::load(&path).unwrap();
        assert_eq!(loaded.metadata.created_at, created);
        assert!(loaded.metadata.modified_at > created);
    }

    #[test]
    fn test_load_file_too_large() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("json");
        fs::write(&path, vec![b' '; 1024]).unwrap();

        let result = PatchFile::load_with_limit(&path, 500);
        assert!(matches!(
            result,
            Err(IoError::FileTooLarge {
                size: 1024,
                limit: 500
            })
        ));
    }
}
