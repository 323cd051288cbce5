//! DMXFlow IO - Patch persistence
//!
//! Saves and loads the universe patch as versioned RON or JSON files.

#![warn(missing_docs)]

/// Error types
pub mod error;
/// Patch file format
pub mod patch_format;

pub use error::{IoError, Result};
pub use patch_format::{PatchFile, PatchFormat, PatchMetadata, MAX_PATCH_FILE_SIZE, PATCH_FILE_VERSION};

use dmxflow_core::PatchMap;
use std::path::Path;

/// Save a patch map to `path`, format chosen by extension.
pub fn save_patch(patch: &PatchMap, path: &Path) -> Result<()> {
    PatchFile::new(patch.clone()).save(path)
}

/// Load a patch map, rejecting files written by another format version.
pub fn load_patch(path: &Path) -> Result<PatchMap> {
    let patch_file = PatchFile::load(path)?;

    if patch_file.version != PATCH_FILE_VERSION {
        return Err(IoError::VersionMismatch {
            expected: PATCH_FILE_VERSION.to_string(),
            found: patch_file.version,
        });
    }

    Ok(patch_file.patch)
}
