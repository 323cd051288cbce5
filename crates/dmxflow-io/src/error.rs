//! Error types for patch file I/O.

/// Result type alias for patch file operations.
pub type Result<T> = std::result::Result<T, IoError>;

/// Error type for patch file operations.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RON parse error
    #[error("RON parse error: {0}")]
    RonParse(#[from] ron::error::SpannedError),

    /// RON serialization error
    #[error("RON write error: {0}")]
    RonWrite(#[from] ron::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File extension not recognized
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// File exceeds the load limit
    #[error("File too large: {size} bytes (limit {limit} bytes)")]
    FileTooLarge {
        /// Actual file size in bytes
        size: u64,
        /// Allowed size in bytes
        limit: u64,
    },

    /// Saved with an incompatible format version
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build writes
        expected: String,
        /// Version found in the file
        found: String,
    },
}
