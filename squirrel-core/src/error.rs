//! Error types for squirrel operations

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SquirrelError {
    #[error("cannot load file {}: {message}", .path.display())]
    FileLoad { path: PathBuf, message: String },

    #[error("format detection failed for file: {}", .0.display())]
    FormatDetectionFailed(PathBuf),

    #[error("unknown format: {0}")]
    UnknownFormat(String),

    #[error("duplicate (segment, element) key for virtual file: {0}")]
    UniqueKeyRequired(String),

    #[error(
        "persistent selections require an explicitly chosen database; \
         using the shared default database would pollute its namespace"
    )]
    PersistentRequiresDatabase,

    #[error("invalid persistent selection name: {0}")]
    InvalidSelectionName(String),

    #[error("a segment filter can only be used when loading from a single file")]
    SegmentRequiresSingleFile,

    #[error("skip_unchanged requires a database")]
    SkipUnchangedRequiresDatabase,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SquirrelError {
    /// Build a `FileLoad` error from anything displayable.
    pub fn file_load(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::FileLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error is recoverable per file during batch ingest.
    ///
    /// A failed format detection is a failed load; an explicitly requested
    /// unknown format is a caller mistake and propagates.
    pub fn is_file_load(&self) -> bool {
        matches!(self, Self::FileLoad { .. } | Self::FormatDetectionFailed(_))
    }
}
