use std::path::PathBuf;
use thiserror::Error;

/// Failure categories of a metadata ingestion run.
///
/// Everything except `Schema` and `Config` is scoped to a single file and
/// never stops the walk.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Unreadable file or stream
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image container could not be decoded
    #[error("Malformed image {}: {reason}", path.display())]
    Image { path: PathBuf, reason: String },

    /// Table or column setup failed; the run cannot continue safely
    #[error("Schema error: {0}")]
    Schema(String),

    /// Query, insert or update failure
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// More than one stored row for one content hash
    #[error("Invariant violation: {rows} rows share SHA256 {sha256}")]
    InvariantViolation { sha256: String, rows: u64 },

    /// The scorer could not produce a probability at all
    #[error("NSFW probability unavailable for {}: {reason}", path.display())]
    ScoreUnavailable { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExtractError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExtractError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractError>;
