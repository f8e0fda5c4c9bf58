use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// The file could not be decoded; the record is kept without a score.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The model produced no probability at all; the record is dropped.
    #[error("probability unavailable: {0}")]
    Unavailable(String),
}

/// Optional NSFW classifier. Returns the probability in `0.0..=1.0`.
pub trait NsfwScorer: Send + Sync {
    fn score(&self, path: &Path) -> Result<f32, ScoreError>;
}
