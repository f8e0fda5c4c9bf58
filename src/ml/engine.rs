use std::path::Path;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;

use crate::ml::pipeline;
use crate::ml::scorer::{NsfwScorer, ScoreError};

/// NSFW classifier backed by an ONNX export of the open NSFW model.
pub struct InferenceEngine {
    nsfw_session: Session,
}

impl InferenceEngine {
    pub fn new(nsfw_model_path: &Path) -> Result<Self> {
        // A second init in the same process is a no-op for our purposes.
        let _ = ort::init().with_name("sd-metadata-nsfw").commit();

        let nsfw_session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(nsfw_model_path)
            .with_context(|| format!("Failed to load NSFW model {}", nsfw_model_path.display()))?;

        Ok(Self { nsfw_session })
    }
}

fn unavailable(err: ort::Error) -> ScoreError {
    ScoreError::Unavailable(err.to_string())
}

impl NsfwScorer for InferenceEngine {
    fn score(&self, path: &Path) -> std::result::Result<f32, ScoreError> {
        let image = image::open(path).map_err(|e| ScoreError::Decode(e.to_string()))?;
        let input = Tensor::from_array(pipeline::normalize_for_nsfw(&image)).map_err(unavailable)?;

        let outputs = self
            .nsfw_session
            .run(ort::inputs![input].map_err(unavailable)?)
            .map_err(unavailable)?;
        let scores = outputs[0].try_extract_tensor::<f32>().map_err(unavailable)?;

        pipeline::nsfw_probability(scores.iter().copied())
            .ok_or_else(|| ScoreError::Unavailable("model returned no NSFW score".to_string()))
    }
}
