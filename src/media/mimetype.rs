use std::path::Path;

use crate::error::{ExtractError, Result};

pub const PNG: &str = "image/png";
const UNKNOWN: &str = "application/octet-stream";

pub fn detect_mimetype(path: &Path) -> Result<String> {
    let kind = infer::get_from_path(path).map_err(|e| ExtractError::io(path, e))?;

    match kind {
        Some(k) => Ok(k.mime_type().to_string()),
        None => Ok(UNKNOWN.to_string()),
    }
}
