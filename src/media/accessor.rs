use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use tracing::debug;

use crate::error::{ExtractError, Result};
use crate::ingest::record::FileAttributes;
use crate::media::mimetype::{self, detect_mimetype};

/// tEXt/zTXt/iTXt keyword under which generation parameters are stored.
pub const PARAMETERS_KEYWORD: &str = "parameters";

/// Read access to an image's embedded parameter text and its filesystem
/// attributes. Pixel data is never decoded here.
pub trait MetadataAccessor: Send + Sync {
    /// The parameter blob, or an empty string when the container has none.
    fn read_parameter_blob(&self, path: &Path) -> Result<String>;

    fn read_attributes(&self, path: &Path) -> Result<FileAttributes>;
}

/// Reads PNG text chunks; other image containers yield an empty blob.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngTextAccessor;

impl MetadataAccessor for PngTextAccessor {
    fn read_parameter_blob(&self, path: &Path) -> Result<String> {
        let media_type = detect_mimetype(path)?;
        if media_type == mimetype::PNG {
            return read_png_parameters(path);
        }
        if media_type.starts_with("image/") {
            debug!(path = %path.display(), %media_type, "No text chunk support for container");
            return Ok(String::new());
        }
        Err(ExtractError::Image {
            path: path.to_path_buf(),
            reason: format!("not an image ({media_type})"),
        })
    }

    fn read_attributes(&self, path: &Path) -> Result<FileAttributes> {
        let metadata = fs::metadata(path).map_err(|e| ExtractError::io(path, e))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|e| ExtractError::io(path, e))?;

        let base_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(FileAttributes {
            base_name,
            directory,
            size: metadata.len(),
            created,
        })
    }
}

fn read_png_parameters(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    let malformed = |e: png::DecodingError| ExtractError::Image {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let reader = png::Decoder::new(BufReader::new(file))
        .read_info()
        .map_err(malformed)?;
    let info = reader.info();

    if let Some(chunk) = info
        .uncompressed_latin1_text
        .iter()
        .find(|c| c.keyword == PARAMETERS_KEYWORD)
    {
        return Ok(chunk.text.clone());
    }
    if let Some(chunk) = info
        .compressed_latin1_text
        .iter()
        .find(|c| c.keyword == PARAMETERS_KEYWORD)
    {
        return chunk.get_text().map_err(malformed);
    }
    if let Some(chunk) = info
        .utf8_text
        .iter()
        .find(|c| c.keyword == PARAMETERS_KEYWORD)
    {
        return chunk.get_text().map_err(malformed);
    }

    Ok(String::new())
}


#[cfg(test)]
mod tests {
    use super::fixtures::write_png;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_parameters_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.png");
        let text = "cat\nNegative prompt: dog\nSteps: 20, Seed: 1";
        write_png(&path, Some(text), 0);

        assert_eq!(PngTextAccessor.read_parameter_blob(&path).unwrap(), text);
    }

    #[test]
    fn test_png_without_parameters_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.png");
        write_png(&path, None, 0);

        assert_eq!(PngTextAccessor.read_parameter_blob(&path).unwrap(), "");
    }

    #[test]
    fn test_non_image_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.png");
        fs::write(&path, "definitely not a png").unwrap();

        let err = PngTextAccessor.read_parameter_blob(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Image { .. }));
    }

    #[test]
    fn test_truncated_png_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"\x89PNG\r\n\x1a\n\0\0").unwrap();

        let err = PngTextAccessor.read_parameter_blob(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Image { .. }));
    }

    #[test]
    fn test_attributes() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("2024-01-02");
        fs::create_dir(&sub).unwrap();
        let path = sub.join("00001-5.png");
        write_png(&path, Some("x"), 0);

        let attrs = PngTextAccessor.read_attributes(&path).unwrap();
        assert_eq!(attrs.base_name, "00001-5.png");
        assert_eq!(attrs.directory, "2024-01-02");
        assert_eq!(attrs.size, fs::metadata(&path).unwrap().len());
    }
}
