use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::{ExtractError, Result};
use crate::ingest::hasher::ContentDigests;
use crate::ingest::parameters::ParsedParameters;
use crate::ml::scorer::{NsfwScorer, ScoreError};

pub mod fields {
    pub const FILE_NAME: &str = "FileName";
    pub const DIRECTORY: &str = "Directory";
    pub const FILE_SIZE: &str = "FileSize";
    pub const CREATED_AT: &str = "CreatedAt";
    pub const POSITIVE_PROMPT: &str = "PositivePrompt";
    pub const NEGATIVE_PROMPT: &str = "NegativePrompt";
    pub const STEPS: &str = "Steps";
    pub const IMAGE_SIZE: &str = "ImageSize";
    pub const NSFW_PROBABILITY: &str = "NSFWProbability";
    pub const MD5: &str = "MD5";
    pub const SHA1: &str = "SHA1";
    pub const SHA256: &str = "SHA256";
}

/// Bumped whenever `CANONICAL_FIELDS` grows. Version 1 lacked `CreatedAt`
/// and `NSFWProbability`.
pub const FIELD_SET_VERSION: u32 = 2;

pub const CANONICAL_FIELDS: [&str; 20] = [
    fields::FILE_NAME,
    fields::DIRECTORY,
    fields::FILE_SIZE,
    fields::CREATED_AT,
    fields::POSITIVE_PROMPT,
    fields::NEGATIVE_PROMPT,
    fields::STEPS,
    "Sampler",
    "CFGScale",
    "Seed",
    fields::IMAGE_SIZE,
    "ModelHash",
    "Model",
    "SeedResizeFrom",
    "DenoisingStrength",
    "Version",
    fields::NSFW_PROBABILITY,
    fields::MD5,
    fields::SHA1,
    fields::SHA256,
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ordered column names the destination table is expected to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    pub fn canonical() -> Self {
        Self {
            names: CANONICAL_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Canonical columns followed by `extra`, skipping names already present.
    pub fn with_extra<S: AsRef<str>>(extra: &[S]) -> Self {
        let mut set = Self::canonical();
        for name in extra {
            let name = name.as_ref();
            if !set.contains(name) {
                set.names.push(name.to_string());
            }
        }
        set
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self::canonical()
    }
}

/// How the stored `FileName` is derived from the file's base name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNameMode {
    /// Base name as-is
    Keep,
    /// Drop the final extension only
    #[default]
    StripExtension,
    /// Trim any of the characters `.`, `p`, `n`, `g` from both ends, which
    /// matches names written by older versions of the extractor
    LegacyStrip,
}

impl FileNameMode {
    pub fn apply(self, base_name: &str) -> String {
        match self {
            FileNameMode::Keep => base_name.to_string(),
            FileNameMode::StripExtension => Path::new(base_name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| base_name.to_string()),
            FileNameMode::LegacyStrip => base_name
                .trim_matches(|c| matches!(c, '.' | 'p' | 'n' | 'g'))
                .to_string(),
        }
    }
}

/// Filesystem facts about one source file.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub base_name: String,
    pub directory: String,
    pub size: u64,
    pub created: SystemTime,
}

pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format(TIMESTAMP_FORMAT).to_string()
}

/// One image's metadata, keyed by column name. Every column of the
/// `ColumnSet` it was assembled against is present; unset ones are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    fields: Vec<(String, String)>,
}

impl MetadataRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn sha256(&self) -> &str {
        self.get(fields::SHA256).unwrap_or_default()
    }

    pub fn file_name(&self) -> &str {
        self.get(fields::FILE_NAME).unwrap_or_default()
    }

    pub fn directory(&self) -> &str {
        self.get(fields::DIRECTORY).unwrap_or_default()
    }

    /// Values in `columns` order; columns the record lacks read as empty.
    pub fn values_for(&self, columns: &ColumnSet) -> Vec<String> {
        columns
            .names()
            .iter()
            .map(|column| self.get(column).unwrap_or_default().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Serialize for MetadataRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Builds a `MetadataRecord` from parsed parameters, file attributes and
/// content digests.
pub struct RecordAssembler {
    columns: ColumnSet,
    file_name_mode: FileNameMode,
    scorer: Option<Arc<dyn NsfwScorer>>,
}

impl RecordAssembler {
    pub fn new(
        columns: ColumnSet,
        file_name_mode: FileNameMode,
        scorer: Option<Arc<dyn NsfwScorer>>,
    ) -> Self {
        Self {
            columns,
            file_name_mode,
            scorer,
        }
    }

    pub fn assemble(
        &self,
        path: &Path,
        parsed: &ParsedParameters,
        attributes: &FileAttributes,
        digests: ContentDigests,
    ) -> Result<MetadataRecord> {
        let nsfw_probability = self.nsfw_probability(path)?;

        let derived = [
            (fields::FILE_NAME, self.file_name_mode.apply(&attributes.base_name)),
            (fields::DIRECTORY, attributes.directory.clone()),
            (fields::FILE_SIZE, attributes.size.to_string()),
            (fields::CREATED_AT, format_timestamp(attributes.created)),
            (fields::NSFW_PROBABILITY, nsfw_probability),
            (fields::MD5, digests.md5),
            (fields::SHA1, digests.sha1),
            (fields::SHA256, digests.sha256),
        ];

        let mut record_fields: Vec<(String, String)> = Vec::with_capacity(self.columns.len());
        for column in self.columns.names() {
            let value = derived
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value.clone())
                .or_else(|| parsed.get(column).map(str::to_string))
                .unwrap_or_default();
            record_fields.push((column.clone(), value));
        }

        // Keys outside the column set ride along for logging only.
        for (key, value) in parsed.fields() {
            if !self.columns.contains(key) {
                record_fields.push((key.to_string(), value.to_string()));
            }
        }

        let record = MetadataRecord {
            fields: record_fields,
        };
        if record.sha256().is_empty() {
            return Err(ExtractError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "empty SHA256 digest"),
            ));
        }
        Ok(record)
    }

    fn nsfw_probability(&self, path: &Path) -> Result<String> {
        let Some(scorer) = &self.scorer else {
            return Ok(String::new());
        };

        match scorer.score(path) {
            Ok(probability) => {
                debug!(path = %path.display(), probability, "NSFW probability computed");
                Ok(probability.to_string())
            }
            Err(ScoreError::Decode(reason)) => {
                warn!(path = %path.display(), %reason, "Skipping NSFW score");
                Ok(String::new())
            }
            Err(ScoreError::Unavailable(reason)) => {
                error!(path = %path.display(), %reason, "NSFW probability is unavailable");
                Err(ExtractError::ScoreUnavailable {
                    path: path.to_path_buf(),
                    reason,
                })
            }
        }
    }
}
