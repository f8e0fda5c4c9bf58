use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;
use walkdir::WalkDir;

use crate::database::schema::is_valid_identifier;
use crate::error::ExtractError;
use crate::ingest::record::{ColumnSet, FileNameMode};

pub const DEFAULT_CONFIG_FILE: &str = "metadata_config.toml";
pub const CONFIG_ENV_VAR: &str = "SD_INGEST_CONFIG";
const MODEL_ENV_KEY: &str = "NSFW_MODEL_PATH";
const MODEL_FILE_NAME: &str = "nsfw.onnx";
const MODEL_SEARCH_DEPTH: usize = 5;

/// Settings for one extraction run, read from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    pub image_folder: PathBuf,
    /// Only ingest `image_folder/<yesterday as YYYY-MM-DD>`
    #[serde(default)]
    pub use_yesterday: bool,
    #[serde(default)]
    pub nsfw_probability: bool,
    #[serde(default)]
    pub nsfw_model: Option<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub file_name_mode: FileNameMode,
    /// Columns tracked on top of the canonical set
    #[serde(default)]
    pub extra_columns: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_table_name() -> String {
    "ImageMetadata".to_string()
}

fn default_extensions() -> Vec<String> {
    vec!["png".to_string()]
}

fn default_workers() -> usize {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ExtractorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: ExtractorConfig = toml::from_str(raw)?;
        config.extensions = config
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(config)
    }

    /// Checks values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> std::result::Result<(), ExtractError> {
        if !is_valid_identifier(&self.table_name) {
            return Err(ExtractError::Config(format!(
                "invalid table name {:?}",
                self.table_name
            )));
        }
        if let Some(bad) = self.extra_columns.iter().find(|c| !is_valid_identifier(c)) {
            return Err(ExtractError::Config(format!("invalid column name {bad:?}")));
        }
        if self.extensions.is_empty() {
            return Err(ExtractError::Config("no image extensions configured".to_string()));
        }
        if self.workers == 0 {
            return Err(ExtractError::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The directory actually walked, given today's local date.
    pub fn source_root(&self, today: NaiveDate) -> PathBuf {
        if !self.use_yesterday {
            return self.image_folder.clone();
        }
        let yesterday = today.pred_opt().unwrap_or(today);
        self.image_folder
            .join(yesterday.format("%Y-%m-%d").to_string())
    }

    pub fn column_set(&self) -> ColumnSet {
        ColumnSet::with_extra(&self.extra_columns)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// `--config` wins, then `$SD_INGEST_CONFIG`, then `./metadata_config.toml`.
pub fn config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Locate the NSFW model: the configured path, else `.env`, else a search
/// of the working directory (and its parent) whose result is saved to `.env`.
pub fn resolve_nsfw_model(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }

    let env_path = Path::new(".env");
    if env_path.exists() {
        if let Ok(path) = load_from_env(env_path) {
            info!("Loaded NSFW model path from .env");
            return Ok(path);
        }
    }

    info!("NSFW model not configured. Searching filesystem...");
    let root = std::env::current_dir()?;
    let model = find_file(&root, MODEL_FILE_NAME, MODEL_SEARCH_DEPTH)?;
    info!(model = %model.display(), "Found NSFW model");

    save_to_env(env_path, &model)?;
    info!("Saved model path to .env");
    Ok(model)
}

fn find_file(root: &Path, filename: &str, max_depth: usize) -> Result<PathBuf> {
    let search = |dir: &Path| {
        WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name() == filename)
            .map(|e| e.into_path())
    };

    search(root)
        .or_else(|| root.parent().and_then(search))
        .ok_or_else(|| anyhow!("Could not find file '{}' in nearby directories.", filename))
}

fn load_from_env(path: &Path) -> Result<PathBuf> {
    let reader = BufReader::new(File::open(path)?);

    for line in reader.lines() {
        let line = line?;
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == MODEL_ENV_KEY {
                return Ok(PathBuf::from(value.trim()));
            }
        }
    }
    Err(anyhow!("{MODEL_ENV_KEY} missing from {}", path.display()))
}

/// Appends so other keys in an existing `.env` survive.
fn save_to_env(path: &Path, model: &Path) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open .env file")?;
    writeln!(file, "{}={}", MODEL_ENV_KEY, model.display())?;
    Ok(())
}
