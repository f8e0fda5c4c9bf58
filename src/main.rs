mod database;
mod error;
mod ingest;
mod media;
mod ml;
mod utils;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::database::reconcile::DedupReconciler;
use crate::database::repo::SqliteStore;
use crate::database::schema::SchemaReconciler;
use crate::ingest::orchestrator::{RunCounters, WalkOrchestrator};
use crate::ingest::record::RecordAssembler;
use crate::media::accessor::PngTextAccessor;
use crate::ml::scorer::NsfwScorer;
use crate::utils::config::{self, ExtractorConfig};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Ingest Stable Diffusion image metadata into SQLite", long_about = None)]
struct Args {
    /// Config file (defaults to $SD_INGEST_CONFIG or ./metadata_config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    image_folder: Option<PathBuf>,

    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Only ingest the subdirectory named after yesterday's date
    #[arg(long)]
    yesterday: bool,

    /// Compute NSFW probabilities
    #[arg(long)]
    nsfw: bool,

    #[arg(short, long)]
    workers: Option<usize>,

    /// No progress spinner
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn apply(&self, config: &mut ExtractorConfig) {
        if let Some(folder) = &self.image_folder {
            config.image_folder = folder.clone();
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.use_yesterday |= self.yesterday;
        config.nsfw_probability |= self.nsfw;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let start = Instant::now();
    let counters = RunCounters::default();

    let config_path = config::config_path(args.config.clone());
    let config = match load_config(&args, &config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(DEFAULT_LOG_LEVEL);
            error!(config = %config_path.display(), error = %format!("{e:#}"), "Configuration rejected");
            counters.snapshot(start.elapsed()).log();
            return Err(e);
        }
    };
    init_tracing(&config.log_level);

    info!("Metadata extractor starting");
    info!(
        config = %config_path.display(),
        db = %config.db_path.display(),
        table = %config.table_name,
        folder = %config.image_folder.display(),
        use_yesterday = config.use_yesterday,
        nsfw = config.nsfw_probability,
        "Configuration loaded"
    );

    let show_progress = !args.quiet && std::io::stderr().is_terminal();

    let result = run(&config, show_progress, &counters);

    // The summary is emitted even when the run stopped early.
    counters.snapshot(start.elapsed()).log();
    result
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args, path: &Path) -> Result<ExtractorConfig> {
    let mut config = ExtractorConfig::load(path)?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run(config: &ExtractorConfig, show_progress: bool, counters: &RunCounters) -> Result<()> {
    let root = config.source_root(chrono::Local::now().date_naive());
    let columns = config.column_set();

    let store = SqliteStore::open(&config.db_path, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let changes =
        SchemaReconciler::new(config.table_name.as_str(), columns.clone()).reconcile(&store)?;
    info!(
        table_created = changes.table_created,
        columns_added = changes.columns_added.len(),
        "Schema ready"
    );

    let scorer = build_scorer(config)?;
    let assembler = RecordAssembler::new(columns.clone(), config.file_name_mode, scorer);
    let mut reconciler = DedupReconciler::new(store, config.table_name.as_str(), columns);

    WalkOrchestrator::new(
        root,
        config.extensions.clone(),
        config.workers,
        PngTextAccessor,
        assembler,
    )
    .with_progress(show_progress)
    .run(&mut reconciler, counters)?;

    Ok(())
}

#[cfg(feature = "nsfw")]
fn build_scorer(config: &ExtractorConfig) -> Result<Option<Arc<dyn NsfwScorer>>> {
    if !config.nsfw_probability {
        info!("NSFW is off so no nsfw calculation");
        return Ok(None);
    }
    let model = config::resolve_nsfw_model(config.nsfw_model.as_deref())?;
    let engine = crate::ml::engine::InferenceEngine::new(&model)?;
    info!(model = %model.display(), "NSFW scorer ready");
    let scorer: Arc<dyn NsfwScorer> = Arc::new(engine);
    Ok(Some(scorer))
}

#[cfg(not(feature = "nsfw"))]
fn build_scorer(config: &ExtractorConfig) -> Result<Option<Arc<dyn NsfwScorer>>> {
    if config.nsfw_probability {
        anyhow::bail!("NSFW scoring requested but this build lacks the `nsfw` feature");
    }
    Ok(None)
}
