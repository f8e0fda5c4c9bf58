use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info};

use crate::database::reconcile::{DedupOutcome, DedupReconciler};
use crate::database::repo::Store;
use crate::error::{ExtractError, Result};
use crate::ingest::hasher;
use crate::ingest::parameters::parse_parameters;
use crate::ingest::record::{MetadataRecord, RecordAssembler};
use crate::ingest::scanner;
use crate::media::accessor::MetadataAccessor;

const CHANNEL_CAPACITY: usize = 1024;

/// Per-run outcome tallies, shared by worker and writer threads.
#[derive(Debug, Default)]
pub struct RunCounters {
    inserted: AtomicUsize,
    updated: AtomicUsize,
    unchanged: AtomicUsize,
    errored: AtomicUsize,
}

impl RunCounters {
    pub fn record(&self, outcome: &DedupOutcome) {
        let counter = match outcome {
            DedupOutcome::Inserted => &self.inserted,
            DedupOutcome::Updated => &self.updated,
            DedupOutcome::Unchanged => &self.unchanged,
            DedupOutcome::Error(_) => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, elapsed: Duration) -> RunSummary {
        RunSummary {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errored: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_written(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn log(&self) {
        info!(
            inserted = self.inserted,
            updated = self.updated,
            unchanged = self.unchanged,
            errored = self.errored,
            total = self.total_written(),
            elapsed = ?self.elapsed,
            "Run finished"
        );
    }
}

/// Walks the source tree and pushes every matching file through hashing,
/// parsing and assembly on a pool of workers. A single writer thread owns
/// the reconciler, so all store writes are serialized.
pub struct WalkOrchestrator<A: MetadataAccessor> {
    root: PathBuf,
    extensions: Vec<String>,
    workers: usize,
    accessor: A,
    assembler: RecordAssembler,
    show_progress: bool,
}

impl<A: MetadataAccessor> WalkOrchestrator<A> {
    pub fn new(
        root: PathBuf,
        extensions: Vec<String>,
        workers: usize,
        accessor: A,
        assembler: RecordAssembler,
    ) -> Self {
        Self {
            root,
            extensions,
            workers: workers.max(1),
            accessor,
            assembler,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run<S: Store + Send>(
        &self,
        reconciler: &mut DedupReconciler<S>,
        counters: &RunCounters,
    ) -> Result<()> {
        if !self.root.is_dir() {
            return Err(ExtractError::Config(format!(
                "image folder {} is not a directory",
                self.root.display()
            )));
        }
        info!(root = %self.root.display(), workers = self.workers, "Walking image folder");

        let (scan_tx, scan_rx) = bounded::<PathBuf>(CHANNEL_CAPACITY);
        let (record_tx, record_rx) = bounded::<(PathBuf, MetadataRecord)>(CHANNEL_CAPACITY);

        thread::scope(|s| {
            let scanner_handle = s.spawn(move || {
                let found = scanner::scan_directory(&self.root, &self.extensions, scan_tx);
                debug!(found, "Scanner finished");
            });

            let mut worker_handles = Vec::with_capacity(self.workers);
            for i in 0..self.workers {
                let rx = scan_rx.clone();
                let tx = record_tx.clone();
                worker_handles.push(s.spawn(move || {
                    for path in rx {
                        match self.process_file_isolated(&path) {
                            Ok(record) => {
                                if tx.send((path, record)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(path = %path.display(), error = %e, "Skipping file");
                                counters.record_error();
                            }
                        }
                    }
                    debug!(worker = i, "Worker finished");
                }));
            }
            // Only the workers hold senders now, so the writer loop ends with them.
            drop(scan_rx);
            drop(record_tx);

            let progress = self.progress_bar();
            let writer_handle = s.spawn(move || {
                for (path, record) in record_rx {
                    let outcome = reconciler.reconcile(&record);
                    log_outcome(&path, &record, &outcome);
                    counters.record(&outcome);
                    let seen = counters.snapshot(Duration::ZERO);
                    progress.set_message(format!(
                        "{} inserted, {} updated, {} unchanged, {} errors",
                        seen.inserted, seen.updated, seen.unchanged, seen.errored
                    ));
                    progress.tick();
                }
                progress.finish_and_clear();
            });

            let mut panicked = Vec::new();
            if scanner_handle.join().is_err() {
                panicked.push("scanner");
            }
            for handle in worker_handles {
                if handle.join().is_err() {
                    panicked.push("worker");
                }
            }
            if writer_handle.join().is_err() {
                panicked.push("writer");
            }
            for stage in panicked {
                error!(stage, "Pipeline thread panicked");
            }
        });

        Ok(())
    }

    /// A panic while handling one file is turned into that file's error.
    fn process_file_isolated(&self, path: &Path) -> Result<MetadataRecord> {
        panic::catch_unwind(AssertUnwindSafe(|| self.process_file(path))).unwrap_or_else(|_| {
            Err(ExtractError::Image {
                path: path.to_path_buf(),
                reason: "processing panicked".to_string(),
            })
        })
    }

    fn process_file(&self, path: &Path) -> Result<MetadataRecord> {
        debug!(path = %path.display(), "Found image file");
        let blob = self.accessor.read_parameter_blob(path)?;
        let attributes = self.accessor.read_attributes(path)?;
        let digests = hasher::digest_file(path)?;

        let parsed = parse_parameters(&blob);
        debug!(
            path = %path.display(),
            fields = parsed.len(),
            dropped = parsed.dropped_segments().len(),
            "Parsed parameter text"
        );

        let record = self.assembler.assemble(path, &parsed, &attributes, digests)?;
        debug!(
            path = %path.display(),
            record = %serde_json::to_string(&record).unwrap_or_default(),
            "Extracted metadata"
        );
        Ok(record)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar
    }
}

fn log_outcome(path: &Path, record: &MetadataRecord, outcome: &DedupOutcome) {
    match outcome {
        DedupOutcome::Inserted => info!(
            file = record.file_name(),
            directory = record.directory(),
            "Metadata extracted and added to the database"
        ),
        DedupOutcome::Updated => info!(
            file = record.file_name(),
            directory = record.directory(),
            "Metadata updated in the database"
        ),
        DedupOutcome::Unchanged => debug!(
            path = %path.display(),
            "Metadata in database is the same as the extracted metadata"
        ),
        DedupOutcome::Error(reason) => error!(path = %path.display(), %reason, "File not stored"),
    }
}
