//! Resolves input files, hashes and dispatches them across a worker pool,
//! and rolls the result up into a [`RunSummary`]. One worker, one file,
//! one database connection, one transaction — no shared mutable state
//! between workers beyond the read-only [`crate::config::Config`].

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::errors::{Error, LoadError, SourceError};
use crate::extractor::{ExtractMode, Extracted, Extractor, RecordError, RecordPayload};
use crate::loader::{FileContext, Loader};
use crate::model::{LoadMode, SchemaType};
use crate::source::{self, DiscoveredFile};
use crate::transformer::{audit, normalized};

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}";

#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: usize,
    pub record_errors: Vec<(String, RecordError)>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

enum FileOutcome {
    Succeeded {
        rows: usize,
        record_errors: Vec<RecordError>,
    },
    Skipped,
    Failed {
        reason: String,
    },
}

pub fn run(config: &Config, loader: Arc<dyn Loader>) -> Result<RunSummary, Error> {
    let cancelled = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancelled)) {
        warn!(error = %err, "could not install SIGINT handler, cancellation will be unavailable");
    }

    let discovered = source::list(&config.source_uri)?;
    info!(count = discovered.len(), "discovered files");

    let completed_hashes = if config.mode == LoadMode::Delta {
        loader.get_completed_file_hashes()?
    }
    else {
        HashSet::new()
    };

    if config.mode == LoadMode::Full {
        loader.prepare_full_load(config.schema_type)?;
    }

    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("valid progress template");
    let bar = ProgressBar::new(discovered.len() as u64)
        .with_style(style)
        .with_message("loading ICSR batches");
    bar.enable_steady_tick(Duration::from_millis(200));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1))
        .build()
        .map_err(|e| crate::errors::ConfigError::Invalid(e.to_string()))?;

    let outcomes: Vec<(DiscoveredFile, FileOutcome)> = pool.install(|| {
        discovered
            .into_par_iter()
            .map(|file| {
                let outcome = process_one(&file, config, loader.as_ref(), &completed_hashes, &cancelled);
                bar.inc(1);
                (file, outcome)
            })
            .collect()
    });

    bar.finish();

    let mut summary = RunSummary::default();
    for (file, outcome) in outcomes {
        match outcome {
            FileOutcome::Succeeded { rows, record_errors } => {
                summary.succeeded += 1;
                summary.total_rows += rows;
                summary
                    .record_errors
                    .extend(record_errors.into_iter().map(|e| (file.uri.clone(), e)));
            }
            FileOutcome::Skipped => summary.skipped += 1,
            FileOutcome::Failed { reason } => {
                summary.failed += 1;
                warn!(file = %file.uri, reason, "file failed and was quarantined");
            }
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        total_rows = summary.total_rows,
        record_errors = summary.record_errors.len(),
        "run finished"
    );

    Ok(summary)
}

#[instrument(skip(config, loader, completed_hashes, cancelled), fields(file = %file.uri))]
fn process_one(
    file: &DiscoveredFile,
    config: &Config,
    loader: &dyn Loader,
    completed_hashes: &HashSet<String>,
    cancelled: &AtomicBool,
) -> FileOutcome {
    if cancelled.load(Ordering::SeqCst) {
        return FileOutcome::Skipped;
    }

    let hash = match hash_file(&file.uri) {
        Ok(hash) => hash,
        Err(err) => return FileOutcome::Failed { reason: err.to_string() },
    };

    if config.mode == LoadMode::Delta && completed_hashes.contains(&hash) {
        return FileOutcome::Skipped;
    }

    let ctx = FileContext {
        filename: file.uri.clone(),
        file_hash: hash,
        mode: config.mode,
        timeout_secs: config.timeout_secs,
    };

    match load_one(file, &ctx, config, loader, cancelled) {
        Ok((rows, record_errors)) => FileOutcome::Succeeded { rows, record_errors },
        Err(err) => {
            if config.quarantine_uri.is_some() {
                if let Err(qerr) = quarantine_file(file, config) {
                    warn!(error = %qerr, "could not quarantine failed file");
                }
            }
            FileOutcome::Failed { reason: err.to_string() }
        }
    }
}

fn hash_file(uri: &str) -> Result<String, SourceError> {
    let mut reader = source::open(uri)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf).map_err(|e| SourceError::OpenFailed {
            path: PathBuf::from(uri),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn load_one(
    file: &DiscoveredFile,
    ctx: &FileContext,
    config: &Config,
    loader: &dyn Loader,
    cancelled: &AtomicBool,
) -> Result<(usize, Vec<RecordError>), Error> {
    let reader = source::open(&file.uri)?;
    let started = Instant::now();
    let deadline = (ctx.timeout_secs > 0).then(|| Duration::from_secs(ctx.timeout_secs));

    match config.schema_type {
        SchemaType::Normalized => {
            let mut extractor = Extractor::new(reader, ExtractMode::Normalized);
            let mut records = Vec::new();
            let mut record_errors = Vec::new();

            while let Some(item) = extractor.next_record()? {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(Error::Load(LoadError::Cancelled));
                }
                if deadline.is_some_and(|d| started.elapsed() > d) {
                    return Err(Error::Load(LoadError::Timeout(started.elapsed())));
                }
                match item {
                    Extracted::Record(RecordPayload::Normalized(fields)) => records.push(fields),
                    Extracted::Error(err) => record_errors.push(err),
                    Extracted::Record(RecordPayload::Audit(_)) => unreachable!("normalized extractor never yields audit payloads"),
                }
            }

            let output = normalized::transform(&records)?;
            let outcome = loader.load_normalized_data(ctx, output)?;
            Ok((outcome.total_rows(), record_errors))
        }
        SchemaType::Audit => {
            let mut extractor = Extractor::new(reader, ExtractMode::Audit);
            let mut records = Vec::new();
            let mut record_errors = Vec::new();

            while let Some(item) = extractor.next_record()? {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(Error::Load(LoadError::Cancelled));
                }
                if deadline.is_some_and(|d| started.elapsed() > d) {
                    return Err(Error::Load(LoadError::Timeout(started.elapsed())));
                }
                match item {
                    Extracted::Record(RecordPayload::Audit(audit_record)) => records.push(audit_record),
                    Extracted::Error(err) => record_errors.push(err),
                    Extracted::Record(RecordPayload::Normalized(_)) => unreachable!("audit extractor never yields normalized payloads"),
                }
            }

            let (buffer, row_count) = audit::transform(&records)?;
            let outcome = loader.load_audit_data(ctx, buffer, row_count)?;
            Ok((outcome.total_rows(), record_errors))
        }
    }
}

fn quarantine_file(file: &DiscoveredFile, config: &Config) -> Result<(), SourceError> {
    let Some(quarantine_uri) = &config.quarantine_uri else {
        return Ok(());
    };

    let mut reader = source::open(&file.uri)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(|e| SourceError::OpenFailed {
        path: PathBuf::from(&file.uri),
        reason: e.to_string(),
    })?;

    let basename = file.uri.rsplit('/').next().unwrap_or(&file.uri);
    source::quarantine(quarantine_uri, basename, &bytes)
}
