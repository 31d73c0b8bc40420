//! Batch alignment of many queries against one reference.
//!
//! The reference features are computed and cached before any worker starts,
//! then the first query is aligned on the calling thread. Once that warm-up
//! succeeds the reference cache entry is made read-only and the remaining
//! queries run on a fixed-size rayon pool.

use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::AlignConfig;
use crate::error::{AlignError, BatchError, ErrorKind};
use crate::exposure::{ExifExposure, ExposureSource};
use crate::features::{FeatureExtractor, OpenCvExtractor};
use crate::image_io;
use crate::matching::{BruteForceMatcher, DescriptorMatcher};
use crate::pipeline::{AlignedImage, Aligner, ReferenceFrame};
use crate::store::{remove_if_exists, CacheKey};
use crate::system_info;

pub type ProgressCallback = Arc<Mutex<dyn FnMut(String, f32) + Send>>;

/// What happened to one query.
#[derive(Debug)]
pub enum QueryOutcome {
    Aligned(AlignedImage),
    Failed { query: PathBuf, error: AlignError },
}

impl QueryOutcome {
    pub fn query(&self) -> &Path {
        match self {
            QueryOutcome::Aligned(aligned) => &aligned.query,
            QueryOutcome::Failed { query, .. } => query,
        }
    }

    pub fn is_aligned(&self) -> bool {
        matches!(self, QueryOutcome::Aligned(_))
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub reference: PathBuf,
    /// One outcome per distinct query. Aligned queries come first, in input
    /// order, followed by queries whose output name was already taken.
    pub outcomes: Vec<QueryOutcome>,
    /// Inputs ignored because they are outputs of an earlier run.
    pub skipped: Vec<PathBuf>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_aligned()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &AlignError)> {
        self.outcomes.iter().filter_map(|o| match o {
            QueryOutcome::Failed { query, error } => Some((query.as_path(), error)),
            QueryOutcome::Aligned(_) => None,
        })
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn outcome(&self, query: &Path) -> Option<&QueryOutcome> {
        self.outcomes.iter().find(|o| o.query() == query)
    }
}

/// Resolves `./a.jpg` and `a.jpg` to the same file. Unresolvable paths
/// compare as written.
fn identity(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Sort `paths`, drop earlier outputs and split off the first as reference.
pub fn split_reference(paths: &[PathBuf], aligned_prefix: &str) -> Option<(PathBuf, Vec<PathBuf>)> {
    let mut inputs: Vec<PathBuf> = paths
        .iter()
        .filter(|p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().starts_with(aligned_prefix))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    inputs.sort();
    inputs.dedup();
    if inputs.is_empty() {
        return None;
    }
    let reference = inputs.remove(0);
    Some((reference, inputs))
}

pub struct BatchAligner {
    aligner: Aligner,
    progress: Option<ProgressCallback>,
}

impl BatchAligner {
    pub fn new(
        config: AlignConfig,
        extractor: Arc<dyn FeatureExtractor>,
        matcher: Arc<dyn DescriptorMatcher>,
        exposure: Arc<dyn ExposureSource>,
    ) -> Self {
        Self {
            aligner: Aligner::new(config, extractor, matcher, exposure),
            progress: None,
        }
    }

    /// OpenCV detector and brute-force matcher chosen by the config, EXIF exposure.
    pub fn with_opencv(config: AlignConfig) -> Self {
        let detector = config.feature_detector;
        Self::new(
            config,
            Arc::new(OpenCvExtractor::new(detector)),
            Arc::new(BruteForceMatcher::new(detector.norm_type())),
            Arc::new(ExifExposure),
        )
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn aligner(&self) -> &Aligner {
        &self.aligner
    }

    fn report_progress(&self, msg: &str, pct: f32) {
        if let Some(ref cb) = self.progress {
            if let Ok(mut cb_lock) = cb.lock() {
                cb_lock(msg.to_string(), pct);
            }
        }
    }

    fn align_one(&self, reference: &ReferenceFrame, query: &Path) -> QueryOutcome {
        match self.aligner.align(reference, query) {
            Ok(aligned) => QueryOutcome::Aligned(aligned),
            Err(error) => {
                match error.kind() {
                    ErrorKind::NotFound => {
                        log::error!("{}: {}", query.display(), error)
                    }
                    _ => log::warn!("Skipping {}: {}", query.display(), error),
                }
                QueryOutcome::Failed {
                    query: query.to_path_buf(),
                    error,
                }
            }
        }
    }

    fn worker_count(&self, reference: &ReferenceFrame) -> usize {
        let config = self.aligner.config();
        let channels = match reference.format {
            image_io::PixelFormat::Opaque8 | image_io::PixelFormat::Opaque16 => 3,
            image_io::PixelFormat::Alpha8 | image_io::PixelFormat::Alpha16 => 4,
        };
        let image_mb = system_info::estimate_image_size_mb(
            reference.size.width,
            reference.size.height,
            channels,
            reference.format.bytes_per_channel(),
        );
        system_info::resolve_worker_count(
            config.workers,
            config.max_workers,
            system_info::get_available_memory_gb(),
            image_mb,
        )
    }

    fn copy_reference(&self, reference: &Path) -> Result<PathBuf, AlignError> {
        let destination = self.aligner.config().reference_copy_path();
        let image = image_io::load_unchanged(reference)?;
        image_io::write_image(&destination, &image.mat)?;
        Ok(destination)
    }

    /// Align every query onto `reference`.
    ///
    /// Per-query failures end up in the report. Only reference preparation,
    /// pool startup and output directory creation abort the batch.
    pub fn run(&self, reference: &Path, queries: &[PathBuf]) -> Result<BatchReport, BatchError> {
        let config = self.aligner.config();
        let reference_failed = |source: AlignError| BatchError::Reference {
            path: reference.to_path_buf(),
            source,
        };

        let mut seen = HashSet::from([identity(reference)]);
        let mut outputs = HashSet::new();
        if config.copy_reference {
            outputs.insert(config.reference_copy_path());
        }
        let mut skipped = Vec::new();
        let mut conflicts = Vec::new();
        let mut pending = Vec::new();
        for query in queries {
            if !seen.insert(identity(query)) {
                log::debug!("Ignoring {}: listed twice or is the reference", query.display());
                continue;
            }
            if config.is_aligned_output(query) {
                log::info!("Ignoring {}: already an aligned output", query.display());
                skipped.push(query.clone());
                continue;
            }
            let output = config.aligned_path(query);
            if !outputs.insert(output.clone()) {
                let error = AlignError::OutputConflict {
                    path: query.clone(),
                    output,
                };
                log::warn!("Skipping {}: {}", query.display(), error);
                conflicts.push(QueryOutcome::Failed {
                    query: query.clone(),
                    error,
                });
                continue;
            }
            pending.push(query.clone());
        }
        let Some((first, rest)) = pending.split_first() else {
            return Err(BatchError::NoQueries);
        };

        std::fs::create_dir_all(&config.output_dir)?;
        std::fs::create_dir_all(config.cache_dir())?;

        self.report_progress("Preparing reference features...", 0.0);
        let frame = self
            .aligner
            .prepare_reference(reference)
            .map_err(reference_failed)?;

        if config.copy_reference {
            let copy = self.copy_reference(reference).map_err(reference_failed)?;
            log::info!("Reference copied to {}", copy.display());
        }

        let total = pending.len();
        let done = AtomicUsize::new(0);
        let finish = |outcome: QueryOutcome| {
            let n = done.fetch_add(1, Ordering::SeqCst) + 1;
            self.report_progress(
                &format!("Aligned {}/{}: {}", n, total, outcome.query().display()),
                5.0 + 90.0 * n as f32 / total as f32,
            );
            outcome
        };

        // Warm-up on the calling thread, before any worker exists.
        let mut outcomes = vec![finish(self.align_one(&frame, first))];

        if let Err(e) = self.aligner.store().mark_read_only(&frame.key) {
            log::warn!("Cannot mark reference cache read-only: {}", e);
        }

        if !rest.is_empty() {
            let workers = self.worker_count(&frame).min(rest.len());
            log::info!("Aligning {} remaining images with {} workers", rest.len(), workers);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("align-{}", i))
                .build()?;

            let parallel: Vec<QueryOutcome> = pool.install(|| {
                rest.par_iter()
                    .map(|query| finish(self.align_one(&frame, query)))
                    .collect()
            });
            outcomes.extend(parallel);
        }
        outcomes.extend(conflicts);

        if !config.keep_scratch {
            self.report_progress("Removing scratch files...", 95.0);
            self.cleanup(&frame, &outcomes);
        }

        let report = BatchReport {
            reference: reference.to_path_buf(),
            outcomes,
            skipped,
        };
        log::info!(
            "Batch done: {} aligned, {} failed, {} skipped",
            report.succeeded(),
            report.failed(),
            report.skipped.len()
        );
        self.report_progress("Done", 100.0);
        Ok(report)
    }

    /// Remove cache entries and logs of successful queries. Logs of failed
    /// queries stay for inspection.
    fn cleanup(&self, reference: &ReferenceFrame, outcomes: &[QueryOutcome]) {
        let store = self.aligner.store();
        let remove = |key: &CacheKey, keep_log: bool| {
            if let Err(e) = store.remove(key) {
                log::warn!("Cannot remove cache entry {}: {}", key, e);
            }
            if !keep_log {
                if let Err(e) = remove_if_exists(&self.aligner.log_path(key)) {
                    log::warn!("Cannot remove log of {}: {}", key, e);
                }
            }
        };

        remove(&reference.key, false);
        for outcome in outcomes {
            match outcome {
                QueryOutcome::Aligned(aligned) => remove(&aligned.key, false),
                QueryOutcome::Failed { query, .. } => {
                    if let Ok(key) = CacheKey::for_image(query) {
                        remove(&key, true);
                    }
                }
            }
        }
    }
}
