use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;

use crate::errors::{PipelineError, PipelineResult};
use crate::models::converter::{ConversionEngine, ConversionReport};

/// One legacy file and the database it converts into
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionJob {
    pub input: PathBuf,
    pub target: PathBuf,
}

impl ConversionJob {
    pub fn new<I: Into<PathBuf>, T: Into<PathBuf>>(input: I, target: T) -> Self {
        ConversionJob {
            input: input.into(),
            target: target.into(),
        }
    }
}

/// Convert several files, each into its own target, in job order.
///
/// With parallel processing enabled the jobs run on a dedicated rayon pool
/// of `worker_count()` threads; every job shares the engine's error handler.
pub fn convert_many(engine: &ConversionEngine, jobs: &[ConversionJob]) -> PipelineResult<Vec<ConversionReport>> {
    let config = engine.config();
    if !config.enable_parallel_processing || jobs.len() < 2 {
        log::info!("Converting {} files sequentially", jobs.len());
        return jobs
            .iter()
            .map(|job| engine.convert_to_sqlite(&job.input, &job.target))
            .collect();
    }

    let workers = config.worker_count();
    log::info!("Converting {} files on {} worker threads", jobs.len(), workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("tps-convert-{}", i))
        .build()
        .map_err(|e| PipelineError::Config(format!("Failed to build worker pool: {}", e)))?;
    pool.install(|| {
        jobs.par_iter()
            .map(|job| engine.convert_to_sqlite(&job.input, &job.target))
            .collect()
    })
}
