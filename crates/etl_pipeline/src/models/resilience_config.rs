use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::thread;

use crate::errors::{PipelineError, PipelineResult};

/// Environment variable overriding the worker count
pub const MAX_THREADS_ENV: &str = "TPS_MAX_THREADS";

/// Tunables for a conversion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    // memory
    pub max_memory_mb: u64,
    pub memory_cleanup_interval: usize,
    pub enable_memory_monitoring: bool,

    // batching
    pub default_batch_size: usize,
    pub adaptive_batch_sizing: bool,
    pub max_batch_size: usize,
    pub min_batch_size: usize,

    // progress
    pub enable_progress_tracking: bool,
    pub progress_log_interval: usize,
    pub detailed_progress_logging: bool,

    // error tolerance
    pub max_consecutive_errors: usize,
    pub enable_partial_conversion: bool,
    pub skip_problematic_tables: bool,

    // strategy
    pub enable_streaming: bool,
    pub streaming_threshold_records: usize,
    pub enable_parallel_processing: bool,
    pub max_worker_threads: usize,

    // target store
    pub sqlite_journal_mode: String,
    pub sqlite_synchronous: String,
    pub sqlite_cache_size: i64,
    pub sqlite_temp_store: String,

    // large tables
    pub large_table_threshold_records: usize,
    pub large_table_threshold_mb: f64,
    pub enable_table_size_estimation: bool,

    // checkpoints
    pub enable_checkpointing: bool,
    pub checkpoint_interval: usize,
    pub enable_resume_capability: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            max_memory_mb: 500,
            memory_cleanup_interval: 1000,
            enable_memory_monitoring: true,
            default_batch_size: 100,
            adaptive_batch_sizing: true,
            max_batch_size: 1000,
            min_batch_size: 5,
            enable_progress_tracking: true,
            progress_log_interval: 100,
            detailed_progress_logging: false,
            max_consecutive_errors: 100,
            enable_partial_conversion: true,
            skip_problematic_tables: false,
            enable_streaming: true,
            streaming_threshold_records: 10_000,
            enable_parallel_processing: false,
            max_worker_threads: 4,
            sqlite_journal_mode: "WAL".to_string(),
            sqlite_synchronous: "NORMAL".to_string(),
            sqlite_cache_size: -2000,
            sqlite_temp_store: "MEMORY".to_string(),
            large_table_threshold_records: 50_000,
            large_table_threshold_mb: 500.0,
            enable_table_size_estimation: true,
            enable_checkpointing: false,
            checkpoint_interval: 10_000,
            enable_resume_capability: false,
        }
    }
}

impl ResilienceConfig {
    /// Small databases: keep everything in memory, bigger batches
    pub fn small() -> Self {
        ResilienceConfig {
            max_memory_mb: 200,
            default_batch_size: 200,
            enable_streaming: false,
            enable_parallel_processing: false,
            detailed_progress_logging: false,
            ..Default::default()
        }
    }

    pub fn medium() -> Self {
        ResilienceConfig {
            max_memory_mb: 500,
            default_batch_size: 100,
            enable_streaming: true,
            streaming_threshold_records: 5_000,
            enable_parallel_processing: false,
            ..Default::default()
        }
    }

    pub fn large() -> Self {
        ResilienceConfig {
            max_memory_mb: 1000,
            default_batch_size: 50,
            enable_streaming: true,
            streaming_threshold_records: 1_000,
            enable_parallel_processing: true,
            max_worker_threads: 2,
            enable_checkpointing: true,
            checkpoint_interval: 5_000,
            detailed_progress_logging: true,
            ..Default::default()
        }
    }

    pub fn enterprise() -> Self {
        ResilienceConfig {
            max_memory_mb: 2000,
            default_batch_size: 25,
            enable_streaming: true,
            streaming_threshold_records: 500,
            enable_parallel_processing: true,
            max_worker_threads: 4,
            enable_checkpointing: true,
            checkpoint_interval: 1_000,
            enable_resume_capability: true,
            sqlite_cache_size: -10_000,
            large_table_threshold_records: 100_000,
            large_table_threshold_mb: 1000.0,
            detailed_progress_logging: true,
            ..Default::default()
        }
    }

    /// Look up a named preset; names are case-sensitive
    pub fn preset(name: &str) -> PipelineResult<Self> {
        match name {
            "small" => Ok(Self::small()),
            "medium" => Ok(Self::medium()),
            "large" => Ok(Self::large()),
            "enterprise" => Ok(Self::enterprise()),
            "default" => Ok(Self::default()),
            other => Err(PipelineError::Config(format!("Unknown configuration: {}", other))),
        }
    }

    /// Preset matching the size category of a database
    pub fn for_database(size_mb: f64, record_count: u64) -> Self {
        match estimate_database_size_category(size_mb, record_count) {
            SizeCategory::Small => Self::small(),
            SizeCategory::Medium => Self::medium(),
            SizeCategory::Large => Self::large(),
            SizeCategory::Enterprise => Self::enterprise(),
        }
    }

    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: ResilienceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.default_batch_size == 0 {
            return Err(PipelineError::Config("default_batch_size must be positive".to_string()));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(PipelineError::Config(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.max_memory_mb == 0 {
            return Err(PipelineError::Config("max_memory_mb must be positive".to_string()));
        }
        Ok(())
    }

    /// Worker threads for multi-file runs, honoring `TPS_MAX_THREADS`
    pub fn worker_count(&self) -> usize {
        match env::var(MAX_THREADS_ENV) {
            Ok(threads_str) => match threads_str.parse::<usize>() {
                Ok(threads) if threads > 0 => threads,
                _ => self.default_worker_count(),
            },
            Err(_) => self.default_worker_count(),
        }
    }

    fn default_worker_count(&self) -> usize {
        let available = thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
        self.max_worker_threads.clamp(1, available.max(1))
    }
}

/// Size tiers used to pick presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
    Enterprise,
}

impl SizeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
            SizeCategory::Enterprise => "enterprise",
        }
    }
}

pub fn estimate_database_size_category(size_mb: f64, record_count: u64) -> SizeCategory {
    if size_mb > 10_000.0 || record_count > 1_000_000 {
        SizeCategory::Enterprise
    } else if size_mb > 1_000.0 || record_count > 100_000 {
        SizeCategory::Large
    } else if size_mb > 100.0 || record_count > 10_000 {
        SizeCategory::Medium
    } else {
        SizeCategory::Small
    }
}
