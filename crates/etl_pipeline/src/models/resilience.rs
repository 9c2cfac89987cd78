use base64::Engine;
use serde::Serialize;
use std::path::PathBuf;
use tps_reader::{TpsFile, hex_string};

use crate::errors::PipelineResult;
use crate::models::checkpoint::CheckpointStore;
use crate::models::resilience_config::ResilienceConfig;

const BASE_BATCH_SIZE: usize = 100;
const SIZE_SAMPLE_PAGES: usize = 20;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Batch size for a table shape; missing metadata keeps the base of 100
pub fn adaptive_batch_size(record_size: Option<usize>, field_count: Option<usize>) -> usize {
    match (record_size, field_count) {
        (_, Some(fields)) if fields > 100 => 10,
        (Some(size), _) if size > 10_000 => (BASE_BATCH_SIZE / 20).max(5),
        (Some(size), _) if size > 5_000 => (BASE_BATCH_SIZE / 10).max(10),
        (Some(size), _) if size < 100 => BASE_BATCH_SIZE * 4,
        _ => BASE_BATCH_SIZE,
    }
}

pub fn should_use_streaming(record_size: usize, field_count: usize, estimated_records: u64) -> bool {
    record_size > 2_000 || field_count > 100 || estimated_records > 10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    Bulk,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Skip,
    StreamingHighMemory,
    StreamingMediumMemory,
    StreamingLowMemory,
    Normal,
}

impl Recommendation {
    pub fn for_records(estimated_records: u64) -> Self {
        match estimated_records {
            0 => Recommendation::Skip,
            n if n > 100_000 => Recommendation::StreamingHighMemory,
            n if n > 50_000 => Recommendation::StreamingMediumMemory,
            n if n > 10_000 => Recommendation::StreamingLowMemory,
            _ => Recommendation::Normal,
        }
    }

    pub fn optimal_batch_size(self) -> usize {
        match self {
            Recommendation::StreamingHighMemory => 10,
            Recommendation::StreamingMediumMemory => 25,
            Recommendation::StreamingLowMemory => 50,
            Recommendation::Normal | Recommendation::Skip => BASE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSizeEstimate {
    pub estimated_records: u64,
    pub estimated_size_mb: f64,
    pub sample_pages: usize,
    pub total_pages: usize,
    pub recommendation: Recommendation,
    pub optimal_batch_size: usize,
}

/// Source of the current process memory figure
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when the platform cannot tell
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the process resident set size
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        memory_stats::memory_stats().map(|stats| stats.physical_mem as u64)
    }
}

/// Anything holding caches that can be dropped under memory pressure
pub trait ReleaseMemory {
    fn release_memory(&self) -> usize;
}

impl ReleaseMemory for TpsFile {
    fn release_memory(&self) -> usize {
        TpsFile::release_memory(self)
    }
}

/// Size-driven strategy choices, memory monitoring and checkpoints for a run
pub struct ResilienceController {
    config: ResilienceConfig,
    probe: Box<dyn MemoryProbe>,
    checkpoints: Option<CheckpointStore>,
}

impl std::fmt::Debug for ResilienceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceController")
            .field("config", &self.config)
            .field("checkpoints", &self.checkpoints)
            .finish()
    }
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Self {
        ResilienceController {
            config,
            probe: Box::new(ProcessMemory),
            checkpoints: None,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn has_checkpoint_store(&self) -> bool {
        self.checkpoints.is_some()
    }

    /// Adaptive size clamped to the configured bounds, or the fixed default
    pub fn batch_size_for(&self, record_size: Option<usize>, field_count: Option<usize>) -> usize {
        if !self.config.adaptive_batch_sizing {
            return self.config.default_batch_size;
        }
        let lower = self.config.min_batch_size.max(1);
        let upper = self.config.max_batch_size.max(lower);
        adaptive_batch_size(record_size, field_count).clamp(lower, upper)
    }

    pub fn choose_strategy(&self, record_size: usize, field_count: usize, estimated_records: u64) -> ExtractionStrategy {
        if !self.config.enable_streaming {
            return ExtractionStrategy::Bulk;
        }
        let over_threshold = estimated_records > self.config.streaming_threshold_records as u64;
        if over_threshold || should_use_streaming(record_size, field_count, estimated_records) {
            ExtractionStrategy::Streaming
        } else {
            ExtractionStrategy::Bulk
        }
    }

    /// Extrapolate a table's size from up to 20 evenly spaced leaf pages
    pub fn estimate_table_size(&self, file: &TpsFile, table_number: u32, record_size: usize) -> TableSizeEstimate {
        let leaves = file.leaf_page_ids();
        let total_pages = leaves.len();
        let step = total_pages.div_ceil(SIZE_SAMPLE_PAGES).max(1);

        let mut sample_pages = 0;
        let mut sampled_records = 0usize;
        for id in leaves.iter().step_by(step).take(SIZE_SAMPLE_PAGES) {
            sample_pages += 1;
            match file.records(*id, table_number) {
                Ok(records) => sampled_records += records.len(),
                Err(e) => log::debug!("Size sample skipped page {:#x}: {}", id, e),
            }
        }

        let estimated_records = if sample_pages == 0 {
            0
        } else {
            let average = sampled_records as f64 / sample_pages as f64;
            (average * total_pages as f64).round() as u64
        };
        let recommendation = Recommendation::for_records(estimated_records);
        let estimate = TableSizeEstimate {
            estimated_records,
            estimated_size_mb: estimated_records as f64 * record_size as f64 / BYTES_PER_MB,
            sample_pages,
            total_pages,
            recommendation,
            optimal_batch_size: recommendation.optimal_batch_size(),
        };
        log::debug!("Table {} size estimate: {:?}", table_number, estimate);
        estimate
    }

    pub fn memory_usage_mb(&self) -> Option<f64> {
        self.probe.resident_bytes().map(|bytes| bytes as f64 / BYTES_PER_MB)
    }

    /// True only when resident memory is strictly above the ceiling
    pub fn check_memory_usage(&self) -> bool {
        if !self.config.enable_memory_monitoring {
            return false;
        }
        match self.memory_usage_mb() {
            Some(used) => used > self.config.max_memory_mb as f64,
            None => false,
        }
    }

    /// Drop releasable caches; returns the bytes freed
    pub fn force_memory_cleanup(&self, caches: &[&dyn ReleaseMemory]) -> usize {
        let freed: usize = caches.iter().map(|cache| cache.release_memory()).sum();
        log::info!("Memory cleanup released {} bytes", freed);
        freed
    }

    /// Emit a progress line when tracking is enabled; returns the line
    pub fn log_progress(&self, operation: &str, table: &str, current: u64, total: Option<u64>) -> Option<String> {
        if !self.config.enable_progress_tracking {
            return None;
        }
        let line = format_progress(operation, table, current, total);
        log::info!("{}", line);
        Some(line)
    }

    /// True when `current` crossed a checkpoint interval since `previous`
    pub fn checkpoint_due(&self, previous: u64, current: u64) -> bool {
        crossed(self.config.enable_checkpointing, self.config.checkpoint_interval, previous, current)
    }

    pub fn memory_check_due(&self, previous: u64, current: u64) -> bool {
        crossed(self.config.enable_memory_monitoring, self.config.memory_cleanup_interval, previous, current)
    }

    /// `None` when no checkpoint store is attached
    pub fn create_checkpoint(&self, name: &str, data: serde_json::Value) -> PipelineResult<Option<PathBuf>> {
        match &self.checkpoints {
            Some(store) => store.create(name, data).map(Some),
            None => Ok(None),
        }
    }

    pub fn restore_checkpoint(&self, name: &str) -> Option<serde_json::Value> {
        self.checkpoints.as_ref().and_then(|store| store.restore(name))
    }

    pub fn remove_checkpoint(&self, name: &str) -> PipelineResult<bool> {
        match &self.checkpoints {
            Some(store) => store.remove(name),
            None => Ok(false),
        }
    }
}

fn crossed(enabled: bool, interval: usize, previous: u64, current: u64) -> bool {
    if !enabled || interval == 0 {
        return false;
    }
    let interval = interval as u64;
    current / interval > previous / interval
}

pub fn format_progress(operation: &str, table: &str, current: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => format!(
            "{} {}: {}/{} ({:.1}%)",
            operation,
            table,
            current,
            total,
            current as f64 * 100.0 / total as f64
        ),
        _ => format!("{} {}: {} items", operation, table, current),
    }
}

/// Loss-free description of a record that could not be converted
pub fn compact_diagnostic(bytes: &[u8], table: &str) -> serde_json::Value {
    let mut diagnostic = serde_json::Map::new();
    diagnostic.insert(
        "raw_data".to_string(),
        base64::engine::general_purpose::STANDARD.encode(bytes).into(),
    );
    diagnostic.insert("data_size".to_string(), bytes.len().into());
    diagnostic.insert("table".to_string(), table.into());

    let len = bytes.len();
    if len < 1000 {
        diagnostic.insert("first_4_bytes".to_string(), hex_string(&bytes[..len.min(4)]).into());
    } else if len <= 2000 {
        diagnostic.insert("first_8_bytes".to_string(), hex_string(&bytes[..8]).into());
        diagnostic.insert("last_8_bytes".to_string(), hex_string(&bytes[len - 8..]).into());
    } else {
        diagnostic.insert("first_16_bytes".to_string(), hex_string(&bytes[..16]).into());
        diagnostic.insert("last_16_bytes".to_string(), hex_string(&bytes[len - 16..]).into());
        diagnostic.insert(
            "checksum".to_string(),
            format!("{:08x}", crc32fast::hash(bytes)).into(),
        );
    }
    serde_json::Value::Object(diagnostic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tps_reader::{Field, FieldType, TableDefinition, TextEncoding, TpsWriter};

    struct FixedMemory(Option<u64>);

    impl MemoryProbe for FixedMemory {
        fn resident_bytes(&self) -> Option<u64> {
            self.0
        }
    }

    struct CountingCache(AtomicUsize);

    impl ReleaseMemory for CountingCache {
        fn release_memory(&self) -> usize {
            self.0.swap(0, Ordering::SeqCst)
        }
    }

    #[test]
    fn test_adaptive_batch_size_thresholds() {
        assert_eq!(adaptive_batch_size(Some(50), Some(10)), 400);
        assert_eq!(adaptive_batch_size(Some(6000), Some(10)), 10);
        assert_eq!(adaptive_batch_size(Some(12000), Some(10)), 5);
        assert_eq!(adaptive_batch_size(Some(500), Some(150)), 10);
        assert_eq!(adaptive_batch_size(None, None), 100);
    }

    #[test]
    fn test_adaptive_batch_size_is_monotonic_and_bounded() {
        for field_count in [1, 10, 50, 100, 150] {
            let sizes: Vec<usize> = [50, 500, 2000, 8000, 12000]
                .iter()
                .map(|rs| adaptive_batch_size(Some(*rs), Some(field_count)))
                .collect();
            assert!(sizes.windows(2).all(|w| w[0] >= w[1]), "{:?}", sizes);
            assert!(sizes.iter().all(|s| (5..=400).contains(s)));
        }
    }

    #[test]
    fn test_controller_clamps_to_config() {
        let controller = ResilienceController::new(ResilienceConfig {
            max_batch_size: 250,
            min_batch_size: 20,
            ..Default::default()
        });
        assert_eq!(controller.batch_size_for(Some(50), Some(10)), 250);
        assert_eq!(controller.batch_size_for(Some(12000), Some(10)), 20);

        let fixed = ResilienceController::new(ResilienceConfig {
            adaptive_batch_sizing: false,
            default_batch_size: 77,
            ..Default::default()
        });
        assert_eq!(fixed.batch_size_for(Some(50), Some(10)), 77);
    }

    #[test]
    fn test_streaming_decision() {
        for record_size in [100, 2000, 2001] {
            for field_count in [5, 100, 101] {
                for estimated in [0, 10_000, 10_001] {
                    let expected = record_size > 2000 || field_count > 100 || estimated > 10_000;
                    assert_eq!(should_use_streaming(record_size, field_count, estimated), expected);
                }
            }
        }
        let controller = ResilienceController::new(ResilienceConfig::small());
        assert_eq!(controller.choose_strategy(5000, 200, 1_000_000), ExtractionStrategy::Bulk);
        let controller = ResilienceController::new(ResilienceConfig::medium());
        assert_eq!(controller.choose_strategy(10, 2, 6_000), ExtractionStrategy::Streaming);
        assert_eq!(controller.choose_strategy(10, 2, 100), ExtractionStrategy::Bulk);
    }

    #[test]
    fn test_recommendation_tiers() {
        assert_eq!(Recommendation::for_records(0), Recommendation::Skip);
        assert_eq!(Recommendation::for_records(150_000), Recommendation::StreamingHighMemory);
        assert_eq!(Recommendation::for_records(60_000).optimal_batch_size(), 25);
        assert_eq!(Recommendation::for_records(20_000).optimal_batch_size(), 50);
        assert_eq!(Recommendation::for_records(10_000), Recommendation::Normal);
    }

    #[test]
    fn test_estimate_counts_sampled_pages() {
        let encoding = TextEncoding::latin1();
        let mut writer = TpsWriter::new(encoding);
        let number = writer
            .add_table(TableDefinition::new(0, "T", vec![Field::new("ID", FieldType::Long, 0, 4)]))
            .unwrap();
        for i in 0..25u32 {
            writer.add_record(number, i.to_le_bytes().to_vec()).unwrap();
        }
        let file = TpsFile::from_bytes(writer.to_bytes().unwrap(), encoding).unwrap();
        let controller = ResilienceController::new(ResilienceConfig::default());

        let estimate = controller.estimate_table_size(&file, number, 4);
        assert_eq!(estimate.total_pages, 1);
        assert_eq!(estimate.estimated_records, 25);
        assert_eq!(estimate.recommendation, Recommendation::Normal);

        let missing = controller.estimate_table_size(&file, 99, 4);
        assert_eq!(missing.recommendation, Recommendation::Skip);
    }

    #[test]
    fn test_memory_check_is_strict() {
        let limit = 500 * 1024 * 1024;
        let at_limit = ResilienceController::new(ResilienceConfig::default())
            .with_probe(Box::new(FixedMemory(Some(limit))));
        assert!(!at_limit.check_memory_usage());

        let over = ResilienceController::new(ResilienceConfig::default())
            .with_probe(Box::new(FixedMemory(Some(limit + 1024 * 1024))));
        assert!(over.check_memory_usage());

        let unknown = ResilienceController::new(ResilienceConfig::default()).with_probe(Box::new(FixedMemory(None)));
        assert!(!unknown.check_memory_usage());
    }

    #[test]
    fn test_force_cleanup_sums_released_bytes() {
        let controller = ResilienceController::new(ResilienceConfig::default());
        let a = CountingCache(AtomicUsize::new(100));
        let b = CountingCache(AtomicUsize::new(28));
        assert_eq!(controller.force_memory_cleanup(&[&a, &b]), 128);
        assert_eq!(controller.force_memory_cleanup(&[&a, &b]), 0);
    }

    #[test]
    fn test_progress_lines() {
        assert_eq!(format_progress("Converting", "WELLS", 50, Some(200)), "Converting WELLS: 50/200 (25.0%)");
        assert_eq!(format_progress("Converting", "WELLS", 50, None), "Converting WELLS: 50 items");

        let quiet = ResilienceController::new(ResilienceConfig {
            enable_progress_tracking: false,
            ..Default::default()
        });
        assert_eq!(quiet.log_progress("Converting", "WELLS", 1, None), None);
    }

    #[test]
    fn test_checkpoint_interval_crossing() {
        let controller = ResilienceController::new(ResilienceConfig {
            enable_checkpointing: true,
            checkpoint_interval: 100,
            ..Default::default()
        });
        assert!(!controller.checkpoint_due(0, 99));
        assert!(controller.checkpoint_due(99, 100));
        assert!(controller.checkpoint_due(50, 250));
        assert!(!controller.checkpoint_due(100, 150));
        assert!(!ResilienceController::new(ResilienceConfig::default()).checkpoint_due(0, 50_000));
    }

    #[test]
    fn test_checkpoints_without_store() {
        let controller = ResilienceController::new(ResilienceConfig::default());
        assert_eq!(controller.create_checkpoint("x", serde_json::json!({})).unwrap(), None);
        assert_eq!(controller.restore_checkpoint("x"), None);

        let dir = tempfile::tempdir().unwrap();
        let controller = controller.with_checkpoints(CheckpointStore::new(dir.path()).unwrap());
        controller.create_checkpoint("x", serde_json::json!({"n": 1})).unwrap();
        assert_eq!(controller.restore_checkpoint("x"), Some(serde_json::json!({"n": 1})));
    }

    fn decoded(diagnostic: &serde_json::Value) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(diagnostic["raw_data"].as_str().unwrap())
            .unwrap()
    }

    #[test]
    fn test_compact_diagnostic_tiers() {
        let small: Vec<u8> = (0..10u8).collect();
        let d = compact_diagnostic(&small, "T");
        assert_eq!(d["first_4_bytes"], "00010203");
        assert!(d.get("first_8_bytes").is_none());
        assert_eq!(d["data_size"], 10);
        assert_eq!(decoded(&d), small);

        let medium: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let d = compact_diagnostic(&medium, "T");
        assert!(d.get("first_4_bytes").is_none());
        assert_eq!(d["first_8_bytes"].as_str().unwrap().len(), 16);
        assert!(d.get("checksum").is_none());
        assert_eq!(decoded(&d), medium);

        let large = vec![0xABu8; 2001];
        let d = compact_diagnostic(&large, "T");
        assert_eq!(d["last_16_bytes"], "ab".repeat(16));
        assert_eq!(d["checksum"], format!("{:08x}", crc32fast::hash(&large)));
        assert_eq!(d["data_size"], 2001);
        assert_eq!(decoded(&d), large);
    }
}
