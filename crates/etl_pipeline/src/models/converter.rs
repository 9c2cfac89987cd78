use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tps_reader::{
    ByteCodec, ColumnValue, Confidence, DEFAULT_ENCODING_LABEL, MemoIndex, Record, TableAnalysis, TableDefinition,
    TextEncoding, TpsFile, analyze,
};

use crate::errors::{PipelineError, PipelineResult};
use crate::models::checkpoint::{CheckpointStore, ConversionProgress};
use crate::models::error_handler::{
    ConversionError, ErrorCategory, ErrorDetails, ErrorHandler, ErrorRecord, ErrorSeverity,
};
use crate::models::resilience::{
    ExtractionStrategy, MemoryProbe, ReleaseMemory, ResilienceController, compact_diagnostic,
};
use crate::models::resilience_config::ResilienceConfig;
use crate::models::schema_mapper::{SchemaMapper, SqliteSchemaMapper, TableMapping};
use crate::models::target::{CellValue, Row, SqliteTarget, TargetWriter};

const CANCELLED: &str = "cancelled";

/// Per-run options that are not resilience tunables
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// WHATWG label of the legacy text encoding
    pub encoding_label: String,
    /// Prepended to every target table name, e.g. `phd_`
    pub table_prefix: Option<String>,
    /// Name under which progress is checkpointed and resumed
    pub checkpoint_name: Option<String>,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            encoding_label: DEFAULT_ENCODING_LABEL.to_string(),
            table_prefix: None,
            checkpoint_name: None,
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    pub name: String,
    pub target_table: String,
    pub confidence: Confidence,
    pub strategy: Option<ExtractionStrategy>,
    pub batch_size: usize,
    pub records_processed: u64,
    pub records_failed: u64,
    /// Set when the table was not converted completely
    pub failure_reason: Option<String>,
    /// Skipped on purpose, neither processed nor failed
    pub skipped: bool,
}

impl TableReport {
    fn new(name: &str, confidence: Confidence) -> Self {
        TableReport {
            name: name.to_string(),
            target_table: String::new(),
            confidence,
            strategy: None,
            batch_size: 0,
            records_processed: 0,
            records_failed: 0,
            failure_reason: None,
            skipped: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.skipped && self.failure_reason.is_none()
    }

    pub fn failed(&self) -> bool {
        self.failure_reason.is_some()
    }

    fn fail<S: Into<String>>(&mut self, reason: S) {
        self.failure_reason = Some(reason.into());
    }
}

/// What a caller gets back from every run, including partial ones
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub source: String,
    pub outcome: RunOutcome,
    pub success: bool,
    pub tables_processed: usize,
    pub tables_failed: usize,
    /// Tables skipped because a checkpoint marked them complete
    pub tables_resumed: Vec<String>,
    pub tables: Vec<TableReport>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub duration_ms: u64,
    pub errors: Vec<ErrorRecord>,
}

impl ConversionReport {
    fn new(source: &str) -> Self {
        ConversionReport {
            source: source.to_string(),
            outcome: RunOutcome::Failure,
            success: false,
            tables_processed: 0,
            tables_failed: 0,
            tables_resumed: Vec::new(),
            tables: Vec::new(),
            records_processed: 0,
            records_failed: 0,
            duration_ms: 0,
            errors: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn finish(mut self, opened: bool, started: Instant, errors: &ErrorHandler) -> Self {
        self.tables_processed = self.tables.iter().filter(|t| t.succeeded()).count();
        self.tables_failed = self.tables.iter().filter(|t| t.failed()).count();
        self.records_processed = self.tables.iter().map(|t| t.records_processed).sum();
        self.records_failed = self.tables.iter().map(|t| t.records_failed).sum();
        self.outcome = if !opened {
            RunOutcome::Failure
        } else if self.tables_failed == 0 {
            RunOutcome::Success
        } else if self.tables_processed == 0 && self.records_processed == 0 {
            RunOutcome::Failure
        } else {
            RunOutcome::PartialSuccess
        };
        self.success = self.outcome != RunOutcome::Failure;
        self.duration_ms = started.elapsed().as_millis() as u64;
        let source = serde_json::Value::from(self.source.as_str());
        self.errors = errors
            .errors()
            .into_iter()
            .filter(|e| e.details.get("source") == Some(&source))
            .collect();
        self
    }
}

/// State threaded through one file's conversion
struct RunContext {
    source: String,
    deadline: Option<Instant>,
    progress: ConversionProgress,
    checkpoint_name: Option<String>,
}

/// Drives table-by-table conversion of one legacy file into a target
pub struct ConversionEngine {
    controller: ResilienceController,
    options: EngineOptions,
    encoding: TextEncoding,
    mapper: Box<dyn SchemaMapper>,
    errors: Arc<ErrorHandler>,
    cancelled: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ConversionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionEngine")
            .field("controller", &self.controller)
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConversionEngine {
    pub fn new(config: ResilienceConfig, options: EngineOptions) -> PipelineResult<Self> {
        config.validate()?;
        let encoding = TextEncoding::from_label(&options.encoding_label)?;
        let mut controller = ResilienceController::new(config);
        if let Some(dir) = &options.checkpoint_dir {
            controller = controller.with_checkpoints(CheckpointStore::new(dir)?);
        }
        let mapper = Box::new(SqliteSchemaMapper::new(options.table_prefix.clone()));
        Ok(ConversionEngine {
            controller,
            options,
            encoding,
            mapper,
            errors: Arc::new(ErrorHandler::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            timeout: None,
        })
    }

    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_mapper(mut self, mapper: Box<dyn SchemaMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.controller = self.controller.with_probe(probe);
        self
    }

    /// Give up on remaining work once a run has taken this long
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        self.controller.config()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn mapper(&self) -> &dyn SchemaMapper {
        self.mapper.as_ref()
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Flag checked at batch boundaries; setting it stops the run
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn interrupted(&self, ctx: &RunContext) -> bool {
        self.cancelled.load(Ordering::SeqCst) || ctx.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn details(&self, ctx: &RunContext, table: Option<&str>) -> ErrorDetails {
        let mut details = ErrorDetails::new();
        details.insert("source".to_string(), ctx.source.clone().into());
        if let Some(table) = table {
            details.insert("table".to_string(), table.into());
        }
        details
    }

    /// Convert into a SQLite database at `target`
    pub fn convert_to_sqlite(&self, input: &Path, target: &Path) -> PipelineResult<ConversionReport> {
        let started = Instant::now();
        match SqliteTarget::open(target, self.config()) {
            Ok(mut sqlite) => self.convert_file(input, &mut sqlite),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let source = input.display().to_string();
                let mut details = ErrorDetails::new();
                details.insert("source".to_string(), source.clone().into());
                details.insert("path".to_string(), target.display().to_string().into());
                self.errors.log_error_with_source(
                    ErrorCategory::DatabaseOperation,
                    ErrorSeverity::Error,
                    &format!("Cannot open target database {}", target.display()),
                    details,
                    &e,
                )?;
                Ok(ConversionReport::new(&source).finish(false, started, &self.errors))
            }
        }
    }

    /// Async wrapper running the blocking conversion off the runtime threads
    pub async fn convert_file_async(self: Arc<Self>, input: PathBuf, target: PathBuf) -> PipelineResult<ConversionReport> {
        tokio::task::spawn_blocking(move || self.convert_to_sqlite(&input, &target))
            .await
            .map_err(|e| PipelineError::TaskJoin(format!("Task join error: {}", e)))?
    }

    /// Convert every table of `input`; only fatal errors come back as `Err`
    pub fn convert_file(&self, input: &Path, target: &mut dyn TargetWriter) -> PipelineResult<ConversionReport> {
        let started = Instant::now();
        let source = input.display().to_string();
        let mut ctx = RunContext {
            source: source.clone(),
            deadline: self.timeout.map(|t| started + t),
            progress: ConversionProgress {
                source: source.clone(),
                ..Default::default()
            },
            checkpoint_name: self
                .options
                .checkpoint_name
                .clone()
                .filter(|_| self.controller.has_checkpoint_store()),
        };
        let mut report = ConversionReport::new(&source);

        let file = match TpsFile::open(input, self.encoding) {
            Ok(file) => file.with_page_cache(),
            Err(e) => {
                let mut details = self.details(&ctx, None);
                details.insert("path".to_string(), source.clone().into());
                self.errors.log_error_with_source(
                    ErrorCategory::FileAccess,
                    ErrorSeverity::Error,
                    &format!("Cannot open legacy file {}", source),
                    details,
                    &e,
                )?;
                return Ok(report.finish(false, started, &self.errors));
            }
        };

        self.load_progress(&mut ctx);
        let tables = file.tables();
        log::info!("Converting {} tables from {}", tables.len(), source);

        for (position, (number, name)) in tables.iter().enumerate() {
            if ctx.progress.is_completed(name) {
                log::info!("Table {} already converted, skipping", name);
                report.tables_resumed.push(name.clone());
                continue;
            }
            if self.interrupted(&ctx) {
                self.cancel_remaining(&file, &tables[position..], &ctx, &mut report);
                break;
            }

            let restart = ctx.progress.current_table.as_deref() == Some(name.as_str());
            ctx.progress.current_table = Some(name.clone());
            ctx.progress.records_done = 0;
            // saved before any row lands so an interrupted table is rebuilt on resume
            self.save_progress(&ctx)?;

            let table_report = self.convert_table(&mut ctx, &file, *number, name, target, restart)?;
            let cancelled = table_report.failure_reason.as_deref() == Some(CANCELLED);
            if table_report.succeeded() {
                ctx.progress.completed_tables.push(name.clone());
                ctx.progress.current_table = None;
                self.save_progress(&ctx)?;
            }
            report.tables.push(table_report);
            if cancelled {
                self.cancel_remaining(&file, &tables[position + 1..], &ctx, &mut report);
                break;
            }
        }

        if let Err(e) = target.finish() {
            self.log_db_error(&ctx, None, "Finishing target", &e)?;
        }
        let report = report.finish(true, started, &self.errors);
        log::info!(
            "Converted {}: {:?}, {} tables processed, {} failed, {} records",
            source,
            report.outcome,
            report.tables_processed,
            report.tables_failed,
            report.records_processed
        );
        Ok(report)
    }

    fn cancel_remaining(&self, file: &TpsFile, tables: &[(u32, String)], ctx: &RunContext, report: &mut ConversionReport) {
        for (number, name) in tables {
            if ctx.progress.is_completed(name) {
                continue;
            }
            let mut table_report = TableReport::new(name, file.definition(*number).definition.confidence());
            table_report.fail(CANCELLED);
            report.tables.push(table_report);
        }
        log::warn!("Run over {} cancelled", ctx.source);
    }

    fn load_progress(&self, ctx: &mut RunContext) {
        if !self.config().enable_resume_capability {
            return;
        }
        let Some(name) = &ctx.checkpoint_name else {
            return;
        };
        let Some(value) = self.controller.restore_checkpoint(name) else {
            return;
        };
        match serde_json::from_value::<ConversionProgress>(value) {
            Ok(progress) if progress.source == ctx.source => {
                log::info!(
                    "Resuming {} with {} completed tables",
                    ctx.source,
                    progress.completed_tables.len()
                );
                ctx.progress = progress;
            }
            Ok(progress) => log::warn!(
                "Checkpoint '{}' belongs to {}, not {}; starting over",
                name,
                progress.source,
                ctx.source
            ),
            Err(e) => log::warn!("Checkpoint '{}' is not conversion progress: {}", name, e),
        }
    }

    fn save_progress(&self, ctx: &RunContext) -> PipelineResult<()> {
        if !self.config().enable_checkpointing {
            return Ok(());
        }
        let Some(name) = &ctx.checkpoint_name else {
            return Ok(());
        };
        if let Err(e) = self.controller.create_checkpoint(name, serde_json::to_value(&ctx.progress)?) {
            self.errors.log_error_with_source(
                ErrorCategory::System,
                ErrorSeverity::Warning,
                &format!("Checkpoint '{}' could not be written", name),
                self.details(ctx, None),
                &e,
            )?;
        }
        Ok(())
    }

    fn log_db_error(&self, ctx: &RunContext, table: Option<&str>, what: &str, error: &PipelineError) -> PipelineResult<ErrorRecord> {
        let message = match table {
            Some(table) => format!("{} failed for table {}", what, table),
            None => format!("{} failed", what),
        };
        self.errors.log_error_with_source(
            ErrorCategory::DatabaseOperation,
            ErrorSeverity::Error,
            &message,
            self.details(ctx, table),
            error,
        )
    }

    /// Run a target operation, retrying once when recovery allows; inner `Err` is the failure reason
    fn with_db_retry<T, F>(&self, ctx: &RunContext, table: &str, what: &str, mut op: F) -> PipelineResult<Result<T, String>>
    where
        F: FnMut() -> PipelineResult<T>,
    {
        let first = match op() {
            Ok(value) => return Ok(Ok(value)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };
        let record = self.log_db_error(ctx, Some(table), what, &first)?;
        if record.recovery_action.is_none() {
            return Ok(Err(first.to_string()));
        }
        match op() {
            Ok(value) => Ok(Ok(value)),
            Err(e) => {
                self.log_db_error(ctx, Some(table), &format!("{} retry", what), &e)?;
                Ok(Err(e.to_string()))
            }
        }
    }

    fn convert_table(
        &self,
        ctx: &mut RunContext,
        file: &TpsFile,
        number: u32,
        name: &str,
        target: &mut dyn TargetWriter,
        restart: bool,
    ) -> PipelineResult<TableReport> {
        let resolution = file.definition(number);
        for warning in &resolution.warnings {
            self.errors.log_error(
                ErrorCategory::DataParsing,
                ErrorSeverity::Warning,
                warning,
                self.details(ctx, Some(name)),
            )?;
        }
        let definition = resolution.definition.table();
        let mut report = TableReport::new(name, resolution.definition.confidence());
        let analysis = analyze(&definition.fields);
        let mapping = self.mapper.map_table(definition, &analysis);
        report.target_table = mapping.table_name.clone();

        if mapping.columns.is_empty() {
            self.errors.log_error(
                ErrorCategory::DataParsing,
                ErrorSeverity::Warning,
                &format!("Table {} has no recoverable columns, nothing to convert", name),
                self.details(ctx, Some(name)),
            )?;
            return Ok(report);
        }

        if restart {
            log::info!("Restarting partially converted table {}", name);
            if let Err(reason) = self.with_db_retry(ctx, name, "Dropping partial table", || {
                target.drop_table(&mapping.table_name)
            })? {
                report.fail(reason);
                return Ok(report);
            }
        }
        if let Err(reason) = self.create_target_table(ctx, name, &mapping, target)? {
            if self.config().skip_problematic_tables {
                log::warn!("Skipping table {}: {}", name, reason);
                report.skipped = true;
            } else {
                report.fail(reason);
            }
            return Ok(report);
        }

        let record_size = definition.record_size;
        let field_count = definition.field_count();
        let estimate = self
            .config()
            .enable_table_size_estimation
            .then(|| self.controller.estimate_table_size(file, number, record_size));
        let estimated_records = estimate.as_ref().map(|e| e.estimated_records).unwrap_or(0);
        let strategy = self.controller.choose_strategy(record_size, field_count, estimated_records);
        let mut batch_size = self.controller.batch_size_for(Some(record_size), Some(field_count));
        if let (ExtractionStrategy::Streaming, Some(estimate)) = (strategy, &estimate) {
            let lower = self.config().min_batch_size.max(1);
            batch_size = batch_size.min(estimate.optimal_batch_size).max(lower);
        }
        report.strategy = Some(strategy);
        report.batch_size = batch_size;
        log::info!(
            "Table {} -> {}: {:?} extraction, batch {}, ~{} records",
            name,
            mapping.table_name,
            strategy,
            batch_size,
            estimated_records
        );

        let codec = ByteCodec::new(file.encoding());
        let memos = if definition.memos.is_empty() {
            MemoIndex::new()
        } else {
            file.memos(number)
        };
        let total = estimate.as_ref().map(|e| e.estimated_records).filter(|n| *n > 0);
        let mut pending: Vec<Row> = Vec::new();
        let mut consecutive_failures = 0usize;

        for item in file.table_records(number) {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    self.errors.log_error_with_source(
                        ErrorCategory::DataParsing,
                        ErrorSeverity::Warning,
                        &format!("Unreadable page in table {}", name),
                        self.details(ctx, Some(name)),
                        &e,
                    )?;
                    continue;
                }
            };
            if !record.data.is_empty() && record.data.len() < record_size {
                let mut details = self.details(ctx, Some(name));
                details.insert("record".to_string(), record.record_number.into());
                details.insert("diagnostic".to_string(), compact_diagnostic(&record.data, name));
                self.errors.log_error(
                    ErrorCategory::DataParsing,
                    ErrorSeverity::Warning,
                    &format!(
                        "Record {} of {} is truncated to {} of {} bytes, missing fields become NULL",
                        record.record_number,
                        name,
                        record.data.len(),
                        record_size
                    ),
                    details,
                )?;
            }
            match convert_record(&record, definition, &analysis, &codec, &memos) {
                Ok(row) => {
                    consecutive_failures = 0;
                    pending.push(row);
                }
                Err(error) => {
                    consecutive_failures += 1;
                    report.records_failed += 1;
                    let error = error.with_detail("source", ctx.source.as_str()).with_detail(
                        "diagnostic",
                        compact_diagnostic(&record.data, name),
                    );
                    self.errors.log_conversion_error(&error, ErrorSeverity::Error)?;
                    if consecutive_failures >= self.config().max_consecutive_errors {
                        report.fail(format!("{} consecutive record failures", consecutive_failures));
                        break;
                    }
                }
            }
            if strategy == ExtractionStrategy::Streaming && pending.len() >= batch_size {
                if !self.flush(ctx, file, &mapping, target, &mut pending, &mut report, total)? {
                    return Ok(report);
                }
            }
        }

        // bulk extraction holds the whole table, then writes it batch by batch
        let mut remaining = std::mem::take(&mut pending);
        while !remaining.is_empty() && report.failure_reason.is_none() {
            let rest = remaining.split_off(batch_size.min(remaining.len()));
            let mut batch = std::mem::replace(&mut remaining, rest);
            if !self.flush(ctx, file, &mapping, target, &mut batch, &mut report, total)? {
                return Ok(report);
            }
        }
        if report.failed() {
            return Ok(report);
        }

        match target.row_count(&mapping.table_name) {
            Ok(rows) if rows != report.records_processed => {
                self.errors.log_error(
                    ErrorCategory::Validation,
                    ErrorSeverity::Warning,
                    &format!(
                        "Table {} holds {} rows but {} records were written",
                        mapping.table_name, rows, report.records_processed
                    ),
                    self.details(ctx, Some(name)),
                )?;
            }
            Ok(_) => {}
            Err(e) => {
                self.log_db_error(ctx, Some(name), "Counting rows", &e)?;
            }
        }
        log::info!(
            "Table {} done: {} records, {} failed",
            name,
            report.records_processed,
            report.records_failed
        );
        Ok(report)
    }

    fn create_target_table(
        &self,
        ctx: &RunContext,
        name: &str,
        mapping: &TableMapping,
        target: &mut dyn TargetWriter,
    ) -> PipelineResult<Result<(), String>> {
        if let Err(reason) = self.with_db_retry(ctx, name, "Creating table", || target.create_table(mapping))? {
            return Ok(Err(reason));
        }
        for index in &mapping.indexes {
            if let Err(reason) = self.with_db_retry(ctx, name, "Creating index", || {
                target.create_index(&mapping.table_name, index)
            })? {
                return Ok(Err(reason));
            }
        }
        Ok(Ok(()))
    }

    /// Write one batch and run the between-batch duties; `false` stops the table
    #[allow(clippy::too_many_arguments)]
    fn flush(
        &self,
        ctx: &mut RunContext,
        file: &TpsFile,
        mapping: &TableMapping,
        target: &mut dyn TargetWriter,
        batch: &mut Vec<Row>,
        report: &mut TableReport,
        total: Option<u64>,
    ) -> PipelineResult<bool> {
        if self.interrupted(ctx) {
            report.fail(CANCELLED);
            return Ok(false);
        }
        let written = match self.with_db_retry(ctx, &report.name, "Writing batch", || {
            target.write_rows(&mapping.table_name, batch)
        })? {
            Ok(written) => written as u64,
            Err(reason) => {
                report.records_failed += batch.len() as u64;
                report.fail(reason);
                return Ok(false);
            }
        };
        batch.clear();

        let previous = report.records_processed;
        report.records_processed += written;
        ctx.progress.records_done = report.records_processed;

        if self.config().detailed_progress_logging || self.crossed_log_interval(previous, report.records_processed) {
            self.controller
                .log_progress("Converting", &report.name, report.records_processed, total);
        }
        if self.controller.checkpoint_due(previous, report.records_processed) {
            self.save_progress(ctx)?;
        }
        if self.controller.memory_check_due(previous, report.records_processed) && self.controller.check_memory_usage() {
            let mut details = self.details(ctx, Some(&report.name));
            if let Some(used) = self.controller.memory_usage_mb() {
                details.insert("memory_mb".to_string(), used.into());
            }
            self.errors.log_error(
                ErrorCategory::System,
                ErrorSeverity::Warning,
                "Memory usage above the configured ceiling, releasing caches",
                details,
            )?;
            self.controller.force_memory_cleanup(&[file as &dyn ReleaseMemory]);
        }
        Ok(true)
    }

    fn crossed_log_interval(&self, previous: u64, current: u64) -> bool {
        let interval = self.config().progress_log_interval as u64;
        interval > 0 && current / interval > previous / interval
    }
}

/// Decode one record into a target row: columns in analysis order, then memos.
///
/// A truncated record still converts; fields past its end decode as NULL and a
/// partially present array element keeps its bytes as hex. Only a record with
/// no data at all is an error.
pub fn convert_record(
    record: &Record,
    definition: &TableDefinition,
    analysis: &TableAnalysis,
    codec: &ByteCodec,
    memos: &MemoIndex,
) -> Result<Row, ConversionError> {
    if record.data.is_empty() && definition.record_size > 0 {
        return Err(ConversionError::new(
            ErrorCategory::Conversion,
            format!(
                "record {} of {} holds no data, expected {} bytes",
                record.record_number, definition.name, definition.record_size
            ),
        )
        .with_detail("table", definition.name.as_str())
        .with_detail("record", record.record_number));
    }

    let mut row: Row = analysis
        .parse_record(&record.data, codec)
        .into_iter()
        .map(|column| match column {
            ColumnValue::Scalar(value) => CellValue::from(value),
            ColumnValue::Array(values) => CellValue::Text(ColumnValue::array_json(&values)),
        })
        .collect();

    for (index, memo) in definition.memos.iter().enumerate() {
        let cell = match memos.get(&(record.record_number, index as u8)) {
            Some(bytes) if memo.binary => CellValue::Blob(bytes.clone()),
            Some(bytes) => CellValue::Text(codec.encoding().decode_lossy(bytes)),
            None => CellValue::Null,
        };
        row.push(cell);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tps_reader::{Field, FieldType, MemoDefinition};

    fn readings() -> TableDefinition {
        TableDefinition::new(
            1,
            "READINGS",
            vec![
                Field::new("RD:WELL", FieldType::UShort, 0, 2),
                Field::new("RD:VAL1", FieldType::Double, 2, 8),
                Field::new("RD:VAL2", FieldType::Double, 10, 8),
            ],
        )
        .with_memo(MemoDefinition::new("RD:NOTE", false))
    }

    #[test]
    fn test_convert_record_arrays_and_memos() {
        let definition = readings();
        let analysis = analyze(&definition.fields);
        let codec = ByteCodec::new(TextEncoding::latin1());
        let mut data = 7u16.to_le_bytes().to_vec();
        data.extend_from_slice(&1.5f64.to_le_bytes());
        data.extend_from_slice(&2.0f64.to_le_bytes());
        let record = Record {
            table_number: 1,
            record_number: 3,
            data,
        };
        let mut memos = MemoIndex::new();
        memos.insert((3, 0), b"checked".to_vec());

        let row = convert_record(&record, &definition, &analysis, &codec, &memos).unwrap();
        assert_eq!(
            row,
            vec![
                CellValue::Integer(7),
                CellValue::Text("[1.5,2.0]".to_string()),
                CellValue::Text("checked".to_string()),
            ]
        );
    }

    #[test]
    fn test_short_record_degrades_per_field() {
        let definition = readings();
        let analysis = analyze(&definition.fields);
        let codec = ByteCodec::new(TextEncoding::latin1());
        let record = Record {
            table_number: 1,
            record_number: 9,
            data: vec![1, 2, 3],
        };
        let row = convert_record(&record, &definition, &analysis, &codec, &MemoIndex::new()).unwrap();
        assert_eq!(
            row,
            vec![
                CellValue::Integer(0x0201),
                CellValue::Text(r#"["03",null]"#.to_string()),
                CellValue::Null,
            ]
        );
    }

    #[test]
    fn test_empty_record_is_a_conversion_error() {
        let definition = readings();
        let analysis = analyze(&definition.fields);
        let codec = ByteCodec::new(TextEncoding::latin1());
        let record = Record {
            table_number: 1,
            record_number: 9,
            data: Vec::new(),
        };
        let error = convert_record(&record, &definition, &analysis, &codec, &MemoIndex::new()).unwrap_err();
        assert_eq!(error.category, ErrorCategory::Conversion);
        assert_eq!(error.details["record"], serde_json::json!(9));
    }

    #[test]
    fn test_engine_rejects_unknown_encoding() {
        let options = EngineOptions {
            encoding_label: "no-such-encoding".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ConversionEngine::new(ResilienceConfig::default(), options),
            Err(PipelineError::Tps(_))
        ));
    }

    #[test]
    fn test_missing_input_reports_failure() {
        let engine = ConversionEngine::new(ResilienceConfig::default(), EngineOptions::default()).unwrap();
        let mut target = SqliteTarget::in_memory(engine.config()).unwrap();
        let report = engine
            .convert_file(Path::new("/nonexistent/input.phd"), &mut target)
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Failure);
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].category, ErrorCategory::FileAccess);
    }
}
