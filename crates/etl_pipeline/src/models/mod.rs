pub mod resilience_config;
pub mod checkpoint;
pub mod error_handler;
pub mod resilience;
pub mod schema_mapper;
pub mod target;
pub mod converter;
pub mod batch;
pub mod validation;
pub mod reverse;


pub use resilience_config::{MAX_THREADS_ENV, ResilienceConfig, SizeCategory, estimate_database_size_category};
pub use checkpoint::{CheckpointEntry, CheckpointStore, ConversionProgress};
pub use error_handler::{
    ConversionError, ErrorCategory, ErrorContext, ErrorDetails, ErrorHandler, ErrorHandlerConfig, ErrorRecord,
    ErrorSeverity, ErrorSummary, RecoveryOutcome, RecoveryStrategy,
};
pub use resilience::{
    ExtractionStrategy, MemoryProbe, ProcessMemory, Recommendation, ReleaseMemory, ResilienceController,
    TableSizeEstimate, adaptive_batch_size, compact_diagnostic, format_progress, should_use_streaming,
};
pub use schema_mapper::{ColumnSpec, IndexSpec, SchemaMapper, SqliteSchemaMapper, TableMapping, sanitize_identifier};
pub use target::{CellValue, Row, SqliteTarget, TargetWriter};
pub use converter::{ConversionEngine, ConversionReport, EngineOptions, RunOutcome, TableReport, convert_record};
pub use batch::{ConversionJob, convert_many};
pub use validation::{TableValidation, ValidationReport, validate_conversion};
pub use reverse::{ReverseConverter, ReverseReport};
