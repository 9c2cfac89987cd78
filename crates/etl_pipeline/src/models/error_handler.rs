use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

use crate::errors::{PipelineError, PipelineResult};

/// Number of records kept in `recent_errors` of a summary
pub const RECENT_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileAccess,
    DataParsing,
    Conversion,
    DatabaseOperation,
    Validation,
    System,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::FileAccess => "file_access",
            ErrorCategory::DataParsing => "data_parsing",
            ErrorCategory::Conversion => "conversion",
            ErrorCategory::DatabaseOperation => "database_operation",
            ErrorCategory::Validation => "validation",
            ErrorCategory::System => "system",
        }
    }

    /// Whether the run can continue once recovery for this category is exhausted
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorCategory::DataParsing | ErrorCategory::Conversion | ErrorCategory::Validation
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
        }
    }
}

pub type ErrorDetails = BTreeMap<String, serde_json::Value>;

/// One logged error; never modified once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub details: ErrorDetails,
    pub stack_trace: Option<String>,
    pub recovery_action: Option<String>,
}

/// A failure carrying its classification, raised by conversion steps
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ConversionError {
    pub category: ErrorCategory,
    pub message: String,
    pub details: ErrorDetails,
}

impl ConversionError {
    pub fn new<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        ConversionError {
            category,
            message: message.into(),
            details: ErrorDetails::new(),
        }
    }

    pub fn with_detail<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// What a recovery handler sees
#[derive(Debug)]
pub struct ErrorContext<'a> {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: &'a str,
    pub details: &'a ErrorDetails,
}

pub type RecoveryHandler = Box<dyn Fn(&ErrorContext<'_>) -> Option<String> + Send + Sync>;

pub struct RecoveryStrategy {
    pub name: String,
    pub description: String,
    pub categories: Vec<ErrorCategory>,
    pub max_attempts: u32,
    handler: RecoveryHandler,
}

impl RecoveryStrategy {
    pub fn new<F>(name: &str, description: &str, categories: Vec<ErrorCategory>, handler: F) -> Self
    where
        F: Fn(&ErrorContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        RecoveryStrategy {
            name: name.to_string(),
            description: description.to_string(),
            categories,
            max_attempts: 3,
            handler: Box::new(handler),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn applies_to(&self, category: ErrorCategory) -> bool {
        self.categories.contains(&category)
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Result of running the applicable strategies for one error
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    NotAttempted,
    Recovered(String),
    Failed,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ErrorHandlerConfig {
    /// The run aborts once this many critical errors have been logged
    pub max_critical_errors: usize,
    pub enable_auto_recovery: bool,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        ErrorHandlerConfig {
            max_critical_errors: 100,
            enable_auto_recovery: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub critical_errors: usize,
    pub errors_by_category: BTreeMap<String, usize>,
    pub errors_by_severity: BTreeMap<String, usize>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Default)]
struct HandlerState {
    log: Vec<ErrorRecord>,
    critical_count: usize,
    attempts: HashMap<(String, ErrorCategory), u32>,
    backup_dir: Option<TempDir>,
    backups: HashMap<PathBuf, PathBuf>,
}

/// Run-wide error log with bounded automatic recovery
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    strategies: Vec<RecoveryStrategy>,
    state: Mutex<HandlerState>,
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("config", &self.config)
            .field("strategies", &self.strategies)
            .finish()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorHandlerConfig::default())
    }
}

impl ErrorHandler {
    /// Handler with the built-in strategies registered
    pub fn new(config: ErrorHandlerConfig) -> Self {
        let mut handler = Self::without_strategies(config);
        for strategy in builtin_strategies() {
            handler.register_strategy(strategy);
        }
        handler
    }

    pub fn without_strategies(config: ErrorHandlerConfig) -> Self {
        ErrorHandler {
            config,
            strategies: Vec::new(),
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn register_strategy(&mut self, strategy: RecoveryStrategy) {
        log::debug!("Registered recovery strategy '{}'", strategy.name);
        self.strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn log_error(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: &str,
        details: ErrorDetails,
    ) -> PipelineResult<ErrorRecord> {
        self.append(category, severity, message, details, None)
    }

    /// Log an error, keeping the rendered source chain as the stack trace
    pub fn log_error_with_source(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: &str,
        details: ErrorDetails,
        source: &dyn StdError,
    ) -> PipelineResult<ErrorRecord> {
        self.append(category, severity, message, details, Some(render_chain(source)))
    }

    pub fn log_conversion_error(&self, error: &ConversionError, severity: ErrorSeverity) -> PipelineResult<ErrorRecord> {
        self.append(error.category, severity, &error.message, error.details.clone(), None)
    }

    fn append(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: &str,
        details: ErrorDetails,
        stack_trace: Option<String>,
    ) -> PipelineResult<ErrorRecord> {
        let outcome = if self.config.enable_auto_recovery && severity >= ErrorSeverity::Error {
            self.attempt_recovery(category, severity, message, &details)
        } else {
            RecoveryOutcome::NotAttempted
        };

        let record = ErrorRecord {
            timestamp: Utc::now(),
            category,
            severity,
            message: message.to_string(),
            details,
            stack_trace,
            recovery_action: match &outcome {
                RecoveryOutcome::Recovered(action) => Some(action.clone()),
                _ => None,
            },
        };

        match severity {
            ErrorSeverity::Info => log::info!("[{}] {}", category, message),
            ErrorSeverity::Warning => log::warn!("[{}] {}", category, message),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                log::error!("[{}] {} ({})", category, message, severity.as_str())
            }
        }

        let mut state = self.state.lock();
        state.log.push(record.clone());
        if severity == ErrorSeverity::Critical {
            state.critical_count += 1;
            if state.critical_count >= self.config.max_critical_errors {
                return Err(PipelineError::Aborted {
                    critical_errors: state.critical_count,
                    limit: self.config.max_critical_errors,
                });
            }
        }
        if outcome == RecoveryOutcome::Exhausted && !category.is_recoverable() {
            return Err(PipelineError::RecoveryExhausted {
                category,
                message: message.to_string(),
            });
        }
        Ok(record)
    }

    /// Try applicable strategies in registration order
    pub fn attempt_recovery(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: &str,
        details: &ErrorDetails,
    ) -> RecoveryOutcome {
        let applicable: Vec<&RecoveryStrategy> =
            self.strategies.iter().filter(|s| s.applies_to(category)).collect();
        if applicable.is_empty() {
            return RecoveryOutcome::NotAttempted;
        }
        let context = ErrorContext {
            category,
            severity,
            message,
            details,
        };
        let mut exhausted = 0;
        for strategy in &applicable {
            let key = (strategy.name.clone(), category);
            {
                let mut state = self.state.lock();
                let attempts = state.attempts.entry(key).or_insert(0);
                if *attempts >= strategy.max_attempts {
                    exhausted += 1;
                    continue;
                }
                *attempts += 1;
            }
            if let Some(action) = (strategy.handler)(&context) {
                log::info!("Recovery '{}' applied: {}", strategy.name, action);
                return RecoveryOutcome::Recovered(action);
            }
        }
        if exhausted == applicable.len() {
            RecoveryOutcome::Exhausted
        } else {
            RecoveryOutcome::Failed
        }
    }

    pub fn attempts(&self, strategy: &str, category: ErrorCategory) -> u32 {
        self.state
            .lock()
            .attempts
            .get(&(strategy.to_string(), category))
            .copied()
            .unwrap_or(0)
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.state.lock().log.clone()
    }

    pub fn error_count(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn critical_count(&self) -> usize {
        self.state.lock().critical_count
    }

    pub fn summary(&self) -> ErrorSummary {
        let state = self.state.lock();
        let mut errors_by_category = BTreeMap::new();
        let mut errors_by_severity = BTreeMap::new();
        for record in &state.log {
            *errors_by_category.entry(record.category.as_str().to_string()).or_insert(0) += 1;
            *errors_by_severity.entry(record.severity.as_str().to_string()).or_insert(0) += 1;
        }
        let skip = state.log.len().saturating_sub(RECENT_ERROR_LIMIT);
        ErrorSummary {
            total_errors: state.log.len(),
            critical_errors: state.critical_count,
            errors_by_category,
            errors_by_severity,
            recent_errors: state.log[skip..].to_vec(),
        }
    }

    /// Write the summary and every record as pretty JSON
    pub fn generate_error_report<P: AsRef<Path>>(&self, path: P) -> PipelineResult<()> {
        let report = serde_json::json!({
            "generated_at": Utc::now(),
            "summary": self.summary(),
            "detailed_errors": self.errors(),
        });
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(&report)?)?;
        log::info!("Error report written to {}", path.as_ref().display());
        Ok(())
    }

    /// Copy a file aside so it can be restored after a failed run
    pub fn create_backup<P: AsRef<Path>>(&self, path: P) -> PipelineResult<PathBuf> {
        let path = path.as_ref();
        let mut state = self.state.lock();
        if state.backup_dir.is_none() {
            state.backup_dir = Some(tempfile::Builder::new().prefix("tps-backup-").tempdir()?);
        }
        let dir = match &state.backup_dir {
            Some(dir) => dir.path().to_path_buf(),
            None => return Err(PipelineError::Config("backup directory unavailable".to_string())),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup".to_string());
        let backup = dir.join(format!("{}_{}", state.backups.len(), file_name));
        std::fs::copy(path, &backup)?;
        state.backups.insert(path.to_path_buf(), backup.clone());
        log::debug!("Backed up {} to {}", path.display(), backup.display());
        Ok(backup)
    }

    /// Restore a file from its backup; `false` when none was taken
    pub fn restore_backup<P: AsRef<Path>>(&self, path: P) -> PipelineResult<bool> {
        let path = path.as_ref();
        let backup = self.state.lock().backups.get(path).cloned();
        match backup {
            Some(backup) => {
                std::fs::copy(&backup, path)?;
                log::info!("Restored {} from backup", path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove backups taken during this run
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.backups.clear();
        if let Some(dir) = state.backup_dir.take() {
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove backup directory: {}", e);
            }
        }
    }
}

impl Drop for ErrorHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn render_chain(error: &dyn StdError) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

fn builtin_strategies() -> Vec<RecoveryStrategy> {
    vec![
        RecoveryStrategy::new(
            "retry_file_access",
            "Re-check a file that could not be opened",
            vec![ErrorCategory::FileAccess],
            |ctx| {
                let path = ctx.details.get("path")?.as_str()?;
                Path::new(path)
                    .exists()
                    .then(|| format!("file {} is reachable on retry", path))
            },
        ),
        RecoveryStrategy::new(
            "skip_malformed_record",
            "Skip the malformed record and continue with the next one",
            vec![ErrorCategory::DataParsing],
            |_| Some("skipped malformed record".to_string()),
        ),
        RecoveryStrategy::new(
            "use_fallback_conversion",
            "Keep the raw record as a diagnostic instead of converted columns",
            vec![ErrorCategory::Conversion],
            |_| Some("record kept as raw diagnostic".to_string()),
        ),
        RecoveryStrategy::new(
            "retry_database_operation",
            "Retry the failed write once",
            vec![ErrorCategory::DatabaseOperation],
            |_| Some("retrying database operation".to_string()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn details(pairs: &[(&str, serde_json::Value)]) -> ErrorDetails {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_builtin_strategies() {
        let handler = ErrorHandler::default();
        assert_eq!(
            handler.strategy_names(),
            vec![
                "retry_file_access",
                "skip_malformed_record",
                "use_fallback_conversion",
                "retry_database_operation"
            ]
        );
    }

    #[test]
    fn test_log_error_appends_record() {
        let handler = ErrorHandler::default();
        let record = handler
            .log_error(
                ErrorCategory::DataParsing,
                ErrorSeverity::Warning,
                "bad page",
                details(&[("page", json!(512))]),
            )
            .unwrap();
        assert_eq!(record.details["page"], json!(512));
        assert_eq!(record.recovery_action, None);
        assert_eq!(handler.errors(), vec![record]);
    }

    #[test]
    fn test_recovery_attempts_are_bounded() {
        let handler = ErrorHandler::default();
        for i in 0..5 {
            let record = handler
                .log_error(ErrorCategory::Conversion, ErrorSeverity::Error, "row failed", ErrorDetails::new())
                .unwrap();
            assert_eq!(record.recovery_action.is_some(), i < 3);
        }
        assert_eq!(handler.attempts("use_fallback_conversion", ErrorCategory::Conversion), 3);
    }

    #[test]
    fn test_attempts_tracked_per_category() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let mut handler = ErrorHandler::without_strategies(ErrorHandlerConfig::default());
        handler.register_strategy(
            RecoveryStrategy::new(
                "shared",
                "applies to two categories",
                vec![ErrorCategory::Conversion, ErrorCategory::Validation],
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    None
                },
            )
            .with_max_attempts(1),
        );
        let none = ErrorDetails::new();
        assert_eq!(
            handler.attempt_recovery(ErrorCategory::Conversion, ErrorSeverity::Error, "a", &none),
            RecoveryOutcome::Failed
        );
        assert_eq!(
            handler.attempt_recovery(ErrorCategory::Conversion, ErrorSeverity::Error, "a", &none),
            RecoveryOutcome::Exhausted
        );
        assert_eq!(
            handler.attempt_recovery(ErrorCategory::Validation, ErrorSeverity::Error, "a", &none),
            RecoveryOutcome::Failed
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(
            handler.attempt_recovery(ErrorCategory::System, ErrorSeverity::Error, "a", &none),
            RecoveryOutcome::NotAttempted
        );
    }

    #[test]
    fn test_critical_ceiling_aborts() {
        let handler = ErrorHandler::new(ErrorHandlerConfig {
            max_critical_errors: 2,
            enable_auto_recovery: false,
        });
        assert!(
            handler
                .log_error(ErrorCategory::System, ErrorSeverity::Critical, "first", ErrorDetails::new())
                .is_ok()
        );
        let err = handler
            .log_error(ErrorCategory::System, ErrorSeverity::Critical, "second", ErrorDetails::new())
            .unwrap_err();
        assert!(err.to_string().contains("Too many errors occurred"));
        assert!(err.is_fatal());
        assert_eq!(handler.error_count(), 2);
    }

    #[test]
    fn test_exhausted_non_recoverable_category_escalates() {
        let handler = ErrorHandler::default();
        for _ in 0..3 {
            let record = handler
                .log_error(
                    ErrorCategory::DatabaseOperation,
                    ErrorSeverity::Error,
                    "insert failed",
                    ErrorDetails::new(),
                )
                .unwrap();
            assert!(record.recovery_action.is_some());
        }
        let err = handler
            .log_error(
                ErrorCategory::DatabaseOperation,
                ErrorSeverity::Error,
                "insert failed",
                ErrorDetails::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::RecoveryExhausted { .. }));
    }

    #[test]
    fn test_file_access_recovery_checks_path() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("present.phd");
        std::fs::write(&existing, b"x").unwrap();
        let handler = ErrorHandler::default();

        let found = handler
            .log_error(
                ErrorCategory::FileAccess,
                ErrorSeverity::Error,
                "open failed",
                details(&[("path", json!(existing.to_string_lossy()))]),
            )
            .unwrap();
        assert!(found.recovery_action.is_some());

        let missing = handler
            .log_error(
                ErrorCategory::FileAccess,
                ErrorSeverity::Error,
                "open failed",
                details(&[("path", json!("/nonexistent/file.phd"))]),
            )
            .unwrap();
        assert_eq!(missing.recovery_action, None);
    }

    #[test]
    fn test_source_chain_becomes_stack_trace() {
        let handler = ErrorHandler::default();
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "Test exception");
        let wrapped = PipelineError::from(io);
        let record = handler
            .log_error_with_source(
                ErrorCategory::System,
                ErrorSeverity::Warning,
                "wrapped",
                ErrorDetails::new(),
                &wrapped,
            )
            .unwrap();
        let trace = record.stack_trace.unwrap();
        assert!(trace.contains("Test exception"));
    }

    #[test]
    fn test_summary_and_report() {
        let handler = ErrorHandler::default();
        for i in 0..12 {
            let category = if i % 2 == 0 { ErrorCategory::DataParsing } else { ErrorCategory::Validation };
            handler
                .log_error(category, ErrorSeverity::Warning, &format!("issue {}", i), ErrorDetails::new())
                .unwrap();
        }
        let summary = handler.summary();
        assert_eq!(summary.total_errors, 12);
        assert_eq!(summary.errors_by_category["data_parsing"], 6);
        assert_eq!(summary.errors_by_severity["warning"], 12);
        assert_eq!(summary.recent_errors.len(), RECENT_ERROR_LIMIT);
        assert_eq!(summary.recent_errors[0].message, "issue 2");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        handler.generate_error_report(&path).unwrap();
        let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(report.get("generated_at").is_some());
        assert_eq!(report["summary"]["total_errors"], json!(12));
        assert_eq!(report["detailed_errors"].as_array().unwrap().len(), 12);
    }

    #[test]
    fn test_backup_restore_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.sqlite");
        std::fs::write(&target, b"original").unwrap();

        let handler = ErrorHandler::default();
        let backup = handler.create_backup(&target).unwrap();
        std::fs::write(&target, b"half written").unwrap();

        assert!(handler.restore_backup(&target).unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert!(!handler.restore_backup(dir.path().join("other")).unwrap());

        handler.cleanup();
        assert!(!backup.exists());
    }

    #[test]
    fn test_conversion_error_details() {
        let error = ConversionError::new(ErrorCategory::Conversion, "row 7 failed").with_detail("record", 7);
        assert_eq!(error.to_string(), "row 7 failed");
        let handler = ErrorHandler::default();
        let record = handler.log_conversion_error(&error, ErrorSeverity::Warning).unwrap();
        assert_eq!(record.details["record"], json!(7));
    }
}
