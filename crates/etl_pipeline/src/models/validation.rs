use serde::Serialize;
use tps_reader::{TpsFile, analyze};

use crate::errors::PipelineResult;
use crate::models::error_handler::{ErrorCategory, ErrorDetails, ErrorHandler, ErrorSeverity};
use crate::models::schema_mapper::SchemaMapper;
use crate::models::target::TargetWriter;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableValidation {
    pub source_table: String,
    pub target_table: String,
    pub source_records: u64,
    /// `None` when the target table does not exist
    pub target_rows: Option<u64>,
}

impl TableValidation {
    pub fn matches(&self) -> bool {
        self.target_rows == Some(self.source_records)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub tables: Vec<TableValidation>,
    pub missing_tables: Vec<String>,
    pub mismatches: Vec<String>,
}

/// Compare per-table record counts of a source file with the rows in a target
pub fn validate_conversion(
    source: &TpsFile,
    target: &dyn TargetWriter,
    mapper: &dyn SchemaMapper,
    errors: &ErrorHandler,
) -> PipelineResult<ValidationReport> {
    let existing = target.list_tables()?;
    let source_name = source
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string());

    let mut report = ValidationReport {
        valid: true,
        tables: Vec::new(),
        missing_tables: Vec::new(),
        mismatches: Vec::new(),
    };

    for (number, name) in source.tables() {
        let resolution = source.definition(number);
        let definition = resolution.definition.table();
        let mapping = mapper.map_table(definition, &analyze(&definition.fields));
        if mapping.columns.is_empty() {
            continue;
        }
        let source_records = source.record_count(number) as u64;
        let target_rows = if existing.contains(&mapping.table_name) {
            Some(target.row_count(&mapping.table_name)?)
        } else {
            None
        };
        let check = TableValidation {
            source_table: name.clone(),
            target_table: mapping.table_name.clone(),
            source_records,
            target_rows,
        };

        let problem = match target_rows {
            None => {
                report.missing_tables.push(mapping.table_name.clone());
                Some(format!("Table {} is missing from the target", mapping.table_name))
            }
            Some(rows) if rows != source_records => {
                let message = format!(
                    "Table {} has {} rows, source {} has {} records",
                    mapping.table_name, rows, name, source_records
                );
                report.mismatches.push(message.clone());
                Some(message)
            }
            Some(_) => None,
        };
        if let Some(message) = problem {
            report.valid = false;
            let mut details = ErrorDetails::new();
            details.insert("source".to_string(), source_name.clone().into());
            details.insert("table".to_string(), name.clone().into());
            details.insert("source_records".to_string(), source_records.into());
            errors.log_error(ErrorCategory::Validation, ErrorSeverity::Error, &message, details)?;
        }
        report.tables.push(check);
    }

    log::info!(
        "Validation of {}: {} tables checked, {} missing, {} mismatched",
        source_name,
        report.tables.len(),
        report.missing_tables.len(),
        report.mismatches.len()
    );
    Ok(report)
}
