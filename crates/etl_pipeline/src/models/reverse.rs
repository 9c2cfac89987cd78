use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tps_reader::{ByteCodec, Field, FieldType, MemoDefinition, TableDefinition, TextEncoding, TpsWriter, TypedValue};

use crate::errors::PipelineResult;
use crate::models::target::quote_identifier;

const STRING_FIELD_SIZE: usize = 255;

/// Legacy files are grouped by these target table prefixes
const PREFIXES: [(&str, &str); 2] = [("phd_", "phd"), ("mod_", "mod")];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReverseReport {
    pub success: bool,
    pub files_created: Vec<PathBuf>,
    pub tables_processed: usize,
    pub records_processed: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Where a SQLite column lands in the synthesized record
#[derive(Debug, Clone)]
enum ColumnSlot {
    Field(Field),
    Memo(u8),
}

/// Rebuilds legacy files from prefixed tables of a SQLite database
#[derive(Debug, Clone)]
pub struct ReverseConverter {
    encoding: TextEncoding,
}

impl ReverseConverter {
    pub fn new(encoding: TextEncoding) -> Self {
        ReverseConverter { encoding }
    }

    /// Write `{stem}.phd` / `{stem}.mod` into `output_dir`
    pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(&self, sqlite_path: P, output_dir: Q) -> PipelineResult<ReverseReport> {
        let started = Instant::now();
        let sqlite_path = sqlite_path.as_ref();
        let mut report = ReverseReport {
            success: false,
            files_created: Vec::new(),
            tables_processed: 0,
            records_processed: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        let conn = Connection::open_with_flags(sqlite_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut groups: BTreeMap<&str, Vec<(String, String)>> = BTreeMap::new();
        for table in list_tables(&conn)? {
            if let Some((prefix, extension)) = PREFIXES.iter().find(|(p, _)| table.starts_with(p)) {
                let legacy_name = table[prefix.len()..].to_string();
                groups.entry(*extension).or_default().push((table, legacy_name));
            }
        }
        if groups.is_empty() {
            report.errors.push(format!("No phd_ or mod_ tables found in {}", sqlite_path.display()));
            log::warn!("{}", report.errors[0]);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        std::fs::create_dir_all(output_dir.as_ref())?;
        let stem = sqlite_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "converted".to_string());

        for (extension, tables) in groups {
            let mut writer = TpsWriter::new(self.encoding);
            for (table, legacy_name) in &tables {
                match self.copy_table(&conn, &mut writer, table, legacy_name) {
                    Ok(records) => {
                        report.tables_processed += 1;
                        report.records_processed += records;
                    }
                    Err(e) => {
                        let message = format!("Table {} not converted: {}", table, e);
                        log::warn!("{}", message);
                        report.errors.push(message);
                    }
                }
            }
            let path = output_dir.as_ref().join(format!("{}.{}", stem, extension));
            match writer.write_to(&path) {
                Ok(()) => {
                    log::info!("Wrote {} ({} tables)", path.display(), tables.len());
                    report.files_created.push(path);
                }
                Err(e) => report.errors.push(format!("Cannot write {}: {}", path.display(), e)),
            }
        }

        report.success = !report.files_created.is_empty() && report.tables_processed > 0;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn copy_table(&self, conn: &Connection, writer: &mut TpsWriter, table: &str, legacy_name: &str) -> PipelineResult<u64> {
        let mut slots = Vec::new();
        let mut fields = Vec::new();
        let mut memos = Vec::new();
        let mut offset = 0;
        for (name, declared) in table_columns(conn, table)? {
            match legacy_type(&declared) {
                Some((field_type, size)) => {
                    let field = Field::new(name, field_type, offset, size);
                    offset += size;
                    fields.push(field.clone());
                    slots.push(ColumnSlot::Field(field));
                }
                None => {
                    slots.push(ColumnSlot::Memo(memos.len() as u8));
                    memos.push(MemoDefinition::new(name, true));
                }
            }
        }
        let mut definition = TableDefinition::new(0, legacy_name, fields);
        for memo in memos {
            definition = definition.with_memo(memo);
        }
        let record_size = definition.record_size;
        let table_number = writer.add_table(definition)?;

        let codec = ByteCodec::new(self.encoding);
        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_identifier(table)))?;
        let mut rows = stmt.query([])?;
        let mut records = 0;
        while let Some(row) = rows.next()? {
            let mut data = Vec::with_capacity(record_size);
            let mut blobs = Vec::new();
            for (i, slot) in slots.iter().enumerate() {
                let value = typed_value(row.get_ref(i)?);
                match slot {
                    ColumnSlot::Field(field) => {
                        let coerced = value.and_then(|v| coerce(v, field.field_type));
                        data.extend(codec.encode(coerced.as_ref(), &field.layout()));
                    }
                    ColumnSlot::Memo(index) => {
                        let bytes = match value {
                            Some(TypedValue::Binary(bytes)) => Some(bytes),
                            Some(TypedValue::Text(text)) => Some(self.encoding.encode_lossy(&text)),
                            _ => None,
                        };
                        if let Some(bytes) = bytes {
                            blobs.push((*index, bytes));
                        }
                    }
                }
            }
            let record_number = writer.add_record(table_number, data)?;
            for (index, bytes) in blobs {
                writer.add_memo(table_number, record_number, index, &bytes)?;
            }
            records += 1;
        }
        log::debug!("Copied {} rows of {} into table {}", records, table, legacy_name);
        Ok(records)
    }
}

fn list_tables(conn: &Connection) -> PipelineResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> PipelineResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Legacy field for a declared column type; `None` means a binary memo
fn legacy_type(declared: &str) -> Option<(FieldType, usize)> {
    match declared.trim().to_ascii_uppercase().as_str() {
        "INTEGER" => Some((FieldType::Long, 4)),
        "REAL" => Some((FieldType::Double, 8)),
        "BLOB" => None,
        _ => Some((FieldType::String, STRING_FIELD_SIZE)),
    }
}

fn typed_value(value: ValueRef<'_>) -> Option<TypedValue> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(TypedValue::Integer(i)),
        ValueRef::Real(r) => Some(TypedValue::Real(r)),
        ValueRef::Text(bytes) => Some(TypedValue::Text(String::from_utf8_lossy(bytes).into_owned())),
        ValueRef::Blob(bytes) => Some(TypedValue::Binary(bytes.to_vec())),
    }
}

/// SQLite columns are loosely typed; bring a value onto the field's type
fn coerce(value: TypedValue, field_type: FieldType) -> Option<TypedValue> {
    match (field_type, value) {
        (FieldType::Long, TypedValue::Real(r)) => Some(TypedValue::Integer(r as i64)),
        (FieldType::Long, TypedValue::Text(s)) => s.trim().parse().ok().map(TypedValue::Integer),
        (FieldType::Double, TypedValue::Integer(i)) => Some(TypedValue::Real(i as f64)),
        (FieldType::Double, TypedValue::Text(s)) => s.trim().parse().ok().map(TypedValue::Real),
        (FieldType::String, TypedValue::Integer(i)) => Some(TypedValue::Text(i.to_string())),
        (FieldType::String, TypedValue::Real(r)) => Some(TypedValue::Text(r.to_string())),
        (_, value) => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_types() {
        assert_eq!(legacy_type("INTEGER"), Some((FieldType::Long, 4)));
        assert_eq!(legacy_type("real"), Some((FieldType::Double, 8)));
        assert_eq!(legacy_type("TEXT"), Some((FieldType::String, 255)));
        assert_eq!(legacy_type("VARCHAR(10)"), Some((FieldType::String, 255)));
        assert_eq!(legacy_type("BLOB"), None);
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce(TypedValue::Text(" 42 ".to_string()), FieldType::Long), Some(TypedValue::Integer(42)));
        assert_eq!(coerce(TypedValue::Text("x".to_string()), FieldType::Double), None);
        assert_eq!(coerce(TypedValue::Integer(3), FieldType::String), Some(TypedValue::Text("3".to_string())));
    }

    #[test]
    fn test_no_eligible_tables_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("plain.sqlite");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch("CREATE TABLE other (a INTEGER);").unwrap();
        drop(conn);

        let report = ReverseConverter::new(TextEncoding::latin1())
            .convert(&db, dir.path().join("out"))
            .unwrap();
        assert!(!report.success);
        assert!(report.files_created.is_empty());
        assert_eq!(report.errors.len(), 1);
    }
}
