use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use std::path::Path;
use tps_reader::TypedValue;

use crate::errors::{PipelineError, PipelineResult};
use crate::models::resilience_config::ResilienceConfig;
use crate::models::schema_mapper::{IndexSpec, TableMapping};

/// One cell of a target row
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub type Row = Vec<CellValue>;

impl From<TypedValue> for CellValue {
    fn from(value: TypedValue) -> Self {
        match value {
            TypedValue::Bool(b) => CellValue::Integer(i64::from(b)),
            TypedValue::Integer(i) => CellValue::Integer(i),
            TypedValue::Real(r) => CellValue::Real(r),
            TypedValue::Text(s) => CellValue::Text(s),
            TypedValue::Binary(bytes) => CellValue::Blob(bytes),
        }
    }
}

impl From<Option<TypedValue>> for CellValue {
    fn from(value: Option<TypedValue>) -> Self {
        value.map(CellValue::from).unwrap_or(CellValue::Null)
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            CellValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            CellValue::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            CellValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            CellValue::Blob(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
        })
    }
}

/// Relational store receiving converted rows
pub trait TargetWriter: Send {
    fn create_table(&mut self, mapping: &TableMapping) -> PipelineResult<()>;

    fn drop_table(&mut self, table: &str) -> PipelineResult<()>;

    fn create_index(&mut self, table: &str, index: &IndexSpec) -> PipelineResult<()>;

    /// Append rows in column order; returns the number written
    fn write_rows(&mut self, table: &str, rows: &[Row]) -> PipelineResult<usize>;

    fn row_count(&self, table: &str) -> PipelineResult<u64>;

    fn list_tables(&self) -> PipelineResult<Vec<String>>;

    fn finish(&mut self) -> PipelineResult<()>;
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLite target with batch-per-transaction inserts
#[derive(Debug)]
pub struct SqliteTarget {
    conn: Connection,
}

impl SqliteTarget {
    pub fn open<P: AsRef<Path>>(path: P, config: &ResilienceConfig) -> PipelineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        log::info!("Opened target database {}", path.as_ref().display());
        Self::configure(conn, config)
    }

    pub fn in_memory(config: &ResilienceConfig) -> PipelineResult<Self> {
        Self::configure(Connection::open_in_memory()?, config)
    }

    fn configure(conn: Connection, config: &ResilienceConfig) -> PipelineResult<Self> {
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", &config.sqlite_journal_mode, |row| {
            row.get(0)
        })?;
        conn.pragma_update(None, "synchronous", &config.sqlite_synchronous)?;
        conn.pragma_update(None, "cache_size", config.sqlite_cache_size)?;
        conn.pragma_update(None, "temp_store", &config.sqlite_temp_store)?;
        log::debug!(
            "SQLite pragmas: journal_mode={} synchronous={} cache_size={} temp_store={}",
            mode,
            config.sqlite_synchronous,
            config.sqlite_cache_size,
            config.sqlite_temp_store
        );
        Ok(SqliteTarget { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl TargetWriter for SqliteTarget {
    fn create_table(&mut self, mapping: &TableMapping) -> PipelineResult<()> {
        if mapping.columns.is_empty() {
            return Err(PipelineError::Config(format!(
                "table {} has no columns",
                mapping.table_name
            )));
        }
        let columns: Vec<String> = mapping
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.target_type.sql_name()))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&mapping.table_name),
            columns.join(", ")
        );
        self.conn.execute(&sql, [])?;
        log::debug!("Created table {} with {} columns", mapping.table_name, columns.len());
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> PipelineResult<()> {
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)), [])?;
        Ok(())
    }

    fn create_index(&mut self, table: &str, index: &IndexSpec) -> PipelineResult<()> {
        let columns: Vec<String> = index.columns.iter().map(|c| quote_identifier(c)).collect();
        let sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_identifier(&index.name),
            quote_identifier(table),
            columns.join(", ")
        );
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn write_rows(&mut self, table: &str, rows: &[Row]) -> PipelineResult<usize> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let placeholders = vec!["?"; first.len()].join(", ");
        let sql = format!("INSERT INTO {} VALUES ({})", quote_identifier(table), placeholders);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn row_count(&self, table: &str) -> PipelineResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn list_tables(&self) -> PipelineResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn finish(&mut self) -> PipelineResult<()> {
        self.conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema_mapper::ColumnSpec;
    use tps_reader::TargetType;

    fn mapping() -> TableMapping {
        TableMapping {
            table_name: "phd_WELLS".to_string(),
            columns: vec![
                ColumnSpec {
                    name: "ID".to_string(),
                    source_name: "WEL:ID".to_string(),
                    target_type: TargetType::Integer,
                },
                ColumnSpec {
                    name: "NAME".to_string(),
                    source_name: "WEL:NAME".to_string(),
                    target_type: TargetType::Text,
                },
                ColumnSpec {
                    name: "PHOTO".to_string(),
                    source_name: "WEL:PHOTO".to_string(),
                    target_type: TargetType::Binary,
                },
            ],
            indexes: vec![IndexSpec {
                name: "phd_WELLS_BY_ID".to_string(),
                columns: vec!["ID".to_string()],
                unique: true,
            }],
        }
    }

    #[test]
    fn test_create_write_and_count() {
        let mut target = SqliteTarget::in_memory(&ResilienceConfig::default()).unwrap();
        let mapping = mapping();
        target.create_table(&mapping).unwrap();
        target.create_index(&mapping.table_name, &mapping.indexes[0]).unwrap();

        let rows = vec![
            vec![CellValue::Integer(1), CellValue::Text("A-1".to_string()), CellValue::Null],
            vec![CellValue::Integer(2), CellValue::Null, CellValue::Blob(vec![1, 2, 3])],
        ];
        assert_eq!(target.write_rows("phd_WELLS", &rows).unwrap(), 2);
        assert_eq!(target.row_count("phd_WELLS").unwrap(), 2);
        assert_eq!(target.list_tables().unwrap(), vec!["phd_WELLS".to_string()]);

        let blob: Vec<u8> = target
            .connection()
            .query_row("SELECT PHOTO FROM phd_WELLS WHERE ID = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(blob, vec![1, 2, 3]);
        target.finish().unwrap();
    }

    #[test]
    fn test_unique_index_rejects_batch() {
        let mut target = SqliteTarget::in_memory(&ResilienceConfig::default()).unwrap();
        let mapping = mapping();
        target.create_table(&mapping).unwrap();
        target.create_index(&mapping.table_name, &mapping.indexes[0]).unwrap();

        let rows = vec![
            vec![CellValue::Integer(1), CellValue::Null, CellValue::Null],
            vec![CellValue::Integer(1), CellValue::Null, CellValue::Null],
        ];
        assert!(matches!(target.write_rows("phd_WELLS", &rows), Err(PipelineError::Sqlite(_))));
        assert_eq!(target.row_count("phd_WELLS").unwrap(), 0);
    }

    #[test]
    fn test_drop_and_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = SqliteTarget::open(dir.path().join("out.sqlite"), &ResilienceConfig::default()).unwrap();
        let mapping = mapping();
        target.create_table(&mapping).unwrap();
        target
            .write_rows("phd_WELLS", &[vec![CellValue::Integer(1), CellValue::Null, CellValue::Null]])
            .unwrap();
        target.drop_table("phd_WELLS").unwrap();
        target.create_table(&mapping).unwrap();
        assert_eq!(target.row_count("phd_WELLS").unwrap(), 0);
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(CellValue::from(Some(TypedValue::Bool(true))), CellValue::Integer(1));
        assert_eq!(CellValue::from(None), CellValue::Null);
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
