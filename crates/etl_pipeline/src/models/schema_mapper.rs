use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tps_reader::{ColumnSource, TableAnalysis, TableDefinition, TargetType, table_schema};

static INVALID_IDENTIFIER_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("Invalid regex pattern for identifier characters"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    /// Name as stored in the legacy definition
    pub source_name: String,
    pub target_type: TargetType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Target-side shape of one legacy table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMapping {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
}

impl TableMapping {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Maps legacy table definitions onto target tables
pub trait SchemaMapper: Send + Sync {
    fn table_name(&self, definition: &TableDefinition) -> String;

    fn map_table(&self, definition: &TableDefinition, analysis: &TableAnalysis) -> TableMapping;
}

#[derive(Debug, Clone, Default)]
pub struct SqliteSchemaMapper {
    pub table_prefix: Option<String>,
}

impl SqliteSchemaMapper {
    pub fn new(table_prefix: Option<String>) -> Self {
        SqliteSchemaMapper { table_prefix }
    }
}

/// `PRE:NAME` becomes `NAME`; other characters outside `[A-Za-z0-9_]` become `_`
pub fn sanitize_identifier(raw: &str) -> String {
    let unqualified = raw.rsplit(':').next().unwrap_or(raw).trim();
    let mut name = INVALID_IDENTIFIER_CHARS.replace_all(unqualified, "_").into_owned();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

impl SchemaMapper for SqliteSchemaMapper {
    fn table_name(&self, definition: &TableDefinition) -> String {
        let mut name = sanitize_identifier(&definition.name);
        if name.is_empty() {
            name = format!("TABLE_{}", definition.table_number);
        }
        match &self.table_prefix {
            Some(prefix) => format!("{}{}", prefix, name),
            None => name,
        }
    }

    fn map_table(&self, definition: &TableDefinition, analysis: &TableAnalysis) -> TableMapping {
        let schema = table_schema(definition, analysis);
        let mut taken = HashSet::new();
        let columns: Vec<ColumnSpec> = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let mut base = sanitize_identifier(field.name());
                if base.is_empty() {
                    base = format!("FIELD_{}", i + 1);
                }
                ColumnSpec {
                    name: unique_name(&base, &mut taken),
                    source_name: field.name().clone(),
                    target_type: TargetType::from_arrow(field.data_type()),
                }
            })
            .collect();

        // only regular fields can back an index column
        let mut by_number: HashMap<u16, &str> = HashMap::new();
        for (position, source) in analysis.order.iter().enumerate() {
            if let ColumnSource::Regular(i) = source {
                by_number.insert(analysis.regular_fields[*i].number, columns[position].name.as_str());
            }
        }

        let table_name = self.table_name(definition);
        let mut index_names = HashSet::new();
        let indexes = definition
            .indexes
            .iter()
            .filter_map(|index| {
                let resolved: Option<Vec<String>> = index
                    .field_numbers
                    .iter()
                    .map(|n| by_number.get(n).map(|c| c.to_string()))
                    .collect();
                let Some(columns) = resolved.filter(|c| !c.is_empty()) else {
                    log::debug!("Index '{}' of {} references no mappable field", index.name, definition.name);
                    return None;
                };
                let base = format!("{}_{}", table_name, sanitize_identifier(&index.name));
                Some(IndexSpec {
                    name: unique_name(&base, &mut index_names),
                    columns,
                    unique: index.unique,
                })
            })
            .collect();

        TableMapping {
            table_name,
            columns,
            indexes,
        }
    }
}

/// SQLite identifiers compare case-insensitively
fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut n = 2;
    while !taken.insert(candidate.to_ascii_lowercase()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tps_reader::{Field, FieldType, IndexDefinition, MemoDefinition, analyze};

    fn wells() -> TableDefinition {
        TableDefinition::new(
            4,
            "WELLS",
            vec![
                Field::new("WEL:ID", FieldType::Long, 0, 4),
                Field::new("WEL:NAME", FieldType::String, 4, 20),
                Field::new("OTHER:NAME", FieldType::String, 24, 20),
                Field::new("WEL:1ST-DEPTH", FieldType::Double, 44, 8),
                Field::new("WEL:P1", FieldType::Double, 52, 8),
                Field::new("WEL:P2", FieldType::Double, 60, 8),
            ],
        )
        .with_memo(MemoDefinition::new("WEL:PHOTO", true))
        .with_index(IndexDefinition {
            name: "WEL:BY_ID".to_string(),
            external_file: None,
            unique: true,
            field_numbers: vec![1],
        })
        .with_index(IndexDefinition {
            name: "WEL:BY_P".to_string(),
            external_file: None,
            unique: false,
            field_numbers: vec![5],
        })
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("WEL:NAME"), "NAME");
        assert_eq!(sanitize_identifier("1ST-DEPTH"), "_1ST_DEPTH");
        assert_eq!(sanitize_identifier("A B.C"), "A_B_C");
        assert_eq!(sanitize_identifier("PRE:"), "");
    }

    #[test]
    fn test_columns_types_and_dedupe() {
        let definition = wells();
        let analysis = analyze(&definition.fields);
        let mapping = SqliteSchemaMapper::new(Some("phd_".to_string())).map_table(&definition, &analysis);

        assert_eq!(mapping.table_name, "phd_WELLS");
        assert_eq!(mapping.column_names(), vec!["ID", "NAME", "NAME_2", "_1ST_DEPTH", "P", "PHOTO"]);
        let types: Vec<TargetType> = mapping.columns.iter().map(|c| c.target_type).collect();
        assert_eq!(
            types,
            vec![
                TargetType::Integer,
                TargetType::Text,
                TargetType::Text,
                TargetType::Real,
                TargetType::Text,
                TargetType::Binary
            ]
        );
        assert_eq!(mapping.columns[2].source_name, "OTHER:NAME");
    }

    #[test]
    fn test_indexes_skip_array_members() {
        let definition = wells();
        let analysis = analyze(&definition.fields);
        let mapping = SqliteSchemaMapper::default().map_table(&definition, &analysis);
        assert_eq!(
            mapping.indexes,
            vec![IndexSpec {
                name: "WELLS_BY_ID".to_string(),
                columns: vec!["ID".to_string()],
                unique: true,
            }]
        );
    }

    #[test]
    fn test_empty_names_get_placeholders() {
        let definition = TableDefinition::new(9, "", vec![Field::new("X:", FieldType::Long, 0, 4)]);
        let analysis = analyze(&definition.fields);
        let mapping = SqliteSchemaMapper::default().map_table(&definition, &analysis);
        assert_eq!(mapping.table_name, "TABLE_9");
        assert_eq!(mapping.column_names(), vec!["FIELD_1"]);
    }
}
