use arrow::datatypes::{DataType, Field as ArrowField, Schema};
use std::collections::HashMap;

use crate::models::arrays::{ColumnSource, TableAnalysis};
use crate::models::definition::TableDefinition;
use crate::models::recovery::Confidence;

/// Arrow description of one legacy table
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table_number: u32,
    pub name: String,
    pub confidence: Confidence,
    pub schema: Schema,
}

/// Build an Arrow schema for a table: regular fields, array columns (JSON text) then memos
pub fn table_schema(definition: &TableDefinition, analysis: &TableAnalysis) -> Schema {
    let mut fields: Vec<ArrowField> = analysis
        .order
        .iter()
        .map(|source| match source {
            ColumnSource::Regular(i) => {
                let field = &analysis.regular_fields[*i];
                let mut metadata = HashMap::new();
                metadata.insert("tps_type".to_string(), field.field_type.to_string());
                metadata.insert("tps_size".to_string(), field.size.to_string());
                metadata.insert("tps_offset".to_string(), field.offset.to_string());
                ArrowField::new(field.name.as_str(), field.field_type.arrow_type(field.size), true)
                    .with_metadata(metadata)
            }
            ColumnSource::Array(i) => {
                let array = &analysis.array_fields[*i];
                let mut metadata = HashMap::new();
                metadata.insert("tps_type".to_string(), array.element_type.to_string());
                metadata.insert("tps_array_size".to_string(), array.array_size.to_string());
                metadata.insert("tps_element_size".to_string(), array.element_size.to_string());
                metadata.insert("tps_offset".to_string(), array.start_offset.to_string());
                ArrowField::new(array.base_name.as_str(), DataType::Utf8, true).with_metadata(metadata)
            }
        })
        .collect();

    for memo in &definition.memos {
        let data_type = if memo.binary { DataType::Binary } else { DataType::Utf8 };
        let mut metadata = HashMap::new();
        metadata.insert("tps_memo".to_string(), if memo.binary { "binary" } else { "text" }.to_string());
        fields.push(ArrowField::new(memo.name.as_str(), data_type, true).with_metadata(metadata));
    }

    let mut metadata = HashMap::new();
    metadata.insert("tps_table".to_string(), definition.name.clone());
    metadata.insert("tps_table_number".to_string(), definition.table_number.to_string());
    metadata.insert("tps_record_size".to_string(), definition.record_size.to_string());
    Schema::new(fields).with_metadata(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::arrays::analyze;
    use crate::models::definition::{Field, MemoDefinition};
    use crate::models::field_type::FieldType;

    #[test]
    fn test_schema_columns_follow_analysis_order() {
        let definition = TableDefinition::new(
            2,
            "PROD",
            vec![
                Field::new("PRD:ID", FieldType::Long, 0, 4),
                Field::new("PRD:OIL1", FieldType::Double, 4, 8),
                Field::new("PRD:OIL2", FieldType::Double, 12, 8),
                Field::new("PRD:DATE", FieldType::Date, 20, 4),
            ],
        )
        .with_memo(MemoDefinition::new("PRD:NOTE", false));
        let analysis = analyze(&definition.fields);
        let schema = table_schema(&definition, &analysis);

        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["PRD:ID", "PRD:OIL", "PRD:DATE", "PRD:NOTE"]);
        assert_eq!(schema.field(0).data_type(), &DataType::Int32);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).metadata().get("tps_array_size").map(String::as_str), Some("2"));
        assert_eq!(schema.field(2).data_type(), &DataType::Date32);
        assert_eq!(schema.metadata().get("tps_record_size").map(String::as_str), Some("24"));
    }
}
