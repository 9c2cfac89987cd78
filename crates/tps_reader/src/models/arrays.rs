use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::codec::{ByteCodec, ValueLayout};
use crate::models::definition::Field;
use crate::models::field_type::{FieldType, TypedValue};

/// Splits a field name into its prefix and trailing sequence number, e.g. `TEST:PROD3`
static TRAILING_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.*\D)(?P<seq>\d+)$").expect("Invalid regex pattern for numbered fields")
});

/// A repeated value, either packed in one field or spread across numbered fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayFieldInfo {
    pub base_name: String,
    pub element_type: FieldType,
    pub element_size: usize,
    pub array_size: usize,
    pub start_offset: usize,
    pub element_offsets: Vec<usize>,
    pub is_single_field_array: bool,
    pub decimal_count: u8,
}

impl ArrayFieldInfo {
    pub fn element_layout(&self) -> ValueLayout {
        ValueLayout::new(self.element_type, self.element_size).with_decimals(self.decimal_count)
    }
}

/// Position of an output column in the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnSource {
    Regular(usize),
    Array(usize),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TableAnalysis {
    pub has_arrays: bool,
    pub array_fields: Vec<ArrayFieldInfo>,
    pub regular_fields: Vec<Field>,
    /// Output column order; arrays sit where their first member was
    pub order: Vec<ColumnSource>,
}

/// A decoded column of one record
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Scalar(Option<TypedValue>),
    Array(Vec<Option<TypedValue>>),
}

impl ColumnValue {
    /// JSON text for arrays, e.g. `[true,false,null]`
    pub fn array_json(values: &[Option<TypedValue>]) -> String {
        let items: Vec<serde_json::Value> = values
            .iter()
            .map(|v| v.as_ref().map(TypedValue::to_json).unwrap_or(serde_json::Value::Null))
            .collect();
        serde_json::Value::Array(items).to_string()
    }
}

impl TableAnalysis {
    /// Raw (unsanitized) column names in output order
    pub fn column_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|source| match source {
                ColumnSource::Regular(i) => self.regular_fields[*i].name.as_str(),
                ColumnSource::Array(i) => self.array_fields[*i].base_name.as_str(),
            })
            .collect()
    }

    /// Decode one record into column values in output order
    pub fn parse_record(&self, data: &[u8], codec: &ByteCodec) -> Vec<ColumnValue> {
        self.order
            .iter()
            .map(|source| match source {
                ColumnSource::Regular(i) => {
                    let field = &self.regular_fields[*i];
                    ColumnValue::Scalar(codec.decode(data, field.offset, &field.layout()))
                }
                ColumnSource::Array(i) => {
                    let array = &self.array_fields[*i];
                    let layout = array.element_layout();
                    ColumnValue::Array(
                        array
                            .element_offsets
                            .iter()
                            .map(|offset| codec.decode_element(data, *offset, &layout))
                            .collect(),
                    )
                }
            })
            .collect()
    }
}

/// Split a flat field list into array descriptors and regular fields
pub fn analyze(fields: &[Field]) -> TableAnalysis {
    let mut claimed = vec![false; fields.len()];
    let mut anchored: Vec<(usize, ArrayFieldInfo)> = Vec::new();

    for (i, field) in fields.iter().enumerate() {
        if field.array_element_count <= 1 {
            continue;
        }
        let count = field.array_element_count;
        let element_size = field
            .array_element_size
            .filter(|size| *size > 0)
            .unwrap_or(field.size / count);
        if element_size == 0 {
            log::warn!(
                "Field '{}' declares {} elements in {} bytes, keeping it as a regular field",
                field.name,
                count,
                field.size
            );
            continue;
        }
        claimed[i] = true;
        anchored.push((
            i,
            ArrayFieldInfo {
                base_name: field.name.clone(),
                element_type: field.field_type,
                element_size,
                array_size: count,
                start_offset: field.offset,
                element_offsets: (0..count).map(|k| field.offset + k * element_size).collect(),
                is_single_field_array: true,
                decimal_count: field.decimal_count,
            },
        ));
    }

    for members in numbered_groups(fields, &claimed) {
        if let Some(info) = fold_group(fields, &members) {
            for i in &members {
                claimed[*i] = true;
            }
            let anchor = members.iter().copied().min().unwrap_or(0);
            anchored.push((anchor, info));
        }
    }
    anchored.sort_by_key(|(anchor, _)| *anchor);

    let mut analysis = TableAnalysis::default();
    let mut next_array = anchored.into_iter().peekable();
    for (i, field) in fields.iter().enumerate() {
        if let Some((_, info)) = next_array.next_if(|(anchor, _)| *anchor == i) {
            analysis.order.push(ColumnSource::Array(analysis.array_fields.len()));
            analysis.array_fields.push(info);
        } else if !claimed[i] {
            analysis.order.push(ColumnSource::Regular(analysis.regular_fields.len()));
            analysis.regular_fields.push(field.clone());
        }
    }
    analysis.has_arrays = !analysis.array_fields.is_empty();
    if analysis.has_arrays {
        log::debug!(
            "Detected {} array columns and {} regular fields",
            analysis.array_fields.len(),
            analysis.regular_fields.len()
        );
    }
    analysis
}

/// Unclaimed numbered fields grouped by (prefix, type, size), in first-seen order
fn numbered_groups(fields: &[Field], claimed: &[bool]) -> Vec<Vec<usize>> {
    let mut keys: Vec<(String, FieldType, usize)> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let Some(captures) = TRAILING_NUMBER.captures(&field.name) else {
            continue;
        };
        let key = (captures["base"].to_string(), field.field_type, field.size);
        match keys.iter().position(|k| *k == key) {
            Some(g) => groups[g].push(i),
            None => {
                keys.push(key);
                groups.push(vec![i]);
            }
        }
    }
    groups
}

/// A group folds only when every consecutive pair shares one stride
fn fold_group(fields: &[Field], members: &[usize]) -> Option<ArrayFieldInfo> {
    if members.len() < 2 {
        return None;
    }
    let mut offsets: Vec<usize> = members.iter().map(|i| fields[*i].offset).collect();
    offsets.sort_unstable();
    let first = &fields[members[0]];
    let stride = offsets[1] - offsets[0];
    if stride == 0 || stride < first.size {
        return None;
    }
    if offsets.windows(2).any(|pair| pair[1] - pair[0] != stride) {
        return None;
    }
    let base_name = TRAILING_NUMBER
        .captures(&first.name)
        .map(|c| c["base"].to_string())
        .unwrap_or_else(|| first.name.clone());
    Some(ArrayFieldInfo {
        base_name,
        element_type: first.field_type,
        element_size: first.size,
        array_size: offsets.len(),
        start_offset: offsets[0],
        element_offsets: offsets,
        is_single_field_array: false,
        decimal_count: first.decimal_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::text_encoding::TextEncoding;

    fn numbered(prefix: &str, offsets: &[usize], field_type: FieldType, size: usize) -> Vec<Field> {
        offsets
            .iter()
            .enumerate()
            .map(|(i, offset)| Field::new(format!("{}{}", prefix, i + 1), field_type, *offset, size))
            .collect()
    }

    #[test]
    fn test_single_field_array() {
        let fields = vec![
            Field::new("ID", FieldType::Long, 0, 4),
            Field::new("BOOLPARAM", FieldType::Byte, 4, 3).with_elements(3, None),
        ];
        let analysis = analyze(&fields);
        assert!(analysis.has_arrays);
        let array = &analysis.array_fields[0];
        assert!(array.is_single_field_array);
        assert_eq!(array.element_size, 1);
        assert_eq!(array.element_offsets, vec![4, 5, 6]);
        assert_eq!(analysis.column_names(), vec!["ID", "BOOLPARAM"]);
    }

    #[test]
    fn test_declared_element_size_wins() {
        let fields = vec![Field::new("CODES", FieldType::String, 10, 40).with_elements(4, Some(8))];
        let array = &analyze(&fields).array_fields[0];
        assert_eq!(array.element_size, 8);
        assert_eq!(array.element_offsets, vec![10, 18, 26, 34]);
    }

    #[test]
    fn test_constant_stride_group_folds() {
        let fields = numbered("X", &[100, 108, 116, 124, 132], FieldType::Double, 8);
        let analysis = analyze(&fields);
        assert_eq!(analysis.array_fields.len(), 1);
        let array = &analysis.array_fields[0];
        assert_eq!(array.array_size, 5);
        assert_eq!(array.base_name, "X");
        assert!(!array.is_single_field_array);
        assert!(analysis.regular_fields.is_empty());
    }

    #[test]
    fn test_irregular_stride_stays_regular() {
        let fields = numbered("X", &[100, 125, 150, 180, 220], FieldType::Double, 8);
        let analysis = analyze(&fields);
        assert!(!analysis.has_arrays);
        assert_eq!(analysis.regular_fields.len(), 5);
    }

    #[test]
    fn test_mixed_types_do_not_fold_together() {
        let mut fields = vec![Field::new("TEST:PROD1", FieldType::Double, 0, 8)];
        fields.push(Field::new("TEST:PROD2", FieldType::Long, 8, 4));
        let analysis = analyze(&fields);
        assert!(!analysis.has_arrays);
        assert_eq!(analysis.regular_fields.len(), 2);
    }

    #[test]
    fn test_prefixed_group_keeps_prefix_and_position() {
        let mut fields = vec![Field::new("TEST:ID", FieldType::Long, 0, 4)];
        fields.extend(numbered("TEST:PROD", &[4, 12, 20], FieldType::Double, 8));
        fields.push(Field::new("TEST:NAME", FieldType::String, 28, 10));
        let analysis = analyze(&fields);
        assert_eq!(analysis.column_names(), vec!["TEST:ID", "TEST:PROD", "TEST:NAME"]);
    }

    #[test]
    fn test_claimed_fields_are_not_reused() {
        // ARR2 is itself a packed array, so only ARR1 and ARR3 remain numbered and unclaimed
        let fields = vec![
            Field::new("ARR1", FieldType::Short, 0, 2),
            Field::new("ARR2", FieldType::Short, 2, 4).with_elements(2, None),
            Field::new("ARR3", FieldType::Short, 6, 2),
        ];
        let analysis = analyze(&fields);
        assert_eq!(analysis.array_fields.len(), 2);
        assert!(analysis.array_fields[1].is_single_field_array);
        assert_eq!(analysis.array_fields[0].element_offsets, vec![0, 6]);
    }

    #[test]
    fn test_parse_record_with_short_data() {
        let fields = vec![
            Field::new("ID", FieldType::Long, 0, 4),
            Field::new("FLAGS", FieldType::Byte, 4, 3).with_elements(3, None),
        ];
        let analysis = analyze(&fields);
        let codec = ByteCodec::new(TextEncoding::latin1());
        let values = analysis.parse_record(&[7, 0, 0, 0, 1, 0], &codec);

        assert_eq!(values[0], ColumnValue::Scalar(Some(TypedValue::Integer(7))));
        let ColumnValue::Array(items) = &values[1] else {
            panic!("expected an array column");
        };
        assert_eq!(ColumnValue::array_json(items), "[true,false,null]");
    }
}
