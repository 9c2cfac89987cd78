//! Metadata recovery
//!
//! Turns the raw definition segments of a table into a [`Definition`] whose
//! variant says how much of it could be trusted. The strict parser is tried
//! first; when it fails, a placeholder layout is synthesized from the fixed
//! header, and when even the header is missing the table resolves to an empty
//! definition. Nothing here returns an error.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::definition::{DEFINITION_HEADER_LEN, Field, TableDefinition};
use crate::models::field_type::FieldType;
use crate::models::text_encoding::TextEncoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Resolved,
    Reconstructed,
    Empty,
}

/// A table definition tagged with how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Resolved(TableDefinition),
    Reconstructed(TableDefinition),
    Empty(TableDefinition),
}

impl Definition {
    pub fn table(&self) -> &TableDefinition {
        match self {
            Definition::Resolved(table) | Definition::Reconstructed(table) | Definition::Empty(table) => table,
        }
    }

    pub fn into_table(self) -> TableDefinition {
        match self {
            Definition::Resolved(table) | Definition::Reconstructed(table) | Definition::Empty(table) => table,
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            Definition::Resolved(_) => Confidence::Resolved,
            Definition::Reconstructed(_) => Confidence::Reconstructed,
            Definition::Empty(_) => Confidence::Empty,
        }
    }
}

/// Outcome of resolving one table, with any warnings the fallback chain raised
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub definition: Definition,
    pub warnings: Vec<String>,
}

/// Resolve definition segments keyed by segment index
pub fn resolve(
    table_number: u32,
    name: &str,
    segments: &BTreeMap<u16, Vec<u8>>,
    encoding: TextEncoding,
) -> Resolution {
    let bytes: Vec<u8> = segments.values().flatten().copied().collect();
    let mut warnings = Vec::new();

    if let Some(gap) = missing_segment(segments) {
        warnings.push(format!("table '{}' is missing definition segment {}", name, gap));
    }

    match TableDefinition::parse(table_number, name, &bytes, encoding) {
        Ok(table) if warnings.is_empty() => {
            return Resolution {
                definition: Definition::Resolved(table),
                warnings,
            };
        }
        Ok(_) => {}
        Err(e) => warnings.push(format!("table '{}' definition did not parse: {}", name, e)),
    }

    let definition = match reconstruct(table_number, name, &bytes) {
        Some(table) => {
            warnings.push(format!(
                "table '{}' reconstructed with {} placeholder fields over {} bytes",
                name,
                table.field_count(),
                table.record_size
            ));
            Definition::Reconstructed(table)
        }
        None => {
            warnings.push(format!("table '{}' has no usable definition, treating as empty", name));
            Definition::Empty(TableDefinition::empty(table_number, name))
        }
    };

    for warning in &warnings {
        log::warn!("{}", warning);
    }
    Resolution { definition, warnings }
}

fn missing_segment(segments: &BTreeMap<u16, Vec<u8>>) -> Option<u16> {
    segments
        .keys()
        .enumerate()
        .find(|(expected, index)| usize::from(**index) != *expected)
        .map(|(expected, _)| expected as u16)
}

/// Synthesize placeholder fields from the declared record size and field count
fn reconstruct(table_number: u32, name: &str, bytes: &[u8]) -> Option<TableDefinition> {
    if bytes.len() < DEFINITION_HEADER_LEN {
        return None;
    }
    let driver_version = LittleEndian::read_u16(&bytes[0..2]);
    let record_size = LittleEndian::read_u16(&bytes[2..4]) as usize;
    let field_count = LittleEndian::read_u16(&bytes[4..6]) as usize;
    if record_size == 0 {
        return None;
    }

    let fields: Vec<Field> = if field_count == 0 {
        vec![placeholder(1, 0, record_size)]
    } else if field_count > record_size {
        (0..field_count).map(|i| placeholder(i + 1, i, 1)).collect()
    } else {
        let size = record_size / field_count;
        (0..field_count)
            .map(|i| {
                let offset = i * size;
                let width = if i + 1 == field_count { record_size - offset } else { size };
                placeholder(i + 1, offset, width)
            })
            .collect()
    };

    Some(TableDefinition {
        table_number,
        name: name.to_string(),
        driver_version,
        record_size,
        fields,
        memos: Vec::new(),
        indexes: Vec::new(),
    })
}

fn placeholder(number: usize, offset: usize, size: usize) -> Field {
    let field_type = match size {
        2 => FieldType::Short,
        4 => FieldType::Long,
        _ => FieldType::Group,
    };
    let mut field = Field::new(format!("FIELD_{:03}", number), field_type, offset, size);
    field.number = number as u16;
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(record_size: u16, field_count: u16) -> Vec<u8> {
        let mut bytes = vec![1, 0];
        bytes.extend_from_slice(&record_size.to_le_bytes());
        bytes.extend_from_slice(&field_count.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    fn segments(parts: Vec<Vec<u8>>) -> BTreeMap<u16, Vec<u8>> {
        parts.into_iter().enumerate().map(|(i, p)| (i as u16, p)).collect()
    }

    #[test]
    fn test_valid_definition_resolves() {
        let encoding = TextEncoding::latin1();
        let table = TableDefinition::new(1, "PEOPLE", vec![Field::new("ID", FieldType::Long, 0, 4)]);
        let bytes = table.encode(encoding).unwrap();
        let split = bytes.len() / 2;
        let resolution = resolve(1, "PEOPLE", &segments(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]), encoding);

        assert_eq!(resolution.definition.confidence(), Confidence::Resolved);
        assert_eq!(resolution.definition.table(), &table);
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_header_only_reconstructs_even_layout() {
        let mut bytes = header(100, 4);
        bytes.push(0x99); // corrupt first field tag
        let resolution = resolve(2, "BROKEN", &segments(vec![bytes]), TextEncoding::latin1());

        assert_eq!(resolution.definition.confidence(), Confidence::Reconstructed);
        let table = resolution.definition.table();
        assert_eq!(table.field_count(), 4);
        assert_eq!(table.fields.iter().map(|f| f.size).sum::<usize>(), 100);
        assert_eq!(table.fields[1].offset, 25);
        assert_eq!(table.fields[0].name, "FIELD_001");
        assert!(!resolution.warnings.is_empty());
    }

    #[test]
    fn test_uneven_split_puts_remainder_last() {
        let resolution = resolve(2, "ODD", &segments(vec![header(10, 3)]), TextEncoding::latin1());
        let sizes: Vec<usize> = resolution.definition.table().fields.iter().map(|f| f.size).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
    }

    #[test]
    fn test_too_many_fields_expand_to_single_bytes() {
        let resolution = resolve(5, "WIDE", &segments(vec![header(8, 20)]), TextEncoding::latin1());
        let table = resolution.definition.table();
        assert_eq!(table.field_count(), 20);
        assert!(table.fields.iter().all(|f| f.size == 1));
        assert_eq!(table.fields[19].offset, 19);
    }

    #[test]
    fn test_missing_header_is_empty() {
        let resolution = resolve(7, "GONE", &segments(vec![vec![1, 2, 3]]), TextEncoding::latin1());
        assert_eq!(resolution.definition.confidence(), Confidence::Empty);
        assert!(resolution.definition.table().is_empty());
        assert_eq!(resolution.definition.table().record_size, 0);

        let none = resolve(7, "GONE", &BTreeMap::new(), TextEncoding::latin1());
        assert_eq!(none.definition.confidence(), Confidence::Empty);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let mut bytes = header(64, 6);
        bytes.extend_from_slice(&[0xEE; 7]);
        let input = segments(vec![bytes]);
        let first = resolve(9, "AGAIN", &input, TextEncoding::latin1());
        for _ in 0..3 {
            let again = resolve(9, "AGAIN", &input, TextEncoding::latin1());
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_segment_gap_forces_fallback() {
        let encoding = TextEncoding::latin1();
        let table = TableDefinition::new(1, "GAP", vec![Field::new("ID", FieldType::Long, 0, 4)]);
        let bytes = table.encode(encoding).unwrap();
        let mut input = BTreeMap::new();
        input.insert(0u16, bytes);
        input.insert(2u16, vec![0u8; 4]);
        let resolution = resolve(1, "GAP", &input, encoding);
        assert_ne!(resolution.definition.confidence(), Confidence::Resolved);
        assert!(resolution.warnings[0].contains("missing definition segment 1"));
    }
}
