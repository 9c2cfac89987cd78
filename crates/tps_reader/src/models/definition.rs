use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

use crate::errors::{TpsError, TpsResult};
use crate::models::codec::ValueLayout;
use crate::models::field_type::FieldType;
use crate::models::text_encoding::TextEncoding;

/// Size of the fixed definition header: version, record size and three counts
pub const DEFINITION_HEADER_LEN: usize = 10;

const EMPTY_EXTERNAL_MARKER: u8 = 0x01;
const MEMO_FLAG_BINARY: u16 = 0x0001;
const INDEX_FLAG_UNIQUE: u8 = 0x01;

/// One column of a legacy record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub number: u16,
    pub name: String,
    pub field_type: FieldType,
    pub offset: usize,
    pub size: usize,
    pub array_element_count: usize,
    pub array_element_size: Option<usize>,
    pub decimal_count: u8,
    pub overlaps: u16,
}

impl Field {
    pub fn new<S: Into<String>>(name: S, field_type: FieldType, offset: usize, size: usize) -> Self {
        Field {
            number: 0,
            name: name.into(),
            field_type,
            offset,
            size,
            array_element_count: 1,
            array_element_size: None,
            decimal_count: 0,
            overlaps: 0,
        }
    }

    /// Mark this field as holding `count` packed elements
    pub fn with_elements(mut self, count: usize, element_size: Option<usize>) -> Self {
        self.array_element_count = count.max(1);
        self.array_element_size = element_size;
        self
    }

    pub fn with_decimals(mut self, decimal_count: u8) -> Self {
        self.decimal_count = decimal_count;
        self
    }

    pub fn layout(&self) -> ValueLayout {
        ValueLayout::new(self.field_type, self.size).with_decimals(self.decimal_count)
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Out-of-row text or blob column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoDefinition {
    pub name: String,
    pub external_file: Option<String>,
    pub size: usize,
    pub binary: bool,
}

impl MemoDefinition {
    pub fn new<S: Into<String>>(name: S, binary: bool) -> Self {
        MemoDefinition {
            name: name.into(),
            external_file: None,
            size: 0,
            binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub external_file: Option<String>,
    pub unique: bool,
    /// Field numbers making up the key, in key order
    pub field_numbers: Vec<u16>,
}

/// Metadata of one logical table
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_number: u32,
    pub name: String,
    pub driver_version: u16,
    pub record_size: usize,
    pub fields: Vec<Field>,
    pub memos: Vec<MemoDefinition>,
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    /// Build a definition from fields, numbering them and deriving the record size
    pub fn new<S: Into<String>>(table_number: u32, name: S, fields: Vec<Field>) -> Self {
        let record_size = fields.iter().map(Field::end).max().unwrap_or(0);
        let fields = fields
            .into_iter()
            .enumerate()
            .map(|(i, mut field)| {
                if field.number == 0 {
                    field.number = (i + 1) as u16;
                }
                field
            })
            .collect();
        TableDefinition {
            table_number,
            name: name.into(),
            driver_version: 1,
            record_size,
            fields,
            memos: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// A definition with no columns; records of such a table convert to nothing
    pub fn empty<S: Into<String>>(table_number: u32, name: S) -> Self {
        TableDefinition {
            table_number,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_memo(mut self, memo: MemoDefinition) -> Self {
        self.memos.push(memo);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn memo_count(&self) -> usize {
        self.memos.len()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.memos.is_empty()
    }

    pub fn field_by_number(&self, number: u16) -> Option<&Field> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Strict parse of concatenated definition segments
    pub fn parse(table_number: u32, name: &str, bytes: &[u8], encoding: TextEncoding) -> TpsResult<Self> {
        if bytes.len() < DEFINITION_HEADER_LEN {
            return Err(TpsError::DefinitionParsing(format!(
                "definition header needs {} bytes, got {}",
                DEFINITION_HEADER_LEN,
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let driver_version = read_u16(&mut cursor)?;
        let record_size = read_u16(&mut cursor)? as usize;
        let field_count = read_u16(&mut cursor)? as usize;
        let memo_count = read_u16(&mut cursor)? as usize;
        let index_count = read_u16(&mut cursor)? as usize;

        let mut fields = Vec::with_capacity(field_count.min(1024));
        for _ in 0..field_count {
            let field = parse_field(&mut cursor, encoding)?;
            if field.end() > record_size {
                return Err(TpsError::DefinitionParsing(format!(
                    "field '{}' spans {}..{} beyond record size {}",
                    field.name,
                    field.offset,
                    field.end(),
                    record_size
                )));
            }
            fields.push(field);
        }

        let mut memos = Vec::with_capacity(memo_count.min(256));
        for _ in 0..memo_count {
            let external_file = read_external_name(&mut cursor, encoding)?;
            let memo_name = read_cstring(&mut cursor, encoding)?;
            let size = read_u16(&mut cursor)? as usize;
            let flags = read_u16(&mut cursor)?;
            memos.push(MemoDefinition {
                name: memo_name,
                external_file,
                size,
                binary: flags & MEMO_FLAG_BINARY != 0,
            });
        }

        let mut indexes = Vec::with_capacity(index_count.min(256));
        for _ in 0..index_count {
            let external_file = read_external_name(&mut cursor, encoding)?;
            let index_name = read_cstring(&mut cursor, encoding)?;
            let flags = read_u8(&mut cursor)?;
            let key_count = read_u16(&mut cursor)? as usize;
            let mut field_numbers = Vec::with_capacity(key_count.min(256));
            for _ in 0..key_count {
                field_numbers.push(read_u16(&mut cursor)?);
                let _key_flags = read_u16(&mut cursor)?;
            }
            indexes.push(IndexDefinition {
                name: index_name,
                external_file,
                unique: flags & INDEX_FLAG_UNIQUE != 0,
                field_numbers,
            });
        }

        Ok(TableDefinition {
            table_number,
            name: name.to_string(),
            driver_version,
            record_size,
            fields,
            memos,
            indexes,
        })
    }

    /// Serialize into the on-disk definition layout
    pub fn encode(&self, encoding: TextEncoding) -> TpsResult<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(self.driver_version)?;
        out.write_u16::<LittleEndian>(to_u16(self.record_size, "record size")?)?;
        out.write_u16::<LittleEndian>(to_u16(self.fields.len(), "field count")?)?;
        out.write_u16::<LittleEndian>(to_u16(self.memos.len(), "memo count")?)?;
        out.write_u16::<LittleEndian>(to_u16(self.indexes.len(), "index count")?)?;

        for field in &self.fields {
            out.push(field.field_type.tag());
            out.write_u16::<LittleEndian>(to_u16(field.offset, "field offset")?)?;
            write_cstring(&mut out, &field.name, encoding);
            out.write_u16::<LittleEndian>(to_u16(field.array_element_count, "element count")?)?;
            out.write_u16::<LittleEndian>(to_u16(field.size, "field size")?)?;
            out.write_u16::<LittleEndian>(field.overlaps)?;
            out.write_u16::<LittleEndian>(field.number)?;
            if field.field_type.is_string() {
                let element_size = field.array_element_size.unwrap_or(field.size / field.array_element_count.max(1));
                out.write_u16::<LittleEndian>(to_u16(element_size, "element size")?)?;
                out.write_u16::<LittleEndian>(0)?;
            } else if field.field_type == FieldType::Decimal {
                out.push(field.decimal_count);
                out.push(field.size as u8);
            }
        }

        for memo in &self.memos {
            write_external_name(&mut out, memo.external_file.as_deref(), encoding);
            write_cstring(&mut out, &memo.name, encoding);
            out.write_u16::<LittleEndian>(to_u16(memo.size, "memo size")?)?;
            out.write_u16::<LittleEndian>(if memo.binary { MEMO_FLAG_BINARY } else { 0 })?;
        }

        for index in &self.indexes {
            write_external_name(&mut out, index.external_file.as_deref(), encoding);
            write_cstring(&mut out, &index.name, encoding);
            out.push(if index.unique { INDEX_FLAG_UNIQUE } else { 0 });
            out.write_u16::<LittleEndian>(to_u16(index.field_numbers.len(), "index key count")?)?;
            for number in &index.field_numbers {
                out.write_u16::<LittleEndian>(*number)?;
                out.write_u16::<LittleEndian>(0)?;
            }
        }
        Ok(out)
    }
}

fn parse_field(cursor: &mut Cursor<&[u8]>, encoding: TextEncoding) -> TpsResult<Field> {
    let tag = read_u8(cursor)?;
    let field_type = FieldType::from_tag(tag)
        .ok_or_else(|| TpsError::DefinitionParsing(format!("unknown field type tag {:#04x}", tag)))?;
    let offset = read_u16(cursor)? as usize;
    let name = read_cstring(cursor, encoding)?;
    let array_element_count = read_u16(cursor)? as usize;
    let size = read_u16(cursor)? as usize;
    let overlaps = read_u16(cursor)?;
    let number = read_u16(cursor)?;

    let mut array_element_size = None;
    let mut decimal_count = 0;
    if field_type.is_string() {
        array_element_size = Some(read_u16(cursor)? as usize);
        let _template = read_u16(cursor)?;
    } else if field_type == FieldType::Decimal {
        decimal_count = read_u8(cursor)?;
        let _decimal_size = read_u8(cursor)?;
    }

    Ok(Field {
        number,
        name,
        field_type,
        offset,
        size,
        array_element_count: array_element_count.max(1),
        array_element_size,
        decimal_count,
        overlaps,
    })
}

fn truncated(what: &str) -> TpsError {
    TpsError::DefinitionParsing(format!("definition truncated while reading {}", what))
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> TpsResult<u8> {
    cursor.read_u8().map_err(|_| truncated("u8"))
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> TpsResult<u16> {
    cursor.read_u16::<LittleEndian>().map_err(|_| truncated("u16"))
}

fn read_cstring(cursor: &mut Cursor<&[u8]>, encoding: TextEncoding) -> TpsResult<String> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        cursor.read_exact(&mut byte).map_err(|_| truncated("name"))?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(encoding.decode_lossy(&bytes))
}

fn read_external_name(cursor: &mut Cursor<&[u8]>, encoding: TextEncoding) -> TpsResult<Option<String>> {
    let name = read_cstring(cursor, encoding)?;
    if name.is_empty() {
        let marker = read_u8(cursor)?;
        if marker != EMPTY_EXTERNAL_MARKER {
            return Err(TpsError::DefinitionParsing(format!(
                "expected empty external name marker, found {:#04x}",
                marker
            )));
        }
        Ok(None)
    } else {
        Ok(Some(name))
    }
}

fn write_cstring(out: &mut Vec<u8>, text: &str, encoding: TextEncoding) {
    out.extend(encoding.encode_lossy(text).into_iter().filter(|b| *b != 0));
    out.push(0);
}

fn write_external_name(out: &mut Vec<u8>, name: Option<&str>, encoding: TextEncoding) {
    match name {
        Some(name) if !name.is_empty() => write_cstring(out, name, encoding),
        _ => {
            out.push(0);
            out.push(EMPTY_EXTERNAL_MARKER);
        }
    }
}

fn to_u16(value: usize, what: &str) -> TpsResult<u16> {
    u16::try_from(value).map_err(|_| TpsError::Layout(format!("{} {} does not fit in 16 bits", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> TableDefinition {
        TableDefinition::new(
            3,
            "WELLS",
            vec![
                Field::new("WEL:ID", FieldType::Long, 0, 4),
                Field::new("WEL:NAME", FieldType::String, 4, 20).with_elements(1, Some(20)),
                Field::new("WEL:RATE", FieldType::Decimal, 24, 5).with_decimals(2),
                Field::new("WEL:FLAGS", FieldType::Byte, 29, 3).with_elements(3, None),
            ],
        )
        .with_memo(MemoDefinition::new("WEL:NOTES", false))
        .with_index(IndexDefinition {
            name: "WEL:BY_ID".to_string(),
            external_file: None,
            unique: true,
            field_numbers: vec![1],
        })
    }

    #[test]
    fn test_encode_then_parse_preserves_structure() {
        let encoding = TextEncoding::latin1();
        let definition = sample_definition();
        let bytes = definition.encode(encoding).unwrap();
        let parsed = TableDefinition::parse(3, "WELLS", &bytes, encoding).unwrap();

        assert_eq!(parsed, definition);
        assert_eq!(parsed.record_size, 32);
        assert_eq!(parsed.field_by_number(4).unwrap().array_element_count, 3);
        assert!(parsed.indexes[0].unique);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let encoding = TextEncoding::latin1();
        let bytes = sample_definition().encode(encoding).unwrap();
        let err = TableDefinition::parse(3, "WELLS", &bytes[..bytes.len() - 3], encoding).unwrap_err();
        assert!(matches!(err, TpsError::DefinitionParsing(_)));
        assert!(TableDefinition::parse(3, "WELLS", &bytes[..6], encoding).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_type_and_overflowing_field() {
        let encoding = TextEncoding::latin1();
        let mut bytes = sample_definition().encode(encoding).unwrap();
        bytes[DEFINITION_HEADER_LEN] = 0x42;
        assert!(TableDefinition::parse(3, "WELLS", &bytes, encoding).is_err());

        let mut definition = sample_definition();
        definition.record_size = 10;
        let bytes = definition.encode(encoding).unwrap();
        let err = TableDefinition::parse(3, "WELLS", &bytes, encoding).unwrap_err();
        assert!(err.to_string().contains("beyond record size"));
    }
}
