use arrow::datatypes::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Legacy field type tags as stored in table definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Byte,
    Short,
    UShort,
    Date,
    Time,
    Long,
    ULong,
    Float,
    Double,
    Decimal,
    String,
    CString,
    PString,
    Group,
}

impl FieldType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FieldType::Byte),
            0x02 => Some(FieldType::Short),
            0x03 => Some(FieldType::UShort),
            0x04 => Some(FieldType::Date),
            0x05 => Some(FieldType::Time),
            0x06 => Some(FieldType::Long),
            0x07 => Some(FieldType::ULong),
            0x08 => Some(FieldType::Float),
            0x09 => Some(FieldType::Double),
            0x0A => Some(FieldType::Decimal),
            0x12 => Some(FieldType::String),
            0x13 => Some(FieldType::CString),
            0x14 => Some(FieldType::PString),
            0x16 => Some(FieldType::Group),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            FieldType::Byte => 0x01,
            FieldType::Short => 0x02,
            FieldType::UShort => 0x03,
            FieldType::Date => 0x04,
            FieldType::Time => 0x05,
            FieldType::Long => 0x06,
            FieldType::ULong => 0x07,
            FieldType::Float => 0x08,
            FieldType::Double => 0x09,
            FieldType::Decimal => 0x0A,
            FieldType::String => 0x12,
            FieldType::CString => 0x13,
            FieldType::PString => 0x14,
            FieldType::Group => 0x16,
        }
    }

    /// String family types carry an element size and picture template in definitions
    pub fn is_string(self) -> bool {
        matches!(self, FieldType::String | FieldType::CString | FieldType::PString)
    }

    /// Natural byte width, `None` for variable-width types
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldType::Byte => Some(1),
            FieldType::Short | FieldType::UShort => Some(2),
            FieldType::Date | FieldType::Time | FieldType::Long | FieldType::ULong | FieldType::Float => Some(4),
            FieldType::Double => Some(8),
            FieldType::Decimal
            | FieldType::String
            | FieldType::CString
            | FieldType::PString
            | FieldType::Group => None,
        }
    }

    /// Arrow type used when describing a field of this type and byte size
    pub fn arrow_type(self, size: usize) -> DataType {
        match self {
            FieldType::Byte if size == 1 => DataType::Boolean,
            FieldType::Byte => DataType::UInt8,
            FieldType::Short => DataType::Int16,
            FieldType::UShort => DataType::UInt16,
            FieldType::Long => DataType::Int32,
            FieldType::ULong => DataType::UInt32,
            FieldType::Float => DataType::Float32,
            FieldType::Double | FieldType::Decimal => DataType::Float64,
            FieldType::Date => DataType::Date32,
            FieldType::Time => DataType::Time32(TimeUnit::Second),
            FieldType::String | FieldType::CString | FieldType::PString => DataType::Utf8,
            FieldType::Group => DataType::Binary,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Byte => "BYTE",
            FieldType::Short => "SHORT",
            FieldType::UShort => "USHORT",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Long => "LONG",
            FieldType::ULong => "ULONG",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Decimal => "DECIMAL",
            FieldType::String => "STRING",
            FieldType::CString => "CSTRING",
            FieldType::PString => "PSTRING",
            FieldType::Group => "GROUP",
        };
        write!(f, "{}", name)
    }
}

/// Column type vocabulary of relational targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Text,
    Integer,
    Real,
    Binary,
}

impl TargetType {
    /// Collapse an Arrow type onto the target vocabulary
    pub fn from_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => TargetType::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => TargetType::Real,
            DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => TargetType::Binary,
            _ => TargetType::Text,
        }
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            TargetType::Text => "TEXT",
            TargetType::Integer => "INTEGER",
            TargetType::Real => "REAL",
            TargetType::Binary => "BLOB",
        }
    }
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl TypedValue {
    pub fn target_type(&self) -> TargetType {
        match self {
            TypedValue::Bool(_) | TypedValue::Integer(_) => TargetType::Integer,
            TypedValue::Real(_) => TargetType::Real,
            TypedValue::Text(_) => TargetType::Text,
            TypedValue::Binary(_) => TargetType::Binary,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TypedValue::Bool(b) => serde_json::Value::Bool(*b),
            TypedValue::Integer(i) => serde_json::Value::from(*i),
            TypedValue::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            TypedValue::Text(s) => serde_json::Value::String(s.clone()),
            TypedValue::Binary(bytes) => serde_json::Value::String(hex_string(bytes)),
        }
    }
}

/// Lowercase hex rendering of raw bytes
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
