use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};

use crate::models::field_type::{FieldType, TypedValue, hex_string};
use crate::models::text_encoding::TextEncoding;

/// Where and how a value sits inside a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueLayout {
    pub field_type: FieldType,
    pub size: usize,
    pub decimal_count: u8,
}

impl ValueLayout {
    pub fn new(field_type: FieldType, size: usize) -> Self {
        ValueLayout {
            field_type,
            size,
            decimal_count: 0,
        }
    }

    pub fn with_decimals(mut self, decimal_count: u8) -> Self {
        self.decimal_count = decimal_count;
        self
    }
}

/// Fixed-width value decoder bound to a text encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec {
    encoding: TextEncoding,
}

impl ByteCodec {
    pub fn new(encoding: TextEncoding) -> Self {
        ByteCodec { encoding }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Decode one value; slices running past the buffer degrade to `None`
    pub fn decode(&self, bytes: &[u8], offset: usize, layout: &ValueLayout) -> Option<TypedValue> {
        let slice = window(bytes, offset, layout.size);
        self.decode_slice(slice, layout)
    }

    /// Decode one array element; a partial element becomes its hex rendering
    pub fn decode_element(&self, bytes: &[u8], offset: usize, layout: &ValueLayout) -> Option<TypedValue> {
        let slice = window(bytes, offset, layout.size);
        if slice.is_empty() {
            return None;
        }
        match self.decode_slice(slice, layout) {
            Some(value) => Some(value),
            None => Some(TypedValue::Text(hex_string(slice))),
        }
    }

    fn decode_slice(&self, slice: &[u8], layout: &ValueLayout) -> Option<TypedValue> {
        match layout.field_type {
            FieldType::Byte => {
                let byte = *slice.first()?;
                if layout.size == 1 {
                    Some(TypedValue::Bool(byte != 0))
                } else {
                    Some(TypedValue::Integer(i64::from(byte)))
                }
            }
            FieldType::Short => {
                take(slice, 2).map(|b| TypedValue::Integer(i64::from(LittleEndian::read_i16(b))))
            }
            FieldType::UShort => {
                take(slice, 2).map(|b| TypedValue::Integer(i64::from(LittleEndian::read_u16(b))))
            }
            FieldType::Long => {
                take(slice, 4).map(|b| TypedValue::Integer(i64::from(LittleEndian::read_i32(b))))
            }
            FieldType::ULong => {
                take(slice, 4).map(|b| TypedValue::Integer(i64::from(LittleEndian::read_u32(b))))
            }
            FieldType::Float => {
                take(slice, 4).map(|b| TypedValue::Real(f64::from(LittleEndian::read_f32(b))))
            }
            FieldType::Double => take(slice, 8).map(|b| TypedValue::Real(LittleEndian::read_f64(b))),
            FieldType::Date => take(slice, 4)
                .and_then(|b| decode_packed_date(LittleEndian::read_u32(b)))
                .map(TypedValue::Text),
            FieldType::Time => take(slice, 4)
                .and_then(|b| decode_packed_time(LittleEndian::read_u32(b)))
                .map(TypedValue::Text),
            FieldType::Decimal => {
                if slice.len() < layout.size || slice.is_empty() {
                    return None;
                }
                decode_bcd(slice, layout.decimal_count).map(TypedValue::Real)
            }
            FieldType::String => {
                if slice.is_empty() {
                    return None;
                }
                let text = self.encoding.decode_lossy(until_nul(slice));
                Some(TypedValue::Text(text.trim_end_matches(' ').to_string()))
            }
            FieldType::CString => {
                if slice.is_empty() {
                    return None;
                }
                Some(TypedValue::Text(self.encoding.decode_lossy(until_nul(slice))))
            }
            FieldType::PString => {
                let (len, rest) = slice.split_first()?;
                let end = usize::from(*len).min(rest.len());
                Some(TypedValue::Text(self.encoding.decode_lossy(&rest[..end])))
            }
            FieldType::Group => {
                if slice.is_empty() {
                    None
                } else {
                    Some(TypedValue::Binary(slice.to_vec()))
                }
            }
        }
    }

    /// Encode a value into exactly `layout.size` bytes; mismatched values write zeros
    pub fn encode(&self, value: Option<&TypedValue>, layout: &ValueLayout) -> Vec<u8> {
        let mut out = vec![0u8; layout.size];
        let Some(value) = value else {
            return out;
        };
        match (layout.field_type, value) {
            (FieldType::Byte, TypedValue::Bool(b)) => put(&mut out, &[u8::from(*b)]),
            (FieldType::Byte, TypedValue::Integer(i)) => put(&mut out, &[*i as u8]),
            (FieldType::Short, TypedValue::Integer(i)) => put(&mut out, &(*i as i16).to_le_bytes()),
            (FieldType::UShort, TypedValue::Integer(i)) => put(&mut out, &(*i as u16).to_le_bytes()),
            (FieldType::Long, TypedValue::Integer(i)) => put(&mut out, &(*i as i32).to_le_bytes()),
            (FieldType::Long, TypedValue::Bool(b)) => put(&mut out, &i32::from(*b).to_le_bytes()),
            (FieldType::ULong, TypedValue::Integer(i)) => put(&mut out, &(*i as u32).to_le_bytes()),
            (FieldType::Float, TypedValue::Real(r)) => put(&mut out, &(*r as f32).to_le_bytes()),
            (FieldType::Double, TypedValue::Real(r)) => put(&mut out, &r.to_le_bytes()),
            (FieldType::Double, TypedValue::Integer(i)) => put(&mut out, &(*i as f64).to_le_bytes()),
            (FieldType::Date, TypedValue::Text(s)) => {
                if let Some(packed) = encode_date_str(s) {
                    put(&mut out, &packed.to_le_bytes());
                }
            }
            (FieldType::Time, TypedValue::Text(s)) => {
                if let Some(packed) = encode_time_str(s) {
                    put(&mut out, &packed.to_le_bytes());
                }
            }
            (FieldType::String, TypedValue::Text(s)) => put(&mut out, &self.encoding.encode_lossy(s)),
            (FieldType::CString, TypedValue::Text(s)) => {
                let bytes = self.encoding.encode_lossy(s);
                let keep = bytes.len().min(layout.size.saturating_sub(1));
                put(&mut out, &bytes[..keep]);
            }
            (FieldType::PString, TypedValue::Text(s)) => {
                let bytes = self.encoding.encode_lossy(s);
                let keep = bytes.len().min(layout.size.saturating_sub(1)).min(255);
                let mut buf = Vec::with_capacity(keep + 1);
                buf.push(keep as u8);
                buf.extend_from_slice(&bytes[..keep]);
                put(&mut out, &buf);
            }
            (FieldType::Group, TypedValue::Binary(bytes)) => put(&mut out, bytes),
            (field_type, value) => {
                log::debug!("No encoding for {:?} into {} field, writing zeros", value, field_type);
            }
        }
        out
    }
}

fn window(bytes: &[u8], offset: usize, size: usize) -> &[u8] {
    if offset >= bytes.len() {
        return &[];
    }
    let end = offset.saturating_add(size).min(bytes.len());
    &bytes[offset..end]
}

fn take(slice: &[u8], width: usize) -> Option<&[u8]> {
    if slice.len() < width {
        None
    } else {
        Some(&slice[..width])
    }
}

fn until_nul(slice: &[u8]) -> &[u8] {
    match slice.iter().position(|b| *b == 0) {
        Some(pos) => &slice[..pos],
        None => slice,
    }
}

fn put(out: &mut [u8], bytes: &[u8]) {
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
}

/// Packed date: year in bits 16-31, month in 8-15, day in 0-7
pub fn decode_packed_date(value: u32) -> Option<String> {
    let year = (value >> 16) as i32;
    let month = (value >> 8) & 0xFF;
    let day = value & 0xFF;
    if year == 0 || month == 0 || day == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

pub fn encode_packed_date(year: u16, month: u8, day: u8) -> u32 {
    (u32::from(year) << 16) | (u32::from(month) << 8) | u32::from(day)
}

/// Packed time: hour in bits 24-31, minute 16-23, second 8-15, hundredths 0-7
pub fn decode_packed_time(value: u32) -> Option<String> {
    if value == 0 {
        return None;
    }
    let hour = value >> 24;
    let minute = (value >> 16) & 0xFF;
    let second = (value >> 8) & 0xFF;
    let hundredths = value & 0xFF;
    if hundredths > 99 {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, second).map(|t| t.format("%H:%M:%S").to_string())
}

pub fn encode_packed_time(hour: u8, minute: u8, second: u8, hundredths: u8) -> u32 {
    (u32::from(hour) << 24) | (u32::from(minute) << 16) | (u32::from(second) << 8) | u32::from(hundredths)
}

fn encode_date_str(s: &str) -> Option<u32> {
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
    let year = u16::try_from(date.year()).ok()?;
    Some(encode_packed_date(year, date.month() as u8, date.day() as u8))
}

fn encode_time_str(s: &str) -> Option<u32> {
    let time = NaiveTime::parse_from_str(s.trim(), "%H:%M:%S").ok()?;
    Some(encode_packed_time(time.hour() as u8, time.minute() as u8, time.second() as u8, 0))
}

/// Packed BCD: sign in the first nibble, then digits with `decimal_count` after the point
fn decode_bcd(slice: &[u8], decimal_count: u8) -> Option<f64> {
    let nibbles = hex_string(slice);
    let negative = !nibbles.starts_with('0');
    let digits = &nibbles[1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let point = digits.len().saturating_sub(usize::from(decimal_count));
    let int_part = if point == 0 { "0" } else { &digits[..point] };
    let frac_part = &digits[point..];
    let text = if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    };
    let value: f64 = text.parse().ok()?;
    Some(if negative { -value } else { value })
}
