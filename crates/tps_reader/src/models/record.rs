use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::errors::{TpsError, TpsResult};

/// Length, table number and tag preceding every record body
pub const RECORD_HEADER_LEN: usize = 7;

pub const TAG_DATA: u8 = 0xF3;
pub const TAG_METADATA: u8 = 0xF6;
pub const TAG_DEFINITION: u8 = 0xFA;
pub const TAG_MEMO: u8 = 0xFC;
pub const TAG_TABLE_NAME: u8 = 0xFE;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecordBody {
    TableName { table_number: u32, name: Vec<u8> },
    Data { record_number: u32, data: Vec<u8> },
    Definition { segment: u16, bytes: Vec<u8> },
    Memo { owner: u32, memo_index: u8, sequence: u16, bytes: Vec<u8> },
    Metadata,
    Index { tag: u8 },
}

/// One record located inside a decompressed page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub table_number: u32,
    pub body: RecordBody,
}

/// A data row handed to converters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub table_number: u32,
    pub record_number: u32,
    pub data: Vec<u8>,
}

impl RawRecord {
    pub fn into_data(self) -> Option<Record> {
        match self.body {
            RecordBody::Data { record_number, data } => Some(Record {
                table_number: self.table_number,
                record_number,
                data,
            }),
            _ => None,
        }
    }

    /// Serialize with its length prefix
    pub fn encode(&self) -> TpsResult<Vec<u8>> {
        let mut body = Vec::new();
        let tag = match &self.body {
            RecordBody::TableName { table_number, name } => {
                body.write_u32::<LittleEndian>(*table_number)?;
                body.extend_from_slice(name);
                TAG_TABLE_NAME
            }
            RecordBody::Data { record_number, data } => {
                body.write_u32::<LittleEndian>(*record_number)?;
                body.extend_from_slice(data);
                TAG_DATA
            }
            RecordBody::Definition { segment, bytes } => {
                body.write_u16::<LittleEndian>(*segment)?;
                body.extend_from_slice(bytes);
                TAG_DEFINITION
            }
            RecordBody::Memo { owner, memo_index, sequence, bytes } => {
                body.write_u32::<LittleEndian>(*owner)?;
                body.push(*memo_index);
                body.write_u16::<LittleEndian>(*sequence)?;
                body.extend_from_slice(bytes);
                TAG_MEMO
            }
            RecordBody::Metadata => TAG_METADATA,
            RecordBody::Index { tag } => *tag,
        };
        let total = RECORD_HEADER_LEN + body.len();
        let total = u16::try_from(total)
            .map_err(|_| TpsError::Layout(format!("record of {} bytes exceeds the 16-bit length prefix", total)))?;
        let mut out = Vec::with_capacity(total as usize);
        out.write_u16::<LittleEndian>(total)?;
        out.write_u32::<LittleEndian>(self.table_number)?;
        out.push(tag);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn parse_body(tag: u8, body: &[u8]) -> Option<RecordBody> {
    let parsed = match tag {
        TAG_TABLE_NAME if body.len() >= 4 => RecordBody::TableName {
            table_number: LittleEndian::read_u32(&body[0..4]),
            name: body[4..].to_vec(),
        },
        TAG_DATA if body.len() >= 4 => RecordBody::Data {
            record_number: LittleEndian::read_u32(&body[0..4]),
            data: body[4..].to_vec(),
        },
        TAG_DEFINITION if body.len() >= 2 => RecordBody::Definition {
            segment: LittleEndian::read_u16(&body[0..2]),
            bytes: body[2..].to_vec(),
        },
        TAG_MEMO if body.len() >= 7 => RecordBody::Memo {
            owner: LittleEndian::read_u32(&body[0..4]),
            memo_index: body[4],
            sequence: LittleEndian::read_u16(&body[5..7]),
            bytes: body[7..].to_vec(),
        },
        TAG_TABLE_NAME | TAG_DATA | TAG_DEFINITION | TAG_MEMO => return None,
        TAG_METADATA => RecordBody::Metadata,
        other => RecordBody::Index { tag: other },
    };
    Some(parsed)
}

/// Records parsed from a page payload, plus the reason parsing stopped early
#[derive(Debug, Default)]
pub struct PageRecords {
    pub records: Vec<RawRecord>,
    pub error: Option<TpsError>,
}

/// Walk the length-prefixed records of a decompressed leaf payload
pub fn parse_records(payload: &[u8], page_offset: u32) -> PageRecords {
    let mut result = PageRecords::default();
    let mut pos = 0;
    while pos < payload.len() {
        let remaining = payload.len() - pos;
        if remaining < RECORD_HEADER_LEN {
            if payload[pos..].iter().any(|b| *b != 0) {
                result.error = Some(TpsError::invalid_page(
                    page_offset,
                    format!("{} trailing bytes at {} do not form a record", remaining, pos),
                ));
            }
            break;
        }
        let length = LittleEndian::read_u16(&payload[pos..pos + 2]) as usize;
        if length == 0 && payload[pos..].iter().all(|b| *b == 0) {
            break;
        }
        if length < RECORD_HEADER_LEN || length > remaining {
            result.error = Some(TpsError::invalid_page(
                page_offset,
                format!("record at {} declares length {} with {} bytes left", pos, length, remaining),
            ));
            break;
        }
        let table_number = LittleEndian::read_u32(&payload[pos + 2..pos + 6]);
        let tag = payload[pos + 6];
        match parse_body(tag, &payload[pos + RECORD_HEADER_LEN..pos + length]) {
            Some(body) => result.records.push(RawRecord { table_number, body }),
            None => {
                result.error = Some(TpsError::RecordParsing(format!(
                    "record at {} in page {:#x} has a short body for tag {:#04x}",
                    pos, page_offset, tag
                )));
                break;
            }
        }
        pos += length;
    }
    result
}
