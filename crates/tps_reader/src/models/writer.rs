use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{TpsError, TpsResult};
use crate::models::definition::TableDefinition;
use crate::models::header::{FileHeader, HEADER_SIZE, offset_to_ref};
use crate::models::page::{PAGE_HEADER_LEN, PageHeader, rle_compress};
use crate::models::record::{RawRecord, RecordBody};
use crate::models::store::PAGE_ALIGNMENT;
use crate::models::text_encoding::TextEncoding;

/// Uncompressed payload a page is filled up to before a new one starts
pub const PAGE_PAYLOAD_LIMIT: usize = 0x1000;

/// Definition and memo bytes are split into segments of this size
pub const SEGMENT_SIZE: usize = 0x0800;

/// Builds a new, self-consistent legacy store
#[derive(Debug)]
pub struct TpsWriter {
    encoding: TextEncoding,
    tables: BTreeMap<u32, TableDefinition>,
    rows: Vec<RawRecord>,
    last_issued_row: u32,
    block_table: bool,
}

impl TpsWriter {
    pub fn new(encoding: TextEncoding) -> Self {
        TpsWriter {
            encoding,
            tables: BTreeMap::new(),
            rows: Vec::new(),
            last_issued_row: 0,
            block_table: true,
        }
    }

    /// Leave the block table empty so readers must walk the page tree
    pub fn without_block_table(mut self) -> Self {
        self.block_table = false;
        self
    }

    /// Register a table; a zero table number is replaced with the next free one
    pub fn add_table(&mut self, mut definition: TableDefinition) -> TpsResult<u32> {
        if definition.table_number == 0 {
            definition.table_number = self.tables.keys().next_back().map_or(1, |n| n + 1);
        }
        let number = definition.table_number;
        if self.tables.contains_key(&number) {
            return Err(TpsError::Layout(format!("table number {} registered twice", number)));
        }
        self.tables.insert(number, definition);
        Ok(number)
    }

    pub fn table(&self, table_number: u32) -> Option<&TableDefinition> {
        self.tables.get(&table_number)
    }

    /// Append a data record and return its record number
    pub fn add_record(&mut self, table_number: u32, data: Vec<u8>) -> TpsResult<u32> {
        if !self.tables.contains_key(&table_number) {
            return Err(TpsError::UnknownTable(table_number));
        }
        self.last_issued_row += 1;
        let record_number = self.last_issued_row;
        self.rows.push(RawRecord {
            table_number,
            body: RecordBody::Data { record_number, data },
        });
        Ok(record_number)
    }

    pub fn add_memo(&mut self, table_number: u32, owner: u32, memo_index: u8, bytes: &[u8]) -> TpsResult<()> {
        if !self.tables.contains_key(&table_number) {
            return Err(TpsError::UnknownTable(table_number));
        }
        for (sequence, chunk) in bytes.chunks(SEGMENT_SIZE).enumerate() {
            self.rows.push(RawRecord {
                table_number,
                body: RecordBody::Memo {
                    owner,
                    memo_index,
                    sequence: sequence as u16,
                    bytes: chunk.to_vec(),
                },
            });
        }
        Ok(())
    }

    fn catalog_records(&self) -> TpsResult<Vec<RawRecord>> {
        let mut records = Vec::new();
        for (number, table) in &self.tables {
            records.push(RawRecord {
                table_number: 0,
                body: RecordBody::TableName {
                    table_number: *number,
                    name: self.encoding.encode_lossy(&table.name),
                },
            });
            let bytes = table.encode(self.encoding)?;
            for (segment, chunk) in bytes.chunks(SEGMENT_SIZE).enumerate() {
                records.push(RawRecord {
                    table_number: *number,
                    body: RecordBody::Definition {
                        segment: segment as u16,
                        bytes: chunk.to_vec(),
                    },
                });
            }
        }
        Ok(records)
    }

    pub fn to_bytes(&self) -> TpsResult<Vec<u8>> {
        let mut payloads: Vec<(Vec<u8>, u16)> = Vec::new();
        let mut current = Vec::new();
        let mut count: u16 = 0;
        for record in self.catalog_records()?.iter().chain(&self.rows) {
            let encoded = record.encode()?;
            if !current.is_empty() && current.len() + encoded.len() > PAGE_PAYLOAD_LIMIT {
                payloads.push((std::mem::take(&mut current), count));
                count = 0;
            }
            current.extend_from_slice(&encoded);
            count += 1;
        }
        if !current.is_empty() {
            payloads.push((current, count));
        }

        let mut out = vec![0u8; HEADER_SIZE];
        let mut leaf_refs = Vec::with_capacity(payloads.len());
        for (payload, record_count) in &payloads {
            let offset = out.len() as u32;
            leaf_refs.push(page_ref(offset)?);
            write_page(&mut out, payload, *record_count, 0)?;
        }

        let root_offset = out.len() as u32;
        let index_payload: Vec<u8> = leaf_refs.iter().flat_map(|r| r.to_le_bytes()).collect();
        write_page(&mut out, &index_payload, 0, 1)?;

        let end_ref = page_ref(out.len() as u32)?;
        let header = FileHeader {
            header_size: HEADER_SIZE as u16,
            file_size: out.len() as u32,
            allocated_file_size: out.len() as u32,
            last_issued_row: self.last_issued_row,
            change_count: 1,
            page_root_ref: page_ref(root_offset)?,
            block_start_refs: if self.block_table { vec![0] } else { Vec::new() },
            block_end_refs: if self.block_table { vec![end_ref] } else { Vec::new() },
        };
        out[..HEADER_SIZE].copy_from_slice(&header.encode()?);
        log::debug!(
            "Synthesized {} tables, {} rows into {} bytes over {} pages",
            self.tables.len(),
            self.rows.len(),
            out.len(),
            payloads.len() + 1
        );
        Ok(out)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> TpsResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

fn page_ref(offset: u32) -> TpsResult<u32> {
    offset_to_ref(offset).ok_or_else(|| TpsError::Layout(format!("page offset {:#x} lies inside the header", offset)))
}

fn write_page(out: &mut Vec<u8>, payload: &[u8], record_count: u16, level: u8) -> TpsResult<()> {
    let offset = out.len() as u32;
    let compressed = rle_compress(payload);
    let stored: &[u8] = if compressed.len() < payload.len() { &compressed } else { payload };
    let size = u16::try_from(PAGE_HEADER_LEN + stored.len())
        .map_err(|_| TpsError::Layout(format!("page at {:#x} exceeds 64 KiB", offset)))?;
    let size_uncompressed = u16::try_from(PAGE_HEADER_LEN + payload.len())
        .map_err(|_| TpsError::Layout(format!("page at {:#x} expands beyond 64 KiB", offset)))?;
    let header = PageHeader {
        offset,
        size,
        size_uncompressed,
        size_uncompressed_without_records: PAGE_HEADER_LEN as u16,
        record_count,
        hierarchy_level: level,
    };
    header.write(out)?;
    out.extend_from_slice(stored);
    let aligned = (out.len() as u32).div_ceil(PAGE_ALIGNMENT) * PAGE_ALIGNMENT;
    out.resize(aligned as usize, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::definition::Field;
    use crate::models::field_type::FieldType;
    use crate::models::header::FileHeader;

    #[test]
    fn test_output_is_page_aligned_with_valid_header() {
        let mut writer = TpsWriter::new(TextEncoding::latin1());
        let table = writer
            .add_table(TableDefinition::new(0, "ONE", vec![Field::new("ID", FieldType::Long, 0, 4)]))
            .unwrap();
        assert_eq!(table, 1);
        writer.add_record(table, 5i32.to_le_bytes().to_vec()).unwrap();

        let bytes = writer.to_bytes().unwrap();
        assert_eq!(bytes.len() % PAGE_ALIGNMENT as usize, 0);
        let header = FileHeader::parse(&bytes).unwrap();
        assert_eq!(header.file_size as usize, bytes.len());
        assert_eq!(header.last_issued_row, 1);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let mut writer = TpsWriter::new(TextEncoding::latin1());
        assert!(matches!(writer.add_record(9, vec![1]), Err(TpsError::UnknownTable(9))));
    }
}
