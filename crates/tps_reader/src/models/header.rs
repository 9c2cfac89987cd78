use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::errors::{TpsError, TpsResult};

pub const HEADER_SIZE: usize = 0x200;
pub const MAGIC: &[u8; 6] = b"tOpS\x00\x00";
pub const BLOCK_SLOTS: usize = 60;

const MAGIC_OFFSET: usize = 0x0E;
const BLOCK_START_OFFSET: usize = 0x20;
const BLOCK_END_OFFSET: usize = BLOCK_START_OFFSET + BLOCK_SLOTS * 4;

/// Convert a page reference into an absolute byte offset; `None` when it cannot fit in 32 bits
pub fn ref_to_offset(reference: u32) -> Option<u32> {
    reference.checked_mul(0x100)?.checked_add(HEADER_SIZE as u32)
}

/// Convert an absolute byte offset back into a page reference; `None` inside the header
pub fn offset_to_ref(offset: u32) -> Option<u32> {
    offset.checked_sub(HEADER_SIZE as u32).map(|rest| rest >> 8)
}

/// File header found at offset 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub header_size: u16,
    pub file_size: u32,
    pub allocated_file_size: u32,
    pub last_issued_row: u32,
    pub change_count: u32,
    pub page_root_ref: u32,
    pub block_start_refs: Vec<u32>,
    pub block_end_refs: Vec<u32>,
}

impl FileHeader {
    pub fn parse(bytes: &[u8]) -> TpsResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TpsError::InvalidHeader(format!(
                "file is {} bytes, header alone needs {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let magic = &bytes[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()];
        if magic != MAGIC {
            return Err(TpsError::InvalidHeader(format!("bad magic signature {:02x?}", magic)));
        }
        let header_size = LittleEndian::read_u16(&bytes[0x04..0x06]);
        if header_size as usize != HEADER_SIZE {
            return Err(TpsError::InvalidHeader(format!("unexpected header size {:#x}", header_size)));
        }
        let read_refs = |start: usize| -> Vec<u32> {
            (0..BLOCK_SLOTS)
                .map(|i| LittleEndian::read_u32(&bytes[start + i * 4..start + i * 4 + 4]))
                .collect()
        };
        Ok(FileHeader {
            header_size,
            file_size: LittleEndian::read_u32(&bytes[0x06..0x0A]),
            allocated_file_size: LittleEndian::read_u32(&bytes[0x0A..0x0E]),
            last_issued_row: LittleEndian::read_u32(&bytes[0x14..0x18]),
            change_count: LittleEndian::read_u32(&bytes[0x18..0x1C]),
            page_root_ref: LittleEndian::read_u32(&bytes[0x1C..0x20]),
            block_start_refs: read_refs(BLOCK_START_OFFSET),
            block_end_refs: read_refs(BLOCK_END_OFFSET),
        })
    }

    pub fn encode(&self) -> TpsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(HEADER_SIZE as u16)?;
        out.write_u32::<LittleEndian>(self.file_size)?;
        out.write_u32::<LittleEndian>(self.allocated_file_size)?;
        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(self.last_issued_row)?;
        out.write_u32::<LittleEndian>(self.change_count)?;
        out.write_u32::<LittleEndian>(self.page_root_ref)?;
        for refs in [&self.block_start_refs, &self.block_end_refs] {
            for i in 0..BLOCK_SLOTS {
                out.write_u32::<LittleEndian>(refs.get(i).copied().unwrap_or(0))?;
            }
        }
        out.resize(HEADER_SIZE, 0);
        Ok(out)
    }

    /// Byte ranges `[start, end)` of populated blocks; out-of-range refs are skipped
    pub fn blocks(&self) -> Vec<(u32, u32)> {
        self.block_start_refs
            .iter()
            .zip(&self.block_end_refs)
            .filter(|(start, end)| end > start)
            .filter_map(|(start, end)| match (ref_to_offset(*start), ref_to_offset(*end)) {
                (Some(from), Some(to)) => Some((from, to)),
                _ => {
                    log::warn!("Skipping block {:#x}..{:#x}: reference out of range", start, end);
                    None
                }
            })
            .collect()
    }
}
