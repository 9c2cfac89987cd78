use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::errors::{TpsError, TpsResult};

pub const PAGE_HEADER_LEN: usize = 13;

/// Largest run length expressible in the two-byte count form
const MAX_RUN: usize = 0x7FFF;

/// Fixed header at the start of every page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageHeader {
    pub offset: u32,
    pub size: u16,
    pub size_uncompressed: u16,
    pub size_uncompressed_without_records: u16,
    pub record_count: u16,
    pub hierarchy_level: u8,
}

impl PageHeader {
    pub fn parse(bytes: &[u8], expected_offset: u32) -> TpsResult<Self> {
        if bytes.len() < PAGE_HEADER_LEN {
            return Err(TpsError::invalid_page(expected_offset, "page header truncated"));
        }
        let header = PageHeader {
            offset: LittleEndian::read_u32(&bytes[0..4]),
            size: LittleEndian::read_u16(&bytes[4..6]),
            size_uncompressed: LittleEndian::read_u16(&bytes[6..8]),
            size_uncompressed_without_records: LittleEndian::read_u16(&bytes[8..10]),
            record_count: LittleEndian::read_u16(&bytes[10..12]),
            hierarchy_level: bytes[12],
        };
        if header.offset != expected_offset {
            return Err(TpsError::invalid_page(
                expected_offset,
                format!("header names offset {:#x}", header.offset),
            ));
        }
        if (header.size as usize) < PAGE_HEADER_LEN || (header.size_uncompressed as usize) < PAGE_HEADER_LEN {
            return Err(TpsError::invalid_page(expected_offset, "declared size smaller than header"));
        }
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> TpsResult<()> {
        out.write_u32::<LittleEndian>(self.offset)?;
        out.write_u16::<LittleEndian>(self.size)?;
        out.write_u16::<LittleEndian>(self.size_uncompressed)?;
        out.write_u16::<LittleEndian>(self.size_uncompressed_without_records)?;
        out.write_u16::<LittleEndian>(self.record_count)?;
        out.push(self.hierarchy_level);
        Ok(())
    }

    pub fn is_leaf(&self) -> bool {
        self.hierarchy_level == 0
    }

    pub fn is_compressed(&self) -> bool {
        self.size != self.size_uncompressed
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - PAGE_HEADER_LEN
    }

    pub fn uncompressed_payload_len(&self) -> usize {
        self.size_uncompressed as usize - PAGE_HEADER_LEN
    }
}

/// A page with its payload already decompressed
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub header: PageHeader,
    pub payload: Vec<u8>,
}

impl Page {
    /// Parse a page from the bytes starting at its offset
    pub fn parse(bytes: &[u8], offset: u32) -> TpsResult<Self> {
        let header = PageHeader::parse(bytes, offset)?;
        let end = header.size as usize;
        if bytes.len() < end {
            return Err(TpsError::invalid_page(
                offset,
                format!("page needs {} bytes but only {} remain", end, bytes.len()),
            ));
        }
        let raw = &bytes[PAGE_HEADER_LEN..end];
        let payload = if header.is_compressed() {
            let expanded = rle_decompress(raw)?;
            if expanded.len() != header.uncompressed_payload_len() {
                return Err(TpsError::Decompression(format!(
                    "page {:#x} expanded to {} bytes, expected {}",
                    offset,
                    expanded.len(),
                    header.uncompressed_payload_len()
                )));
            }
            expanded
        } else {
            raw.to_vec()
        };
        Ok(Page { header, payload })
    }

    /// Child page references held by an index page
    pub fn child_refs(&self) -> Vec<u32> {
        if self.header.is_leaf() {
            return Vec::new();
        }
        self.payload.chunks_exact(4).map(LittleEndian::read_u32).collect()
    }
}

fn read_count(data: &[u8], pos: &mut usize) -> TpsResult<usize> {
    let first = *data
        .get(*pos)
        .ok_or_else(|| TpsError::Decompression("run count past end of input".to_string()))?;
    *pos += 1;
    if first > 0x7F {
        let high = *data
            .get(*pos)
            .ok_or_else(|| TpsError::Decompression("extended run count past end of input".to_string()))?;
        *pos += 1;
        Ok(usize::from(first & 0x7F) | (usize::from(high) << 7))
    } else {
        Ok(usize::from(first))
    }
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    if count > 0x7F {
        out.push(0x80 | (count & 0x7F) as u8);
        out.push((count >> 7) as u8);
    } else {
        out.push(count as u8);
    }
}

/// Expand `[skip][literal bytes][repeat]` groups
pub fn rle_decompress(data: &[u8]) -> TpsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut pos = 0;
    while pos < data.len() {
        let skip = read_count(data, &mut pos)?;
        let end = pos + skip;
        if end > data.len() {
            return Err(TpsError::Decompression(format!(
                "literal run of {} bytes overruns input at {}",
                skip, pos
            )));
        }
        out.extend_from_slice(&data[pos..end]);
        pos = end;
        if pos < data.len() {
            let repeat = read_count(data, &mut pos)?;
            if repeat > 0 {
                let last = *out
                    .last()
                    .ok_or_else(|| TpsError::Decompression("repeat with no preceding byte".to_string()))?;
                out.resize(out.len() + repeat, last);
            }
        }
    }
    Ok(out)
}

/// Compress with the same scheme; runs shorter than four bytes stay literal
pub fn rle_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut literal_start = 0;
    let mut i = 0;
    while i < data.len() {
        let mut run = 1;
        while i + run < data.len() && data[i + run] == data[i] && run <= MAX_RUN {
            run += 1;
        }
        if run >= 4 {
            // the first byte of the run closes the literal, the rest are repeats
            emit_literal(&mut out, &data[literal_start..=i]);
            write_count(&mut out, run - 1);
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }
    if literal_start < data.len() {
        emit_literal(&mut out, &data[literal_start..]);
    }
    out
}

fn emit_literal(out: &mut Vec<u8>, literal: &[u8]) {
    let mut chunks = literal.chunks(MAX_RUN).peekable();
    while let Some(chunk) = chunks.next() {
        write_count(out, chunk.len());
        out.extend_from_slice(chunk);
        if chunks.peek().is_some() {
            write_count(out, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_known_stream() {
        // "ab" then repeat 'b' three times, then literal "c"
        let data = [2, b'a', b'b', 3, 1, b'c'];
        assert_eq!(rle_decompress(&data).unwrap(), b"abbbbc".to_vec());
    }

    #[test]
    fn test_decompress_extended_counts() {
        let mut data = vec![1, b'x'];
        data.extend_from_slice(&[0x80 | 0x2C, 0x01]); // 0x2C + (1 << 7) = 172 repeats
        let out = rle_decompress(&data).unwrap();
        assert_eq!(out.len(), 173);
        assert!(out.iter().all(|b| *b == b'x'));
    }

    #[test]
    fn test_decompress_rejects_bad_streams() {
        assert!(rle_decompress(&[0, 5]).is_err());
        assert!(rle_decompress(&[10, 1, 2]).is_err());
    }

    #[test]
    fn test_compress_shrinks_zero_padding() {
        let mut data = b"NAME".to_vec();
        data.extend(std::iter::repeat_n(0u8, 500));
        data.extend_from_slice(b"TAIL");
        let packed = rle_compress(&data);
        assert!(packed.len() < 20);
        assert_eq!(rle_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_compress_long_literals_split() {
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(rle_decompress(&rle_compress(&data)).unwrap(), data);
    }

    #[test]
    fn test_page_offset_must_match() {
        let header = PageHeader {
            offset: 0x300,
            size: 13,
            size_uncompressed: 13,
            size_uncompressed_without_records: 13,
            record_count: 0,
            hierarchy_level: 0,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert!(Page::parse(&bytes, 0x300).is_ok());
        assert!(Page::parse(&bytes, 0x200).is_err());
    }
}
