use memmap2::Mmap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{TpsError, TpsResult};
use crate::models::arrays::analyze;
use crate::models::header::{FileHeader, HEADER_SIZE, ref_to_offset};
use crate::models::page::{PAGE_HEADER_LEN, Page, PageHeader};
use crate::models::record::{PageRecords, Record, RecordBody, parse_records};
use crate::models::recovery::{Resolution, resolve};
use crate::models::schema::{TableSchema, table_schema};
use crate::models::text_encoding::TextEncoding;

/// Pages start on this boundary
pub const PAGE_ALIGNMENT: u32 = 0x100;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Owned(bytes) => bytes,
        }
    }
}

/// Table names and definition segments gathered in one pass over the leaf pages
#[derive(Debug, Default)]
struct Catalog {
    names: BTreeMap<u32, String>,
    segments: HashMap<u32, BTreeMap<u16, Vec<u8>>>,
}

/// Memo payloads keyed by (owner record number, memo index)
pub type MemoIndex = HashMap<(u32, u8), Vec<u8>>;

/// A legacy store opened read-only
pub struct TpsFile {
    path: Option<PathBuf>,
    bytes: Backing,
    header: FileHeader,
    encoding: TextEncoding,
    pages: Vec<PageHeader>,
    catalog: OnceCell<Catalog>,
    definitions: Mutex<HashMap<u32, Arc<Resolution>>>,
    page_cache: Option<Mutex<HashMap<u32, Arc<Page>>>>,
}

impl TpsFile {
    pub fn open<P: AsRef<Path>>(path: P, encoding: TextEncoding) -> TpsResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(TpsError::InvalidHeader(format!(
                "{} is {} bytes, too small for a header",
                path.display(),
                len
            )));
        }
        // the map is read-only and the file is not modified while open
        let map = unsafe { Mmap::map(&file)? };
        let mut tps = Self::from_backing(Backing::Mapped(map), encoding)?;
        tps.path = Some(path.to_path_buf());
        log::info!(
            "Opened {} ({} bytes, {} pages, encoding {})",
            path.display(),
            len,
            tps.pages.len(),
            encoding.name()
        );
        Ok(tps)
    }

    pub fn from_bytes(bytes: Vec<u8>, encoding: TextEncoding) -> TpsResult<Self> {
        Self::from_backing(Backing::Owned(bytes), encoding)
    }

    fn from_backing(bytes: Backing, encoding: TextEncoding) -> TpsResult<Self> {
        let header = FileHeader::parse(&bytes)?;
        if header.file_size as usize != bytes.len() {
            log::warn!(
                "Header declares {} bytes but file holds {}",
                header.file_size,
                bytes.len()
            );
        }
        let pages = discover_pages(&bytes, &header);
        Ok(TpsFile {
            path: None,
            bytes,
            header,
            encoding,
            pages,
            catalog: OnceCell::new(),
            definitions: Mutex::new(HashMap::new()),
            page_cache: None,
        })
    }

    /// Keep decompressed pages in memory until [`TpsFile::release_memory`] is called
    pub fn with_page_cache(mut self) -> Self {
        self.page_cache = Some(Mutex::new(HashMap::new()));
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Page identifiers (absolute offsets) in on-disk order
    pub fn page_ids(&self) -> Vec<u32> {
        self.pages.iter().map(|p| p.offset).collect()
    }

    pub fn page_headers(&self) -> &[PageHeader] {
        &self.pages
    }

    pub fn leaf_page_ids(&self) -> Vec<u32> {
        self.pages.iter().filter(|p| p.is_leaf()).map(|p| p.offset).collect()
    }

    /// Random access to a decompressed page
    pub fn page(&self, id: u32) -> TpsResult<Arc<Page>> {
        if let Some(cache) = &self.page_cache {
            if let Some(page) = cache.lock().get(&id) {
                return Ok(Arc::clone(page));
            }
        }
        let start = id as usize;
        if start >= self.bytes.len() {
            return Err(TpsError::invalid_page(id, "offset past end of file"));
        }
        let page = Arc::new(Page::parse(&self.bytes[start..], id)?);
        if let Some(cache) = &self.page_cache {
            cache.lock().insert(id, Arc::clone(&page));
        }
        Ok(page)
    }

    /// Every record in a page; index pages hold none
    pub fn page_records(&self, id: u32) -> TpsResult<PageRecords> {
        let page = self.page(id)?;
        if !page.header.is_leaf() {
            return Ok(PageRecords::default());
        }
        Ok(parse_records(&page.payload, id))
    }

    /// Data records of one table within one page
    pub fn records(&self, page_id: u32, table_number: u32) -> TpsResult<Vec<Record>> {
        let parsed = self.page_records(page_id)?;
        if let Some(e) = parsed.error {
            log::warn!("Page {:#x} parsed partially: {}", page_id, e);
        }
        Ok(parsed
            .records
            .into_iter()
            .filter(|r| r.table_number == table_number)
            .filter_map(|r| r.into_data())
            .collect())
    }

    /// Lazily iterate a table's data records across all leaf pages
    pub fn table_records(&self, table_number: u32) -> TableRecords<'_> {
        TableRecords {
            file: self,
            table_number,
            pages: self.leaf_page_ids().into_iter().collect(),
            buffered: VecDeque::new(),
        }
    }

    pub fn record_count(&self, table_number: u32) -> usize {
        self.table_records(table_number).filter(|r| r.is_ok()).count()
    }

    fn catalog(&self) -> &Catalog {
        self.catalog.get_or_init(|| {
            let mut catalog = Catalog::default();
            for id in self.leaf_page_ids() {
                let parsed = match self.page_records(id) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::warn!("Skipping unreadable page {:#x}: {}", id, e);
                        continue;
                    }
                };
                if let Some(e) = &parsed.error {
                    log::warn!("Page {:#x} parsed partially: {}", id, e);
                }
                for record in parsed.records {
                    match record.body {
                        RecordBody::TableName { table_number, name } if record.table_number == 0 => {
                            catalog.names.insert(table_number, self.encoding.decode_lossy(&name));
                        }
                        RecordBody::Definition { segment, bytes } => {
                            catalog
                                .segments
                                .entry(record.table_number)
                                .or_default()
                                .insert(segment, bytes);
                        }
                        _ => {}
                    }
                }
            }
            log::debug!("Catalog holds {} named tables", catalog.names.len());
            catalog
        })
    }

    /// Named tables sorted by table number
    pub fn tables(&self) -> Vec<(u32, String)> {
        self.catalog()
            .names
            .iter()
            .map(|(number, name)| (*number, name.clone()))
            .collect()
    }

    pub fn table_name(&self, table_number: u32) -> Option<String> {
        self.catalog().names.get(&table_number).cloned()
    }

    pub fn table_number(&self, name: &str) -> Option<u32> {
        self.catalog()
            .names
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(number, _)| *number)
    }

    /// Resolved definition of a table, computed once and cached
    pub fn definition(&self, table_number: u32) -> Arc<Resolution> {
        if let Some(found) = self.definitions.lock().get(&table_number) {
            return Arc::clone(found);
        }
        let catalog = self.catalog();
        let name = catalog
            .names
            .get(&table_number)
            .cloned()
            .unwrap_or_else(|| format!("TABLE_{}", table_number));
        let empty = BTreeMap::new();
        let segments = catalog.segments.get(&table_number).unwrap_or(&empty);
        let resolution = Arc::new(resolve(table_number, &name, segments, self.encoding));
        self.definitions
            .lock()
            .entry(table_number)
            .or_insert(resolution)
            .clone()
    }

    /// Memo payloads of a table, segments joined in sequence order
    pub fn memos(&self, table_number: u32) -> MemoIndex {
        let mut pieces: BTreeMap<(u32, u8, u16), Vec<u8>> = BTreeMap::new();
        for id in self.leaf_page_ids() {
            let Ok(parsed) = self.page_records(id) else {
                continue;
            };
            for record in parsed.records {
                if record.table_number != table_number {
                    continue;
                }
                if let RecordBody::Memo { owner, memo_index, sequence, bytes } = record.body {
                    pieces.insert((owner, memo_index, sequence), bytes);
                }
            }
        }
        let mut memos = MemoIndex::new();
        for ((owner, memo_index, _), bytes) in pieces {
            memos.entry((owner, memo_index)).or_default().extend_from_slice(&bytes);
        }
        memos
    }

    /// Arrow schemas for every named table
    pub fn describe(&self) -> Vec<TableSchema> {
        self.tables()
            .into_iter()
            .map(|(number, name)| {
                let resolution = self.definition(number);
                let table = resolution.definition.table();
                let analysis = analyze(&table.fields);
                TableSchema {
                    table_number: number,
                    name,
                    confidence: resolution.definition.confidence(),
                    schema: table_schema(table, &analysis),
                }
            })
            .collect()
    }

    /// Drop cached pages; returns the payload bytes released
    pub fn release_memory(&self) -> usize {
        match &self.page_cache {
            Some(cache) => {
                let mut cache = cache.lock();
                let freed = cache.values().map(|p| p.payload.len()).sum();
                cache.clear();
                freed
            }
            None => 0,
        }
    }
}

/// Iterator over one table's data records; page failures surface as `Err` items
pub struct TableRecords<'a> {
    file: &'a TpsFile,
    table_number: u32,
    pages: VecDeque<u32>,
    buffered: VecDeque<TpsResult<Record>>,
}

impl Iterator for TableRecords<'_> {
    type Item = TpsResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(item);
            }
            let id = self.pages.pop_front()?;
            match self.file.page_records(id) {
                Ok(parsed) => {
                    let table_number = self.table_number;
                    self.buffered.extend(
                        parsed
                            .records
                            .into_iter()
                            .filter(|r| r.table_number == table_number)
                            .filter_map(|r| r.into_data())
                            .map(Ok),
                    );
                    if let Some(e) = parsed.error {
                        self.buffered.push_back(Err(e));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn align(value: u32) -> u32 {
    value.div_ceil(PAGE_ALIGNMENT) * PAGE_ALIGNMENT
}

/// Walk the block table; fall back to the page tree when no blocks are populated
fn discover_pages(bytes: &[u8], header: &FileHeader) -> Vec<PageHeader> {
    let mut pages = Vec::new();
    for (start, end) in header.blocks() {
        let mut offset = start;
        while offset < end && (offset as usize) + PAGE_HEADER_LEN <= bytes.len() {
            match PageHeader::parse(&bytes[offset as usize..], offset) {
                Ok(page) => {
                    pages.push(page);
                    offset += align(u32::from(page.size));
                }
                Err(e) => {
                    log::warn!("Stopping block scan at {:#x}: {}", offset, e);
                    break;
                }
            }
        }
    }
    if pages.is_empty() && bytes.len() > HEADER_SIZE {
        match ref_to_offset(header.page_root_ref) {
            Some(root) => pages = walk_tree(bytes, root),
            None => log::warn!("Root page reference {:#x} is out of range", header.page_root_ref),
        }
    }
    pages
}

fn walk_tree(bytes: &[u8], root: u32) -> Vec<PageHeader> {
    let mut seen = BTreeSet::new();
    let mut found = BTreeMap::new();
    let mut pending = vec![root];
    while let Some(offset) = pending.pop() {
        if !seen.insert(offset) || offset as usize >= bytes.len() {
            continue;
        }
        match Page::parse(&bytes[offset as usize..], offset) {
            Ok(page) => {
                for child in page.child_refs() {
                    match ref_to_offset(child) {
                        Some(child_offset) => pending.push(child_offset),
                        None => log::warn!("Page {:#x} names out-of-range child {:#x}", offset, child),
                    }
                }
                found.insert(offset, page.header);
            }
            Err(e) => log::warn!("Unreadable page {:#x} in page tree: {}", offset, e),
        }
    }
    found.into_values().collect()
}
