//! Directory catalog.
//!
//! A directory is a chain of packet pages. Each packet is a list of 7-byte
//! records followed by a continuation byte (`0` = last page). The first
//! page of a directory starts with a 7-byte header in record position.
//!
//! Record layout (7 bytes):
//! - Bytes 0-3: name (space padded)
//! - Byte 4: extension in bits 0-6, attribute flag in bit 7
//! - Byte 5: start page
//! - Byte 6: page count
//!
//! Root header: `0xAA, 0x00, ctrl, b3, b4, b5, b6`. With bit 7 of `ctrl`
//! set the bitmap is local in bytes 3-6; otherwise byte 5 is the first
//! bitmap page and byte 6 the number of bitmap pages.
//!
//! Subdirectory header: `0xAA, 0x00, parent name[4], parent page`.

use log::{debug, warn};

use super::bitmap::Bitmap;
use super::entry::{FileEntry, FileInfo, FileName, ATTR_HIDDEN, ATTR_READ_ONLY};
use super::page_store::PageStore;
use super::RECORD_LEN;
use crate::device::udp::MAX_PACKET_DATA;
use crate::device::PageNumber;
use crate::error::{OwfsError, OwfsResult};

/// First byte of every directory header.
pub const DIR_MARKER: u8 = 0xAA;

/// Control byte flag for a bitmap stored in the root page.
pub const LOCAL_BITMAP: u8 = 0x80;

/// Where the page bitmap of a device is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapLocation {
    /// Four bytes inside the root directory header.
    Local([u8; 4]),
    /// Dedicated pages starting at `page`.
    Remote { page: PageNumber, count: u8 },
}

/// Parsed root directory header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryHeader {
    pub bitmap: BitmapLocation,
}

impl DirectoryHeader {
    pub fn parse_root(data: &[u8]) -> OwfsResult<Self> {
        check_header(0, data)?;
        let bitmap = if data[2] & LOCAL_BITMAP != 0 {
            BitmapLocation::Local([data[3], data[4], data[5], data[6]])
        } else {
            BitmapLocation::Remote {
                page: data[5],
                count: data[6],
            }
        };
        Ok(Self { bitmap })
    }

    /// Packet of an empty root directory.
    pub fn root_packet(&self) -> Vec<u8> {
        let mut data = vec![DIR_MARKER, 0x00];
        match self.bitmap {
            BitmapLocation::Local(bits) => {
                data.push(LOCAL_BITMAP);
                data.extend_from_slice(&bits);
            }
            BitmapLocation::Remote { page, count } => {
                data.extend_from_slice(&[0, 0, 0, page, count]);
            }
        }
        data.push(0);
        data
    }
}

/// Packet of an empty subdirectory.
pub fn subdirectory_packet(parent_name: FileName, parent_page: PageNumber) -> Vec<u8> {
    let mut data = vec![DIR_MARKER, 0x00];
    data.extend_from_slice(parent_name.as_bytes());
    data.push(parent_page);
    data.push(0);
    data
}

/// Whether a directory first page holds no records and no continuation.
pub fn is_empty_directory(data: &[u8]) -> bool {
    data.len() == RECORD_LEN + 1 && data[RECORD_LEN] == 0
}

fn check_header(page: PageNumber, data: &[u8]) -> OwfsResult<()> {
    if data.len() < RECORD_LEN + 1 || data[0] != DIR_MARKER || data[1] != 0 {
        return Err(OwfsError::CorruptDirectory(page));
    }
    Ok(())
}

/// One 7-byte catalog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record([u8; RECORD_LEN]);

impl Record {
    pub fn new(entry: &FileEntry, attrib: u8, start_page: PageNumber, num_pages: u8) -> Self {
        let flag = if entry.is_directory() {
            (attrib & ATTR_HIDDEN) >> 1
        } else {
            attrib & ATTR_READ_ONLY
        };
        let name = entry.name.as_bytes();
        Self([
            name[0],
            name[1],
            name[2],
            name[3],
            (entry.ext & 0x7F) | (flag << 7),
            start_page,
            num_pages,
        ])
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut raw = [0u8; RECORD_LEN];
        raw.copy_from_slice(&bytes[..RECORD_LEN]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_LEN] {
        &self.0
    }

    pub fn ext(&self) -> u8 {
        self.0[4] & 0x7F
    }

    /// Logical attribute, shifted for directories.
    pub fn attrib(&self) -> u8 {
        let flag = self.0[4] >> 7;
        if self.ext() == super::entry::EXT_DIRECTORY {
            flag << 1
        } else {
            flag
        }
    }

    pub fn start_page(&self) -> PageNumber {
        self.0[5]
    }

    pub fn num_pages(&self) -> u8 {
        self.0[6]
    }

    /// Case-insensitive match on name and extension.
    pub fn matches(&self, entry: &FileEntry) -> bool {
        self.ext() == entry.ext
            && self.0[..4]
                .iter()
                .zip(entry.name.as_bytes())
                .all(|(a, b)| a.to_ascii_uppercase() == *b)
    }

    fn entry(&self) -> OwfsResult<FileEntry> {
        let name = FileName::from_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])?;
        Ok(FileEntry {
            name,
            ext: self.ext(),
        })
    }
}

/// One loaded page of a directory chain.
#[derive(Debug, Clone)]
pub struct DirPage {
    pub page: PageNumber,
    pub prev: PageNumber,
    pub data: Vec<u8>,
    /// Whether this is the first page, which carries the header.
    pub first: bool,
}

impl DirPage {
    pub fn continuation(&self) -> PageNumber {
        self.data.last().copied().unwrap_or(0)
    }

    /// Offsets of the records on this page.
    pub fn record_offsets(&self) -> impl Iterator<Item = usize> {
        let start = if self.first { RECORD_LEN } else { 0 };
        (start..self.data.len().saturating_sub(1)).step_by(RECORD_LEN)
    }

    pub fn is_full(&self) -> bool {
        self.data.len() + RECORD_LEN > MAX_PACKET_DATA
    }

    fn info_at(&self, offset: usize) -> OwfsResult<FileInfo> {
        let record = Record::from_slice(&self.data[offset..]);
        Ok(FileInfo {
            entry: record.entry()?,
            attrib: record.attrib(),
            start_page: record.start_page(),
            num_pages: record.num_pages(),
            dir_page: self.page,
            prev_dir_page: self.prev,
            offset,
        })
    }
}

/// Load a whole directory chain starting at `start`.
pub fn load_chain(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<Vec<DirPage>> {
    let limit = store.max_page() as usize + 1;
    let mut pages: Vec<DirPage> = Vec::new();
    let mut page = start;
    let mut prev = start;
    loop {
        if pages.len() >= limit {
            return Err(OwfsError::BrokenChain(start));
        }
        let data = store.read_page(page)?;
        if data.is_empty() || (data.len() - 1) % RECORD_LEN != 0 {
            return Err(OwfsError::CorruptDirectory(page));
        }
        let first = pages.is_empty();
        if first {
            check_header(page, &data)?;
        }
        let dir_page = DirPage {
            page,
            prev,
            data,
            first,
        };
        let next = dir_page.continuation();
        pages.push(dir_page);
        if next == 0 {
            return Ok(pages);
        }
        prev = page;
        page = next;
    }
}

/// Every record of the directory starting at `start`, in chain order.
///
/// Records that do not decode are logged and skipped.
pub fn entries(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<Vec<FileInfo>> {
    let mut found = Vec::new();
    for dir_page in load_chain(store, start)? {
        for offset in dir_page.record_offsets() {
            match dir_page.info_at(offset) {
                Ok(info) => found.push(info),
                Err(e) => warn!(
                    "skipping record at page {} offset {}: {}",
                    dir_page.page, offset, e
                ),
            }
        }
    }
    Ok(found)
}

/// Look a record up by name and extension.
pub fn lookup(
    store: &mut PageStore<'_>,
    start: PageNumber,
    entry: &FileEntry,
) -> OwfsResult<Option<FileInfo>> {
    for dir_page in load_chain(store, start)? {
        for offset in dir_page.record_offsets() {
            if Record::from_slice(&dir_page.data[offset..]).matches(entry) {
                return dir_page.info_at(offset).map(Some);
            }
        }
    }
    Ok(None)
}

/// Like [`lookup`] but a missing record is an error.
pub fn find(store: &mut PageStore<'_>, start: PageNumber, entry: &FileEntry) -> OwfsResult<FileInfo> {
    lookup(store, start, entry)?.ok_or_else(|| not_found(entry))
}

/// The `n`th record (1-based) of a directory.
pub fn find_entry(
    store: &mut PageStore<'_>,
    start: PageNumber,
    n: usize,
) -> OwfsResult<Option<FileInfo>> {
    if n == 0 {
        return Ok(None);
    }
    Ok(entries(store, start)?.into_iter().nth(n - 1))
}

/// The first directory page with room for one more record, or the last
/// page of the chain when every page is full.
pub fn find_insertion_point(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<DirPage> {
    let mut chain = load_chain(store, start)?;
    let index = chain
        .iter()
        .position(|p| !p.is_full())
        .unwrap_or(chain.len() - 1);
    Ok(chain.swap_remove(index))
}

/// Add `record` to the directory starting at `start`.
///
/// A full chain is extended with a freshly allocated page, which is marked
/// in `bitmap`. Returns where the record was stored.
pub fn insert(
    store: &mut PageStore<'_>,
    bitmap: &mut Bitmap,
    start: PageNumber,
    record: &Record,
) -> OwfsResult<FileInfo> {
    let mut spot = find_insertion_point(store, start)?;
    let continuation = spot.continuation();

    if !spot.is_full() {
        let offset = spot.data.len() - 1;
        spot.data.truncate(offset);
        spot.data.extend_from_slice(record.as_bytes());
        spot.data.push(continuation);
        store.write_page(spot.page, &spot.data)?;
        return spot.info_at(offset);
    }

    let new_page = bitmap.find_empty().first.ok_or(OwfsError::OutOfSpace)?;
    bitmap.set(new_page)?;
    debug!("extend directory {} with page {}", start, new_page);

    let mut data = record.as_bytes().to_vec();
    data.push(continuation);
    store.write_page(new_page, &data)?;

    let last = spot.data.len() - 1;
    spot.data[last] = new_page;
    store.write_page(spot.page, &spot.data)?;

    DirPage {
        page: new_page,
        prev: spot.page,
        data,
        first: false,
    }
    .info_at(0)
}

/// Remove the record described by `info`.
///
/// A page left without records is unlinked from the chain and released
/// in `bitmap`; otherwise the page is rewritten without the record.
pub fn remove(store: &mut PageStore<'_>, bitmap: &mut Bitmap, info: &FileInfo) -> OwfsResult<()> {
    let mut data = load_record_page(store, info)?;
    if data.len() / RECORD_LEN == 1 && info.dir_page != info.prev_dir_page {
        let mut prev = store.read_page(info.prev_dir_page)?;
        let last = prev
            .len()
            .checked_sub(1)
            .ok_or(OwfsError::CorruptDirectory(info.prev_dir_page))?;
        prev[last] = data[data.len() - 1];
        store.write_page(info.prev_dir_page, &prev)?;
        store.change_bit(bitmap, info.dir_page, false)?;
        debug!("unlinked directory page {}", info.dir_page);
        return Ok(());
    }
    data.drain(info.offset..info.offset + RECORD_LEN);
    store.write_page(info.dir_page, &data)
}

/// Rewrite name and extension of a record, keeping its attribute.
pub fn rename_in_place(
    store: &mut PageStore<'_>,
    info: &FileInfo,
    new_entry: &FileEntry,
) -> OwfsResult<()> {
    rewrite_record(store, info, |record| {
        record[..4].copy_from_slice(new_entry.name.as_bytes());
        record[4] = (record[4] & 0x80) | (new_entry.ext & 0x7F);
    })
}

/// Set or clear the attribute flag of a record.
pub fn set_attribute(store: &mut PageStore<'_>, info: &FileInfo, flag: bool) -> OwfsResult<()> {
    rewrite_record(store, info, |record| {
        record[4] = (record[4] & 0x7F) | ((flag as u8) << 7);
    })
}

/// Rewrite start page and page count of a record.
pub fn update_pages(
    store: &mut PageStore<'_>,
    info: &FileInfo,
    start_page: PageNumber,
    num_pages: u8,
) -> OwfsResult<()> {
    rewrite_record(store, info, |record| {
        record[5] = start_page;
        record[6] = num_pages;
    })
}

fn rewrite_record(
    store: &mut PageStore<'_>,
    info: &FileInfo,
    edit: impl FnOnce(&mut [u8]),
) -> OwfsResult<()> {
    let mut data = load_record_page(store, info)?;
    edit(&mut data[info.offset..info.offset + RECORD_LEN]);
    store.write_page(info.dir_page, &data)
}

/// Read the page holding `info` and check the record is still there.
fn load_record_page(store: &mut PageStore<'_>, info: &FileInfo) -> OwfsResult<Vec<u8>> {
    let data = store.read_page(info.dir_page)?;
    if data.is_empty()
        || (data.len() - 1) % RECORD_LEN != 0
        || info.offset + RECORD_LEN >= data.len()
        || !Record::from_slice(&data[info.offset..]).matches(&info.entry)
    {
        return Err(OwfsError::CorruptDirectory(info.dir_page));
    }
    Ok(data)
}

pub(crate) fn not_found(entry: &FileEntry) -> OwfsError {
    if entry.is_directory() {
        OwfsError::DirectoryNotFound(entry.to_string())
    } else {
        OwfsError::FileNotFound(entry.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCache;
    use crate::device::{EepromBank, MemoryBank, RomId};
    use crate::fs::entry::EXT_DIRECTORY;

    fn rom() -> RomId {
        RomId::new([0x0C, 0x10, 0, 0, 0, 0, 0, 0])
    }

    /// Bank with an empty root directory using a remote bitmap on page 1.
    fn formatted() -> EepromBank {
        let mut bank = EepromBank::new(rom(), 64);
        let header = DirectoryHeader {
            bitmap: BitmapLocation::Remote { page: 1, count: 1 },
        };
        bank.write_page_packet(0, &header.root_packet()).unwrap();
        let mut bits = vec![0u8; 8];
        bits[0] = 0x03;
        bits.push(0);
        bank.write_page_packet(1, &bits).unwrap();
        bank
    }

    fn record(name: &str, ext: u8, start: PageNumber) -> Record {
        Record::new(&FileEntry::new(name, ext).unwrap(), 0, start, 1)
    }

    #[test]
    fn test_record_layout() {
        let entry = FileEntry::new("TEST", 1).unwrap();
        let rec = Record::new(&entry, ATTR_READ_ONLY, 5, 2);
        assert_eq!(rec.as_bytes(), &[b'T', b'E', b'S', b'T', 0x81, 5, 2]);
        assert_eq!(rec.attrib(), ATTR_READ_ONLY);

        let dir = FileEntry::new("SUB", EXT_DIRECTORY).unwrap();
        let rec = Record::new(&dir, ATTR_HIDDEN, 9, 0);
        assert_eq!(rec.as_bytes()[4], 0xFF);
        assert_eq!(rec.attrib(), ATTR_HIDDEN);
    }

    #[test]
    fn test_headers() {
        let local = DirectoryHeader {
            bitmap: BitmapLocation::Local([1, 0, 0, 0]),
        };
        let packet = local.root_packet();
        assert_eq!(packet, vec![0xAA, 0, 0x80, 1, 0, 0, 0, 0]);
        assert_eq!(DirectoryHeader::parse_root(&packet).unwrap(), local);

        let sub = subdirectory_packet(FileName::ROOT, 0);
        assert_eq!(sub, vec![0xAA, 0, b'R', b'O', b'O', b'T', 0, 0]);
        assert!(is_empty_directory(&sub));
        assert!(DirectoryHeader::parse_root(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_insert_and_find() {
        let mut bank = formatted();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::from_bytes(&[0x03], 63);

        let info = insert(&mut store, &mut bm, 0, &record("TEST", 1, 2)).unwrap();
        assert_eq!(info.dir_page, 0);
        assert_eq!(info.offset, 7);

        let found = find(&mut store, 0, &FileEntry::new("test", 1).unwrap()).unwrap();
        assert_eq!(found.start_page, 2);
        assert!(matches!(
            find(&mut store, 0, &FileEntry::new("test", 2).unwrap()),
            Err(OwfsError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_chain_extends_and_shrinks() {
        let mut bank = formatted();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::from_bytes(&[0x03], 63);

        // Root page holds the header plus three records
        for (i, name) in ["A", "B", "C", "D"].iter().enumerate() {
            insert(&mut store, &mut bm, 0, &record(name, 1, 10 + i as u8)).unwrap();
        }
        let chain = load_chain(&mut store, 0).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].page, 2);
        assert!(bm.is_set(2));

        let d = find(&mut store, 0, &FileEntry::new("D", 1).unwrap()).unwrap();
        assert_eq!(d.dir_page, 2);
        assert_eq!(d.prev_dir_page, 0);
        assert_eq!(find_entry(&mut store, 0, 4).unwrap(), Some(d));
        assert_eq!(find_entry(&mut store, 0, 5).unwrap(), None);

        remove(&mut store, &mut bm, &d).unwrap();
        assert!(!bm.is_set(2));
        assert_eq!(load_chain(&mut store, 0).unwrap().len(), 1);
        assert_eq!(entries(&mut store, 0).unwrap().len(), 3);
    }

    #[test]
    fn test_insertion_point_reuses_gap() {
        let mut bank = formatted();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::from_bytes(&[0x03], 63);
        for (i, name) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            insert(&mut store, &mut bm, 0, &record(name, 1, 10 + i as u8)).unwrap();
        }
        let b = find(&mut store, 0, &FileEntry::new("B", 1).unwrap()).unwrap();
        remove(&mut store, &mut bm, &b).unwrap();

        let spot = find_insertion_point(&mut store, 0).unwrap();
        assert_eq!(spot.page, 0);
        let f = insert(&mut store, &mut bm, 0, &record("F", 1, 20)).unwrap();
        assert_eq!(f.dir_page, 0);
        // Records after the removed one moved up, the continuation survived
        let chain = load_chain(&mut store, 0).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_rename_and_attribute() {
        let mut bank = formatted();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::from_bytes(&[0x03], 63);
        let info = insert(&mut store, &mut bm, 0, &record("OLD", 3, 4)).unwrap();

        set_attribute(&mut store, &info, true).unwrap();
        let new_entry = FileEntry::new("NEW", 4).unwrap();
        rename_in_place(&mut store, &info, &new_entry).unwrap();

        let renamed = find(&mut store, 0, &new_entry).unwrap();
        assert_eq!(renamed.attrib, ATTR_READ_ONLY);
        assert_eq!(renamed.start_page, 4);
        assert!(lookup(&mut store, 0, &FileEntry::new("OLD", 3).unwrap())
            .unwrap()
            .is_none());

        update_pages(&mut store, &renamed, 4, 3).unwrap();
        assert_eq!(find(&mut store, 0, &new_entry).unwrap().num_pages, 3);
    }

    #[test]
    fn test_corrupt_directory_length() {
        let mut bank = formatted();
        bank.write_page_packet(0, &[0xAA, 0, 0, 0, 0, 1, 1, 0, 0]).unwrap();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        assert!(matches!(
            entries(&mut store, 0),
            Err(OwfsError::CorruptDirectory(0))
        ));
    }

    #[test]
    fn test_undecodable_record_skipped() {
        let mut bank = formatted();
        let mut packet = vec![0xAA, 0, 0, 0, 0, 1, 1];
        packet.extend([0x01, 0x02, 0x03, 0x04, 1, 5, 1]);
        packet.extend([b'G', b'O', b'O', b'D', 1, 6, 1]);
        packet.push(0);
        bank.write_page_packet(0, &packet).unwrap();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);

        let found = entries(&mut store, 0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_page, 6);
        assert_eq!(found[0].offset, 14);
        assert_eq!(find_entry(&mut store, 0, 1).unwrap(), Some(found[0]));
        let good = find(&mut store, 0, &FileEntry::new("GOOD", 1).unwrap()).unwrap();
        assert_eq!(good, found[0]);
    }
}
