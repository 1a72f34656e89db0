//! Add files: append-only page chains on write-once parts.
//!
//! Until terminated an add-file page is programmed byte by byte:
//! - byte 0 stays `0xFF`
//! - bytes 1-28 hold data
//! - byte 29 points at the next page, `0xFF` on the last page
//! - bytes 30-31 stay `0xFF`
//!
//! Terminating seals every page as a regular packet and sets the last
//! pointer to 0, after which the file reads like any other.

use log::{debug, info, warn};

use super::{split_path, Session};
use crate::device::{Bus, PageNumber, RomId, ERASED};
use crate::error::{OwfsError, OwfsResult};
use crate::fs::{catalog, read_bitmap, write_bitmap, Bitmap, FileEntry, PageStore};

/// Last data byte of a raw page.
const LAST_DATA: usize = 28;
/// Raw offset of the next-page pointer.
const POINTER: usize = 29;

/// Where [`Session::write_add_file`] puts its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// After the last written byte. Bytes are written as given.
    Append,
    /// At a byte offset from the start of the file. Bytes can only clear
    /// bits already set. A gap past the current end is filled with zeros.
    At(usize),
}

fn check_open(page: PageNumber, raw: &[u8]) -> OwfsResult<()> {
    if raw[0] != ERASED {
        debug!("add-file page {} already sealed", page);
        return Err(OwfsError::AddFileTerminated);
    }
    Ok(())
}

/// Page and raw offset just past the last written byte.
fn find_end(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<(PageNumber, usize)> {
    let mut page = start;
    for _ in 0..=store.max_page() as usize {
        let raw = store.read_raw_page(page)?.bytes;
        check_open(page, &raw)?;
        if raw[POINTER] == ERASED {
            let spot = (1..=LAST_DATA)
                .rev()
                .find(|&i| raw[i] != ERASED)
                .map_or(1, |i| i + 1);
            return Ok((page, spot));
        }
        page = raw[POINTER];
    }
    Err(OwfsError::BrokenChain(start))
}

/// Page and raw offset of byte `offset`, which must lie inside the file.
fn find_offset(
    store: &mut PageStore<'_>,
    start: PageNumber,
    offset: usize,
) -> OwfsResult<(PageNumber, usize)> {
    let mut page = start;
    let mut seen = 0;
    for _ in 0..=store.max_page() as usize {
        let raw = store.read_raw_page(page)?.bytes;
        check_open(page, &raw)?;
        if offset < seen + LAST_DATA {
            return Ok((page, offset - seen + 1));
        }
        seen += LAST_DATA;
        if raw[POINTER] == ERASED {
            break;
        }
        page = raw[POINTER];
    }
    Err(OwfsError::BrokenChain(start))
}

/// Contents of an unterminated add file.
pub(super) fn read_open(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut page = start;
    for _ in 0..=store.max_page() as usize {
        let raw = store.read_raw_page(page)?.bytes;
        if raw[POINTER] == ERASED {
            let used = (1..=LAST_DATA)
                .rev()
                .find(|&i| raw[i] != ERASED)
                .unwrap_or(0);
            out.extend_from_slice(&raw[1..=used]);
            return Ok(out);
        }
        out.extend_from_slice(&raw[1..=LAST_DATA]);
        page = raw[POINTER];
    }
    Err(OwfsError::BrokenChain(start))
}

/// Release the pages of an unterminated add file that only exist in the
/// open job.
pub(super) fn release_open(
    store: &mut PageStore<'_>,
    bitmap: &mut Bitmap,
    start: PageNumber,
) -> OwfsResult<()> {
    let mut pages = Vec::new();
    let mut page = start;
    for _ in 0..=store.max_page() as usize {
        pages.push(page);
        match store.read_raw_page(page) {
            Ok(raw) if raw.bytes[POINTER] != ERASED => page = raw.bytes[POINTER],
            Ok(_) => break,
            Err(err) => {
                warn!("add-file chain from {} unreadable at {}: {}", start, page, err);
                break;
            }
        }
    }
    for page in pages {
        store.release_add_page(bitmap, page)?;
    }
    Ok(())
}

impl<B: Bus> Session<B> {
    /// Write into an unterminated add file.
    pub fn write_add_file(
        &mut self,
        rom: &RomId,
        handle: usize,
        mode: AddMode,
        data: &[u8],
    ) -> OwfsResult<()> {
        self.prepare_write(rom)?;
        let file = self.open_handle(rom, handle)?;
        let entry = file.info.entry;
        if !entry.is_add_file() {
            return Err(OwfsError::NotAddFile(entry.to_string()));
        }

        let mut parts = self.parts(rom)?;
        let store = &mut parts.store;
        let info = catalog::find(store, file.dir_start, &entry)?;
        if info.num_pages != 0 {
            return Err(OwfsError::AddFileTerminated);
        }
        let mut bitmap = read_bitmap(store)?;

        // Writes reaching past the end become appends, zero padded up to
        // the offset
        let (mut page, mut spot, payload, extends) = match mode {
            AddMode::Append => {
                let (page, spot) = find_end(store, info.start_page)?;
                (page, spot, data.to_vec(), true)
            }
            AddMode::At(offset) => {
                let len = read_open(store, info.start_page)?.len();
                if offset >= len {
                    let (page, spot) = find_end(store, info.start_page)?;
                    let mut padded = vec![0; offset - len];
                    padded.extend_from_slice(data);
                    (page, spot, padded, true)
                } else {
                    let (page, spot) = find_offset(store, info.start_page, offset)?;
                    (page, spot, data.to_vec(), false)
                }
            }
        };
        if extends {
            let room = LAST_DATA + 1 - spot;
            let needed = payload.len().saturating_sub(room);
            if needed > bitmap.count_free() * LAST_DATA {
                return Err(OwfsError::OutOfSpace);
            }
        }

        let zero_mode = matches!(mode, AddMode::At(_));
        let data = payload.as_slice();
        let mut written = 0;
        loop {
            bitmap.set(page)?;
            if data.is_empty() {
                store.mark_job_add(page)?;
            }
            while spot <= LAST_DATA && written < data.len() {
                store.write_job_byte(page, spot, data[written], zero_mode)?;
                written += 1;
                spot += 1;
            }
            if written == data.len() {
                break;
            }
            let existing = store.read_raw_page(page)?.bytes[POINTER];
            page = if existing != ERASED {
                existing
            } else {
                let next = bitmap.find_empty().first.ok_or(OwfsError::OutOfSpace)?;
                bitmap.set(next)?;
                store.write_job_byte(page, POINTER, next, false)?;
                next
            };
            spot = 1;
        }
        write_bitmap(store, &bitmap)?;
        debug!("wrote {} bytes to {} ending on page {}", data.len(), entry, page);
        Ok(())
    }

    /// Seal an add file. Returns the number of pages in its chain.
    ///
    /// Handles on the file are closed. Sealing twice fails with
    /// [`OwfsError::AddFileTerminated`].
    pub fn terminate_add_file(&mut self, rom: &RomId, path: &str) -> OwfsResult<u8> {
        let (dir, last) = split_path(path)?;
        let entry: FileEntry = last.parse()?;
        if !entry.is_add_file() {
            return Err(OwfsError::NotAddFile(entry.to_string()));
        }
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        let levels = parts.resolve(&dir)?;
        let start_dir = super::dir_start(&levels);
        parts.handles.close_matching(rom, start_dir, &entry);
        let store = &mut parts.store;
        let info = catalog::find(store, start_dir, &entry)?;
        if info.num_pages != 0 {
            return Err(OwfsError::AddFileTerminated);
        }

        let mut count: u8 = 0;
        let mut page = info.start_page;
        loop {
            if count as usize > store.max_page() as usize {
                return Err(OwfsError::BrokenChain(info.start_page));
            }
            let raw = store.read_raw_page(page)?.bytes;
            if raw[0] != ERASED || raw[30] != ERASED || raw[31] != ERASED {
                return Err(OwfsError::AddFileTerminated);
            }
            count += 1;
            store.terminate_page(page)?;
            if raw[POINTER] == ERASED {
                store.write_job_byte(page, POINTER, 0, false)?;
                break;
            }
            page = raw[POINTER];
        }

        catalog::update_pages(store, &info, info.start_page, count)?;
        info!("terminated {} with {} pages", entry, count);
        Ok(count)
    }
}
