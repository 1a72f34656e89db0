//! File and directory operations.

use log::{debug, info};

use super::{add_file, dir_start, split_path, Session};
use crate::device::{Bus, PageNumber, RomId, FAMILY_SHA_COUNTER};
use crate::error::{OwfsError, OwfsResult};
use crate::fs::catalog::{self, is_empty_directory, subdirectory_packet, Record};
use crate::fs::{
    ext_read, ext_write, read_bitmap, reclaim_chain, write_bitmap, AccessMode, Bitmap, FileEntry,
    FileInfo, FileName, OpenFile, PageStore, ATTR_HIDDEN, ATTR_READ_ONLY, EXT_MONEY, MAX_DEPTH,
    PAGE_PAYLOAD,
};

/// Start page for a monetary file: the first free page of the reserve at
/// the top of the part.
fn monetary_page(rom: &RomId, bitmap: &Bitmap) -> OwfsResult<PageNumber> {
    let pages = bitmap.max_page() as usize + 1;
    let reserve = if rom.family() == FAMILY_SHA_COUNTER {
        7
    } else {
        (pages / 4).max(3)
    };
    (pages.saturating_sub(reserve)..pages)
        .map(|p| p as PageNumber)
        .find(|&p| !bitmap.is_set(p))
        .ok_or(OwfsError::OutOfSpace)
}

/// Find `last` in the directory at `start`. A bare name matches a
/// subdirectory before a file with extension 0.
fn lookup_any(store: &mut PageStore<'_>, start: PageNumber, last: &str) -> OwfsResult<FileInfo> {
    if !last.contains('.') {
        let dir = FileEntry::directory(FileName::new(last)?);
        if let Some(info) = catalog::lookup(store, start, &dir)? {
            return Ok(info);
        }
    }
    let entry: FileEntry = last.parse()?;
    catalog::find(store, start, &entry)
}

fn parse_file_entry(last: &str) -> OwfsResult<FileEntry> {
    let entry: FileEntry = last.parse()?;
    if entry.is_directory() {
        return Err(OwfsError::UnsupportedExtension(entry.ext));
    }
    Ok(entry)
}

impl<B: Bus> Session<B> {
    /// Handle state, checked against the device it was opened on.
    pub(super) fn open_handle(&self, rom: &RomId, handle: usize) -> OwfsResult<OpenFile> {
        let file = self.handles.get(handle)?;
        if file.rom != *rom {
            return Err(OwfsError::DeviceMismatch {
                expected: file.rom,
                found: *rom,
            });
        }
        Ok(file.clone())
    }

    /// Catalog information behind an open handle.
    pub fn handle_info(&self, handle: usize) -> OwfsResult<FileInfo> {
        Ok(self.handles.get(handle)?.info)
    }

    /// Create an empty file and open it.
    ///
    /// Returns the handle and the number of bytes the file may hold.
    /// Monetary files (101/102) take their page from a reserve at the top
    /// of the part and hold at most one page. Add files (100) need a
    /// write-once part.
    pub fn create_file(&mut self, rom: &RomId, path: &str) -> OwfsResult<(usize, usize)> {
        let (dir, last) = split_path(path)?;
        let entry = parse_file_entry(last)?;
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        if entry.is_add_file() && !parts.store.is_write_once() {
            return Err(OwfsError::WrongDeviceType("add files require a write-once part"));
        }
        if entry.ext == EXT_MONEY && !parts.store.bank().has_extra_info() {
            return Err(OwfsError::WrongDeviceType(
                "monetary files require a part with extra info",
            ));
        }
        let levels = parts.resolve(&dir)?;
        let start_dir = dir_start(&levels);
        if parts.handles.is_open(rom, start_dir, &entry)
            || catalog::lookup(&mut parts.store, start_dir, &entry)?.is_some()
        {
            return Err(OwfsError::FileExists(entry.to_string()));
        }
        if !parts.handles.has_free() {
            return Err(OwfsError::HandleNotAvailable);
        }

        let mut bitmap = read_bitmap(&mut parts.store)?;
        let (start, max_writable) = if entry.is_monetary() {
            (monetary_page(rom, &bitmap)?, PAGE_PAYLOAD)
        } else {
            let start = bitmap.find_empty().first.ok_or(OwfsError::OutOfSpace)?;
            (start, bitmap.max_writable_bytes())
        };
        bitmap.set(start)?;

        let num_pages = if entry.is_add_file() { 0 } else { 1 };
        let record = Record::new(&entry, 0, start, num_pages);
        let info = catalog::insert(&mut parts.store, &mut bitmap, start_dir, &record)?;
        if entry.is_add_file() {
            parts.store.mark_job_add(start)?;
        } else {
            ext_write(&mut parts.store, &mut bitmap, start, &[])?;
        }
        write_bitmap(&mut parts.store, &bitmap)?;

        let handle = parts.handles.allocate(OpenFile {
            rom: *rom,
            dir_start: start_dir,
            info,
            mode: AccessMode::Write,
        })?;
        debug!("created {} at page {} as handle {}", entry, start, handle);
        Ok((handle, max_writable))
    }

    /// Open an existing file.
    pub fn open_file(&mut self, rom: &RomId, path: &str) -> OwfsResult<usize> {
        let (dir, last) = split_path(path)?;
        let entry = parse_file_entry(last)?;
        self.ensure_device(rom)?;

        let mut parts = self.parts(rom)?;
        if entry.is_add_file() && !parts.store.is_write_once() {
            return Err(OwfsError::WrongDeviceType("add files require a write-once part"));
        }
        if !parts.handles.has_free() {
            return Err(OwfsError::HandleNotAvailable);
        }
        let levels = parts.resolve(&dir)?;
        let start_dir = dir_start(&levels);
        let info = catalog::find(&mut parts.store, start_dir, &entry)?;
        parts.handles.allocate(OpenFile {
            rom: *rom,
            dir_start: start_dir,
            info,
            mode: AccessMode::Read,
        })
    }

    pub fn close_file(&mut self, handle: usize) -> OwfsResult<()> {
        self.handles.release(handle).map(|_| ())
    }

    /// Read the whole file behind `handle`.
    ///
    /// Monetary files return their data followed by the extra info the
    /// part reports for the page. Unterminated add files are read from
    /// their raw pages.
    pub fn read_file(&mut self, rom: &RomId, handle: usize) -> OwfsResult<Vec<u8>> {
        self.ensure_device(rom)?;
        let file = self.open_handle(rom, handle)?;
        let info = file.info;
        let mut parts = self.parts(rom)?;

        if info.entry.is_monetary() {
            let (data, extra) = parts.store.read_page_with_extra(info.start_page)?;
            let mut out = data
                .split_last()
                .map_or_else(Vec::new, |(_, payload)| payload.to_vec());
            out.extend_from_slice(&extra);
            return Ok(out);
        }
        if info.entry.is_add_file() && info.num_pages == 0 {
            return add_file::read_open(&mut parts.store, info.start_page);
        }
        ext_read(&mut parts.store, info.start_page)
    }

    /// Replace the contents of the file behind `handle`.
    ///
    /// Writes to an add file append to it.
    pub fn write_file(&mut self, rom: &RomId, handle: usize, data: &[u8]) -> OwfsResult<()> {
        self.prepare_write(rom)?;
        let file = self.open_handle(rom, handle)?;
        let entry = file.info.entry;
        if entry.is_add_file() {
            return self.write_add_file(rom, handle, super::AddMode::Append, data);
        }
        if file.info.is_read_only() {
            return Err(OwfsError::ReadOnly(entry.to_string()));
        }
        if entry.is_monetary() && data.len() > PAGE_PAYLOAD {
            return Err(OwfsError::OutOfSpace);
        }

        let mut parts = self.parts(rom)?;
        let info = catalog::find(&mut parts.store, file.dir_start, &entry)?;
        let mut bitmap = read_bitmap(&mut parts.store)?;

        // The old chain is released first; on write-once parts only the
        // start page is reused
        let freed = if parts.store.is_write_once() {
            1
        } else {
            info.num_pages.max(1) as usize
        };
        if data.len() > (bitmap.count_free() + freed) * PAGE_PAYLOAD {
            return Err(OwfsError::OutOfSpace);
        }

        reclaim_chain(&mut parts.store, &mut bitmap, info.start_page)?;
        let pages = ext_write(&mut parts.store, &mut bitmap, info.start_page, data)?;
        let num_pages = u8::try_from(pages).map_err(|_| OwfsError::OutOfSpace)?;
        catalog::update_pages(&mut parts.store, &info, info.start_page, num_pages)?;
        write_bitmap(&mut parts.store, &bitmap)?;

        parts.handles.get_mut(handle)?.info = FileInfo { num_pages, ..info };
        debug!("wrote {} bytes to {}", data.len(), entry);
        Ok(())
    }

    /// Delete a file, closing any handle on it.
    pub fn delete_file(&mut self, rom: &RomId, path: &str) -> OwfsResult<()> {
        let (dir, last) = split_path(path)?;
        let entry = parse_file_entry(last)?;
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        let levels = parts.resolve(&dir)?;
        let start_dir = dir_start(&levels);
        let info = catalog::find(&mut parts.store, start_dir, &entry)?;
        if info.is_read_only() {
            return Err(OwfsError::ReadOnly(entry.to_string()));
        }
        parts.handles.close_matching(rom, start_dir, &entry);

        let mut bitmap = read_bitmap(&mut parts.store)?;
        if entry.is_add_file() && info.num_pages == 0 {
            add_file::release_open(&mut parts.store, &mut bitmap, info.start_page)?;
        } else {
            reclaim_chain(&mut parts.store, &mut bitmap, info.start_page)?;
        }
        catalog::remove(&mut parts.store, &mut bitmap, &info)?;
        write_bitmap(&mut parts.store, &bitmap)?;
        info!("deleted {}", entry);
        Ok(())
    }

    /// Rename the file behind `handle` in place, keeping its attribute.
    ///
    /// If the new name is taken the handle is released.
    pub fn rename_file(&mut self, rom: &RomId, handle: usize, new_name: &str) -> OwfsResult<()> {
        self.prepare_write(rom)?;
        let file = self.open_handle(rom, handle)?;
        let new_entry = parse_file_entry(new_name)?;

        let mut parts = self.parts(rom)?;
        if catalog::lookup(&mut parts.store, file.dir_start, &new_entry)?.is_some() {
            parts.handles.release(handle)?;
            return Err(OwfsError::FileExists(new_entry.to_string()));
        }
        let info = catalog::find(&mut parts.store, file.dir_start, &file.info.entry)?;
        catalog::rename_in_place(&mut parts.store, &info, &new_entry)?;
        parts.handles.get_mut(handle)?.info = FileInfo {
            entry: new_entry,
            ..info
        };
        debug!("renamed {} to {}", info.entry, new_entry);
        Ok(())
    }

    /// Set the attribute of a file (0 or read-only) or directory (0 or hidden).
    pub fn set_attribute(&mut self, rom: &RomId, path: &str, attrib: u8) -> OwfsResult<()> {
        let (dir, last) = split_path(path)?;
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        let levels = parts.resolve(&dir)?;
        let info = lookup_any(&mut parts.store, dir_start(&levels), last)?;
        let allowed = if info.entry.is_directory() {
            ATTR_HIDDEN
        } else {
            ATTR_READ_ONLY
        };
        if attrib != 0 && attrib != allowed {
            return Err(OwfsError::InvalidAttribute {
                name: info.entry.to_string(),
                attrib,
            });
        }
        catalog::set_attribute(&mut parts.store, &info, attrib != 0)
    }

    /// Create an empty subdirectory.
    pub fn create_dir(&mut self, rom: &RomId, path: &str) -> OwfsResult<()> {
        let (dir, last) = split_path(path)?;
        let name = FileName::new(last)?;
        let entry = FileEntry::directory(name);
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        let levels = parts.resolve(&dir)?;
        if levels.len() >= MAX_DEPTH {
            return Err(OwfsError::DirectoryTooDeep);
        }
        let start_dir = dir_start(&levels);
        if catalog::lookup(&mut parts.store, start_dir, &entry)?.is_some() {
            return Err(OwfsError::FileExists(entry.to_string()));
        }

        let mut bitmap = read_bitmap(&mut parts.store)?;
        let page = bitmap.find_empty().first.ok_or(OwfsError::OutOfSpace)?;
        bitmap.set(page)?;
        let parent = levels.last().map_or(FileName::ROOT, |level| level.name);
        parts
            .store
            .write_page(page, &subdirectory_packet(parent, start_dir))?;
        catalog::insert(
            &mut parts.store,
            &mut bitmap,
            start_dir,
            &Record::new(&entry, 0, page, 0),
        )?;
        write_bitmap(&mut parts.store, &bitmap)?;
        debug!("created directory {} at page {}", name, page);
        Ok(())
    }

    /// Remove an empty subdirectory.
    ///
    /// If the current directory lies inside it, the session moves to its parent.
    pub fn remove_dir(&mut self, rom: &RomId, path: &str) -> OwfsResult<()> {
        let (dir, last) = split_path(path)?;
        let entry = FileEntry::directory(FileName::new(last)?);
        self.prepare_write(rom)?;

        let mut parts = self.parts(rom)?;
        let levels = parts.resolve(&dir)?;
        let info = catalog::find(&mut parts.store, dir_start(&levels), &entry)?;
        let first = parts.store.read_page(info.start_page)?;
        if !is_empty_directory(&first) {
            return Err(OwfsError::DirectoryNotEmpty(entry.to_string()));
        }

        let mut bitmap = read_bitmap(&mut parts.store)?;
        reclaim_chain(&mut parts.store, &mut bitmap, info.start_page)?;
        catalog::remove(&mut parts.store, &mut bitmap, &info)?;
        write_bitmap(&mut parts.store, &bitmap)?;

        if let Some(depth) = parts
            .cd
            .levels()
            .iter()
            .position(|level| level.page == info.start_page)
        {
            parts.cd.truncate(depth);
        }
        info!("removed directory {}", entry);
        Ok(())
    }
}
