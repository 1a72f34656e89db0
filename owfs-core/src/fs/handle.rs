//! Open-file handle table.

use super::entry::{FileEntry, FileInfo};
use super::MAX_HANDLES;
use crate::device::{PageNumber, RomId};
use crate::error::{OwfsError, OwfsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Opened an existing file.
    Read,
    /// Created the file.
    Write,
}

/// State behind one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub rom: RomId,
    /// First page of the directory holding the record.
    pub dir_start: PageNumber,
    pub info: FileInfo,
    pub mode: AccessMode,
}

impl OpenFile {
    fn names(&self, rom: &RomId, dir_start: PageNumber, entry: &FileEntry) -> bool {
        self.rom == *rom && self.dir_start == dir_start && self.info.entry == *entry
    }
}

/// Fixed table of [`MAX_HANDLES`] slots. A handle is the slot index.
#[derive(Debug, Clone, Default)]
pub struct HandleTable {
    slots: [Option<OpenFile>; MAX_HANDLES],
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a slot is free.
    pub fn has_free(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Take the lowest free slot.
    pub fn allocate(&mut self, file: OpenFile) -> OwfsResult<usize> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(OwfsError::HandleNotAvailable)?;
        self.slots[index] = Some(file);
        Ok(index)
    }

    pub fn get(&self, handle: usize) -> OwfsResult<&OpenFile> {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .ok_or(OwfsError::InvalidHandle(handle))
    }

    pub fn get_mut(&mut self, handle: usize) -> OwfsResult<&mut OpenFile> {
        self.slots
            .get_mut(handle)
            .and_then(Option::as_mut)
            .ok_or(OwfsError::InvalidHandle(handle))
    }

    pub fn release(&mut self, handle: usize) -> OwfsResult<OpenFile> {
        self.slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or(OwfsError::InvalidHandle(handle))
    }

    /// Whether a handle names `entry` in the given directory.
    pub fn is_open(&self, rom: &RomId, dir_start: PageNumber, entry: &FileEntry) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|file| file.names(rom, dir_start, entry))
    }

    /// Release every handle naming `entry`. Returns how many were closed.
    pub fn close_matching(&mut self, rom: &RomId, dir_start: PageNumber, entry: &FileEntry) -> usize {
        let mut closed = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|f| f.names(rom, dir_start, entry)) {
                *slot = None;
                closed += 1;
            }
        }
        closed
    }

    /// Release every handle on `rom`.
    pub fn close_device(&mut self, rom: &RomId) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|f| f.rom == *rom) {
                *slot = None;
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}
