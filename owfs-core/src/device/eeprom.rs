//! Simulated rewritable memory bank.

use super::bank::MemoryBank;
use super::{PageNumber, RomId, PAGE_LEN};
use crate::error::{OwfsError, OwfsResult};

/// Bytes of extra info reported by banks with write counters.
pub const COUNTER_LEN: usize = 4;

/// In-memory EEPROM/NV RAM bank.
///
/// With counters enabled each page keeps a write cycle counter that is
/// reported as extra info, like the counter pages of monetary parts.
#[derive(Debug, Clone)]
pub struct EepromBank {
    rom: RomId,
    memory: Vec<u8>,
    counters: Option<Vec<u32>>,
    read_only: bool,
}

impl EepromBank {
    /// Create a zero-filled bank with `pages` pages.
    pub fn new(rom: RomId, pages: usize) -> Self {
        Self {
            rom,
            memory: vec![0; pages.clamp(1, 256) * PAGE_LEN],
            counters: None,
            read_only: false,
        }
    }

    /// Enable per-page write counters.
    pub fn with_counters(mut self) -> Self {
        self.counters = Some(vec![0; self.memory.len() / PAGE_LEN]);
        self
    }

    /// Mark the bank as read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Rebuild a bank from persisted contents.
    pub fn from_parts(
        rom: RomId,
        memory: Vec<u8>,
        counters: Option<Vec<u32>>,
        read_only: bool,
    ) -> OwfsResult<Self> {
        let pages = memory.len() / PAGE_LEN;
        if memory.is_empty() || memory.len() % PAGE_LEN != 0 || pages > 256 {
            return Err(OwfsError::Image(format!(
                "{}: memory size {} is not a whole number of pages",
                rom,
                memory.len()
            )));
        }
        if counters.as_ref().is_some_and(|c| c.len() != pages) {
            return Err(OwfsError::Image(format!("{}: counter count mismatch", rom)));
        }
        Ok(Self {
            rom,
            memory,
            counters,
            read_only,
        })
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn counters(&self) -> Option<&[u32]> {
        self.counters.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.read_only
    }

    fn check_range(&self, addr: usize, len: usize) -> OwfsResult<()> {
        if addr + len > self.memory.len() {
            return Err(OwfsError::AddressOutOfRange(addr + len));
        }
        Ok(())
    }
}

impl MemoryBank for EepromBank {
    fn rom(&self) -> RomId {
        self.rom
    }

    fn description(&self) -> &str {
        if self.counters.is_some() {
            "Simulated NV RAM with write cycle counters"
        } else {
            "Simulated NV RAM"
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_write_once(&self) -> bool {
        false
    }

    fn has_extra_info(&self) -> bool {
        self.counters.is_some()
    }

    fn extra_info_len(&self) -> usize {
        if self.counters.is_some() {
            COUNTER_LEN
        } else {
            0
        }
    }

    fn has_page_auto_crc(&self) -> bool {
        self.counters.is_some()
    }

    fn number_pages(&self) -> usize {
        self.memory.len() / PAGE_LEN
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> OwfsResult<()> {
        self.check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.memory[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> OwfsResult<()> {
        if self.read_only {
            return Err(OwfsError::ReadOnly(self.rom.to_string()));
        }
        self.check_range(addr, data.len())?;
        self.memory[addr..addr + data.len()].copy_from_slice(data);
        if let Some(counters) = self.counters.as_mut() {
            let first = addr / PAGE_LEN;
            let last = (addr + data.len().max(1) - 1) / PAGE_LEN;
            for counter in &mut counters[first..=last] {
                *counter = counter.wrapping_add(1);
            }
        }
        Ok(())
    }

    fn read_page_extra(&mut self, page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        let counter = match &self.counters {
            Some(counters) => *counters
                .get(page as usize)
                .ok_or(OwfsError::OutOfRange(page as usize))?,
            None => return Err(OwfsError::WrongDeviceType("bank has no extra info")),
        };
        let raw = self.read_page(page)?;
        Ok((raw, counter.to_le_bytes().to_vec()))
    }
}
