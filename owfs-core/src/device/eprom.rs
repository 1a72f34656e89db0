//! Simulated write-once (EPROM) memory bank.

use super::bank::{MemoryBank, StatusLayout};
use super::udp;
use super::{PageNumber, RomId, PAGE_LEN};
use crate::error::{OwfsError, OwfsResult};

/// Value of an unprogrammed EPROM byte.
pub const ERASED: u8 = 0xFF;

/// In-memory EPROM bank.
///
/// Programming can only clear bits; every write is verified and fails with
/// [`OwfsError::ProgramFailed`] when a requested one bit is already zero.
/// Status memory follows [`StatusLayout`].
#[derive(Debug, Clone)]
pub struct EpromBank {
    rom: RomId,
    memory: Vec<u8>,
    status: Vec<u8>,
    layout: StatusLayout,
}

impl EpromBank {
    /// Create a blank bank with `pages` pages.
    pub fn new(rom: RomId, pages: usize) -> Self {
        let pages = pages.clamp(1, 256);
        let layout = StatusLayout::new(pages);
        Self {
            rom,
            memory: vec![ERASED; pages * PAGE_LEN],
            status: vec![ERASED; layout.len()],
            layout,
        }
    }

    /// Rebuild a bank from persisted contents.
    pub fn from_parts(rom: RomId, memory: Vec<u8>, status: Vec<u8>) -> OwfsResult<Self> {
        let pages = memory.len() / PAGE_LEN;
        if memory.is_empty() || memory.len() % PAGE_LEN != 0 || pages > 256 {
            return Err(OwfsError::Image(format!(
                "{}: memory size {} is not a whole number of pages",
                rom,
                memory.len()
            )));
        }
        let layout = StatusLayout::new(pages);
        if status.len() != layout.len() {
            return Err(OwfsError::Image(format!(
                "{}: status memory is {} bytes, expected {}",
                rom,
                status.len(),
                layout.len()
            )));
        }
        Ok(Self {
            rom,
            memory,
            status,
            layout,
        })
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn status(&self) -> &[u8] {
        &self.status
    }

    pub fn layout(&self) -> StatusLayout {
        self.layout
    }

    /// Burn the write-protect bit of `page`.
    pub fn protect_page(&mut self, page: PageNumber) -> OwfsResult<()> {
        let (addr, mask) = self.layout.bit(self.layout.write_protect(), page);
        self.burn_status_bit(addr, mask)
    }

    /// Burn the redirection write-protect bit of `page`.
    pub fn protect_redirection(&mut self, page: PageNumber) -> OwfsResult<()> {
        let (addr, mask) = self.layout.bit(self.layout.redirect_protect(), page);
        self.burn_status_bit(addr, mask)
    }

    /// Burn a redirection of `page` to `target` into status memory.
    pub fn redirect(&mut self, page: PageNumber, target: PageNumber) -> OwfsResult<()> {
        self.program_status(self.layout.redirect_address(page), !target)
    }

    /// Redirection target of `page`, if any.
    pub fn redirection(&self, page: PageNumber) -> Option<PageNumber> {
        match self.status.get(self.layout.redirect_address(page)) {
            Some(&ERASED) | None => None,
            Some(&raw) => Some(!raw),
        }
    }

    pub fn is_protected(&self, page: PageNumber) -> bool {
        let (addr, mask) = self.layout.bit(self.layout.write_protect(), page);
        self.status.get(addr).is_some_and(|b| b & mask == 0)
    }

    fn burn_status_bit(&mut self, addr: usize, mask: u8) -> OwfsResult<()> {
        let current = *self
            .status
            .get(addr)
            .ok_or(OwfsError::AddressOutOfRange(addr))?;
        self.program_status(addr, current & !mask)
    }

    fn program_status(&mut self, addr: usize, value: u8) -> OwfsResult<()> {
        let cell = self
            .status
            .get_mut(addr)
            .ok_or(OwfsError::AddressOutOfRange(addr))?;
        let programmed = *cell & value;
        if programmed != value {
            return Err(OwfsError::ProgramFailed(addr));
        }
        *cell = programmed;
        Ok(())
    }
}

impl MemoryBank for EpromBank {
    fn rom(&self) -> RomId {
        self.rom
    }

    fn description(&self) -> &str {
        "Simulated EPROM with status memory"
    }

    fn is_write_once(&self) -> bool {
        true
    }

    fn has_extra_info(&self) -> bool {
        true
    }

    fn extra_info_len(&self) -> usize {
        1
    }

    fn has_page_auto_crc(&self) -> bool {
        true
    }

    fn can_redirect_page(&self) -> bool {
        true
    }

    fn can_lock_page(&self) -> bool {
        true
    }

    fn number_pages(&self) -> usize {
        self.layout.pages()
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> OwfsResult<()> {
        let end = addr + buf.len();
        if end > self.memory.len() {
            return Err(OwfsError::AddressOutOfRange(end));
        }
        buf.copy_from_slice(&self.memory[addr..end]);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> OwfsResult<()> {
        let end = addr + data.len();
        if end > self.memory.len() {
            return Err(OwfsError::AddressOutOfRange(end));
        }
        for (i, &byte) in data.iter().enumerate() {
            let at = addr + i;
            let page = (at / PAGE_LEN) as PageNumber;
            if self.is_protected(page) {
                return Err(OwfsError::WriteProtected(page));
            }
            let programmed = self.memory[at] & byte;
            if programmed != byte {
                return Err(OwfsError::ProgramFailed(at));
            }
            self.memory[at] = programmed;
        }
        Ok(())
    }

    fn read_page_extra(&mut self, page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        let raw = self.read_page(page)?;
        let extra = self
            .status
            .get(self.layout.redirect_address(page))
            .copied()
            .ok_or(OwfsError::OutOfRange(page as usize))?;
        Ok((raw, vec![extra]))
    }

    /// A redirected page reports its redirection byte and no data.
    fn read_page_packet_extra(&mut self, page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        let (raw, extra) = self.read_page_extra(page)?;
        if extra[0] != ERASED {
            return Ok((Vec::new(), extra));
        }
        Ok((udp::decode_packet(page, &raw)?, extra))
    }

    fn read_status(&mut self, addr: usize, buf: &mut [u8]) -> OwfsResult<()> {
        let end = addr + buf.len();
        if end > self.status.len() {
            return Err(OwfsError::AddressOutOfRange(end));
        }
        buf.copy_from_slice(&self.status[addr..end]);
        Ok(())
    }

    fn write_status(&mut self, addr: usize, data: &[u8]) -> OwfsResult<()> {
        for (i, &byte) in data.iter().enumerate() {
            self.program_status(addr + i, byte)?;
        }
        Ok(())
    }
}
