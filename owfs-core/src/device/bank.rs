//! Memory bank capability contract.

use super::udp;
use super::{PageNumber, RomId, PAGE_LEN};
use crate::error::{OwfsError, OwfsResult};

/// Which address space of a device a page number refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// General purpose data pages.
    Data,
    /// Status memory of write-once parts (bitmap, protection, redirection).
    Status,
}

/// One paged memory bank of a 1-Wire device.
///
/// Implementations provide raw `read`/`write` plus capability queries;
/// page and packet helpers have default implementations built on those.
/// Write-once banks additionally expose status memory.
pub trait MemoryBank {
    /// Serial number of the device this bank belongs to.
    fn rom(&self) -> RomId;

    /// Short human readable description.
    fn description(&self) -> &str;

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_write_once(&self) -> bool;

    fn has_extra_info(&self) -> bool;

    fn extra_info_len(&self) -> usize {
        0
    }

    fn has_page_auto_crc(&self) -> bool;

    fn can_redirect_page(&self) -> bool {
        false
    }

    fn can_lock_page(&self) -> bool {
        false
    }

    fn page_length(&self) -> usize {
        PAGE_LEN
    }

    fn number_pages(&self) -> usize;

    fn starting_address(&self) -> usize {
        0
    }

    /// Highest valid page number.
    fn max_page(&self) -> PageNumber {
        self.number_pages().saturating_sub(1).min(PageNumber::MAX as usize) as PageNumber
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> OwfsResult<()>;

    fn write(&mut self, addr: usize, data: &[u8]) -> OwfsResult<()>;

    /// Read one raw page.
    fn read_page(&mut self, page: PageNumber) -> OwfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.page_length()];
        self.read(page as usize * self.page_length(), &mut buf)?;
        Ok(buf)
    }

    /// Read one raw page with the device verifying its own CRC.
    fn read_page_crc(&mut self, page: PageNumber) -> OwfsResult<Vec<u8>> {
        if !self.has_page_auto_crc() {
            return Err(OwfsError::WrongDeviceType("bank has no page CRC"));
        }
        self.read_page(page)
    }

    /// Read one raw page plus the device's extra information bytes.
    fn read_page_extra(&mut self, _page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        Err(OwfsError::WrongDeviceType("bank has no extra info"))
    }

    /// Read and decode the packet on one page.
    fn read_page_packet(&mut self, page: PageNumber) -> OwfsResult<Vec<u8>> {
        let raw = self.read_page(page)?;
        udp::decode_packet(page, &raw)
    }

    /// Read and decode the packet on one page together with extra info.
    fn read_page_packet_extra(&mut self, page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        let (raw, extra) = self.read_page_extra(page)?;
        Ok((udp::decode_packet(page, &raw)?, extra))
    }

    /// Frame `data` as a packet and write it to one page.
    fn write_page_packet(&mut self, page: PageNumber, data: &[u8]) -> OwfsResult<()> {
        let packet = udp::encode_packet(page, data)?;
        self.write(page as usize * self.page_length(), &packet)
    }

    fn read_status(&mut self, _addr: usize, _buf: &mut [u8]) -> OwfsResult<()> {
        Err(OwfsError::WrongDeviceType("status memory requires a write-once bank"))
    }

    fn write_status(&mut self, _addr: usize, _data: &[u8]) -> OwfsResult<()> {
        Err(OwfsError::WrongDeviceType("status memory requires a write-once bank"))
    }
}

/// Bytes per status memory page.
pub const STATUS_PAGE_LEN: usize = 8;

/// Status memory layout of a write-once bank.
///
/// Regions follow each other in this order, all stored inverted so an
/// unprogrammed part reads as all ones:
/// - write-protect bits, one per page
/// - redirection write-protect bits, one per page
/// - page bitmap, one bit per page
/// - redirection bytes, one per page (`0xFF` = not redirected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLayout {
    pages: usize,
}

impl StatusLayout {
    pub fn new(pages: usize) -> Self {
        Self { pages }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Bytes in each of the three bit regions.
    pub fn bits_len(&self) -> usize {
        self.pages.div_ceil(8)
    }

    pub fn write_protect(&self) -> usize {
        0
    }

    pub fn redirect_protect(&self) -> usize {
        self.bits_len()
    }

    pub fn bitmap(&self) -> usize {
        2 * self.bits_len()
    }

    pub fn redirection(&self) -> usize {
        3 * self.bits_len()
    }

    /// Total status memory size.
    pub fn len(&self) -> usize {
        self.redirection() + self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Number of status pages covering the whole layout.
    pub fn status_pages(&self) -> usize {
        self.len().div_ceil(STATUS_PAGE_LEN)
    }

    /// Address and programming mask for the bit of `page` in the region at `base`.
    pub fn bit(&self, base: usize, page: PageNumber) -> (usize, u8) {
        (base + page as usize / 8, 1 << (page % 8))
    }

    pub fn redirect_address(&self, page: PageNumber) -> usize {
        self.redirection() + page as usize
    }
}
