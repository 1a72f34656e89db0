//! Logical page access.
//!
//! Reads consult an ordered chain of [`PageSource`]s: the open program
//! job's shadow, then the page cache, then the device. Redirections
//! reported by the device or remembered by the cache are followed up to a
//! fixed number of hops. Writes land in the shadow while a program job is
//! open and go to the device otherwise.

use log::{debug, trace, warn};

use super::bitmap::{Bitmap, Media};
use super::program_job::ProgramJob;
use super::PAGE_PAYLOAD;
use crate::cache::{CachedPage, PageCache};
use crate::device::udp::{self, MAX_PACKET_DATA};
use crate::device::{
    MemoryBank, MemoryKind, PageNumber, RomId, StatusLayout, ERASED, PAGE_LEN, STATUS_PAGE_LEN,
};
use crate::error::{OwfsError, OwfsResult};

/// Redirections followed by one read. 256 covers a chain through every
/// page of the largest part; one more lookup reads the final page.
pub const MAX_REDIRECT_HOPS: usize = 256;

/// Outcome of asking one source for a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Vec<u8>),
    Redirect(PageNumber),
    Miss,
}

/// Which link of the chain answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Shadow,
    Cache,
    Device,
}

/// One link of the read chain.
pub trait PageSource {
    fn lookup(&mut self, rom: &RomId, page: PageNumber, kind: MemoryKind) -> OwfsResult<Lookup>;
}

impl PageSource for PageCache {
    fn lookup(&mut self, rom: &RomId, page: PageNumber, kind: MemoryKind) -> OwfsResult<Lookup> {
        Ok(match self.find(rom, page, kind) {
            Some(CachedPage::Data(data)) => Lookup::Hit(data.clone()),
            Some(CachedPage::Redirect(target)) => Lookup::Redirect(*target),
            None => Lookup::Miss,
        })
    }
}

/// The physical bank as the last link of the chain. Never misses.
pub struct DeviceSource<'a> {
    bank: &'a mut dyn MemoryBank,
}

impl<'a> DeviceSource<'a> {
    pub fn new(bank: &'a mut dyn MemoryBank) -> Self {
        Self { bank }
    }
}

impl PageSource for DeviceSource<'_> {
    fn lookup(&mut self, _rom: &RomId, page: PageNumber, kind: MemoryKind) -> OwfsResult<Lookup> {
        if kind == MemoryKind::Status {
            let layout = StatusLayout::new(self.bank.number_pages());
            let addr = page as usize * STATUS_PAGE_LEN;
            if addr >= layout.len() {
                return Err(OwfsError::OutOfRange(addr));
            }
            let mut buf = vec![0u8; STATUS_PAGE_LEN.min(layout.len() - addr)];
            self.bank.read_status(addr, &mut buf)?;
            return Ok(Lookup::Hit(buf));
        }

        // Most verbose read the bank supports
        if self.bank.has_extra_info() {
            let (data, extra) = self.bank.read_page_packet_extra(page)?;
            if self.bank.can_redirect_page() {
                if let Some(&raw) = extra.first().filter(|&&b| b != ERASED) {
                    return Ok(Lookup::Redirect(!raw));
                }
            }
            Ok(Lookup::Hit(data))
        } else if self.bank.has_page_auto_crc() {
            let raw = self.bank.read_page_crc(page)?;
            Ok(Lookup::Hit(udp::decode_packet(page, &raw)?))
        } else {
            let raw = self.bank.read_page(page)?;
            Ok(Lookup::Hit(udp::decode_packet(page, &raw)?))
        }
    }
}

/// A page read without packet decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub bytes: Vec<u8>,
    pub extra: Vec<u8>,
}

/// Page access for one device within a session.
pub struct PageStore<'a> {
    rom: RomId,
    bank: &'a mut dyn MemoryBank,
    cache: &'a mut PageCache,
    job: Option<&'a mut ProgramJob>,
    max_hops: usize,
}

impl<'a> PageStore<'a> {
    /// A job opened for another device is ignored.
    pub fn new(
        rom: RomId,
        bank: &'a mut dyn MemoryBank,
        cache: &'a mut PageCache,
        job: Option<&'a mut ProgramJob>,
    ) -> Self {
        Self {
            rom,
            bank,
            cache,
            job: job.filter(|j| j.rom() == rom),
            max_hops: MAX_REDIRECT_HOPS,
        }
    }

    pub fn with_hop_limit(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn rom(&self) -> RomId {
        self.rom
    }

    pub fn bank(&mut self) -> &mut dyn MemoryBank {
        &mut *self.bank
    }

    pub fn is_write_once(&self) -> bool {
        self.bank.is_write_once()
    }

    pub fn is_read_only(&self) -> bool {
        self.bank.is_read_only()
    }

    pub fn max_page(&self) -> PageNumber {
        self.bank.max_page()
    }

    pub fn job(&self) -> Option<&ProgramJob> {
        self.job.as_deref()
    }

    pub fn job_mut(&mut self) -> Option<&mut ProgramJob> {
        self.job.as_deref_mut()
    }

    /// Decoded packet data of a logical page.
    pub fn read_page(&mut self, page: PageNumber) -> OwfsResult<Vec<u8>> {
        self.read(page, MemoryKind::Data)
    }

    /// Read `len` bytes of status memory starting at `addr`.
    pub fn read_status(&mut self, addr: usize, len: usize) -> OwfsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut at = addr;
        while out.len() < len {
            let page = (at / STATUS_PAGE_LEN) as PageNumber;
            let data = self.read(page, MemoryKind::Status)?;
            let skip = at % STATUS_PAGE_LEN;
            if skip >= data.len() {
                return Err(OwfsError::OutOfRange(at));
            }
            let take = (data.len() - skip).min(len - out.len());
            out.extend_from_slice(&data[skip..skip + take]);
            at += take;
        }
        Ok(out)
    }

    /// Read a page through the source chain, following redirections.
    pub fn read(&mut self, page: PageNumber, kind: MemoryKind) -> OwfsResult<Vec<u8>> {
        let origin = page;
        let mut page = page;
        for _ in 0..=self.max_hops {
            let (tier, found) = self.lookup_once(page, kind)?;
            match found {
                Lookup::Hit(data) => {
                    if data.len() > PAGE_LEN {
                        return Err(OwfsError::InvalidPacketLength {
                            page,
                            len: data.len(),
                        });
                    }
                    if tier == Tier::Device {
                        self.cache.add(&self.rom, page, kind, data.clone());
                    }
                    trace!("page {} ({:?}) from {:?} as page {}", origin, kind, tier, page);
                    return Ok(data);
                }
                Lookup::Redirect(target) => {
                    if tier == Tier::Device {
                        self.cache.add_redirect(&self.rom, page, target);
                    }
                    debug!("page {} redirected to {}", page, target);
                    page = target;
                }
                Lookup::Miss => return Err(OwfsError::BrokenChain(page)),
            }
        }
        Err(OwfsError::RedirectionCycle(origin))
    }

    fn lookup_once(&mut self, page: PageNumber, kind: MemoryKind) -> OwfsResult<(Tier, Lookup)> {
        let mut device = DeviceSource::new(&mut *self.bank);
        let mut chain: Vec<(Tier, &mut dyn PageSource)> = Vec::with_capacity(3);
        if let Some(job) = self.job.as_deref_mut() {
            chain.push((Tier::Shadow, job as &mut dyn PageSource));
        }
        chain.push((Tier::Cache, &mut *self.cache as &mut dyn PageSource));
        chain.push((Tier::Device, &mut device as &mut dyn PageSource));

        for (tier, source) in chain {
            match source.lookup(&self.rom, page, kind)? {
                Lookup::Miss => continue,
                found => return Ok((tier, found)),
            }
        }
        Ok((Tier::Device, Lookup::Miss))
    }

    /// Write packet data to a logical page.
    ///
    /// With a program job open the write is staged in its shadow;
    /// otherwise it goes to the device and the cache.
    pub fn write_page(&mut self, page: PageNumber, data: &[u8]) -> OwfsResult<()> {
        if data.len() > MAX_PACKET_DATA {
            return Err(OwfsError::InvalidPacketLength {
                page,
                len: data.len(),
            });
        }
        if let Some(job) = self.job.as_deref_mut() {
            trace!("stage page {} ({} bytes)", page, data.len());
            return job.stage_write(page, data);
        }
        if self.bank.is_read_only() {
            return Err(OwfsError::ReadOnly(self.rom.to_string()));
        }
        self.bank.write_page_packet(page, data)?;
        self.cache.add(&self.rom, page, MemoryKind::Data, data.to_vec());
        Ok(())
    }

    /// Raw page contents for byte-level work on write-once and counter parts.
    ///
    /// Pending job pages come from the shadow with byte 0 left at `0xFF`.
    /// A redirected page is an error.
    pub fn read_raw_page(&mut self, page: PageNumber) -> OwfsResult<RawPage> {
        if !self.bank.is_write_once() && !self.bank.has_extra_info() {
            return Err(OwfsError::WrongDeviceType(
                "raw page access requires a write-once or counter part",
            ));
        }
        if let Some(data) = self.job.as_deref().and_then(|j| j.pending_data(page)) {
            let mut bytes = vec![ERASED; PAGE_LEN];
            bytes[1..1 + data.len()].copy_from_slice(data);
            return Ok(RawPage {
                bytes,
                extra: Vec::new(),
            });
        }
        let (bytes, extra) = self.bank.read_page_extra(page)?;
        if self.bank.can_redirect_page() && extra.first().is_some_and(|&b| b != ERASED) {
            return Err(OwfsError::RedirectedPage(page));
        }
        Ok(RawPage { bytes, extra })
    }

    /// Packet data plus extra info straight from the device.
    pub fn read_page_with_extra(&mut self, page: PageNumber) -> OwfsResult<(Vec<u8>, Vec<u8>)> {
        if self.bank.has_extra_info() {
            self.bank.read_page_packet_extra(page)
        } else {
            Ok((self.read_page(page)?, Vec::new()))
        }
    }

    /// Set or clear a bitmap bit with the media rules of this device.
    pub fn change_bit(&mut self, bitmap: &mut Bitmap, page: PageNumber, set: bool) -> OwfsResult<()> {
        let media = if self.bank.is_write_once() {
            Media::WriteOnce(self.job.as_deref_mut())
        } else {
            Media::Rewritable
        };
        bitmap.change_bit(page, set, media)
    }

    /// Change one byte of a page through the open job.
    ///
    /// Offsets 1-29 address the raw page bytes after the length byte.
    pub fn write_job_byte(
        &mut self,
        page: PageNumber,
        offset: usize,
        byte: u8,
        zero_mode: bool,
    ) -> OwfsResult<()> {
        self.load_job_page(page)?;
        self.job_mut()
            .ok_or(OwfsError::NoProgramJob)?
            .write_byte(page, offset, byte, zero_mode)
    }

    /// Mark a page as an add-file page in the open job.
    pub fn mark_job_add(&mut self, page: PageNumber) -> OwfsResult<()> {
        self.load_job_page(page)?;
        self.job_mut()
            .ok_or(OwfsError::NoProgramJob)?
            .mark_add(page)
    }

    /// Seal an add-file page in the open job.
    pub fn terminate_page(&mut self, page: PageNumber) -> OwfsResult<()> {
        self.load_job_page(page)?;
        self.job_mut()
            .ok_or(OwfsError::NoProgramJob)?
            .terminate_page(page)
    }

    /// Drop a pending add-file page from the open job, freeing it in
    /// `bitmap` unless the device already holds it.
    pub fn release_add_page(&mut self, bitmap: &mut Bitmap, page: PageNumber) -> OwfsResult<()> {
        let Some(job) = self.job.as_deref_mut() else {
            return Ok(());
        };
        if job.discard_add(page)? && !job.original_bitmap().is_set(page) {
            bitmap.clear(page)?;
        }
        Ok(())
    }

    fn load_job_page(&mut self, page: PageNumber) -> OwfsResult<()> {
        let loaded = self.job().ok_or(OwfsError::NoProgramJob)?.has_page(page);
        if !loaded {
            let raw = self.read_raw_page(page)?;
            if let Some(job) = self.job_mut() {
                job.load_raw(page, &raw.bytes);
            }
        }
        Ok(())
    }
}

/// Write `data` as a chain of pages starting at `start`.
///
/// Each page carries up to 28 bytes plus the number of the next page
/// (`0` ends the chain). Pages are marked in `bitmap` as they are taken.
/// Returns the number of pages written.
pub fn ext_write(
    store: &mut PageStore<'_>,
    bitmap: &mut Bitmap,
    start: PageNumber,
    data: &[u8],
) -> OwfsResult<usize> {
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(PAGE_PAYLOAD).collect()
    };
    bitmap.set(start)?;
    let mut page = start;
    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 == chunks.len() {
            0
        } else {
            let next = bitmap.find_empty().first.ok_or(OwfsError::OutOfSpace)?;
            bitmap.set(next)?;
            next
        };
        let mut packet = chunk.to_vec();
        packet.push(next);
        store.write_page(page, &packet)?;
        page = next;
    }
    debug!("wrote {} bytes in {} pages from page {}", data.len(), chunks.len(), start);
    Ok(chunks.len())
}

/// Read the chain of pages starting at `start`.
pub fn ext_read(store: &mut PageStore<'_>, start: PageNumber) -> OwfsResult<Vec<u8>> {
    let mut out = Vec::new();
    walk_chain(store, start, |_, payload| out.extend_from_slice(payload))?;
    Ok(out)
}

/// Release every page of the chain starting at `start` in `bitmap`.
///
/// Returns the number of pages visited.
pub fn reclaim_chain(
    store: &mut PageStore<'_>,
    bitmap: &mut Bitmap,
    start: PageNumber,
) -> OwfsResult<usize> {
    let mut pages = Vec::new();
    let visited = walk_chain(store, start, |page, _| pages.push(page));
    match visited {
        Ok(_) => {}
        // An unreadable first page is released on its own
        Err(err @ (OwfsError::InvalidPacketLength { .. } | OwfsError::CrcMismatch(_)))
            if pages.is_empty() =>
        {
            warn!("releasing unreadable page {}: {}", start, err);
            pages.push(start);
        }
        Err(err) => return Err(err),
    }
    for &page in &pages {
        store.change_bit(bitmap, page, false)?;
    }
    Ok(pages.len())
}

fn walk_chain(
    store: &mut PageStore<'_>,
    start: PageNumber,
    mut visit: impl FnMut(PageNumber, &[u8]),
) -> OwfsResult<usize> {
    let limit = store.max_page() as usize + 1;
    let mut page = start;
    for count in 1..=limit {
        let data = store.read_page(page)?;
        let (&next, payload) = data.split_last().ok_or(OwfsError::BrokenChain(page))?;
        visit(page, payload);
        if next == 0 {
            return Ok(count);
        }
        page = next;
    }
    Err(OwfsError::BrokenChain(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EepromBank, EpromBank};

    fn nv_rom() -> RomId {
        RomId::new([0x0C, 0x20, 0, 0, 0, 0, 0, 0])
    }

    fn otp_rom() -> RomId {
        RomId::new([0x0B, 0x21, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_write_then_read_uses_cache() {
        let mut bank = EepromBank::new(nv_rom(), 16);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        store.write_page(3, b"ABC").unwrap();
        assert_eq!(store.read_page(3).unwrap(), b"ABC".to_vec());
        drop(store);
        assert!(cache.find(&nv_rom(), 3, MemoryKind::Data).is_some());
    }

    #[test]
    fn test_packet_too_long() {
        let mut bank = EepromBank::new(nv_rom(), 16);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        assert!(matches!(
            store.write_page(1, &[0u8; 30]),
            Err(OwfsError::InvalidPacketLength { len: 30, .. })
        ));
    }

    #[test]
    fn test_shadow_precedes_device() {
        let mut bank = EpromBank::new(otp_rom(), 16);
        bank.write_page_packet(4, b"OLD").unwrap();
        let mut cache = PageCache::new(8);
        let mut job = ProgramJob::new(otp_rom(), Bitmap::new(15));
        let mut store = PageStore::new(otp_rom(), &mut bank, &mut cache, Some(&mut job));
        assert_eq!(store.read_page(4).unwrap(), b"OLD".to_vec());
        store.write_page(4, b"NEW").unwrap();
        assert_eq!(store.read_page(4).unwrap(), b"NEW".to_vec());
        drop(store);
        // Nothing reached the device
        assert_eq!(bank.read_page_packet(4).unwrap(), b"OLD".to_vec());
    }

    #[test]
    fn test_job_for_other_device_ignored() {
        let mut bank = EepromBank::new(nv_rom(), 16);
        let mut cache = PageCache::new(8);
        let mut job = ProgramJob::new(otp_rom(), Bitmap::new(15));
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, Some(&mut job));
        assert!(store.job().is_none());
        store.write_page(2, b"X").unwrap();
        drop(store);
        assert_eq!(bank.read_page_packet(2).unwrap(), b"X".to_vec());
    }

    #[test]
    fn test_redirection_chain_is_transparent() {
        let mut bank = EpromBank::new(otp_rom(), 16);
        bank.write_page_packet(7, b"FINAL").unwrap();
        bank.redirect(2, 5).unwrap();
        bank.redirect(5, 6).unwrap();
        bank.redirect(6, 7).unwrap();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(otp_rom(), &mut bank, &mut cache, None);
        let direct = store.read_page(7).unwrap();
        assert_eq!(store.read_page(2).unwrap(), direct);
        assert_eq!(store.read_page(6).unwrap(), direct);
        drop(store);
        assert_eq!(
            cache.find(&otp_rom(), 2, MemoryKind::Data),
            Some(&CachedPage::Redirect(5))
        );
    }

    #[test]
    fn test_redirection_cycle_detected() {
        let mut bank = EpromBank::new(otp_rom(), 16);
        bank.redirect(1, 2).unwrap();
        bank.redirect(2, 1).unwrap();
        let mut cache = PageCache::new(16);
        let mut store = PageStore::new(otp_rom(), &mut bank, &mut cache, None);
        assert!(matches!(
            store.read_page(1),
            Err(OwfsError::RedirectionCycle(1))
        ));
    }

    #[test]
    fn test_hop_limit() {
        let mut bank = EpromBank::new(otp_rom(), 16);
        bank.write_page_packet(9, b"END").unwrap();
        bank.redirect(3, 8).unwrap();
        bank.redirect(8, 9).unwrap();
        let mut cache = PageCache::new(0);
        let mut store =
            PageStore::new(otp_rom(), &mut bank, &mut cache, None).with_hop_limit(1);
        assert!(matches!(store.read_page(3), Err(OwfsError::RedirectionCycle(3))));
        assert_eq!(store.read_page(8).unwrap(), b"END".to_vec());
    }

    #[test]
    fn test_status_reads() {
        let mut bank = EpromBank::new(otp_rom(), 16);
        bank.protect_page(3).unwrap();
        let layout = bank.layout();
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(otp_rom(), &mut bank, &mut cache, None);
        let wp = store.read_status(layout.write_protect(), layout.bits_len()).unwrap();
        assert_eq!(wp, vec![!0x08, 0xFF]);
        let all = store.read_status(0, layout.len()).unwrap();
        assert_eq!(all.len(), layout.len());
    }

    #[test]
    fn test_ext_write_read_and_reclaim() {
        let mut bank = EepromBank::new(nv_rom(), 16);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::new(15);
        bm.set(0).unwrap();

        let data: Vec<u8> = (0..60).collect();
        let pages = ext_write(&mut store, &mut bm, 4, &data).unwrap();
        assert_eq!(pages, 3);
        assert_eq!(bm.count_set(), 4);
        assert_eq!(ext_read(&mut store, 4).unwrap(), data);

        assert_eq!(reclaim_chain(&mut store, &mut bm, 4).unwrap(), 3);
        assert_eq!(bm.count_set(), 1);
    }

    #[test]
    fn test_empty_chain() {
        let mut bank = EepromBank::new(nv_rom(), 8);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::new(7);
        assert_eq!(ext_write(&mut store, &mut bm, 2, &[]).unwrap(), 1);
        assert!(ext_read(&mut store, 2).unwrap().is_empty());
        assert!(bm.is_set(2));
    }

    #[test]
    fn test_reclaim_unreadable_start() {
        let mut bank = EepromBank::new(nv_rom(), 8);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::new(7);
        bm.set(3).unwrap();
        assert_eq!(reclaim_chain(&mut store, &mut bm, 3).unwrap(), 1);
        assert!(!bm.is_set(3));
    }

    #[test]
    fn test_raw_page_requires_capable_bank() {
        let mut bank = EepromBank::new(nv_rom(), 8);
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(nv_rom(), &mut bank, &mut cache, None);
        assert!(matches!(
            store.read_raw_page(1),
            Err(OwfsError::WrongDeviceType(_))
        ));
    }
}
