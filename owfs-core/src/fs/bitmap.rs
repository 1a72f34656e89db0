//! Page allocation bitmap.
//!
//! One bit per logical page, set when the page is in use. The bitmap lives
//! either inside the root directory page (parts with at most 32 pages), in
//! one or two dedicated pages, or in status memory on write-once parts.

use log::{debug, trace};

use super::catalog::{BitmapLocation, DirectoryHeader};
use super::page_store::PageStore;
use super::program_job::ProgramJob;
use super::PAGE_PAYLOAD;
use crate::device::{PageNumber, StatusLayout};
use crate::error::{OwfsError, OwfsResult};

/// First two free pages found by [`Bitmap::find_empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreePages {
    pub first: Option<PageNumber>,
    pub second: Option<PageNumber>,
}

/// How clearing a bit is honored.
pub enum Media<'a> {
    /// Bits can always be cleared.
    Rewritable,
    /// Bits can only be cleared for pages an open job has not started.
    WriteOnce(Option<&'a mut ProgramJob>),
}

/// In-memory copy of a device's page bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    max_page: PageNumber,
}

impl Bitmap {
    /// An empty bitmap covering pages `0..=max_page`.
    pub fn new(max_page: PageNumber) -> Self {
        Self {
            bits: vec![0; max_page as usize / 8 + 1],
            max_page,
        }
    }

    /// Build from stored bytes, padding or truncating to size.
    pub fn from_bytes(bytes: &[u8], max_page: PageNumber) -> Self {
        let mut bitmap = Self::new(max_page);
        let n = bitmap.bits.len().min(bytes.len());
        bitmap.bits[..n].copy_from_slice(&bytes[..n]);
        bitmap
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn max_page(&self) -> PageNumber {
        self.max_page
    }

    pub fn is_set(&self, page: PageNumber) -> bool {
        page <= self.max_page && self.bits[page as usize / 8] & (1 << (page % 8)) != 0
    }

    /// Mark a page as used.
    pub fn set(&mut self, page: PageNumber) -> OwfsResult<()> {
        self.check(page)?;
        self.bits[page as usize / 8] |= 1 << (page % 8);
        Ok(())
    }

    /// Mark a page as free without any media rules.
    pub fn clear(&mut self, page: PageNumber) -> OwfsResult<()> {
        self.check(page)?;
        self.bits[page as usize / 8] &= !(1 << (page % 8));
        Ok(())
    }

    /// Set or clear a page bit under the rules of `media`.
    ///
    /// On write-once media a clear is only honored when `page` holds a
    /// pending, unstarted write in the open job; otherwise it is a no-op.
    pub fn change_bit(&mut self, page: PageNumber, set: bool, media: Media<'_>) -> OwfsResult<()> {
        self.check(page)?;
        if set {
            return self.set(page);
        }
        match media {
            Media::Rewritable => self.clear(page),
            Media::WriteOnce(Some(job)) => {
                if !job.release(page) {
                    trace!("page {} is burned or started, keeping it", page);
                    return Ok(());
                }
                debug!("released pending page {}", page);
                self.clear(page)
            }
            Media::WriteOnce(None) => {
                trace!("page {} stays allocated on write-once media", page);
                Ok(())
            }
        }
    }

    /// Number of pages marked used.
    pub fn count_set(&self) -> usize {
        (0..=self.max_page).filter(|&p| self.is_set(p)).count()
    }

    pub fn count_free(&self) -> usize {
        self.max_page as usize + 1 - self.count_set()
    }

    /// Linear first-fit scan for the first two free pages.
    pub fn find_empty(&self) -> FreePages {
        let mut free = (0..=self.max_page).filter(|&p| !self.is_set(p));
        FreePages {
            first: free.next(),
            second: free.next(),
        }
    }

    /// Bytes a new file may hold, keeping one page back for directory growth
    /// when the device is nearly full. A full device can hold nothing.
    pub fn max_writable_bytes(&self) -> usize {
        let free = self.count_free();
        if free == 0 {
            return 0;
        }
        let with_spare = (free + 1) * PAGE_PAYLOAD;
        if with_spare > self.max_page as usize * PAGE_PAYLOAD {
            free * PAGE_PAYLOAD
        } else {
            with_spare
        }
    }

    fn check(&self, page: PageNumber) -> OwfsResult<()> {
        if page > self.max_page {
            return Err(OwfsError::OutOfRange(page as usize));
        }
        Ok(())
    }
}

/// Read the device bitmap.
///
/// Write-once parts report the open job's working bitmap, or the bitmap
/// in status memory when no job is open.
pub fn read_bitmap(store: &mut PageStore<'_>) -> OwfsResult<Bitmap> {
    let max_page = store.max_page();
    if store.is_write_once() {
        if let Some(job) = store.job() {
            return Ok(job.working_bitmap().clone());
        }
        let layout = StatusLayout::new(max_page as usize + 1);
        let raw = store.read_status(layout.bitmap(), layout.bits_len())?;
        let bytes: Vec<u8> = raw.iter().map(|b| !b).collect();
        return Ok(Bitmap::from_bytes(&bytes, max_page));
    }

    let root = store.read_page(0)?;
    match DirectoryHeader::parse_root(&root)?.bitmap {
        BitmapLocation::Local(bytes) => Ok(Bitmap::from_bytes(&bytes, max_page)),
        BitmapLocation::Remote { page, count } => {
            let mut bytes = Vec::new();
            for i in 0..count {
                let data = store.read_page(page.wrapping_add(i))?;
                let (_, payload) = data.split_last().ok_or(OwfsError::BrokenChain(page + i))?;
                bytes.extend_from_slice(payload);
            }
            Ok(Bitmap::from_bytes(&bytes, max_page))
        }
    }
}

/// Persist the bitmap.
///
/// Write-once parts require an open job; the bitmap becomes the job's
/// working bitmap and pending pages whose bit is clear are dropped.
pub fn write_bitmap(store: &mut PageStore<'_>, bitmap: &Bitmap) -> OwfsResult<()> {
    if store.is_write_once() {
        let job = store.job_mut().ok_or(OwfsError::NoProgramJob)?;
        job.set_working_bitmap(bitmap.clone());
        return Ok(());
    }

    let mut root = store.read_page(0)?;
    match DirectoryHeader::parse_root(&root)?.bitmap {
        BitmapLocation::Local(_) => {
            let n = bitmap.as_bytes().len().min(4);
            root[3..3 + n].copy_from_slice(&bitmap.as_bytes()[..n]);
            store.write_page(0, &root)
        }
        BitmapLocation::Remote { page, count } => {
            let chunks: Vec<&[u8]> = bitmap.as_bytes().chunks(PAGE_PAYLOAD).collect();
            if chunks.len() > count as usize {
                return Err(OwfsError::OutOfRange(chunks.len()));
            }
            for (i, chunk) in chunks.iter().enumerate() {
                let next = if i + 1 < chunks.len() {
                    page + i as u8 + 1
                } else {
                    0
                };
                let mut data = chunk.to_vec();
                data.push(next);
                store.write_page(page + i as u8, &data)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RomId;

    #[test]
    fn test_find_empty() {
        let mut bm = Bitmap::new(15);
        assert_eq!(
            bm.find_empty(),
            FreePages {
                first: Some(0),
                second: Some(1)
            }
        );
        bm.set(0).unwrap();
        bm.set(2).unwrap();
        assert_eq!(
            bm.find_empty(),
            FreePages {
                first: Some(1),
                second: Some(3)
            }
        );
    }

    #[test]
    fn test_full_bitmap_has_no_free_page() {
        let mut bm = Bitmap::new(7);
        for p in 0..=7 {
            bm.set(p).unwrap();
        }
        assert_eq!(bm.find_empty(), FreePages::default());
        assert_eq!(bm.max_writable_bytes(), 0);

        // One page left still counts the spare
        bm.clear(7).unwrap();
        assert_eq!(bm.max_writable_bytes(), 2 * PAGE_PAYLOAD);
    }

    #[test]
    fn test_out_of_range() {
        let mut bm = Bitmap::new(15);
        assert!(matches!(bm.set(16), Err(OwfsError::OutOfRange(16))));
        assert!(!bm.is_set(200));
    }

    #[test]
    fn test_max_writable_bytes() {
        let mut bm = Bitmap::new(15);
        bm.set(0).unwrap();
        // 15 free pages, a spare page would exceed the device
        assert_eq!(bm.max_writable_bytes(), 15 * PAGE_PAYLOAD);
        for p in 1..=8 {
            bm.set(p).unwrap();
        }
        assert_eq!(bm.max_writable_bytes(), 8 * PAGE_PAYLOAD);
    }

    #[test]
    fn test_rewritable_clear() {
        let mut bm = Bitmap::new(15);
        bm.set(4).unwrap();
        bm.change_bit(4, false, Media::Rewritable).unwrap();
        assert!(!bm.is_set(4));
    }

    #[test]
    fn test_write_once_clear_without_job_is_noop() {
        let mut bm = Bitmap::new(15);
        bm.set(4).unwrap();
        bm.change_bit(4, false, Media::WriteOnce(None)).unwrap();
        assert!(bm.is_set(4));
    }

    #[test]
    fn test_write_once_clear_pending_write() {
        let rom = RomId::new([0x0B, 0, 0, 0, 0, 0, 0, 0]);
        let mut bm = Bitmap::new(15);
        let mut job = ProgramJob::new(rom, bm.clone());
        job.stage_write(5, &[1, 2, 0]).unwrap();
        bm.set(5).unwrap();
        bm.set(6).unwrap();

        bm.change_bit(5, false, Media::WriteOnce(Some(&mut job))).unwrap();
        assert!(!bm.is_set(5));
        assert!(!job.has_page(5));

        // Page 6 has no pending write
        bm.change_bit(6, false, Media::WriteOnce(Some(&mut job))).unwrap();
        assert!(bm.is_set(6));
    }
}
