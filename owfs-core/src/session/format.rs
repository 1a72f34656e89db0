//! Formatting a device.

use log::{debug, info};

use super::Session;
use crate::device::{Bus, PageNumber, RomId, StatusLayout, ERASED};
use crate::error::{OwfsError, OwfsResult};
use crate::fs::catalog::{BitmapLocation, DirectoryHeader};
use crate::fs::{read_bitmap, write_bitmap, Bitmap, PageStore};

/// Largest part whose bitmap fits in the root header.
const LOCAL_BITMAP_PAGES: usize = 32;
/// Above this page number the bitmap takes two pages.
const ONE_BITMAP_PAGE_MAX: PageNumber = 223;

impl<B: Bus> Session<B> {
    /// Write an empty root directory.
    ///
    /// Every handle on the device is closed and the current directory
    /// returns to the root. On write-once parts the open job is discarded
    /// and the new root is staged in a fresh one; pages already burned
    /// stay in use.
    pub fn format(&mut self, rom: &RomId) -> OwfsResult<()> {
        self.prepare_write(rom)?;
        self.handles.close_device(rom);
        self.cd.reset();
        self.cache.invalidate_all();

        let mut parts = self.parts(rom)?;
        if parts.store.is_write_once() {
            format_write_once(&mut parts.store)?;
        } else {
            format_rewritable(&mut parts.store)?;
        }
        info!("formatted {}", rom);
        Ok(())
    }
}

fn format_rewritable(store: &mut PageStore<'_>) -> OwfsResult<()> {
    let max_page = store.max_page();
    let mut bitmap = Bitmap::new(max_page);
    bitmap.set(0)?;

    let location = if (max_page as usize) < LOCAL_BITMAP_PAGES {
        BitmapLocation::Local([0x01, 0, 0, 0])
    } else {
        let count = if max_page > ONE_BITMAP_PAGE_MAX { 2 } else { 1 };
        for page in 1..=count {
            bitmap.set(page)?;
        }
        BitmapLocation::Remote { page: 1, count }
    };
    debug!("root bitmap at {:?}", location);
    store.write_page(0, &DirectoryHeader { bitmap: location }.root_packet())?;
    write_bitmap(store, &bitmap)
}

fn format_write_once(store: &mut PageStore<'_>) -> OwfsResult<()> {
    let max_page = store.max_page();
    let layout = StatusLayout::new(max_page as usize + 1);

    // Find where page 0 really lives
    let mut page: PageNumber = 0;
    let mut hops = 0;
    loop {
        let (_, extra) = store.bank().read_page_extra(page)?;
        match extra.first() {
            Some(&raw) if raw != ERASED => {
                hops += 1;
                if hops > max_page as usize {
                    return Err(OwfsError::RedirectionCycle(0));
                }
                page = !raw;
            }
            _ => break,
        }
    }
    let burned = store.bank().read_page(page)?.iter().any(|&b| b != ERASED);

    let job = store.job_mut().ok_or(OwfsError::NoProgramJob)?;
    job.discard_all();
    if burned && !job.original_bitmap().is_set(page) {
        job.mark_burned(page)?;
    }

    let header = DirectoryHeader {
        bitmap: BitmapLocation::Remote {
            page: (layout.bitmap() / 8) as PageNumber,
            count: layout.bits_len().div_ceil(8) as u8,
        },
    };
    store.write_page(0, &header.root_packet())?;
    let mut bitmap = read_bitmap(store)?;
    bitmap.set(0)?;
    write_bitmap(store, &bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EepromBank, EpromBank, SimBus};
    use crate::fs::catalog;

    fn nv_rom() -> RomId {
        RomId::new([0x0C, 0x21, 0, 0, 0, 0, 0, 0])
    }

    fn otp_rom() -> RomId {
        RomId::new([0x0B, 0x22, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_small_part_keeps_bitmap_in_root() {
        let mut s = Session::new(SimBus::with_devices([EepromBank::new(nv_rom(), 16)]));
        s.format(&nv_rom()).unwrap();
        let bitmap = s.read_bitmap(&nv_rom()).unwrap();
        assert_eq!(bitmap.count_set(), 1);
        assert!(bitmap.is_set(0));
        assert!(s.list_directory(&nv_rom()).unwrap().is_empty());
    }

    #[test]
    fn test_large_parts_use_bitmap_pages() {
        let mut s = Session::new(SimBus::with_devices([EepromBank::new(nv_rom(), 64)]));
        s.format(&nv_rom()).unwrap();
        assert_eq!(s.read_bitmap(&nv_rom()).unwrap().count_set(), 2);

        let mut s = Session::new(SimBus::with_devices([EepromBank::new(nv_rom(), 256)]));
        s.format(&nv_rom()).unwrap();
        let bitmap = s.read_bitmap(&nv_rom()).unwrap();
        assert_eq!(bitmap.count_set(), 3);
        assert!(bitmap.is_set(1) && bitmap.is_set(2));
    }

    #[test]
    fn test_format_closes_handles_and_resets_directory() {
        let mut s = Session::new(SimBus::with_devices([EepromBank::new(nv_rom(), 32)]));
        s.format(&nv_rom()).unwrap();
        s.create_dir(&nv_rom(), "SUB").unwrap();
        s.change_directory(&nv_rom(), "SUB").unwrap();
        let (h, _) = s.create_file(&nv_rom(), "A.001").unwrap();

        s.format(&nv_rom()).unwrap();
        assert!(matches!(s.handle_info(h), Err(OwfsError::InvalidHandle(_))));
        assert_eq!(s.current_path().to_string(), "root");
        assert!(s.list_directory(&nv_rom()).unwrap().is_empty());
    }

    #[test]
    fn test_write_once_format_is_staged() {
        let mut s = Session::new(SimBus::with_devices([EpromBank::new(otp_rom(), 64)]));
        s.format(&otp_rom()).unwrap();
        assert!(s.is_job_open(&otp_rom()));
        assert_eq!(s.job().unwrap().working_bitmap().count_set(), 1);
        s.commit_program_job(&otp_rom()).unwrap();

        let mut parts = s.parts(&otp_rom()).unwrap();
        let root = parts.store.read_page(0).unwrap();
        let header = DirectoryHeader::parse_root(&root).unwrap();
        let layout = StatusLayout::new(64);
        assert_eq!(
            header.bitmap,
            BitmapLocation::Remote {
                page: (layout.bitmap() / 8) as PageNumber,
                count: 1,
            }
        );
        assert_eq!(catalog::find_entry(&mut parts.store, 0, 1).unwrap(), None);
    }

    #[test]
    fn test_reformat_write_once_keeps_burned_pages() {
        let mut s = Session::new(SimBus::with_devices([EpromBank::new(otp_rom(), 32)]));
        s.format(&otp_rom()).unwrap();
        s.commit_program_job(&otp_rom()).unwrap();
        let (h, _) = s.create_file(&otp_rom(), "OLD.001").unwrap();
        s.write_file(&otp_rom(), h, b"burned").unwrap();
        s.commit_program_job(&otp_rom()).unwrap();
        let used = s.read_bitmap(&otp_rom()).unwrap().count_set();

        s.format(&otp_rom()).unwrap();
        s.commit_program_job(&otp_rom()).unwrap();
        assert!(s.list_directory(&otp_rom()).unwrap().is_empty());
        // The relocated root takes one more page
        assert_eq!(s.read_bitmap(&otp_rom()).unwrap().count_set(), used + 1);
    }
}
