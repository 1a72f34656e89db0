//! Program jobs for write-once parts.
//!
//! While a job is open every page write is staged in RAM. The commit
//! checks the whole batch against the device's protection and
//! redirection tables, then programs it in one pass. A page that cannot
//! be rewritten in place is copied to a free page and the original is
//! redirected to it.

use log::{debug, info};

use super::bitmap::Bitmap;
use super::page_store::{Lookup, PageSource};
use crate::device::udp::MAX_PACKET_DATA;
use crate::device::{MemoryBank, MemoryKind, PageNumber, RomId, StatusLayout, ERASED, PAGE_LEN};
use crate::error::{OwfsError, OwfsResult};

/// Page visits allowed in one commit. Each relocation revisits a page, so
/// this bounds the work for a device whose redirections point at each
/// other.
pub const COMMIT_ITERATION_CAP: usize = 20480;

/// Pending operation on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    None,
    /// Write a whole packet.
    Write,
    /// Redirect the page to another page.
    Redirect(PageNumber),
    /// Program individual bytes of an add-file page.
    Add,
    /// Seal an add-file page with its length and CRC.
    Terminate,
}

/// Shadow of one page.
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    state: JobState,
    started: bool,
    len: usize,
    data: [u8; MAX_PACKET_DATA],
    dirty: [u8; 4],
}

impl JobPage {
    fn blank() -> Self {
        Self {
            data: [ERASED; MAX_PACKET_DATA],
            ..Self::default()
        }
    }

    fn is_dirty(&self, offset: usize) -> bool {
        self.dirty[(offset - 1) / 8] & (1 << ((offset - 1) % 8)) != 0
    }

    fn mark_dirty(&mut self, offset: usize) {
        self.dirty[(offset - 1) / 8] |= 1 << ((offset - 1) % 8);
    }
}

/// An open batch of writes for one device.
#[derive(Debug, Clone)]
pub struct ProgramJob {
    rom: RomId,
    pages: Vec<JobPage>,
    /// Contents of `pages` that came from the device rather than a write.
    loaded: Vec<bool>,
    working: Bitmap,
    original: Bitmap,
}

impl ProgramJob {
    /// Open a job over the device bitmap as it is now.
    pub fn new(rom: RomId, bitmap: Bitmap) -> Self {
        let pages = bitmap.max_page() as usize + 1;
        Self {
            rom,
            pages: vec![JobPage::blank(); pages],
            loaded: vec![false; pages],
            working: bitmap.clone(),
            original: bitmap,
        }
    }

    pub fn rom(&self) -> RomId {
        self.rom
    }

    pub fn max_page(&self) -> PageNumber {
        self.original.max_page()
    }

    /// Bitmap including allocations made while the job is open.
    pub fn working_bitmap(&self) -> &Bitmap {
        &self.working
    }

    /// Bitmap as it was when the job was opened.
    pub fn original_bitmap(&self) -> &Bitmap {
        &self.original
    }

    /// Replace the working bitmap, dropping pending pages it no longer covers.
    pub fn set_working_bitmap(&mut self, bitmap: Bitmap) {
        for page in 0..=self.max_page() {
            let slot = &mut self.pages[page as usize];
            if slot.state != JobState::None && !slot.started && !bitmap.is_set(page) {
                debug!("drop pending page {}", page);
                *slot = JobPage::blank();
                self.loaded[page as usize] = false;
            }
        }
        self.working = bitmap;
    }

    /// Mark a page as physically used in both bitmaps so the commit
    /// treats it as occupied.
    pub fn mark_burned(&mut self, page: PageNumber) -> OwfsResult<()> {
        self.original.set(page)?;
        self.working.set(page)
    }

    /// Record every page set in `burned` as used in both bitmaps.
    fn absorb(&mut self, burned: &Bitmap) -> OwfsResult<()> {
        for page in (0..=self.max_page()).filter(|&p| burned.is_set(p)) {
            self.mark_burned(page)?;
        }
        Ok(())
    }

    pub fn state(&self, page: PageNumber) -> JobState {
        self.pages
            .get(page as usize)
            .map_or(JobState::None, |slot| slot.state)
    }

    /// Whether the shadow holds contents for `page`.
    pub fn has_page(&self, page: PageNumber) -> bool {
        self.state(page) != JobState::None || self.loaded.get(page as usize) == Some(&true)
    }

    /// Pending contents of `page`, if it has a staged operation.
    pub fn pending_data(&self, page: PageNumber) -> Option<&[u8]> {
        let slot = self.pages.get(page as usize)?;
        match slot.state {
            JobState::Write | JobState::Add | JobState::Terminate => Some(&slot.data[..slot.len]),
            JobState::None | JobState::Redirect(_) => None,
        }
    }

    /// Pages with a staged operation.
    pub fn pending_pages(&self) -> Vec<PageNumber> {
        (0..=self.max_page())
            .filter(|&p| self.state(p) != JobState::None)
            .collect()
    }

    /// Stage a whole packet write.
    pub fn stage_write(&mut self, page: PageNumber, data: &[u8]) -> OwfsResult<()> {
        if data.len() > MAX_PACKET_DATA {
            return Err(OwfsError::InvalidPacketLength {
                page,
                len: data.len(),
            });
        }
        let slot = self.slot(page)?;
        slot.data = [ERASED; MAX_PACKET_DATA];
        slot.data[..data.len()].copy_from_slice(data);
        slot.len = data.len();
        slot.state = JobState::Write;
        slot.started = false;
        slot.dirty = [0; 4];
        Ok(())
    }

    /// Seed the shadow with the raw device bytes 1-29 of `page`.
    pub fn load_raw(&mut self, page: PageNumber, raw: &[u8]) {
        let Some(slot) = self.pages.get_mut(page as usize) else {
            return;
        };
        let n = raw.len().saturating_sub(1).min(MAX_PACKET_DATA);
        slot.data = [ERASED; MAX_PACKET_DATA];
        slot.data[..n].copy_from_slice(&raw[1..1 + n]);
        slot.dirty = [0; 4];
        self.loaded[page as usize] = true;
    }

    /// Change one byte of an add-file page. Offsets run 1-29.
    ///
    /// With `zero_mode` the byte is ANDed into the current contents so
    /// only bits still set can be cleared; otherwise it overwrites.
    pub fn write_byte(
        &mut self,
        page: PageNumber,
        offset: usize,
        byte: u8,
        zero_mode: bool,
    ) -> OwfsResult<()> {
        if !(1..=MAX_PACKET_DATA).contains(&offset) {
            return Err(OwfsError::OutOfRange(offset));
        }
        let slot = self.slot(page)?;
        if slot.state == JobState::None {
            slot.state = JobState::Add;
            slot.len = MAX_PACKET_DATA;
        }
        slot.mark_dirty(offset);
        let cell = &mut slot.data[offset - 1];
        *cell = if zero_mode { *cell & byte } else { byte };
        Ok(())
    }

    /// Mark `page` as an add-file page without changing any byte.
    pub fn mark_add(&mut self, page: PageNumber) -> OwfsResult<()> {
        let slot = self.slot(page)?;
        if slot.state == JobState::None {
            slot.state = JobState::Add;
            slot.len = MAX_PACKET_DATA;
        }
        Ok(())
    }

    /// Seal an add-file page. Only untouched, add or already sealed pages qualify.
    pub fn terminate_page(&mut self, page: PageNumber) -> OwfsResult<()> {
        let slot = self.slot(page)?;
        match slot.state {
            JobState::None | JobState::Add | JobState::Terminate => {
                slot.len = MAX_PACKET_DATA;
                slot.state = JobState::Terminate;
                Ok(())
            }
            JobState::Write | JobState::Redirect(_) => Err(OwfsError::JobConflict(page)),
        }
    }

    /// Drop a pending whole-page write that has not been started.
    ///
    /// Returns whether the page was released.
    pub fn release(&mut self, page: PageNumber) -> bool {
        match self.pages.get_mut(page as usize) {
            Some(slot) if slot.state == JobState::Write && !slot.started => {
                *slot = JobPage::blank();
                self.loaded[page as usize] = false;
                true
            }
            _ => false,
        }
    }

    /// Drop a pending add-file page that has not been started and free it
    /// in the working bitmap unless the device already holds it.
    pub fn discard_add(&mut self, page: PageNumber) -> OwfsResult<bool> {
        match self.pages.get_mut(page as usize) {
            Some(slot) if slot.state == JobState::Add && !slot.started => {
                *slot = JobPage::blank();
                self.loaded[page as usize] = false;
                if !self.original.is_set(page) {
                    self.working.clear(page)?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop every pending page and every allocation made since the job opened.
    pub fn discard_all(&mut self) {
        let pending = self.pending_pages().len();
        self.pages.iter_mut().for_each(|slot| *slot = JobPage::blank());
        self.loaded.iter_mut().for_each(|l| *l = false);
        self.working = self.original.clone();
        debug!("discarded {} pending pages", pending);
    }

    fn slot(&mut self, page: PageNumber) -> OwfsResult<&mut JobPage> {
        self.pages
            .get_mut(page as usize)
            .ok_or(OwfsError::OutOfRange(page as usize))
    }

    /// Copy the payload of `page` to `target` and turn `page` into a
    /// redirection.
    fn relocate(&mut self, page: PageNumber, target: PageNumber) {
        let source = self.pages[page as usize].clone();
        let dest = &mut self.pages[target as usize];
        dest.state = JobState::Write;
        dest.started = false;
        dest.len = source.len;
        dest.data = source.data;
        dest.dirty = [0; 4];
        self.pages[page as usize].state = JobState::Redirect(target);
        debug!("relocate page {} to {}", page, target);
    }
}

impl PageSource for ProgramJob {
    fn lookup(&mut self, rom: &RomId, page: PageNumber, kind: MemoryKind) -> OwfsResult<Lookup> {
        if kind != MemoryKind::Data || *rom != self.rom {
            return Ok(Lookup::Miss);
        }
        Ok(match self.pending_data(page) {
            Some(data) => Lookup::Hit(data.to_vec()),
            None => Lookup::Miss,
        })
    }
}

/// Protection and redirection state read from status memory.
#[derive(Debug, Clone)]
pub struct StatusTables {
    pub write_protect: Bitmap,
    pub redirect_protect: Bitmap,
    /// Redirection target per page, `0` when not redirected.
    pub redirection: Vec<PageNumber>,
}

impl StatusTables {
    pub fn read(bank: &mut dyn MemoryBank) -> OwfsResult<Self> {
        let max_page = bank.max_page();
        let layout = StatusLayout::new(max_page as usize + 1);
        let mut bits = vec![0u8; layout.bits_len()];

        bank.read_status(layout.write_protect(), &mut bits)?;
        let write_protect = Bitmap::from_bytes(&invert(&bits), max_page);
        bank.read_status(layout.redirect_protect(), &mut bits)?;
        let redirect_protect = Bitmap::from_bytes(&invert(&bits), max_page);

        let mut redirection = vec![0u8; layout.pages()];
        bank.read_status(layout.redirection(), &mut redirection)?;
        let redirection = redirection
            .into_iter()
            .map(|raw| if raw == ERASED { 0 } else { !raw })
            .collect();

        Ok(Self {
            write_protect,
            redirect_protect,
            redirection,
        })
    }

    fn redirected(&self, page: PageNumber) -> Option<PageNumber> {
        match self.redirection[page as usize] {
            0 => None,
            target => Some(target),
        }
    }
}

fn invert(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| !b).collect()
}

/// Program every staged page of `job` into `bank`.
///
/// On success every slot is cleared. On failure the job keeps the state
/// of every page that was not finished and records the pages already
/// burned, so the commit can be retried.
pub fn commit(job: &mut ProgramJob, bank: &mut dyn MemoryBank, iteration_cap: usize) -> OwfsResult<()> {
    if !bank.is_write_once() {
        return Err(OwfsError::WrongDeviceType("program jobs require a write-once part"));
    }
    let mut bitmap = job.original.clone();
    let result = program(job, bank, &mut bitmap, iteration_cap);
    let absorbed = job.absorb(&bitmap);
    let programmed = result?;
    absorbed?;
    job.loaded.iter_mut().for_each(|l| *l = false);
    info!("committed {} page operations to {}", programmed, job.rom);
    Ok(())
}

fn program(
    job: &mut ProgramJob,
    bank: &mut dyn MemoryBank,
    bitmap: &mut Bitmap,
    iteration_cap: usize,
) -> OwfsResult<usize> {
    let layout = StatusLayout::new(bank.number_pages());
    let mut tables = StatusTables::read(bank)?;
    let max_page = job.max_page();

    // Every write onto an occupied page needs a second page
    let mut spare = max_page as isize + 1;
    for page in 0..=max_page {
        if job.state(page) == JobState::Write {
            spare -= if bitmap.is_set(page) { 2 } else { 1 };
        } else if bitmap.is_set(page) {
            spare -= 1;
        }
    }
    if spare < 0 {
        return Err(OwfsError::OutOfSpace);
    }

    let mut programmed = 0usize;
    let mut index = 0usize;
    let mut iterations = 0usize;
    while index <= max_page as usize {
        iterations += 1;
        if iterations > iteration_cap {
            return Err(OwfsError::IterationCapExceeded(iteration_cap));
        }
        let page = index as PageNumber;
        let state = job.pages[index].state;
        match state {
            JobState::None => {}
            state @ (JobState::Write | JobState::Terminate) => {
                let started = job.pages[index].started;
                let target = if started {
                    None
                } else if let Some(target) = tables.redirected(page) {
                    if target > max_page {
                        return Err(OwfsError::OutOfRange(target as usize));
                    }
                    if job.state(target) != JobState::None {
                        return Err(OwfsError::JobConflict(target));
                    }
                    Some(target)
                } else if tables.write_protect.is_set(page)
                    || (state == JobState::Write && bitmap.is_set(page))
                {
                    if tables.redirect_protect.is_set(page) {
                        return Err(OwfsError::WriteProtected(page));
                    }
                    let free = (1..=max_page).find(|&p| {
                        !bitmap.is_set(p)
                            && job.state(p) == JobState::None
                            && tables.redirected(p).is_none()
                            && !tables.write_protect.is_set(p)
                            && !tables.redirect_protect.is_set(p)
                    });
                    Some(free.ok_or(OwfsError::OutOfSpace)?)
                } else {
                    None
                };

                if let Some(target) = target {
                    job.relocate(page, target);
                    // Revisit this page, or the target first if it comes earlier
                    index = index.min(target as usize);
                    continue;
                }

                if !started {
                    let slot = &job.pages[index];
                    bank.write_page_packet(page, &slot.data[..slot.len])?;
                    job.pages[index].started = true;
                }
                mark_used(bank, &layout, bitmap, page)?;
                job.pages[index] = JobPage::blank();
                programmed += 1;
            }
            JobState::Redirect(target) => {
                if !job.pages[index].started {
                    let existing = tables.redirection[index];
                    if (tables.redirect_protect.is_set(page) && existing != target)
                        || (existing | target) ^ target != 0
                    {
                        return Err(OwfsError::WriteProtected(page));
                    }
                    bank.write_status(layout.redirect_address(page), &[!target])?;
                    tables.redirection[index] = target;
                    job.pages[index].started = true;
                }
                mark_used(bank, &layout, bitmap, page)?;
                job.pages[index] = JobPage::blank();
                programmed += 1;
            }
            JobState::Add => {
                let slot = job.pages[index].clone();
                for offset in (1..=MAX_PACKET_DATA).filter(|&o| slot.is_dirty(o)) {
                    bank.write(index * PAGE_LEN + offset, &[slot.data[offset - 1]])?;
                    job.pages[index].started = true;
                }
                mark_used(bank, &layout, bitmap, page)?;
                job.pages[index] = JobPage::blank();
                programmed += 1;
            }
        }
        index += 1;
    }
    Ok(programmed)
}

/// Burn the bitmap bit of `page` into status memory if not yet set.
fn mark_used(
    bank: &mut dyn MemoryBank,
    layout: &StatusLayout,
    bitmap: &mut Bitmap,
    page: PageNumber,
) -> OwfsResult<()> {
    if bitmap.is_set(page) {
        return Ok(());
    }
    let (addr, mask) = layout.bit(layout.bitmap(), page);
    let mut current = [0u8; 1];
    bank.read_status(addr, &mut current)?;
    bank.write_status(addr, &[current[0] & !mask])?;
    bitmap.set(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EepromBank, EpromBank};

    fn rom() -> RomId {
        RomId::new([0x0B, 0x30, 0, 0, 0, 0, 0, 0])
    }

    fn status_bitmap(bank: &mut EpromBank) -> Bitmap {
        let layout = bank.layout();
        let mut raw = vec![0u8; layout.bits_len()];
        bank.read_status(layout.bitmap(), &mut raw).unwrap();
        Bitmap::from_bytes(&invert(&raw), bank.max_page())
    }

    #[test]
    fn test_commit_plain_write() {
        let mut bank = EpromBank::new(rom(), 16);
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.stage_write(3, b"HELLO\0").unwrap();
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();

        assert_eq!(bank.read_page_packet(3).unwrap(), b"HELLO\0".to_vec());
        assert!(status_bitmap(&mut bank).is_set(3));
        assert!(job.pending_pages().is_empty());
        assert!(job.original_bitmap().is_set(3));
    }

    #[test]
    fn test_commit_redirects_occupied_page() {
        let mut bank = EpromBank::new(rom(), 16);
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.stage_write(2, b"V1\0").unwrap();
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();

        let mut job = ProgramJob::new(rom(), status_bitmap(&mut bank));
        job.stage_write(2, b"V2\0").unwrap();
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();

        assert_eq!(bank.redirection(2), Some(1));
        assert_eq!(bank.read_page_packet(1).unwrap(), b"V2\0".to_vec());
        let bm = status_bitmap(&mut bank);
        assert!(bm.is_set(1) && bm.is_set(2));
    }

    #[test]
    fn test_commit_follows_existing_redirection() {
        let mut bank = EpromBank::new(rom(), 16);
        bank.redirect(4, 9).unwrap();
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.stage_write(4, b"X\0").unwrap();
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();
        assert_eq!(bank.read_page_packet(9).unwrap(), b"X\0".to_vec());
        assert_eq!(bank.redirection(4), Some(9));
    }

    #[test]
    fn test_commit_write_protected_without_redirect() {
        let mut bank = EpromBank::new(rom(), 16);
        bank.protect_page(5).unwrap();
        bank.protect_redirection(5).unwrap();
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.stage_write(5, b"NO\0").unwrap();
        assert!(matches!(
            commit(&mut job, &mut bank, COMMIT_ITERATION_CAP),
            Err(OwfsError::WriteProtected(5))
        ));
        // The job survives a failed commit
        assert_eq!(job.state(5), JobState::Write);
    }

    #[test]
    fn test_retry_after_failed_commit_redirects_burned_page() {
        let mut bank = EpromBank::new(rom(), 16);
        bank.protect_page(5).unwrap();
        bank.protect_redirection(5).unwrap();
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.stage_write(1, b"OLD\0").unwrap();
        job.stage_write(5, b"NO\0").unwrap();
        assert!(matches!(
            commit(&mut job, &mut bank, COMMIT_ITERATION_CAP),
            Err(OwfsError::WriteProtected(5))
        ));
        // Page 1 went out before the failure
        assert!(job.original_bitmap().is_set(1));
        assert!(job.working_bitmap().is_set(1));
        assert_eq!(job.state(1), JobState::None);

        assert!(job.release(5));
        job.stage_write(1, b"NEW\0").unwrap();
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();

        let target = bank.redirection(1).expect("page 1 redirected");
        assert_eq!(bank.read_page_packet(target).unwrap(), b"NEW\0".to_vec());
        assert_eq!(bank.read_page_packet(1).unwrap(), b"OLD\0".to_vec());
        assert!(status_bitmap(&mut bank).is_set(target));
    }

    #[test]
    fn test_commit_out_of_space() {
        let mut bank = EpromBank::new(rom(), 4);
        let mut full = Bitmap::new(3);
        for p in 0..=3 {
            full.set(p).unwrap();
        }
        let mut job = ProgramJob::new(rom(), full);
        job.stage_write(1, b"A\0").unwrap();
        assert!(matches!(
            commit(&mut job, &mut bank, COMMIT_ITERATION_CAP),
            Err(OwfsError::OutOfSpace)
        ));
    }

    #[test]
    fn test_commit_iteration_cap() {
        let mut bank = EpromBank::new(rom(), 16);
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        for p in 1..=10 {
            job.stage_write(p, &[p, 0]).unwrap();
        }
        assert!(matches!(
            commit(&mut job, &mut bank, 5),
            Err(OwfsError::IterationCapExceeded(5))
        ));
    }

    #[test]
    fn test_add_bytes_programmed_individually() {
        let mut bank = EpromBank::new(rom(), 16);
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        let raw = [ERASED; PAGE_LEN];
        job.load_raw(6, &raw);
        job.write_byte(6, 1, b'H', false).unwrap();
        job.write_byte(6, 2, b'I', false).unwrap();
        assert_eq!(job.state(6), JobState::Add);
        commit(&mut job, &mut bank, COMMIT_ITERATION_CAP).unwrap();

        let page = bank.read_page(6).unwrap();
        assert_eq!(&page[..4], &[ERASED, b'H', b'I', ERASED]);
        assert!(status_bitmap(&mut bank).is_set(6));
    }

    #[test]
    fn test_zero_mode_only_clears_bits() {
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.write_byte(2, 3, 0xF0, false).unwrap();
        job.write_byte(2, 3, 0x3C, true).unwrap();
        assert_eq!(job.pending_data(2).unwrap()[2], 0x30);
        assert!(job.write_byte(2, 30, 0, false).is_err());
        assert!(job.write_byte(2, 0, 0, false).is_err());
    }

    #[test]
    fn test_terminate_rules() {
        let mut job = ProgramJob::new(rom(), Bitmap::new(15));
        job.mark_add(3).unwrap();
        job.terminate_page(3).unwrap();
        assert_eq!(job.state(3), JobState::Terminate);
        job.stage_write(4, b"P\0").unwrap();
        assert!(matches!(job.terminate_page(4), Err(OwfsError::JobConflict(4))));
    }

    #[test]
    fn test_working_bitmap_drops_pages() {
        let mut bm = Bitmap::new(15);
        bm.set(0).unwrap();
        let mut job = ProgramJob::new(rom(), bm.clone());
        job.stage_write(7, b"T\0").unwrap();
        job.set_working_bitmap(bm);
        assert_eq!(job.state(7), JobState::None);
    }

    #[test]
    fn test_discard_add() {
        let mut bm = Bitmap::new(15);
        let mut job = ProgramJob::new(rom(), bm.clone());
        bm.set(8).unwrap();
        job.set_working_bitmap(bm);
        job.mark_add(8).unwrap();
        assert!(job.discard_add(8).unwrap());
        assert!(!job.working_bitmap().is_set(8));
        assert!(!job.discard_add(8).unwrap());
    }

    #[test]
    fn test_commit_rejects_rewritable_part() {
        let mut bank = EepromBank::new(RomId::new([0x0C, 1, 0, 0, 0, 0, 0, 0]), 8);
        let mut job = ProgramJob::new(rom(), Bitmap::new(7));
        assert!(matches!(
            commit(&mut job, &mut bank, COMMIT_ITERATION_CAP),
            Err(OwfsError::WrongDeviceType(_))
        ));
    }
}
