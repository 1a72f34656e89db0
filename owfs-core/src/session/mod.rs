//! File service sessions.
//!
//! A [`Session`] owns everything that lives between calls: the bus, the
//! page cache, the open program job, the current directory and the handle
//! table. Every operation names the device it works on. The first
//! operation binds the session to that device; naming another device
//! afterwards fails with [`OwfsError::DeviceMismatch`] until
//! [`Session::select_device`] switches over.
//!
//! Write operations on write-once parts open a program job on demand.
//! Nothing reaches the part until [`Session::commit_program_job`].

mod add_file;
mod files;
mod format;

use std::fmt;

use log::{debug, info};

use crate::cache::PageCache;
use crate::config::SessionConfig;
use crate::device::{Bus, PageNumber, RomId};
use crate::error::{OwfsError, OwfsResult};
use crate::fs::{
    self, catalog, commit, Bitmap, CurrentDirectory, DirLevel, DirectoryPath, FileInfo,
    HandleTable, PageStore, ProgramJob,
};

pub use add_file::AddMode;

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// `.` of a subdirectory.
    Current,
    /// `..` of a subdirectory.
    Parent,
    Record(FileInfo),
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListEntry::Current => f.write_str("."),
            ListEntry::Parent => f.write_str(".."),
            ListEntry::Record(info) => write!(f, "{}", info.entry),
        }
    }
}

/// Session fields borrowed for one operation on one device.
struct Parts<'a> {
    store: PageStore<'a>,
    cd: &'a mut CurrentDirectory,
    handles: &'a mut HandleTable,
}

impl Parts<'_> {
    /// Levels of the directory named by `dir`, relative to the current one.
    fn resolve(&mut self, dir: &DirectoryPath) -> OwfsResult<Vec<DirLevel>> {
        self.cd.resolve(&mut self.store, dir)
    }
}

/// First page of the innermost directory of `levels`.
fn dir_start(levels: &[DirLevel]) -> PageNumber {
    levels.last().map_or(0, |level| level.page)
}

/// Split `dir/dir/NAME.EXT` into the directory part and the last component.
fn split_path(path: &str) -> OwfsResult<(DirectoryPath, &str)> {
    let trimmed = path.trim_end_matches(['/', '\\']);
    let (dir, last) = match trimmed.rfind(['/', '\\']) {
        Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
        None => ("", trimmed),
    };
    if last.is_empty() {
        return Err(OwfsError::InvalidName(path.to_string()));
    }
    Ok((DirectoryPath::parse(dir)?, last))
}

/// File service over the devices of one bus.
pub struct Session<B: Bus> {
    bus: B,
    cache: PageCache,
    job: Option<ProgramJob>,
    cd: CurrentDirectory,
    handles: HandleTable,
    config: SessionConfig,
}

impl<B: Bus> Session<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, SessionConfig::default())
    }

    pub fn with_config(bus: B, config: SessionConfig) -> Self {
        Self {
            bus,
            cache: PageCache::new(config.cache_capacity),
            job: None,
            cd: CurrentDirectory::new(),
            handles: HandleTable::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Device the session is bound to.
    pub fn active_device(&self) -> Option<RomId> {
        self.cd.rom()
    }

    /// Switch to `rom`, returning to its root directory.
    pub fn select_device(&mut self, rom: &RomId) -> OwfsResult<()> {
        self.bus.select(rom)?;
        if self.cd.rom() != Some(*rom) {
            info!("switching to device {}", rom);
        }
        self.cd.bind(*rom);
        Ok(())
    }

    /// Check `rom` is the bound device, binding it on first use.
    fn ensure_device(&mut self, rom: &RomId) -> OwfsResult<()> {
        match self.cd.rom() {
            Some(bound) if bound != *rom => Err(OwfsError::DeviceMismatch {
                expected: bound,
                found: *rom,
            }),
            Some(_) => self.bus.select(rom),
            None => {
                self.bus.select(rom)?;
                debug!("binding session to device {}", rom);
                self.cd.bind(*rom);
                Ok(())
            }
        }
    }

    fn parts(&mut self, rom: &RomId) -> OwfsResult<Parts<'_>> {
        let Self {
            bus,
            cache,
            job,
            cd,
            handles,
            config,
        } = self;
        let bank = bus.bank(rom)?;
        let store =
            PageStore::new(*rom, bank, cache, job.as_mut()).with_hop_limit(config.max_redirect_hops);
        Ok(Parts { store, cd, handles })
    }

    /// Check a write may proceed, opening a program job on write-once parts.
    fn prepare_write(&mut self, rom: &RomId) -> OwfsResult<()> {
        self.ensure_device(rom)?;
        let bank = self.bus.bank(rom)?;
        if bank.is_read_only() {
            return Err(OwfsError::ReadOnly(rom.to_string()));
        }
        if !bank.is_write_once() {
            return Ok(());
        }
        if let Some(job) = &self.job {
            if job.rom() != *rom {
                return Err(OwfsError::JobAlreadyOpen(job.rom()));
            }
            return Ok(());
        }
        self.create_program_job(rom)
    }

    /// Open a program job on a write-once part.
    ///
    /// The page cache is flushed and the bitmap in status memory becomes
    /// the job's reference and working bitmap.
    pub fn create_program_job(&mut self, rom: &RomId) -> OwfsResult<()> {
        self.ensure_device(rom)?;
        if let Some(job) = &self.job {
            return Err(OwfsError::JobAlreadyOpen(job.rom()));
        }
        self.cache.invalidate_all();
        let mut parts = self.parts(rom)?;
        if !parts.store.is_write_once() {
            return Err(OwfsError::WrongDeviceType(
                "program jobs require a write-once part",
            ));
        }
        let bitmap = fs::read_bitmap(&mut parts.store)?;
        debug!(
            "program job opened on {} with {} pages in use",
            rom,
            bitmap.count_set()
        );
        self.job = Some(ProgramJob::new(*rom, bitmap));
        Ok(())
    }

    pub fn is_job_open(&self, rom: &RomId) -> bool {
        self.job.as_ref().is_some_and(|job| job.rom() == *rom)
    }

    pub fn job(&self) -> Option<&ProgramJob> {
        self.job.as_ref()
    }

    /// Program the open job into the part.
    ///
    /// Every device on the bus must be a write-once part. On failure the
    /// job stays open.
    pub fn commit_program_job(&mut self, rom: &RomId) -> OwfsResult<()> {
        self.ensure_device(rom)?;
        if !self.is_job_open(rom) {
            return Err(OwfsError::NoProgramJob);
        }
        if let Some(other) = self.bus.search()?.into_iter().find(|r| !r.is_eprom_family()) {
            return Err(OwfsError::NonProgramParts(other));
        }

        self.cache.invalidate_all();
        self.bus.begin_exclusive()?;
        let result = match (self.job.as_mut(), self.bus.bank(rom)) {
            (Some(job), Ok(bank)) => commit(job, bank, self.config.commit_iteration_cap),
            (None, _) => Err(OwfsError::NoProgramJob),
            (_, Err(err)) => Err(err),
        };
        self.bus.end_exclusive();
        self.cache.invalidate_all();
        result?;

        self.job = None;
        info!("program job on {} committed", rom);
        Ok(())
    }

    /// Drop the open job without programming anything.
    pub fn discard_program_job(&mut self, rom: &RomId) -> bool {
        if !self.is_job_open(rom) {
            return false;
        }
        self.job = None;
        self.cache.invalidate_all();
        debug!("program job on {} discarded", rom);
        true
    }

    /// Move the current directory.
    pub fn change_directory(&mut self, rom: &RomId, path: &str) -> OwfsResult<()> {
        self.ensure_device(rom)?;
        let path = DirectoryPath::parse(path)?;
        let mut parts = self.parts(rom)?;
        parts.cd.change_directory(&mut parts.store, &path)
    }

    pub fn current_path(&self) -> DirectoryPath {
        self.cd.current_path()
    }

    /// Every record of the current directory, in catalog order.
    pub fn list_directory(&mut self, rom: &RomId) -> OwfsResult<Vec<ListEntry>> {
        self.ensure_device(rom)?;
        let mut parts = self.parts(rom)?;
        let start = parts.cd.page();
        let mut listing = Vec::new();
        if parts.cd.depth() > 0 {
            listing.push(ListEntry::Current);
            listing.push(ListEntry::Parent);
        }
        for n in 1.. {
            match catalog::find_entry(&mut parts.store, start, n)? {
                Some(info) => listing.push(ListEntry::Record(info)),
                None => break,
            }
        }
        Ok(listing)
    }

    /// The device bitmap, including pages taken by an open job.
    pub fn read_bitmap(&mut self, rom: &RomId) -> OwfsResult<Bitmap> {
        self.ensure_device(rom)?;
        let mut parts = self.parts(rom)?;
        fs::read_bitmap(&mut parts.store)
    }

    pub fn write_bitmap(&mut self, rom: &RomId, bitmap: &Bitmap) -> OwfsResult<()> {
        self.prepare_write(rom)?;
        let mut parts = self.parts(rom)?;
        fs::write_bitmap(&mut parts.store, bitmap)
    }

    /// Bytes a new file may hold on `rom`.
    pub fn max_writable(&mut self, rom: &RomId) -> OwfsResult<usize> {
        Ok(self.read_bitmap(rom)?.max_writable_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EepromBank, EpromBank, SimBus};

    fn nv_rom() -> RomId {
        RomId::new([0x0C, 0x01, 0, 0, 0, 0, 0, 0])
    }

    fn otp_rom() -> RomId {
        RomId::new([0x0B, 0x02, 0, 0, 0, 0, 0, 0])
    }

    fn two_devices() -> Session<SimBus> {
        let mut bus = SimBus::new();
        bus.attach(EepromBank::new(nv_rom(), 16));
        bus.attach(EpromBank::new(otp_rom(), 64));
        Session::new(bus)
    }

    #[test]
    fn test_split_path() {
        let (dir, last) = split_path("SUB/TEST.001").unwrap();
        assert_eq!(dir.to_string(), "SUB");
        assert_eq!(last, "TEST.001");

        let (dir, last) = split_path("/LOG.100").unwrap();
        assert!(dir.is_absolute() && dir.is_empty());
        assert_eq!(last, "LOG.100");

        let (dir, _) = split_path("A.001").unwrap();
        assert!(!dir.is_absolute() && dir.is_empty());
        assert!(split_path("/").is_err());
    }

    #[test]
    fn test_device_binding() {
        let mut session = two_devices();
        session.format(&nv_rom()).unwrap();
        assert_eq!(session.active_device(), Some(nv_rom()));

        assert!(matches!(
            session.list_directory(&otp_rom()),
            Err(OwfsError::DeviceMismatch { .. })
        ));

        session.select_device(&otp_rom()).unwrap();
        assert_eq!(session.active_device(), Some(otp_rom()));
        assert!(matches!(
            session.list_directory(&nv_rom()),
            Err(OwfsError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_job_lifecycle() {
        let mut session = two_devices();
        assert!(matches!(
            session.create_program_job(&nv_rom()),
            Err(OwfsError::WrongDeviceType(_))
        ));

        session.select_device(&otp_rom()).unwrap();
        session.create_program_job(&otp_rom()).unwrap();
        assert!(session.is_job_open(&otp_rom()));
        assert!(matches!(
            session.create_program_job(&otp_rom()),
            Err(OwfsError::JobAlreadyOpen(_))
        ));

        // The rewritable part on the bus blocks the commit
        assert!(matches!(
            session.commit_program_job(&otp_rom()),
            Err(OwfsError::NonProgramParts(rom)) if rom == nv_rom()
        ));
        assert!(session.is_job_open(&otp_rom()));

        assert!(session.discard_program_job(&otp_rom()));
        assert!(!session.discard_program_job(&otp_rom()));
        assert!(matches!(
            session.commit_program_job(&otp_rom()),
            Err(OwfsError::NoProgramJob)
        ));
    }

    #[test]
    fn test_list_root_and_subdirectory() {
        let mut session = two_devices();
        let rom = nv_rom();
        session.format(&rom).unwrap();
        session.create_dir(&rom, "SUB").unwrap();
        let (h, _) = session.create_file(&rom, "A.001").unwrap();
        session.close_file(h).unwrap();

        let names: Vec<String> = session
            .list_directory(&rom)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec!["SUB", "A.001"]);

        session.change_directory(&rom, "SUB").unwrap();
        let listing = session.list_directory(&rom).unwrap();
        assert_eq!(listing, vec![ListEntry::Current, ListEntry::Parent]);
        assert_eq!(session.current_path().to_string(), "/SUB");
    }
}
