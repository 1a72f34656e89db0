//! Directory paths and the current directory.

use std::fmt;
use std::str::FromStr;

use log::debug;

use super::catalog;
use super::entry::{FileEntry, FileName};
use super::page_store::PageStore;
use super::MAX_DEPTH;
use crate::device::{PageNumber, RomId};
use crate::error::{OwfsError, OwfsResult};

/// One step of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathComponent {
    /// `..`
    Parent,
    Name(FileName),
}

/// A parsed directory path.
///
/// Components are separated by `/` or `\`. A leading separator makes the
/// path absolute; `.` components are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryPath {
    absolute: bool,
    components: Vec<PathComponent>,
}

impl DirectoryPath {
    /// The root directory.
    pub fn root() -> Self {
        Self {
            absolute: true,
            components: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> OwfsResult<Self> {
        let absolute = text.starts_with(['/', '\\']);
        let mut components = Vec::new();
        for part in text.split(['/', '\\']).filter(|p| !p.is_empty()) {
            match part {
                "." => {}
                ".." => components.push(PathComponent::Parent),
                name => components.push(PathComponent::Name(FileName::new(name)?)),
            }
        }
        if components.len() > MAX_DEPTH {
            return Err(OwfsError::DirectoryTooDeep);
        }
        Ok(Self {
            absolute,
            components,
        })
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn components(&self) -> &[PathComponent] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl FromStr for DirectoryPath {
    type Err = OwfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An absolute empty path renders as `root`.
impl fmt::Display for DirectoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute && self.components.is_empty() {
            return f.write_str("root");
        }
        for (i, component) in self.components.iter().enumerate() {
            if self.absolute || i > 0 {
                f.write_str("/")?;
            }
            match component {
                PathComponent::Parent => f.write_str("..")?,
                PathComponent::Name(name) => write!(f, "{}", name)?,
            }
        }
        Ok(())
    }
}

/// One directory on the current path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLevel {
    pub name: FileName,
    /// First page of the directory chain.
    pub page: PageNumber,
    pub attrib: u8,
}

/// The current directory of a session and the device it belongs to.
#[derive(Debug, Clone, Default)]
pub struct CurrentDirectory {
    rom: Option<RomId>,
    levels: Vec<DirLevel>,
}

impl CurrentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device the path was resolved against.
    pub fn rom(&self) -> Option<RomId> {
        self.rom
    }

    /// Bind to `rom` at its root directory.
    pub fn bind(&mut self, rom: RomId) {
        self.rom = Some(rom);
        self.levels.clear();
    }

    /// Return to the root directory.
    pub fn reset(&mut self) {
        self.levels.clear();
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[DirLevel] {
        &self.levels
    }

    /// First page of the current directory.
    pub fn page(&self) -> PageNumber {
        self.levels.last().map_or(0, |level| level.page)
    }

    /// Drop every level below `depth`.
    pub fn truncate(&mut self, depth: usize) {
        self.levels.truncate(depth);
    }

    pub fn current_path(&self) -> DirectoryPath {
        DirectoryPath {
            absolute: true,
            components: self
                .levels
                .iter()
                .map(|level| PathComponent::Name(level.name))
                .collect(),
        }
    }

    /// Walk `path` from here without changing anything.
    pub fn resolve(&self, store: &mut PageStore<'_>, path: &DirectoryPath) -> OwfsResult<Vec<DirLevel>> {
        let mut levels = if path.is_absolute() {
            Vec::new()
        } else {
            self.levels.clone()
        };
        for component in path.components() {
            match component {
                PathComponent::Parent => {
                    levels.pop().ok_or(OwfsError::AtRoot)?;
                }
                PathComponent::Name(name) => {
                    if levels.len() >= MAX_DEPTH {
                        return Err(OwfsError::DirectoryTooDeep);
                    }
                    let start = levels.last().map_or(0, |l| l.page);
                    let info = catalog::find(store, start, &FileEntry::directory(*name))?;
                    levels.push(DirLevel {
                        name: *name,
                        page: info.start_page,
                        attrib: info.attrib,
                    });
                }
            }
        }
        Ok(levels)
    }

    /// Move to `path`. On failure the current directory is unchanged.
    pub fn change_directory(&mut self, store: &mut PageStore<'_>, path: &DirectoryPath) -> OwfsResult<()> {
        self.levels = self.resolve(store, path)?;
        debug!("current directory is now {}", self.current_path());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCache;
    use crate::device::{EepromBank, MemoryBank};
    use crate::fs::bitmap::Bitmap;
    use crate::fs::catalog::{subdirectory_packet, BitmapLocation, DirectoryHeader, Record};

    fn rom() -> RomId {
        RomId::new([0x0C, 0x44, 0, 0, 0, 0, 0, 0])
    }

    /// Root with `SUB` at page 2 and `SUB/DEEP` at page 3.
    fn nested_bank() -> EepromBank {
        let mut bank = EepromBank::new(rom(), 16);
        let header = DirectoryHeader {
            bitmap: BitmapLocation::Local([0x0F, 0, 0, 0]),
        };
        bank.write_page_packet(0, &header.root_packet()).unwrap();
        bank.write_page_packet(2, &subdirectory_packet(FileName::ROOT, 0))
            .unwrap();
        bank.write_page_packet(3, &subdirectory_packet(FileName::new("SUB").unwrap(), 2))
            .unwrap();

        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut bm = Bitmap::new(15);
        let sub = FileEntry::directory(FileName::new("SUB").unwrap());
        let deep = FileEntry::directory(FileName::new("DEEP").unwrap());
        catalog::insert(&mut store, &mut bm, 0, &Record::new(&sub, 0, 2, 0)).unwrap();
        catalog::insert(&mut store, &mut bm, 2, &Record::new(&deep, 2, 3, 0)).unwrap();
        drop(store);
        bank
    }

    #[test]
    fn test_parse_paths() {
        let path = DirectoryPath::parse("/a/../b").unwrap();
        assert!(path.is_absolute());
        assert_eq!(path.components().len(), 3);
        assert_eq!(path.to_string(), "/A/../B");

        let rel: DirectoryPath = "x\\.\\y".parse().unwrap();
        assert!(!rel.is_absolute());
        assert_eq!(rel.to_string(), "X/Y");

        assert_eq!(DirectoryPath::root().to_string(), "root");
        assert!(DirectoryPath::parse("toolong").is_err());
        let deep = "/a".repeat(MAX_DEPTH + 1);
        assert!(matches!(
            DirectoryPath::parse(&deep),
            Err(OwfsError::DirectoryTooDeep)
        ));
    }

    #[test]
    fn test_change_directory() {
        let mut bank = nested_bank();
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut cd = CurrentDirectory::new();
        cd.bind(rom());

        cd.change_directory(&mut store, &"sub/deep".parse().unwrap()).unwrap();
        assert_eq!(cd.depth(), 2);
        assert_eq!(cd.page(), 3);
        assert_eq!(cd.levels()[1].attrib, 2);
        assert_eq!(cd.current_path().to_string(), "/SUB/DEEP");

        cd.change_directory(&mut store, &"..".parse().unwrap()).unwrap();
        assert_eq!(cd.page(), 2);

        cd.change_directory(&mut store, &"/".parse().unwrap()).unwrap();
        assert_eq!(cd.current_path().to_string(), "root");
        assert_eq!(cd.page(), 0);
    }

    #[test]
    fn test_failed_change_keeps_directory() {
        let mut bank = nested_bank();
        let mut cache = PageCache::new(8);
        let mut store = PageStore::new(rom(), &mut bank, &mut cache, None);
        let mut cd = CurrentDirectory::new();
        cd.change_directory(&mut store, &"sub".parse().unwrap()).unwrap();

        assert!(matches!(
            cd.change_directory(&mut store, &"nope".parse().unwrap()),
            Err(OwfsError::DirectoryNotFound(_))
        ));
        assert!(matches!(
            cd.change_directory(&mut store, &"../..".parse().unwrap()),
            Err(OwfsError::AtRoot)
        ));
        assert_eq!(cd.current_path().to_string(), "/SUB");
    }
}
