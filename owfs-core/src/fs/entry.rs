//! File names, extensions and catalog information.

use std::fmt;
use std::str::FromStr;

use crate::device::PageNumber;
use crate::error::{OwfsError, OwfsResult};

/// Extension marking a subdirectory.
pub const EXT_DIRECTORY: u8 = 0x7F;
/// Append-only file on write-once parts.
pub const EXT_ADD_FILE: u8 = 100;
/// Monetary file.
pub const EXT_MONEY: u8 = 101;
/// Counter file.
pub const EXT_COUNTER: u8 = 102;

/// File attribute: read-only (files).
pub const ATTR_READ_ONLY: u8 = 1;
/// Directory attribute: hidden.
pub const ATTR_HIDDEN: u8 = 2;

/// Punctuation allowed in names besides letters and digits.
const NAME_PUNCTUATION: &[u8] = b" !#$%&'-@^_`{}~";

/// Whether `c` may appear in a file name.
pub fn is_valid_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(&c)
}

/// Four character, space padded, upper case file name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileName([u8; 4]);

impl FileName {
    /// Name of the pseudo parent stored in first-level subdirectories.
    pub const ROOT: FileName = FileName(*b"ROOT");

    /// Validate and normalize a name of one to four characters.
    ///
    /// # Examples
    ///
    /// ```
    /// use owfs_core::FileName;
    ///
    /// assert_eq!(FileName::new("log").unwrap().to_string(), "LOG");
    /// assert!(FileName::new("a.b").is_err());
    /// ```
    pub fn new(name: &str) -> OwfsResult<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(OwfsError::InvalidName(name.to_string()));
        }
        let mut raw = [b' '; 4];
        raw[..bytes.len()].copy_from_slice(bytes);
        Self::from_bytes(raw).map_err(|_| OwfsError::InvalidName(name.to_string()))
    }

    /// Validate raw record bytes, folding them to upper case.
    pub fn from_bytes(raw: [u8; 4]) -> OwfsResult<Self> {
        if raw.iter().all(|&c| c == b' ') || !raw.iter().all(|&c| is_valid_name_char(c)) {
            return Err(OwfsError::InvalidName(String::from_utf8_lossy(&raw).into_owned()));
        }
        Ok(Self(raw.map(|c| c.to_ascii_uppercase())))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.0);
        f.write_str(text.trim_end_matches(' '))
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileName({:?})", self.to_string())
    }
}

impl FromStr for FileName {
    type Err = OwfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Name plus extension identifying a catalog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileEntry {
    pub name: FileName,
    pub ext: u8,
}

impl FileEntry {
    /// A file entry; `ext` must be 0-102 or the directory marker.
    pub fn new(name: &str, ext: u8) -> OwfsResult<Self> {
        if ext > EXT_COUNTER && ext != EXT_DIRECTORY {
            return Err(OwfsError::UnsupportedExtension(ext));
        }
        Ok(Self {
            name: FileName::new(name)?,
            ext,
        })
    }

    pub fn directory(name: FileName) -> Self {
        Self {
            name,
            ext: EXT_DIRECTORY,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.ext == EXT_DIRECTORY
    }

    pub fn is_add_file(&self) -> bool {
        self.ext == EXT_ADD_FILE
    }

    pub fn is_monetary(&self) -> bool {
        self.ext == EXT_MONEY || self.ext == EXT_COUNTER
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_directory() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{:03}", self.name, self.ext)
        }
    }
}

/// Parses `NAME.EXT` with a decimal extension; a bare name has extension 0.
impl FromStr for FileEntry {
    type Err = OwfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((name, ext)) => {
                let ext = ext
                    .parse::<u8>()
                    .map_err(|_| OwfsError::InvalidName(s.to_string()))?;
                Self::new(name, ext)
            }
            None => Self::new(s, 0),
        }
    }
}

/// A catalog record together with where it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub entry: FileEntry,
    /// Logical attribute: [`ATTR_READ_ONLY`] for files, [`ATTR_HIDDEN`] for directories.
    pub attrib: u8,
    pub start_page: PageNumber,
    pub num_pages: u8,
    /// Directory page holding the record.
    pub dir_page: PageNumber,
    /// Directory page linking to `dir_page`.
    pub prev_dir_page: PageNumber,
    /// Offset of the record within the directory packet.
    pub offset: usize,
}

impl FileInfo {
    pub fn is_read_only(&self) -> bool {
        !self.entry.is_directory() && self.attrib & ATTR_READ_ONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.entry.is_directory() && self.attrib & ATTR_HIDDEN != 0
    }
}
