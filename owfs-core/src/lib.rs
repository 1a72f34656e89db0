//! 1-Wire MicroLAN File System Core
//!
//! This crate implements the MicroLAN file format on paged device memory:
//! - Page packets with a length byte and an inverted CRC16
//! - A page bitmap and chained directory records with subdirectories
//! - Ordinary, append-only (extension 100) and monetary (101/102) files
//! - Program jobs that stage writes to write-once parts and burn them
//!   with page redirection
//!
//! # Architecture
//!
//! The core uses a layered design:
//! - `MemoryBank` trait: raw page, packet and status access of one part
//! - `Bus` trait: device search and selection (`SimBus` holds simulated parts)
//! - `PageStore`: page reads through the job shadow, the cache and the
//!   device, following redirections
//! - `catalog` and `Bitmap`: the on-device directory and allocation formats
//! - `ProgramJob`: pending page operations and the commit to a write-once part
//! - `Session`: handles, current directory and every file operation
//!
//! ```
//! use owfs_core::FileName;
//!
//! let name = FileName::new("log").unwrap();
//! assert_eq!(name.to_string(), "LOG");
//! ```

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod session;

pub use config::SessionConfig;
pub use device::{
    load_image, save_image, Bus, EepromBank, EpromBank, MemoryBank, PageNumber, RomId, SimBus,
};
pub use error::{ErrorKind, OwfsError, OwfsResult};
pub use fs::{Bitmap, FileEntry, FileInfo, FileName};
pub use session::{AddMode, ListEntry, Session};
