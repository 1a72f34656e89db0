//! File system layers over paged device memory.
//!
//! This module provides the layered file system:
//! - `Bitmap`: page allocation, first-fit
//! - `catalog`: 7-byte directory records in chained pages
//! - `CurrentDirectory`: path walking bound to one device
//! - `PageStore`: logical page access with redirection and shadowing
//! - `ProgramJob`: staged writes and the commit for write-once parts
//! - `HandleTable`: the four open-file slots

mod bitmap;
pub mod catalog;
mod entry;
mod handle;
mod page_store;
mod path;
mod program_job;

pub use bitmap::{read_bitmap, write_bitmap, Bitmap, FreePages, Media};
pub use entry::{
    is_valid_name_char, FileEntry, FileInfo, FileName, ATTR_HIDDEN, ATTR_READ_ONLY, EXT_ADD_FILE,
    EXT_COUNTER, EXT_DIRECTORY, EXT_MONEY,
};
pub use handle::{AccessMode, HandleTable, OpenFile};
pub use page_store::{
    ext_read, ext_write, reclaim_chain, DeviceSource, Lookup, PageSource, PageStore, RawPage, Tier,
    MAX_REDIRECT_HOPS,
};
pub use path::{CurrentDirectory, DirLevel, DirectoryPath, PathComponent};
pub use program_job::{commit, JobState, ProgramJob, StatusTables, COMMIT_ITERATION_CAP};

/// Payload bytes per page in a page chain.
pub const PAGE_PAYLOAD: usize = 28;

/// Bytes per directory record.
pub const RECORD_LEN: usize = 7;

/// Deepest directory nesting.
pub const MAX_DEPTH: usize = 10;

/// Files open at once.
pub const MAX_HANDLES: usize = 4;
