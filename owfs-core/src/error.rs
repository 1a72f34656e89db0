//! Error types for the MicroLAN file system.

use thiserror::Error;

use crate::device::RomId;

/// Coarse classification of [`OwfsError`] values.
///
/// Front ends match on this instead of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidName,
    OutOfSpace,
    ReadOnlyViolation,
    WrongDeviceType,
    CrcMismatch,
    ProtocolFramingError,
    WriteProtected,
    RedirectionCycle,
    IterationCapExceeded,
    DeviceMismatch,
    DirectoryNotEmpty,
    Busy,
    InvalidState,
    Io,
}

/// Errors raised by the file system and its device collaborators.
#[derive(Error, Debug)]
pub enum OwfsError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(RomId),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(usize),

    #[error("No file handle available")]
    HandleNotAvailable,

    #[error("File exists: {0}")]
    FileExists(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(u8),

    #[error("Invalid attribute {attrib} for {name}")]
    InvalidAttribute { name: String, attrib: u8 },

    #[error("Invalid serial number: {0:?}")]
    InvalidRom(String),

    #[error("Device full")]
    OutOfSpace,

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Wrong device type: {0}")]
    WrongDeviceType(&'static str),

    #[error("CRC mismatch on page {0}")]
    CrcMismatch(u8),

    #[error("Invalid packet length {len} on page {page}")]
    InvalidPacketLength { page: u8, len: usize },

    #[error("Page {0} is redirected")]
    RedirectedPage(u8),

    #[error("Broken page chain at page {0}")]
    BrokenChain(u8),

    #[error("Corrupt directory page {0}")]
    CorruptDirectory(u8),

    #[error("Address {0:#06x} is outside the memory bank")]
    AddressOutOfRange(usize),

    #[error("Bit number {0} out of range")]
    OutOfRange(usize),

    #[error("Page {0} is write protected")]
    WriteProtected(u8),

    #[error("Programming failed at address {0:#06x}")]
    ProgramFailed(usize),

    #[error("Redirection chain starting at page {0} does not terminate")]
    RedirectionCycle(u8),

    #[error("Program job exceeded {0} iterations")]
    IterationCapExceeded(usize),

    #[error("Device mismatch: session bound to {expected}, got {found}")]
    DeviceMismatch { expected: RomId, found: RomId },

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Directory nesting limit reached")]
    DirectoryTooDeep,

    #[error("Already at the root directory")]
    AtRoot,

    #[error("No program job open")]
    NoProgramJob,

    #[error("A program job is already open for {0}")]
    JobAlreadyOpen(RomId),

    #[error("Page {0} has a conflicting program job")]
    JobConflict(u8),

    #[error("Device {0} on the bus is not programmable")]
    NonProgramParts(RomId),

    #[error("Add file already terminated")]
    AddFileTerminated,

    #[error("Not an add file: {0}")]
    NotAddFile(String),

    #[error("Invalid device image: {0}")]
    Image(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OwfsError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        use OwfsError::*;
        match self {
            FileNotFound(_) | DirectoryNotFound(_) | DeviceNotFound(_) | InvalidHandle(_) => {
                ErrorKind::NotFound
            }
            FileExists(_) => ErrorKind::AlreadyExists,
            InvalidName(_) | UnsupportedExtension(_) | InvalidAttribute { .. } | InvalidRom(_) => {
                ErrorKind::InvalidName
            }
            OutOfSpace | DirectoryTooDeep => ErrorKind::OutOfSpace,
            ReadOnly(_) => ErrorKind::ReadOnlyViolation,
            WrongDeviceType(_) | NotAddFile(_) => ErrorKind::WrongDeviceType,
            CrcMismatch(_) => ErrorKind::CrcMismatch,
            InvalidPacketLength { .. }
            | RedirectedPage(_)
            | BrokenChain(_)
            | CorruptDirectory(_)
            | AddressOutOfRange(_)
            | OutOfRange(_) => ErrorKind::ProtocolFramingError,
            WriteProtected(_) | ProgramFailed(_) | JobConflict(_) => ErrorKind::WriteProtected,
            RedirectionCycle(_) => ErrorKind::RedirectionCycle,
            IterationCapExceeded(_) => ErrorKind::IterationCapExceeded,
            DeviceMismatch { .. } | NonProgramParts(_) => ErrorKind::DeviceMismatch,
            DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            HandleNotAvailable => ErrorKind::Busy,
            AtRoot | NoProgramJob | JobAlreadyOpen(_) | AddFileTerminated => {
                ErrorKind::InvalidState
            }
            Image(_) | Io(_) | Json(_) => ErrorKind::Io,
        }
    }
}

/// Result type for file system operations.
pub type OwfsResult<T> = Result<T, OwfsError>;
