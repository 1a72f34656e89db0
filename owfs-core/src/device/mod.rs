//! Device side collaborators: serial numbers, packet framing, memory banks
//! and the bus.

mod bank;
mod bus;
mod eeprom;
mod eprom;
mod image;
mod rom;
pub mod udp;

pub use bank::{MemoryBank, MemoryKind, StatusLayout, STATUS_PAGE_LEN};
pub use bus::{Bus, SimBus, SimDevice};
pub use eeprom::{EepromBank, COUNTER_LEN};
pub use eprom::{EpromBank, ERASED};
pub use image::{load_image, save_image, BusImage, DeviceImage, DeviceKind};
pub use rom::{RomId, FAMILY_SHA_COUNTER};

/// Logical page number. Parts hold at most 256 pages.
pub type PageNumber = u8;

/// Bytes per physical page.
pub const PAGE_LEN: usize = 32;
