//! 1-Wire bus access.

use log::debug;

use super::bank::MemoryBank;
use super::eeprom::EepromBank;
use super::eprom::EpromBank;
use super::RomId;
use crate::error::{OwfsError, OwfsResult};

/// Transport contract: device discovery, selection and bank access.
pub trait Bus {
    /// Serial numbers of every device currently on the bus.
    fn search(&mut self) -> OwfsResult<Vec<RomId>>;

    /// Address `rom` for the following transactions.
    fn select(&mut self, rom: &RomId) -> OwfsResult<()>;

    /// File system memory bank of `rom`.
    fn bank(&mut self, rom: &RomId) -> OwfsResult<&mut dyn MemoryBank>;

    /// Start a sequence that must not be interleaved with other bus traffic.
    fn begin_exclusive(&mut self) -> OwfsResult<()> {
        Ok(())
    }

    fn end_exclusive(&mut self) {}
}

/// A simulated device.
#[derive(Debug, Clone)]
pub enum SimDevice {
    Eeprom(EepromBank),
    Eprom(EpromBank),
}

impl SimDevice {
    pub fn rom(&self) -> RomId {
        self.bank().rom()
    }

    pub fn bank(&self) -> &dyn MemoryBank {
        match self {
            SimDevice::Eeprom(bank) => bank,
            SimDevice::Eprom(bank) => bank,
        }
    }

    pub fn bank_mut(&mut self) -> &mut dyn MemoryBank {
        match self {
            SimDevice::Eeprom(bank) => bank,
            SimDevice::Eprom(bank) => bank,
        }
    }
}

impl From<EepromBank> for SimDevice {
    fn from(bank: EepromBank) -> Self {
        SimDevice::Eeprom(bank)
    }
}

impl From<EpromBank> for SimDevice {
    fn from(bank: EpromBank) -> Self {
        SimDevice::Eprom(bank)
    }
}

/// In-memory bus holding simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: Vec<SimDevice>,
    selected: Option<RomId>,
    exclusive: bool,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with the given devices attached.
    pub fn with_devices<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<SimDevice>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Attach a device, replacing any device with the same serial number.
    pub fn attach(&mut self, device: impl Into<SimDevice>) {
        let device = device.into();
        let rom = device.rom();
        self.devices.retain(|d| d.rom() != rom);
        debug!("attach {}", rom);
        self.devices.push(device);
    }

    /// Remove a device from the bus.
    pub fn detach(&mut self, rom: &RomId) -> Option<SimDevice> {
        let index = self.devices.iter().position(|d| d.rom() == *rom)?;
        if self.selected == Some(*rom) {
            self.selected = None;
        }
        Some(self.devices.remove(index))
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    pub fn device(&self, rom: &RomId) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.rom() == *rom)
    }

    pub fn device_mut(&mut self, rom: &RomId) -> Option<&mut SimDevice> {
        self.devices.iter_mut().find(|d| d.rom() == *rom)
    }

    pub fn selected(&self) -> Option<RomId> {
        self.selected
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Bus for SimBus {
    fn search(&mut self) -> OwfsResult<Vec<RomId>> {
        Ok(self.devices.iter().map(SimDevice::rom).collect())
    }

    fn select(&mut self, rom: &RomId) -> OwfsResult<()> {
        if self.device(rom).is_none() {
            return Err(OwfsError::DeviceNotFound(*rom));
        }
        self.selected = Some(*rom);
        Ok(())
    }

    fn bank(&mut self, rom: &RomId) -> OwfsResult<&mut dyn MemoryBank> {
        self.device_mut(rom)
            .map(SimDevice::bank_mut)
            .ok_or(OwfsError::DeviceNotFound(*rom))
    }

    fn begin_exclusive(&mut self) -> OwfsResult<()> {
        self.exclusive = true;
        Ok(())
    }

    fn end_exclusive(&mut self) {
        self.exclusive = false;
    }
}
