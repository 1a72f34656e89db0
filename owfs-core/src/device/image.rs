//! JSON images of simulated devices.
//!
//! An image file holds every device of a [`SimBus`] so the command line
//! front end can keep state between invocations.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::bus::{SimBus, SimDevice};
use super::eeprom::EepromBank;
use super::eprom::EpromBank;
use super::{RomId, PAGE_LEN};
use crate::error::{OwfsError, OwfsResult};

/// Kind of simulated part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Eeprom,
    Eprom,
}

/// Persisted state of one simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceImage {
    pub rom: RomId,
    pub kind: DeviceKind,
    /// One hex string per page.
    pub pages: Vec<String>,
    /// Status memory as hex (EPROM only).
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub counters: Option<Vec<u32>>,
    #[serde(default)]
    pub read_only: bool,
}

/// Persisted state of a whole bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusImage {
    #[serde(default)]
    pub devices: Vec<DeviceImage>,
}

impl DeviceImage {
    pub fn from_device(device: &SimDevice) -> Self {
        match device {
            SimDevice::Eeprom(bank) => DeviceImage {
                rom: device.rom(),
                kind: DeviceKind::Eeprom,
                pages: bank.memory().chunks(PAGE_LEN).map(hex::encode_upper).collect(),
                status: None,
                counters: bank.counters().map(<[u32]>::to_vec),
                read_only: bank.is_locked(),
            },
            SimDevice::Eprom(bank) => DeviceImage {
                rom: device.rom(),
                kind: DeviceKind::Eprom,
                pages: bank.memory().chunks(PAGE_LEN).map(hex::encode_upper).collect(),
                status: Some(hex::encode_upper(bank.status())),
                counters: None,
                read_only: false,
            },
        }
    }

    pub fn into_device(self) -> OwfsResult<SimDevice> {
        let mut memory = Vec::with_capacity(self.pages.len() * PAGE_LEN);
        for page in &self.pages {
            let bytes = from_hex(page)?;
            if bytes.len() != PAGE_LEN {
                return Err(OwfsError::Image(format!(
                    "{}: page of {} bytes",
                    self.rom,
                    bytes.len()
                )));
            }
            memory.extend(bytes);
        }
        match self.kind {
            DeviceKind::Eeprom => Ok(EepromBank::from_parts(
                self.rom,
                memory,
                self.counters,
                self.read_only,
            )?
            .into()),
            DeviceKind::Eprom => {
                let status = self
                    .status
                    .as_deref()
                    .map(from_hex)
                    .transpose()?
                    .ok_or_else(|| OwfsError::Image(format!("{}: missing status", self.rom)))?;
                Ok(EpromBank::from_parts(self.rom, memory, status)?.into())
            }
        }
    }
}

impl BusImage {
    pub fn from_bus(bus: &SimBus) -> Self {
        Self {
            devices: bus.devices().iter().map(DeviceImage::from_device).collect(),
        }
    }

    pub fn into_bus(self) -> OwfsResult<SimBus> {
        let devices = self
            .devices
            .into_iter()
            .map(DeviceImage::into_device)
            .collect::<OwfsResult<Vec<_>>>()?;
        Ok(SimBus::with_devices(devices))
    }
}

/// Load a bus image from a JSON file.
pub fn load_image(path: impl AsRef<Path>) -> OwfsResult<SimBus> {
    let text = std::fs::read_to_string(path)?;
    let image: BusImage = serde_json::from_str(&text)?;
    image.into_bus()
}

/// Save a bus image as pretty-printed JSON.
pub fn save_image(path: impl AsRef<Path>, bus: &SimBus) -> OwfsResult<()> {
    let text = serde_json::to_string_pretty(&BusImage::from_bus(bus))?;
    std::fs::write(path, text)?;
    Ok(())
}

fn from_hex(text: &str) -> OwfsResult<Vec<u8>> {
    hex::decode(text).map_err(|e| OwfsError::Image(format!("bad hex string {:?}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBank;

    #[test]
    fn test_bus_image_keeps_contents() {
        let mut eeprom = EepromBank::new(RomId::new([0x0C, 1, 0, 0, 0, 0, 0, 0]), 4).with_counters();
        eeprom.write_page_packet(1, b"NV").unwrap();
        let mut eprom = EpromBank::new(RomId::new([0x0B, 2, 0, 0, 0, 0, 0, 0]), 8);
        eprom.write_page_packet(2, b"OTP").unwrap();
        eprom.redirect(3, 2).unwrap();

        let bus = SimBus::with_devices([SimDevice::from(eeprom), SimDevice::from(eprom)]);
        let json = serde_json::to_string(&BusImage::from_bus(&bus)).unwrap();
        let image: BusImage = serde_json::from_str(&json).unwrap();
        let mut restored = image.into_bus().unwrap();

        let nv = RomId::new([0x0C, 1, 0, 0, 0, 0, 0, 0]);
        let (data, extra) = restored.device_mut(&nv).unwrap().bank_mut().read_page_packet_extra(1).unwrap();
        assert_eq!(data, b"NV".to_vec());
        assert_eq!(extra, 1u32.to_le_bytes().to_vec());

        let otp = RomId::new([0x0B, 2, 0, 0, 0, 0, 0, 0]);
        match restored.device(&otp).unwrap() {
            SimDevice::Eprom(bank) => assert_eq!(bank.redirection(3), Some(2)),
            other => panic!("unexpected device {:?}", other),
        }
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(from_hex("ABC").is_err());
        assert!(from_hex("GG").is_err());
        assert!(from_hex("+F").is_err());
        assert_eq!(from_hex("00ff").unwrap(), vec![0x00, 0xFF]);
    }

    #[test]
    fn test_missing_status_rejected() {
        let image = DeviceImage {
            rom: RomId::new([0x0B, 3, 0, 0, 0, 0, 0, 0]),
            kind: DeviceKind::Eprom,
            pages: vec!["FF".repeat(PAGE_LEN)],
            status: None,
            counters: None,
            read_only: false,
        };
        assert!(matches!(image.into_device(), Err(OwfsError::Image(_))));
    }
}
