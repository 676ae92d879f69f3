use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

pub const RUN_REPORT_SCHEMA_VERSION: &str = "1.0.0";
pub const STATION_SCHEMA_VERSION: &str = "1.0.0";
pub const DEFAULT_SLOT_COUNT: usize = 20;

pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const OTA_INIT_OFFSET: u32 = 0xd000;
pub const FIRMWARE_OFFSET: u32 = 0x10000;
pub const NVS_OFFSET: u32 = 0x003e_0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("unsupported baud rate {0} (expected one of 115200, 460800, 921600, 1152000, 1500000)")]
    UnsupportedBaud(String),
    #[error("unknown chip family {0:?} (expected esp32 or esp32c3)")]
    UnknownChip(String),
    #[error("slot {index} is outside the roster (1..={count})")]
    SlotOutOfRange { index: usize, count: usize },
}

/// Target chip family. Selects the bootloader offset and the binaries subdirectory.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChipFamily {
    Esp32,
    #[default]
    Esp32c3,
}

impl ChipFamily {
    pub fn tool_name(self) -> &'static str {
        match self {
            ChipFamily::Esp32 => "esp32",
            ChipFamily::Esp32c3 => "esp32c3",
        }
    }

    pub fn bootloader_offset(self) -> u32 {
        match self {
            ChipFamily::Esp32 => 0x1000,
            ChipFamily::Esp32c3 => 0x0000,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

impl FromStr for ChipFamily {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "esp32" => Ok(ChipFamily::Esp32),
            "esp32c3" => Ok(ChipFamily::Esp32c3),
            _ => Err(ModelError::UnknownChip(value.to_string())),
        }
    }
}

/// Serial speed used for flashing; restricted to the rates the station offers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "u32", into = "u32")]
pub struct BaudRate(u32);

impl BaudRate {
    pub const SUPPORTED: [u32; 5] = [115_200, 460_800, 921_600, 1_152_000, 1_500_000];

    pub fn new(value: u32) -> Result<Self, ModelError> {
        if Self::SUPPORTED.contains(&value) {
            Ok(Self(value))
        } else {
            Err(ModelError::UnsupportedBaud(value.to_string()))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self(1_500_000)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = ModelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BaudRate> for u32 {
    fn from(value: BaudRate) -> Self {
        value.0
    }
}

impl FromStr for BaudRate {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u32>()
            .map_err(|_| ModelError::UnsupportedBaud(value.to_string()))
            .and_then(Self::new)
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chip family plus the directory holding its fixed-offset support images.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FirmwareProfile {
    pub chip: ChipFamily,
    pub bins_dir: PathBuf,
}

impl FirmwareProfile {
    pub fn new(chip: ChipFamily, bins_root: impl AsRef<Path>) -> Self {
        Self {
            chip,
            bins_dir: bins_root.as_ref().join(chip.tool_name()),
        }
    }

    pub fn bootloader_offset(&self) -> u32 {
        self.chip.bootloader_offset()
    }

    pub fn bootloader_path(&self) -> PathBuf {
        self.bins_dir.join("bootloader.bin")
    }

    pub fn partition_table_path(&self) -> PathBuf {
        self.bins_dir.join("partition-table.bin")
    }

    pub fn ota_init_path(&self) -> PathBuf {
        self.bins_dir.join("ota_data_initial.bin")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Pending,
    Ignored,
    Success,
    Failed,
}

impl SlotStatus {
    pub fn is_settled(self) -> bool {
        !matches!(self, SlotStatus::Pending)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Ignored => "ignored",
            SlotStatus::Success => "success",
            SlotStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub index: usize,
    pub enabled: bool,
    pub port: Option<String>,
    pub status: SlotStatus,
}

impl DeviceSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            enabled: false,
            port: None,
            status: SlotStatus::Pending,
        }
    }

    /// The assigned port, or `None` when unassigned or blank.
    pub fn assigned_port(&self) -> Option<&str> {
        self.port
            .as_deref()
            .map(str::trim)
            .filter(|port| !port.is_empty())
    }
}

/// Fixed-size slot roster, indexed 1..=N.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Roster {
    slots: Vec<DeviceSlot>,
}

impl Roster {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (1..=count).map(DeviceSlot::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[DeviceSlot] {
        &self.slots
    }

    pub fn get(&self, index: usize) -> Option<&DeviceSlot> {
        index.checked_sub(1).and_then(|pos| self.slots.get(pos))
    }

    pub fn assign(
        &mut self,
        index: usize,
        enabled: bool,
        port: Option<String>,
    ) -> Result<(), ModelError> {
        let count = self.slots.len();
        let slot = index
            .checked_sub(1)
            .and_then(|pos| self.slots.get_mut(pos))
            .ok_or(ModelError::SlotOutOfRange { index, count })?;
        slot.enabled = enabled;
        slot.port = port;
        Ok(())
    }

    pub fn reset_statuses(&mut self) {
        for slot in &mut self.slots {
            slot.status = SlotStatus::Pending;
        }
    }

    pub fn into_slots(self) -> Vec<DeviceSlot> {
        self.slots
    }

    pub fn from_slots(slots: Vec<DeviceSlot>) -> Self {
        Self { slots }
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisionRecord {
    pub mac: String,
    pub device_identity: String,
}

impl ProvisionRecord {
    pub fn new(mac: impl Into<String>, device_identity: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            device_identity: device_identity.into(),
        }
    }
}

/// Normalises `aa:bb:cc:dd:ee:ff` style text into 12 uppercase hex digits.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let mac: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != ':' && *ch != '-')
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if mac.len() == 12 && mac.chars().all(|ch| ch.is_ascii_hexdigit()) {
        Some(mac)
    } else {
        None
    }
}

/// One CSV record terminated by CRLF; fields are quoted only when needed.
pub fn csv_record<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields
        .iter()
        .map(|field| {
            let field = field.as_ref();
            if field.contains([',', '"', '\r', '\n']) {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
