//! Station configuration: one JSON file describing the bench, its slots and
//! the external tools.

use anyhow::{anyhow, bail, Context, Result};
use espbatch_core::{
    BaudRate, ChipFamily, FirmwareProfile, Roster, DEFAULT_SLOT_COUNT, STATION_SCHEMA_VERSION,
};
use espbatch_esptool::ToolCommand;
use espbatch_nvs::NvsSettings;
use espbatch_uplink::UplinkSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub index: usize,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolSettings {
    pub esptool: ToolCommand,
    /// Upper bound for one tool invocation; `None` waits forever.
    pub step_timeout_secs: Option<u64>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            esptool: ToolCommand::default(),
            step_timeout_secs: Some(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StationConfig {
    pub schema_version: String,
    pub baud: BaudRate,
    pub chip: ChipFamily,
    pub bins_dir: PathBuf,
    pub firmware: Option<PathBuf>,
    pub prefix: Option<String>,
    pub sequence: Option<String>,
    pub slot_count: usize,
    pub slots: Vec<SlotConfig>,
    pub tool: ToolSettings,
    pub nvs: NvsSettings,
    pub uplink: UplinkSettings,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            schema_version: STATION_SCHEMA_VERSION.to_string(),
            baud: BaudRate::default(),
            chip: ChipFamily::default(),
            bins_dir: PathBuf::from("bins"),
            firmware: None,
            prefix: None,
            sequence: None,
            slot_count: DEFAULT_SLOT_COUNT,
            slots: Vec::new(),
            tool: ToolSettings::default(),
            nvs: NvsSettings::default(),
            uplink: UplinkSettings::default(),
        }
    }
}

impl StationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            bail!("slot_count must be > 0");
        }
        let mut seen = BTreeSet::new();
        for slot in &self.slots {
            if slot.index == 0 || slot.index > self.slot_count {
                bail!(
                    "slot index {} outside 1..={}",
                    slot.index,
                    self.slot_count
                );
            }
            if !seen.insert(slot.index) {
                bail!("slot {} configured twice", slot.index);
            }
        }
        Ok(())
    }

    /// Enables the slot and points it at `port`, replacing any file entry.
    pub fn assign_slot(&mut self, assignment: SlotAssignment) {
        self.slots.retain(|slot| slot.index != assignment.index);
        self.slots.push(SlotConfig {
            index: assignment.index,
            enabled: true,
            port: Some(assignment.port),
        });
    }

    pub fn roster(&self) -> Result<Roster> {
        self.validate()?;
        let mut roster = Roster::new(self.slot_count);
        for slot in &self.slots {
            roster.assign(slot.index, slot.enabled, slot.port.clone())?;
        }
        Ok(roster)
    }

    pub fn profile(&self) -> FirmwareProfile {
        FirmwareProfile::new(self.chip, &self.bins_dir)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.tool.step_timeout_secs.map(Duration::from_secs)
    }
}

pub fn load_station_config(path: impl AsRef<Path>) -> Result<StationConfig> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading station config {}", path.display()))?;
    let config: StationConfig = serde_json::from_str(&data)
        .with_context(|| format!("parsing station config {}", path.display()))?;
    config.validate()?;
    info!(path = %path.display(), slots = config.slots.len(), "station config loaded");
    Ok(config)
}

/// Loads `path` when given and present; anything else yields the defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<StationConfig> {
    match path {
        Some(path) if path.exists() => load_station_config(path),
        Some(path) => {
            debug!(path = %path.display(), "station config not found, using defaults");
            Ok(StationConfig::default())
        }
        None => Ok(StationConfig::default()),
    }
}

/// `N=PORT` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub index: usize,
    pub port: String,
}

impl FromStr for SlotAssignment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (index, port) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected N=PORT, got {s:?}"))?;
        let index: usize = index
            .trim()
            .parse()
            .with_context(|| format!("slot number in {s:?}"))?;
        let port = port.trim();
        if port.is_empty() {
            bail!("slot {index} has an empty port");
        }
        Ok(Self {
            index,
            port: port.to_string(),
        })
    }
}
