use clap::{Args, Parser, Subcommand};
use espbatch_core::{BaudRate, ChipFamily};
use espbatch_station::SlotAssignment;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Erase and provision a bench of ESP32 devices", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List serial ports that can be opened right now
    Ports,
    /// Erase the whole flash of every selected slot
    Erase(StationArgs),
    /// Flash and provision every selected slot
    Flash(FlashArgs),
    /// Only build the config blob for one identity
    Nvs(NvsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct StationArgs {
    /// Station config file (JSON); missing file means defaults
    #[arg(env = "ESPBATCH_CONFIG", long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Enable slot N on PORT, may be repeated
    #[arg(long = "slot", value_name = "N=PORT")]
    pub slots: Vec<SlotAssignment>,

    #[arg(env = "ESPBATCH_BAUD", long, value_name = "baud")]
    pub baud: Option<BaudRate>,

    #[arg(env = "ESPBATCH_CHIP", long, value_name = "chip")]
    pub chip: Option<ChipFamily>,

    /// Ignore slots whose port is not currently connected
    #[arg(long)]
    pub check_ports: bool,
}

#[derive(Debug, Clone, Args)]
pub struct FlashArgs {
    #[command(flatten)]
    pub station: StationArgs,

    /// Application image written at 0x10000
    #[arg(env = "ESPBATCH_FIRMWARE", long, value_name = "file")]
    pub firmware: Option<PathBuf>,

    /// Device identity prefix, at least two characters
    #[arg(env = "ESPBATCH_PREFIX", long, value_name = "str")]
    pub prefix: Option<String>,

    /// Five digit sequence of the first device
    #[arg(env = "ESPBATCH_SEQUENCE", long, value_name = "digits")]
    pub sequence: Option<String>,

    /// Write the provisioned records to this CSV file
    #[arg(long, value_name = "file")]
    pub export: Option<PathBuf>,

    /// Write a run report bundle under this directory
    #[arg(env = "ESPBATCH_REPORT_BASE", long, value_name = "dir")]
    pub report_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct NvsArgs {
    #[arg(env = "ESPBATCH_CONFIG", long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Full device identity, eg. DEV00001
    #[arg(long, value_name = "id")]
    pub identity: String,
}
