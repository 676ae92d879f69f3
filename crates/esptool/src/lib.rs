//! Single device programming steps driven through `esptool.py`.

pub mod marker;
pub mod runner;

use espbatch_core::{
    BaudRate, ChipFamily, FIRMWARE_OFFSET, NVS_OFFSET, OTA_INIT_OFFSET, PARTITION_TABLE_OFFSET,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub use runner::{Invocation, ProcessRunner, RunnerError, ToolExit, ToolRunner};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Erase,
    WriteBootloader,
    WritePartitionTable,
    WriteOtaInit,
    WriteFirmware,
    WriteNvs,
    ReadMac,
}

impl StepKind {
    pub fn name(self) -> &'static str {
        match self {
            StepKind::Erase => "erase",
            StepKind::WriteBootloader => "write-bootloader",
            StepKind::WritePartitionTable => "write-partition-table",
            StepKind::WriteOtaInit => "write-ota-init",
            StepKind::WriteFirmware => "write-firmware",
            StepKind::WriteNvs => "write-nvs",
            StepKind::ReadMac => "read-mac",
        }
    }

    /// Flash offset for write steps.
    pub fn offset(self, chip: ChipFamily) -> Option<u32> {
        match self {
            StepKind::WriteBootloader => Some(chip.bootloader_offset()),
            StepKind::WritePartitionTable => Some(PARTITION_TABLE_OFFSET),
            StepKind::WriteOtaInit => Some(OTA_INIT_OFFSET),
            StepKind::WriteFirmware => Some(FIRMWARE_OFFSET),
            StepKind::WriteNvs => Some(NVS_OFFSET),
            StepKind::Erase | StepKind::ReadMac => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest<'a> {
    pub kind: StepKind,
    pub port: &'a str,
    pub baud: BaudRate,
    pub chip: ChipFamily,
    pub image: Option<&'a Path>,
}

impl<'a> StepRequest<'a> {
    pub fn erase(port: &'a str, baud: BaudRate, chip: ChipFamily) -> Self {
        Self {
            kind: StepKind::Erase,
            port,
            baud,
            chip,
            image: None,
        }
    }

    pub fn write(
        kind: StepKind,
        port: &'a str,
        baud: BaudRate,
        chip: ChipFamily,
        image: &'a Path,
    ) -> Self {
        Self {
            kind,
            port,
            baud,
            chip,
            image: Some(image),
        }
    }

    pub fn read_mac(port: &'a str, baud: BaudRate, chip: ChipFamily) -> Self {
        Self {
            kind: StepKind::ReadMac,
            port,
            baud,
            chip,
            image: None,
        }
    }
}

/// What the tool confirmed for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Erased,
    Wrote { offset: u32 },
    Mac(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{program} could not be started: {reason}")]
    ToolUnavailable { program: String, reason: String },
    #[error("{step} was not confirmed by the tool (exit code {exit_code:?})")]
    MarkerAbsent {
        step: StepKind,
        exit_code: Option<i32>,
    },
    #[error("{step} timed out")]
    TimedOut { step: StepKind },
    #[error("{step} needs an image path")]
    MissingImage { step: StepKind },
    #[error("{step} failed while reading tool output: {reason}")]
    Io { step: StepKind, reason: String },
}

/// One blocking device programming step. Implementations must never be
/// called concurrently for the same port.
pub trait FlashSteps {
    fn execute(&mut self, request: &StepRequest<'_>) -> Result<Confirmation, StepError>;
}

/// Program name and leading arguments used to reach the tool.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn invocation(&self) -> Invocation {
        Invocation {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::new("esptool.py")
    }
}

/// Full esptool argument vector for a step.
pub fn step_invocation(tool: &ToolCommand, request: &StepRequest<'_>) -> Result<Invocation, StepError> {
    let invocation = tool
        .invocation()
        .arg("--chip")
        .arg(request.chip.tool_name())
        .arg("--port")
        .arg(request.port);
    let invocation = match request.kind {
        StepKind::Erase => invocation
            .arg("--baud")
            .arg(request.baud.to_string())
            .arg("erase_flash"),
        StepKind::ReadMac => invocation.arg("read_mac"),
        kind => {
            let image = request.image.ok_or(StepError::MissingImage { step: kind })?;
            let offset = kind.offset(request.chip).unwrap_or_default();
            invocation
                .arg("--baud")
                .arg(request.baud.to_string())
                .arg("write_flash")
                .arg(format!("0x{:04x}", offset))
                .arg(image.display().to_string())
        }
    };
    Ok(invocation)
}

fn confirm_line(request: &StepRequest<'_>, line: &str) -> Option<Confirmation> {
    match request.kind {
        StepKind::Erase => marker::erase_confirmed(line).then_some(Confirmation::Erased),
        StepKind::ReadMac => marker::parse_mac_line(line).map(Confirmation::Mac),
        kind => {
            let offset = kind.offset(request.chip)?;
            marker::write_confirmed(line, offset).then_some(Confirmation::Wrote { offset })
        }
    }
}

pub struct StepExecutor<R> {
    runner: R,
    tool: ToolCommand,
}

impl<R: ToolRunner> StepExecutor<R> {
    pub fn new(runner: R, tool: ToolCommand) -> Self {
        Self { runner, tool }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: ToolRunner> FlashSteps for StepExecutor<R> {
    fn execute(&mut self, request: &StepRequest<'_>) -> Result<Confirmation, StepError> {
        let invocation = step_invocation(&self.tool, request)?;
        debug!(step = %request.kind, port = request.port, "executing step");
        let mut confirmation = None;
        let exit = self
            .runner
            .run(&invocation, &mut |line| match confirm_line(request, line) {
                Some(found) => {
                    confirmation = Some(found);
                    true
                }
                None => false,
            })
            .map_err(|err| match err {
                RunnerError::Spawn(source) => StepError::ToolUnavailable {
                    program: invocation.program.clone(),
                    reason: source.to_string(),
                },
                RunnerError::Io(source) => StepError::Io {
                    step: request.kind,
                    reason: source.to_string(),
                },
            })?;

        // A marker seen before a timeout still counts: the write landed.
        if let Some(found) = confirmation {
            return Ok(found);
        }
        if exit.timed_out {
            return Err(StepError::TimedOut { step: request.kind });
        }
        warn!(step = %request.kind, port = request.port, exit_code = ?exit.exit_code, "step not confirmed");
        Err(StepError::MarkerAbsent {
            step: request.kind,
            exit_code: exit.exit_code,
        })
    }
}
