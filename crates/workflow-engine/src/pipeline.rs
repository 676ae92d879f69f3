use espbatch_core::{BaudRate, FirmwareProfile};
use espbatch_esptool::{FlashSteps, StepError, StepKind, StepRequest};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Write steps applied to every device, in order.
pub const PIPELINE_STEPS: [StepKind; 5] = [
    StepKind::WriteBootloader,
    StepKind::WritePartitionTable,
    StepKind::WriteOtaInit,
    StepKind::WriteFirmware,
    StepKind::WriteNvs,
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{step} failed: {error}")]
pub struct PipelineFailure {
    pub step: StepKind,
    pub error: StepError,
}

#[derive(Debug, Clone, Copy)]
pub struct FlashJob<'a> {
    pub port: &'a str,
    pub baud: BaudRate,
    pub firmware: &'a Path,
    pub profile: &'a FirmwareProfile,
    pub config_blob: &'a Path,
}

/// Flashes one device. Stops at the first step the tool does not confirm.
pub fn run(steps: &mut dyn FlashSteps, job: &FlashJob<'_>) -> Result<(), PipelineFailure> {
    let bootloader = job.profile.bootloader_path();
    let partition_table = job.profile.partition_table_path();
    let ota_init = job.profile.ota_init_path();

    for step in PIPELINE_STEPS {
        let image = match step {
            StepKind::WriteBootloader => bootloader.as_path(),
            StepKind::WritePartitionTable => partition_table.as_path(),
            StepKind::WriteOtaInit => ota_init.as_path(),
            StepKind::WriteFirmware => job.firmware,
            _ => job.config_blob,
        };
        debug!(port = job.port, step = %step, image = %image.display(), "pipeline step");
        let request = StepRequest::write(step, job.port, job.baud, job.profile.chip, image);
        if let Err(error) = steps.execute(&request) {
            warn!(port = job.port, step = %step, error = %error, "pipeline aborted");
            return Err(PipelineFailure { step, error });
        }
    }
    info!(port = job.port, "device flashed");
    Ok(())
}
