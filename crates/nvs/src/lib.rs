//! Per-device NVS configuration blob carrying the device identity.

use espbatch_core::csv_record;
use espbatch_esptool::{Invocation, RunnerError, ToolCommand, ToolRunner};
use espbatch_identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_NAMESPACE: &str = "nvs_store";
pub const DEFAULT_PARTITION_SIZE: u32 = 0x4000;
const CREATED_MARKER: &str = "Created NVS binary";

#[derive(Debug, Error)]
pub enum NvsError {
    #[error("writing staging file {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("blob compiler {program} could not be started: {reason}")]
    CompilerUnavailable { program: String, reason: String },
    #[error("blob compiler did not confirm creation (exit code {exit_code:?}, timed out: {timed_out})")]
    NotCreated {
        exit_code: Option<i32>,
        timed_out: bool,
    },
    #[error("blob compiler i/o failed: {0}")]
    Io(String),
}

/// Produces the config blob for an identity and returns where it was written.
pub trait BlobGenerator {
    fn generate(&mut self, identity: &DeviceIdentity) -> Result<PathBuf, NvsError>;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NvsSettings {
    pub namespace: String,
    pub staging_csv: PathBuf,
    pub blob: PathBuf,
    pub partition_size: u32,
    pub compiler: ToolCommand,
}

impl Default for NvsSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            staging_csv: PathBuf::from("bins/nvs.csv"),
            blob: PathBuf::from("bins/nvs.bin"),
            partition_size: DEFAULT_PARTITION_SIZE,
            compiler: ToolCommand {
                program: "python".to_string(),
                args: vec!["tools/nvs_partition_gen.py".to_string()],
                cwd: None,
            },
        }
    }
}

/// Staging table handed to the blob compiler: a namespace row and the `deviceid` entry.
pub fn staging_contents(namespace: &str, identity: &DeviceIdentity) -> String {
    let identity = identity.to_string();
    let mut contents = String::new();
    contents.push_str(&csv_record(&["key", "type", "encoding", "value"]));
    contents.push_str(&csv_record(&[namespace, "namespace", "", ""]));
    contents.push_str(&csv_record(&["deviceid", "data", "string", identity.as_str()]));
    contents
}

pub fn write_staging(path: &Path, namespace: &str, identity: &DeviceIdentity) -> Result<(), NvsError> {
    let staging_err = |source| NvsError::Staging {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(staging_err)?;
    }
    fs::write(path, staging_contents(namespace, identity)).map_err(staging_err)
}

pub struct NvsGenerator<R> {
    runner: R,
    settings: NvsSettings,
}

impl<R: ToolRunner> NvsGenerator<R> {
    pub fn new(runner: R, settings: NvsSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &NvsSettings {
        &self.settings
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn compiler_invocation(&self) -> Invocation {
        self.settings
            .compiler
            .invocation()
            .arg("generate")
            .arg(self.settings.staging_csv.display().to_string())
            .arg(self.settings.blob.display().to_string())
            .arg(format!("0x{:x}", self.settings.partition_size))
    }
}

impl<R: ToolRunner> BlobGenerator for NvsGenerator<R> {
    fn generate(&mut self, identity: &DeviceIdentity) -> Result<PathBuf, NvsError> {
        info!(identity = %identity, "creating nvs config blob");
        write_staging(&self.settings.staging_csv, &self.settings.namespace, identity)?;

        let invocation = self.compiler_invocation();
        let exit = self
            .runner
            .run(&invocation, &mut |line| line.contains(CREATED_MARKER))
            .map_err(|err| match err {
                RunnerError::Spawn(source) => NvsError::CompilerUnavailable {
                    program: invocation.program.clone(),
                    reason: source.to_string(),
                },
                RunnerError::Io(source) => NvsError::Io(source.to_string()),
            })?;
        if !exit.matched {
            warn!(identity = %identity, exit_code = ?exit.exit_code, "nvs blob not created");
            return Err(NvsError::NotCreated {
                exit_code: exit.exit_code,
                timed_out: exit.timed_out,
            });
        }
        Ok(self.settings.blob.clone())
    }
}
