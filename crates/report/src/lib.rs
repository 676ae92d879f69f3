use anyhow::{Context, Result};
use espbatch_core::{csv_record, ProvisionRecord, SlotStatus, RUN_REPORT_SCHEMA_VERSION};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const EXPORT_EXTENSION: &str = ".csv";
pub const EXPORT_HEADER: [&str; 3] = ["No.", "MAC", "Device ID"];

/// Provisioned devices of the current session, in flash order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResultRegistry {
    records: Vec<ProvisionRecord>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, mac: impl Into<String>, device_identity: impl Into<String>) {
        self.records.push(ProvisionRecord::new(mac, device_identity));
    }

    pub fn records(&self) -> &[ProvisionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Operator-initiated only; runs never clear the registry.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn render_csv(&self) -> String {
        render_records(&self.records)
    }

    /// Writes the registry to `destination`, appending `.csv` when missing.
    pub fn export(&self, destination: impl AsRef<Path>) -> Result<PathBuf> {
        let path = export_destination(destination.as_ref());
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, self.render_csv())
            .with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), records = self.records.len(), "exported provision records");
        Ok(path)
    }
}

pub fn export_destination(destination: &Path) -> PathBuf {
    if destination.to_string_lossy().ends_with(EXPORT_EXTENSION) {
        destination.to_path_buf()
    } else {
        let mut name = destination.as_os_str().to_owned();
        name.push(EXPORT_EXTENSION);
        PathBuf::from(name)
    }
}

fn render_records(records: &[ProvisionRecord]) -> String {
    let mut out = csv_record(&EXPORT_HEADER);
    for (ordinal, record) in records.iter().enumerate() {
        out.push_str(&csv_record(&[
            (ordinal + 1).to_string().as_str(),
            record.mac.as_str(),
            record.device_identity.as_str(),
        ]));
    }
    out
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    pub index: usize,
    pub port: Option<String>,
    pub status: SlotStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub aborted: bool,
    /// `None` for erase runs and once the sequence is used up.
    pub next_identity: Option<String>,
    pub identities_exhausted: bool,
    pub slots: Vec<SlotSummary>,
    pub records: Vec<ProvisionRecord>,
}

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub run_json: PathBuf,
    pub records_csv: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunDocument<'a> {
    schema_version: &'static str,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

/// Writes `reports/<run_id>/run.json` and `records.csv` under `base`.
pub fn create_run_report(base: impl AsRef<Path>, summary: &RunSummary) -> Result<ReportPaths> {
    let run_id = summary.run_id.to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let run_json = root.join("run.json");
    let records_csv = root.join("records.csv");

    let document = RunDocument {
        schema_version: RUN_REPORT_SCHEMA_VERSION,
        summary,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("write {}", run_json.display()))?;
    std::fs::write(&records_csv, render_records(&summary.records))
        .with_context(|| format!("write {}", records_csv.display()))?;

    Ok(ReportPaths {
        run_id,
        root,
        run_json,
        records_csv,
    })
}
