#![allow(dead_code)]

use espbatch_core::{BaudRate, ChipFamily, FirmwareProfile, ProvisionRecord, Roster};
use espbatch_esptool::{Confirmation, FlashSteps, StepError, StepKind, StepRequest};
use espbatch_identity::DeviceIdentity;
use espbatch_nvs::{BlobGenerator, NvsError};
use espbatch_uplink::RegistrationSink;
use espbatch_workflow_engine::{FlashRequest, Orchestrator, RunProgress};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

pub const PORT_A: &str = "/dev/ttyUSB0";
pub const PORT_B: &str = "/dev/ttyUSB1";
pub const PORT_C: &str = "/dev/ttyUSB2";

#[derive(Default)]
pub struct FakeSteps {
    pub failures: HashMap<(String, StepKind), StepError>,
    pub macs: HashMap<String, String>,
    pub calls: Vec<(String, StepKind)>,
}

impl FakeSteps {
    pub fn fail(mut self, port: &str, step: StepKind) -> Self {
        self.failures.insert(
            (port.to_string(), step),
            StepError::MarkerAbsent {
                step,
                exit_code: Some(2),
            },
        );
        self
    }

    pub fn calls_on(&self, port: &str) -> Vec<StepKind> {
        self.calls
            .iter()
            .filter(|(seen, _)| seen == port)
            .map(|(_, kind)| *kind)
            .collect()
    }
}

impl FlashSteps for FakeSteps {
    fn execute(&mut self, request: &StepRequest<'_>) -> Result<Confirmation, StepError> {
        self.calls.push((request.port.to_string(), request.kind));
        if let Some(error) = self.failures.get(&(request.port.to_string(), request.kind)) {
            return Err(error.clone());
        }
        Ok(match request.kind {
            StepKind::Erase => Confirmation::Erased,
            StepKind::ReadMac => Confirmation::Mac(
                self.macs
                    .get(request.port)
                    .cloned()
                    .unwrap_or_else(|| "AABBCCDDEEFF".to_string()),
            ),
            _ => Confirmation::Wrote { offset: 0 },
        })
    }
}

#[derive(Default)]
pub struct FakeBlobs {
    pub generated: Vec<String>,
    /// Identities whose next generation fails; consumed on use unless `sticky`.
    pub failing: BTreeSet<String>,
    pub sticky: bool,
    pub fail_all: bool,
}

impl FakeBlobs {
    pub fn failing_once(identity: &str) -> Self {
        Self {
            failing: BTreeSet::from([identity.to_string()]),
            ..Self::default()
        }
    }

    pub fn failing_always(identity: &str) -> Self {
        Self {
            sticky: true,
            ..Self::failing_once(identity)
        }
    }
}

impl BlobGenerator for FakeBlobs {
    fn generate(&mut self, identity: &DeviceIdentity) -> Result<PathBuf, NvsError> {
        let text = identity.to_string();
        let fails = self.fail_all
            || if self.sticky {
                self.failing.contains(&text)
            } else {
                self.failing.remove(&text)
            };
        if fails {
            return Err(NvsError::NotCreated {
                exit_code: Some(1),
                timed_out: false,
            });
        }
        self.generated.push(text);
        Ok(PathBuf::from("bins/nvs.bin"))
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub submitted: Mutex<Vec<ProvisionRecord>>,
}

impl FakeSink {
    pub fn submitted(&self) -> Vec<ProvisionRecord> {
        self.submitted.lock().map(|list| list.clone()).unwrap_or_default()
    }
}

impl RegistrationSink for FakeSink {
    fn submit(&self, record: &ProvisionRecord) {
        if let Ok(mut list) = self.submitted.lock() {
            list.push(record.clone());
        }
    }
}

pub type TestStation = Orchestrator<FakeSteps, FakeBlobs, FakeSink>;

/// `(enabled, port)` per slot, slot 1 first.
pub fn station(slots: &[(bool, Option<&str>)], steps: FakeSteps, blobs: FakeBlobs) -> TestStation {
    let mut roster = Roster::new(slots.len());
    for (position, (enabled, port)) in slots.iter().enumerate() {
        roster
            .assign(position + 1, *enabled, port.map(str::to_string))
            .unwrap();
    }
    Orchestrator::new(roster, steps, blobs, FakeSink::default())
}

pub fn flash_request(prefix: &str, sequence: &str) -> FlashRequest {
    FlashRequest {
        baud: BaudRate::default(),
        profile: FirmwareProfile::new(ChipFamily::Esp32c3, "bins"),
        firmware: PathBuf::from("build/app.bin"),
        prefix: prefix.to_string(),
        sequence: sequence.to_string(),
    }
}

/// Ticks until the run settles and returns the final progress.
pub fn run_to_end(station: &mut TestStation) -> RunProgress {
    for _ in 0..1000 {
        let outcome = station.tick();
        if outcome.progress != RunProgress::Running {
            return outcome.progress;
        }
    }
    panic!("run did not settle");
}
