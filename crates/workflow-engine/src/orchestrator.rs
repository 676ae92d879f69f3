//! Slot-by-slot batch state machine.
//!
//! A run walks the roster from slot 1 to slot N, one slot per [`tick`].
//! Every slot ends the run as Ignored, Success or Failed; a failure on one
//! slot never changes the outcome of another.

use crate::pipeline::{self, FlashJob, PipelineFailure};
use espbatch_core::{
    now_utc_rfc3339, BaudRate, ChipFamily, DeviceSlot, FirmwareProfile, ModelError,
    ProvisionRecord, Roster, SlotStatus,
};
use espbatch_esptool::{Confirmation, FlashSteps, StepError, StepKind, StepRequest};
use espbatch_identity::{validate_firmware_path, DeviceIdentity, ValidationError};
use espbatch_nvs::{BlobGenerator, NvsError};
use espbatch_report::{ResultRegistry, RunSummary, SlotSummary};
use espbatch_uplink::RegistrationSink;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseParams {
    pub baud: BaudRate,
    pub chip: ChipFamily,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashParams {
    pub baud: BaudRate,
    pub profile: FirmwareProfile,
    pub firmware: PathBuf,
    /// Identity the next provisioned device receives.
    pub identity: DeviceIdentity,
    /// Blob compiled for `identity`; `None` when it has to be regenerated.
    pub config_blob: Option<PathBuf>,
    /// Set once `identity` has been assigned and no successor exists.
    pub identities_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Idle,
    Erasing(EraseParams),
    Flashing(FlashParams),
}

impl RunMode {
    pub fn is_idle(&self) -> bool {
        matches!(self, RunMode::Idle)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Idle => "idle",
            RunMode::Erasing(_) => "erase",
            RunMode::Flashing(_) => "flash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunState {
    pub mode: RunMode,
    /// Next slot to process, 1-based. Past the roster end means the run is done.
    pub cursor: usize,
    pub abort_requested: bool,
}

impl RunState {
    fn started(mode: RunMode) -> Self {
        Self {
            mode,
            cursor: 1,
            abort_requested: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub baud: BaudRate,
    pub profile: FirmwareProfile,
    pub firmware: PathBuf,
    pub prefix: String,
    pub sequence: String,
}

/// Proof that a run was started; only handed out when the orchestrator was idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub mode: &'static str,
    pub started_at_utc: String,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("initial config blob could not be generated: {0}")]
    ConfigBlob(#[from] NvsError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("the roster cannot change while a run is active")]
    Busy,
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Disabled,
    NoPort,
    PortUnavailable,
    Aborted,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IgnoreReason::Disabled => "slot not selected",
            IgnoreReason::NoPort => "no port assigned",
            IgnoreReason::PortUnavailable => "port not connected",
            IgnoreReason::Aborted => "run aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotResult {
    Ignored(IgnoreReason),
    Erased,
    EraseFailed(StepError),
    Provisioned(ProvisionRecord),
    FlashFailed(PipelineFailure),
    MacUnavailable(StepError),
    ConfigBlobUnavailable(String),
    IdentitiesExhausted,
}

impl SlotResult {
    pub fn status(&self) -> SlotStatus {
        match self {
            SlotResult::Ignored(_) => SlotStatus::Ignored,
            SlotResult::Erased | SlotResult::Provisioned(_) => SlotStatus::Success,
            SlotResult::EraseFailed(_)
            | SlotResult::FlashFailed(_)
            | SlotResult::MacUnavailable(_)
            | SlotResult::ConfigBlobUnavailable(_)
            | SlotResult::IdentitiesExhausted => SlotStatus::Failed,
        }
    }

    /// The step that failed, when the failure came from the tool.
    pub fn failed_step(&self) -> Option<StepKind> {
        match self {
            SlotResult::EraseFailed(_) => Some(StepKind::Erase),
            SlotResult::FlashFailed(failure) => Some(failure.step),
            SlotResult::MacUnavailable(_) => Some(StepKind::ReadMac),
            _ => None,
        }
    }
}

impl fmt::Display for SlotResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotResult::Ignored(reason) => write!(f, "ignored: {}", reason),
            SlotResult::Erased => f.write_str("erased"),
            SlotResult::EraseFailed(error) => write!(f, "erase failed: {}", error),
            SlotResult::Provisioned(record) => {
                write!(f, "provisioned {} ({})", record.device_identity, record.mac)
            }
            SlotResult::FlashFailed(failure) => write!(f, "flash failed: {}", failure),
            SlotResult::MacUnavailable(error) => write!(f, "mac read failed: {}", error),
            SlotResult::ConfigBlobUnavailable(reason) => {
                write!(f, "config blob unavailable: {}", reason)
            }
            SlotResult::IdentitiesExhausted => f.write_str("no device identities left"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOutcome {
    pub index: usize,
    pub port: Option<String>,
    pub result: SlotResult,
}

impl SlotOutcome {
    pub fn status(&self) -> SlotStatus {
        self.result.status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunProgress {
    /// No run is active; the tick did nothing.
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub slots: Vec<SlotOutcome>,
    pub progress: RunProgress,
    /// Identity the next device of a flash run would receive, as of the end of this tick.
    pub next_identity: Option<DeviceIdentity>,
    /// The sequence is used up; no identity is left for another device.
    pub identities_exhausted: bool,
}

impl TickOutcome {
    fn idle() -> Self {
        Self {
            slots: Vec::new(),
            progress: RunProgress::Idle,
            next_identity: None,
            identities_exhausted: false,
        }
    }
}

/// Everything a tick may touch besides the run state and the slots.
pub struct Collaborators<'a> {
    pub steps: &'a mut dyn FlashSteps,
    pub blobs: &'a mut dyn BlobGenerator,
    pub registry: &'a mut ResultRegistry,
    pub uplink: &'a dyn RegistrationSink,
    /// Ports seen by the last enumeration; `None` skips the check.
    pub available_ports: Option<&'a BTreeSet<String>>,
}

/// Processes the slot under the cursor and advances the cursor by one.
pub fn tick(
    mut state: RunState,
    mut slots: Vec<DeviceSlot>,
    env: &mut Collaborators<'_>,
) -> (RunState, Vec<DeviceSlot>, TickOutcome) {
    if state.mode.is_idle() {
        return (state, slots, TickOutcome::idle());
    }

    if state.abort_requested {
        let skipped = slots
            .iter_mut()
            .skip(state.cursor.saturating_sub(1))
            .map(|slot| {
                slot.status = SlotStatus::Ignored;
                SlotOutcome {
                    index: slot.index,
                    port: slot.assigned_port().map(str::to_string),
                    result: SlotResult::Ignored(IgnoreReason::Aborted),
                }
            })
            .collect();
        info!(cursor = state.cursor, "run aborted");
        let next_identity = flash_identity(&state.mode);
        let identities_exhausted = sequence_exhausted(&state.mode);
        let finished = RunState {
            mode: RunMode::Idle,
            cursor: slots.len() + 1,
            abort_requested: false,
        };
        return (
            finished,
            slots,
            TickOutcome {
                slots: skipped,
                progress: RunProgress::Aborted,
                next_identity,
                identities_exhausted,
            },
        );
    }

    let mut processed = Vec::new();
    if let Some(slot) = state
        .cursor
        .checked_sub(1)
        .and_then(|position| slots.get_mut(position))
    {
        if let Some(outcome) = process_slot(&mut state.mode, slot, env) {
            slot.status = outcome.status();
            info!(slot = outcome.index, status = %slot.status, result = %outcome.result, "slot done");
            processed.push(outcome);
        }
    }

    state.cursor += 1;
    let next_identity = flash_identity(&state.mode);
    let identities_exhausted = sequence_exhausted(&state.mode);
    let progress = if state.cursor > slots.len() {
        info!(mode = state.mode.label(), "run finished");
        state.mode = RunMode::Idle;
        state.abort_requested = false;
        RunProgress::Completed
    } else {
        RunProgress::Running
    };

    (
        state,
        slots,
        TickOutcome {
            slots: processed,
            progress,
            next_identity,
            identities_exhausted,
        },
    )
}

fn flash_identity(mode: &RunMode) -> Option<DeviceIdentity> {
    match mode {
        RunMode::Flashing(params) if !params.identities_exhausted => Some(params.identity.clone()),
        _ => None,
    }
}

fn sequence_exhausted(mode: &RunMode) -> bool {
    matches!(mode, RunMode::Flashing(params) if params.identities_exhausted)
}

fn eligible_port<'s>(
    slot: &'s DeviceSlot,
    available: Option<&BTreeSet<String>>,
) -> Result<&'s str, IgnoreReason> {
    if !slot.enabled {
        return Err(IgnoreReason::Disabled);
    }
    let port = slot.assigned_port().ok_or(IgnoreReason::NoPort)?;
    if available.is_some_and(|ports| !ports.contains(port)) {
        return Err(IgnoreReason::PortUnavailable);
    }
    Ok(port)
}

fn process_slot(
    mode: &mut RunMode,
    slot: &DeviceSlot,
    env: &mut Collaborators<'_>,
) -> Option<SlotOutcome> {
    let port = match eligible_port(slot, env.available_ports) {
        Ok(port) => port,
        Err(reason) => {
            return Some(SlotOutcome {
                index: slot.index,
                port: slot.assigned_port().map(str::to_string),
                result: SlotResult::Ignored(reason),
            })
        }
    };

    let result = match mode {
        RunMode::Idle => return None,
        RunMode::Erasing(params) => {
            info!(slot = slot.index, port, "erasing");
            match env
                .steps
                .execute(&StepRequest::erase(port, params.baud, params.chip))
            {
                Ok(_) => SlotResult::Erased,
                Err(error) => SlotResult::EraseFailed(error),
            }
        }
        RunMode::Flashing(params) => {
            info!(slot = slot.index, port, identity = %params.identity, "flashing");
            flash_slot(params, port, env)
        }
    };

    Some(SlotOutcome {
        index: slot.index,
        port: Some(port.to_string()),
        result,
    })
}

fn flash_slot(params: &mut FlashParams, port: &str, env: &mut Collaborators<'_>) -> SlotResult {
    if params.identities_exhausted {
        return SlotResult::IdentitiesExhausted;
    }

    let config_blob = match params.config_blob.clone() {
        Some(blob) => blob,
        None => match env.blobs.generate(&params.identity) {
            Ok(blob) => {
                params.config_blob = Some(blob.clone());
                blob
            }
            Err(error) => return SlotResult::ConfigBlobUnavailable(error.to_string()),
        },
    };

    let job = FlashJob {
        port,
        baud: params.baud,
        firmware: &params.firmware,
        profile: &params.profile,
        config_blob: &config_blob,
    };
    if let Err(failure) = pipeline::run(&mut *env.steps, &job) {
        return SlotResult::FlashFailed(failure);
    }

    let mac = match env
        .steps
        .execute(&StepRequest::read_mac(port, params.baud, params.profile.chip))
    {
        Ok(Confirmation::Mac(mac)) => mac,
        Ok(_) => {
            return SlotResult::MacUnavailable(StepError::MarkerAbsent {
                step: StepKind::ReadMac,
                exit_code: None,
            })
        }
        Err(error) => return SlotResult::MacUnavailable(error),
    };

    let record = ProvisionRecord::new(mac, params.identity.to_string());
    env.registry
        .record(record.mac.clone(), record.device_identity.clone());
    env.uplink.submit(&record);

    // The blob on disk always belongs to the device that is flashed next.
    match params.identity.next() {
        Ok(next) => {
            params.identity = next;
            params.config_blob = match env.blobs.generate(&params.identity) {
                Ok(blob) => Some(blob),
                Err(error) => {
                    warn!(identity = %params.identity, error = %error, "pre-generating config blob failed");
                    None
                }
            };
        }
        Err(error) => {
            warn!(error = %error, "device identities exhausted");
            params.identities_exhausted = true;
            params.config_blob = None;
        }
    }

    SlotResult::Provisioned(record)
}

struct ActiveRun {
    handle: RunHandle,
    records_at_start: usize,
    outcomes: Vec<SlotOutcome>,
    identities_exhausted: bool,
}

/// Owns the roster, the run state and the collaborators of one station.
pub struct Orchestrator<S, B, U> {
    state: RunState,
    roster: Roster,
    steps: S,
    blobs: B,
    uplink: U,
    registry: ResultRegistry,
    available_ports: Option<BTreeSet<String>>,
    identity: Option<DeviceIdentity>,
    active: Option<ActiveRun>,
    last_summary: Option<RunSummary>,
}

impl<S, B, U> Orchestrator<S, B, U>
where
    S: FlashSteps,
    B: BlobGenerator,
    U: RegistrationSink,
{
    pub fn new(roster: Roster, steps: S, blobs: B, uplink: U) -> Self {
        Self {
            state: RunState::default(),
            roster,
            steps,
            blobs,
            uplink,
            registry: ResultRegistry::new(),
            available_ports: None,
            identity: None,
            active: None,
            last_summary: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state.mode.is_idle()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn registry(&self) -> &ResultRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResultRegistry {
        &mut self.registry
    }

    pub fn steps(&self) -> &S {
        &self.steps
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    /// Identity the next flashed device will receive; `None` once the sequence is used up.
    pub fn current_identity(&self) -> Option<&DeviceIdentity> {
        match &self.state.mode {
            RunMode::Flashing(params) if params.identities_exhausted => None,
            RunMode::Flashing(params) => Some(&params.identity),
            _ => self.identity.as_ref(),
        }
    }

    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    pub fn configure_slot(
        &mut self,
        index: usize,
        enabled: bool,
        port: Option<String>,
    ) -> Result<(), RosterError> {
        if !self.is_idle() {
            return Err(RosterError::Busy);
        }
        self.roster.assign(index, enabled, port)?;
        Ok(())
    }

    /// Records which ports the last enumeration found. Enumeration opens ports,
    /// so it is only accepted between runs.
    pub fn set_available_ports<I>(&mut self, ports: Option<I>) -> Result<(), RosterError>
    where
        I: IntoIterator<Item = String>,
    {
        if !self.is_idle() {
            return Err(RosterError::Busy);
        }
        self.available_ports = ports.map(|ports| ports.into_iter().collect());
        Ok(())
    }

    pub fn start_erase(&mut self, params: EraseParams) -> Option<RunHandle> {
        if !self.is_idle() {
            return None;
        }
        Some(self.begin(RunMode::Erasing(params)))
    }

    /// Validates operator input and compiles the blob for the first device
    /// before leaving Idle. Returns `Ok(None)` when a run is already active.
    pub fn start_flash(&mut self, request: FlashRequest) -> Result<Option<RunHandle>, StartError> {
        if !self.is_idle() {
            return Ok(None);
        }
        let identity = DeviceIdentity::parse(&request.prefix, &request.sequence)?;
        validate_firmware_path(&request.firmware)?;
        let config_blob = self.blobs.generate(&identity)?;

        let params = FlashParams {
            baud: request.baud,
            profile: request.profile,
            firmware: request.firmware,
            identity,
            config_blob: Some(config_blob),
            identities_exhausted: false,
        };
        Ok(Some(self.begin(RunMode::Flashing(params))))
    }

    fn begin(&mut self, mode: RunMode) -> RunHandle {
        let handle = RunHandle {
            run_id: Uuid::new_v4(),
            mode: mode.label(),
            started_at_utc: now_utc_rfc3339(),
        };
        info!(run_id = %handle.run_id, mode = handle.mode, slots = self.roster.len(), "run started");
        self.roster.reset_statuses();
        self.state = RunState::started(mode);
        self.active = Some(ActiveRun {
            handle: handle.clone(),
            records_at_start: self.registry.len(),
            outcomes: Vec::new(),
            identities_exhausted: false,
        });
        handle
    }

    /// Ends the run before the next slot; the slot in progress is not interrupted.
    pub fn request_abort(&mut self) {
        if !self.is_idle() {
            self.state.abort_requested = true;
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        let state = std::mem::take(&mut self.state);
        let slots = std::mem::replace(&mut self.roster, Roster::from_slots(Vec::new())).into_slots();
        let mut env = Collaborators {
            steps: &mut self.steps,
            blobs: &mut self.blobs,
            registry: &mut self.registry,
            uplink: &self.uplink,
            available_ports: self.available_ports.as_ref(),
        };
        let (state, slots, outcome) = tick(state, slots, &mut env);
        self.state = state;
        self.roster = Roster::from_slots(slots);

        if outcome.identities_exhausted {
            self.identity = None;
        } else if let Some(identity) = &outcome.next_identity {
            self.identity = Some(identity.clone());
        }
        if let Some(active) = self.active.as_mut() {
            active.outcomes.extend(outcome.slots.iter().cloned());
            active.identities_exhausted |= outcome.identities_exhausted;
        }
        if matches!(outcome.progress, RunProgress::Completed | RunProgress::Aborted) {
            self.finish(outcome.progress == RunProgress::Aborted);
        }
        outcome
    }

    fn finish(&mut self, aborted: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        let slots = self
            .roster
            .slots()
            .iter()
            .map(|slot| {
                let outcome = active.outcomes.iter().find(|outcome| outcome.index == slot.index);
                SlotSummary {
                    index: slot.index,
                    port: slot.assigned_port().map(str::to_string),
                    status: slot.status,
                    detail: outcome.map(|outcome| outcome.result.to_string()),
                }
            })
            .collect();
        let records = self
            .registry
            .records()
            .get(active.records_at_start..)
            .map(<[ProvisionRecord]>::to_vec)
            .unwrap_or_default();
        let next_identity = if active.handle.mode == "flash" {
            self.identity.as_ref().map(ToString::to_string)
        } else {
            None
        };
        self.last_summary = Some(RunSummary {
            run_id: active.handle.run_id,
            mode: active.handle.mode.to_string(),
            started_at_utc: active.handle.started_at_utc,
            finished_at_utc: now_utc_rfc3339(),
            aborted,
            next_identity,
            identities_exhausted: active.identities_exhausted,
            slots,
            records,
        });
    }
}
