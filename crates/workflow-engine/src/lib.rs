//! Batch provisioning workflow: the per-device pipeline, the slot state
//! machine and a worker that drives it.

pub mod orchestrator;
pub mod pipeline;
pub mod worker;

pub use orchestrator::{
    Collaborators, EraseParams, FlashParams, FlashRequest, IgnoreReason, Orchestrator, RosterError,
    RunHandle, RunMode, RunProgress, RunState, SlotOutcome, SlotResult, StartError, TickOutcome,
};
pub use pipeline::{FlashJob, PipelineFailure, PIPELINE_STEPS};
pub use worker::{drive, spawn_run, RunObserver, RunWorker, WorkerOptions};
