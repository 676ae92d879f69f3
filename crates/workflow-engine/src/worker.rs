//! Drives an orchestrator until its run settles.

use crate::orchestrator::{Orchestrator, RunProgress, SlotOutcome};
use espbatch_esptool::FlashSteps;
use espbatch_nvs::BlobGenerator;
use espbatch_report::RunSummary;
use espbatch_uplink::RegistrationSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Receives slot results as they settle. Returning `false` asks for an abort.
pub trait RunObserver {
    fn on_slot(&mut self, outcome: &SlotOutcome) -> bool;

    fn on_finished(&mut self, _summary: Option<&RunSummary>) {}
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Pause between two slots.
    pub tick_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(20),
        }
    }
}

/// Ticks until the run completes or aborts. Does nothing when no run is active.
pub fn drive<S, B, U>(
    orchestrator: &mut Orchestrator<S, B, U>,
    options: WorkerOptions,
    abort: &AtomicBool,
    mut observer: Option<&mut dyn RunObserver>,
) -> RunProgress
where
    S: FlashSteps,
    B: BlobGenerator,
    U: RegistrationSink,
{
    loop {
        if abort.load(Ordering::SeqCst) {
            orchestrator.request_abort();
        }
        let outcome = orchestrator.tick();
        for slot in &outcome.slots {
            if let Some(obs) = observer.as_deref_mut() {
                if !obs.on_slot(slot) {
                    debug!(slot = slot.index, "observer requested abort");
                    orchestrator.request_abort();
                }
            }
        }
        match outcome.progress {
            RunProgress::Running => {
                if !options.tick_interval.is_zero() {
                    thread::sleep(options.tick_interval);
                }
            }
            finished => {
                if finished != RunProgress::Idle {
                    if let Some(obs) = observer.as_deref_mut() {
                        obs.on_finished(orchestrator.last_summary());
                    }
                }
                return finished;
            }
        }
    }
}

/// A run driven on its own thread. Joining hands the orchestrator back.
pub struct RunWorker<S, B, U> {
    abort: Arc<AtomicBool>,
    handle: JoinHandle<(Orchestrator<S, B, U>, RunProgress)>,
}

impl<S, B, U> RunWorker<S, B, U> {
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> thread::Result<(Orchestrator<S, B, U>, RunProgress)> {
        self.handle.join()
    }
}

/// Moves a started orchestrator onto a worker thread.
pub fn spawn_run<S, B, U>(
    mut orchestrator: Orchestrator<S, B, U>,
    options: WorkerOptions,
) -> std::io::Result<RunWorker<S, B, U>>
where
    S: FlashSteps + Send + 'static,
    B: BlobGenerator + Send + 'static,
    U: RegistrationSink + Send + 'static,
{
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    let handle = thread::Builder::new()
        .name("espbatch-run".to_string())
        .spawn(move || {
            let progress = drive(&mut orchestrator, options, &flag, None);
            info!(?progress, "worker finished");
            (orchestrator, progress)
        })?;
    Ok(RunWorker { abort, handle })
}
