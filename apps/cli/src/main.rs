use anyhow::{anyhow, Context, Result};
use clap::Parser;
use espbatch_core::SlotStatus;
use espbatch_esptool::{ProcessRunner, StepExecutor};
use espbatch_host_ports::list_serial_ports;
use espbatch_identity::{DeviceIdentity, SEQUENCE_DIGITS};
use espbatch_nvs::{BlobGenerator, NvsGenerator};
use espbatch_report::{create_run_report, RunSummary};
use espbatch_station::{load_or_default, StationConfig};
use espbatch_uplink::UplinkDispatcher;
use espbatch_workflow_engine::{
    drive, EraseParams, FlashRequest, Orchestrator, RunObserver, SlotOutcome, WorkerOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

mod cli;

use crate::cli::{Cli, Command, FlashArgs, NvsArgs, StationArgs};

type Station =
    Orchestrator<StepExecutor<ProcessRunner>, NvsGenerator<ProcessRunner>, UplinkDispatcher>;

fn initialize_tracing() {
    // RUST_LOG overrides the default level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();
}

fn main() -> Result<()> {
    initialize_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Ports => {
            for port in list_serial_ports()? {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Erase(args) => erase(&args),
        Command::Flash(args) => flash(&args),
        Command::Nvs(args) => nvs(&args),
    }
}

fn load_config(args: &StationArgs) -> Result<StationConfig> {
    let mut config = load_or_default(args.config.as_deref())?;
    if let Some(baud) = args.baud {
        config.baud = baud;
    }
    if let Some(chip) = args.chip {
        config.chip = chip;
    }
    for assignment in &args.slots {
        config.assign_slot(assignment.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_station(config: &StationConfig, check_ports: bool) -> Result<Station> {
    let steps = StepExecutor::new(
        ProcessRunner::new(config.step_timeout()),
        config.tool.esptool.clone(),
    );
    let blobs = NvsGenerator::new(ProcessRunner::new(config.step_timeout()), config.nvs.clone());
    let uplink =
        UplinkDispatcher::spawn(config.uplink.clone()).context("starting registration uplink")?;
    let mut station = Orchestrator::new(config.roster()?, steps, blobs, uplink);
    if check_ports {
        let ports = list_serial_ports().context("enumerating serial ports")?;
        info!(count = ports.len(), "serial ports found");
        station.set_available_ports(Some(ports))?;
    }
    Ok(station)
}

struct PrintObserver;

impl RunObserver for PrintObserver {
    fn on_slot(&mut self, outcome: &SlotOutcome) -> bool {
        println!(
            "slot {:>2} {:<16} {:<8} {}",
            outcome.index,
            outcome.port.as_deref().unwrap_or("-"),
            outcome.status(),
            outcome.result
        );
        true
    }

    fn on_finished(&mut self, summary: Option<&RunSummary>) {
        if let Some(summary) = summary {
            println!("run_id: {}", summary.run_id);
            if summary.aborted {
                println!("run aborted");
            }
        }
    }
}

/// Exit code used when a second Ctrl-C forces the process down.
const FORCED_EXIT_CODE: i32 = 130;

/// Records an interrupt. Returns `true` when one was already pending.
fn note_interrupt(abort: &AtomicBool) -> bool {
    abort.swap(true, Ordering::SeqCst)
}

/// First Ctrl-C stops the run after the slot in progress; a second one exits.
fn install_abort_handler() -> Arc<AtomicBool> {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    let installed = ctrlc::set_handler(move || {
        if note_interrupt(&flag) {
            eprintln!("interrupted twice, exiting");
            std::process::exit(FORCED_EXIT_CODE);
        }
        eprintln!("stopping after the current slot, press Ctrl-C again to exit now");
    });
    if let Err(err) = installed {
        warn!(error = %err, "could not install Ctrl-C handler, runs cannot be aborted");
    }
    abort
}

fn run_station(station: &mut Station, abort: &AtomicBool) {
    let mut observer = PrintObserver;
    drive(station, WorkerOptions::default(), abort, Some(&mut observer));
}

fn finish_run(station: &Station, args: Option<&FlashArgs>) -> Result<()> {
    let summary = station
        .last_summary()
        .ok_or_else(|| anyhow!("run finished without a summary"))?;
    if let Some(next) = &summary.next_identity {
        println!("next_identity: {}", next);
    } else if summary.identities_exhausted {
        println!("next_identity: none, sequence exhausted");
    }
    if let Some(args) = args {
        if let Some(export) = &args.export {
            let path = station.registry().export(export)?;
            println!("export: {}", path.display());
        }
        if let Some(base) = &args.report_base {
            let report = create_run_report(base, summary)?;
            println!("report_root: {}", report.root.display());
            println!("run_json: {}", report.run_json.display());
            println!("records_csv: {}", report.records_csv.display());
        }
    }

    let failed = summary
        .slots
        .iter()
        .filter(|slot| slot.status == SlotStatus::Failed)
        .count();
    if failed > 0 {
        return Err(anyhow!("{} slot(s) failed", failed));
    }
    if summary.aborted {
        return Err(anyhow!("run aborted"));
    }
    Ok(())
}

fn erase(args: &StationArgs) -> Result<()> {
    let config = load_config(args)?;
    let mut station = build_station(&config, args.check_ports)?;
    station
        .start_erase(EraseParams {
            baud: config.baud,
            chip: config.chip,
        })
        .ok_or_else(|| anyhow!("a run is already active"))?;
    run_station(&mut station, &install_abort_handler());
    finish_run(&station, None)
}

fn flash(args: &FlashArgs) -> Result<()> {
    let config = load_config(&args.station)?;
    let firmware = args
        .firmware
        .clone()
        .or_else(|| config.firmware.clone())
        .ok_or_else(|| anyhow!("--firmware is required"))?;
    let prefix = args
        .prefix
        .clone()
        .or_else(|| config.prefix.clone())
        .ok_or_else(|| anyhow!("--prefix is required"))?;
    let sequence = args
        .sequence
        .clone()
        .or_else(|| config.sequence.clone())
        .ok_or_else(|| anyhow!("--sequence is required"))?;

    let mut station = build_station(&config, args.station.check_ports)?;
    station
        .start_flash(FlashRequest {
            baud: config.baud,
            profile: config.profile(),
            firmware,
            prefix,
            sequence,
        })
        .context("flash run not started")?
        .ok_or_else(|| anyhow!("a run is already active"))?;
    run_station(&mut station, &install_abort_handler());
    finish_run(&station, Some(args))
}

fn nvs(args: &NvsArgs) -> Result<()> {
    let config = load_or_default(args.config.as_deref())?;
    let identity = split_identity(&args.identity)?;
    let mut generator =
        NvsGenerator::new(ProcessRunner::new(config.step_timeout()), config.nvs.clone());
    let blob = generator
        .generate(&identity)
        .with_context(|| format!("building config blob for {}", identity))?;
    println!("blob: {}", blob.display());
    Ok(())
}

/// Splits `DEV00001` into prefix and sequence.
fn split_identity(text: &str) -> Result<DeviceIdentity> {
    let split = text
        .len()
        .checked_sub(SEQUENCE_DIGITS)
        .filter(|at| text.is_char_boundary(*at))
        .ok_or_else(|| anyhow!("identity {:?} is too short", text))?;
    let (prefix, sequence) = text.split_at(split);
    DeviceIdentity::parse(prefix, sequence).map_err(|err| {
        warn!(identity = text, error = %err, "rejected identity");
        anyhow!(err)
    })
}
