mod common;

use common::*;
use espbatch_core::{BaudRate, ChipFamily, ProvisionRecord, SlotStatus};
use espbatch_esptool::StepKind;
use espbatch_identity::ValidationError;
use espbatch_workflow_engine::{
    EraseParams, IgnoreReason, RosterError, RunMode, RunProgress, SlotResult, StartError,
    PIPELINE_STEPS,
};
use std::path::PathBuf;

fn statuses(station: &TestStation) -> Vec<SlotStatus> {
    station.roster().slots().iter().map(|slot| slot.status).collect()
}

#[test]
fn mixed_batch_settles_every_slot_independently() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B)), (false, Some(PORT_C))],
        FakeSteps::default().fail(PORT_B, StepKind::WriteBootloader),
        FakeBlobs::default(),
    );
    let handle = station.start_flash(flash_request("DEV", "00001")).unwrap();
    assert_eq!(handle.map(|handle| handle.mode), Some("flash"));

    let first = station.tick();
    assert_eq!(first.progress, RunProgress::Running);
    assert_eq!(first.slots.len(), 1);
    assert_eq!(
        first.slots[0].result,
        SlotResult::Provisioned(ProvisionRecord::new("AABBCCDDEEFF", "DEV00001"))
    );

    let second = station.tick();
    assert_eq!(second.progress, RunProgress::Running);
    assert_eq!(second.slots[0].result.failed_step(), Some(StepKind::WriteBootloader));

    let third = station.tick();
    assert_eq!(third.progress, RunProgress::Completed);
    assert_eq!(third.slots[0].result, SlotResult::Ignored(IgnoreReason::Disabled));

    assert_eq!(
        statuses(&station),
        vec![SlotStatus::Success, SlotStatus::Failed, SlotStatus::Ignored]
    );
    assert!(station.is_idle());
    assert_eq!(
        station.registry().records(),
        &[ProvisionRecord::new("AABBCCDDEEFF", "DEV00001")]
    );
    assert_eq!(
        station.current_identity().map(ToString::to_string).as_deref(),
        Some("DEV00002")
    );
    assert_eq!(station.blobs().generated, vec!["DEV00001", "DEV00002"]);
    assert_eq!(station.uplink().submitted().len(), 1);

    let mut expected_a: Vec<StepKind> = PIPELINE_STEPS.to_vec();
    expected_a.push(StepKind::ReadMac);
    assert_eq!(station.steps().calls_on(PORT_A), expected_a);
    assert_eq!(station.steps().calls_on(PORT_B), vec![StepKind::WriteBootloader]);
    assert!(station.steps().calls_on(PORT_C).is_empty());

    let summary = station.last_summary().unwrap();
    assert!(!summary.aborted);
    assert_eq!(summary.mode, "flash");
    assert_eq!(summary.next_identity.as_deref(), Some("DEV00002"));
    assert_eq!(summary.records.len(), 1);
    assert_eq!(summary.slots.len(), 3);
    assert!(summary.slots[1].detail.as_deref().unwrap().contains("bootloader"));
}

#[test]
fn second_start_while_running_is_ignored() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station.start_flash(flash_request("DEV", "00001")).unwrap().unwrap();
    station.tick();
    let before = station.state().clone();

    assert!(station.start_flash(flash_request("XY", "00500")).unwrap().is_none());
    assert!(station
        .start_erase(EraseParams {
            baud: BaudRate::default(),
            chip: ChipFamily::Esp32c3,
        })
        .is_none());
    assert_eq!(station.state(), &before);
    assert_eq!(station.blobs().generated, vec!["DEV00001", "DEV00002"]);
}

#[test]
fn roster_is_frozen_during_a_run() {
    let mut station = station(&[(true, Some(PORT_A)), (true, Some(PORT_B))], FakeSteps::default(), FakeBlobs::default());
    station.start_flash(flash_request("DEV", "00001")).unwrap();
    assert_eq!(
        station.configure_slot(2, false, None),
        Err(RosterError::Busy)
    );
    assert_eq!(
        station.set_available_ports::<Vec<String>>(None),
        Err(RosterError::Busy)
    );
    run_to_end(&mut station);
    assert_eq!(station.configure_slot(2, false, None), Ok(()));
    assert!(matches!(
        station.configure_slot(3, true, None),
        Err(RosterError::Model(_))
    ));
}

#[test]
fn every_slot_is_settled_after_a_run() {
    let mut station = station(
        &[
            (true, Some(PORT_A)),
            (true, None),
            (true, Some("  ")),
            (false, None),
            (true, Some(PORT_B)),
        ],
        FakeSteps::default().fail(PORT_B, StepKind::ReadMac),
        FakeBlobs::default(),
    );
    station.start_flash(flash_request("DEV", "00010")).unwrap();
    assert_eq!(run_to_end(&mut station), RunProgress::Completed);
    assert!(station.roster().slots().iter().all(|slot| slot.status.is_settled()));
    assert_eq!(
        statuses(&station),
        vec![
            SlotStatus::Success,
            SlotStatus::Ignored,
            SlotStatus::Ignored,
            SlotStatus::Ignored,
            SlotStatus::Failed,
        ]
    );
}

#[test]
fn slots_without_port_never_reach_the_tool() {
    let mut station = station(
        &[(true, None), (false, Some(PORT_A)), (true, Some(""))],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station.start_erase(EraseParams {
        baud: BaudRate::default(),
        chip: ChipFamily::Esp32,
    });
    run_to_end(&mut station);
    assert!(station.steps().calls.is_empty());
    assert_eq!(statuses(&station), vec![SlotStatus::Ignored; 3]);
}

#[test]
fn invalid_input_keeps_station_idle() {
    let cases = [
        (flash_request("D", "00001"), ValidationError::PrefixTooShort),
        (
            flash_request("DEV", "12a45"),
            ValidationError::SequenceNotNumeric("12a45".to_string()),
        ),
        (flash_request("DEV", "1234"), ValidationError::SequenceLength(4)),
    ];
    for (request, expected) in cases {
        let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), FakeBlobs::default());
        match station.start_flash(request) {
            Err(StartError::Validation(error)) => assert_eq!(error, expected),
            other => panic!("unexpected start result: {other:?}"),
        }
        assert!(station.is_idle());
        assert!(station.blobs().generated.is_empty());
    }

    let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), FakeBlobs::default());
    let mut request = flash_request("DEV", "00001");
    request.firmware = PathBuf::from("build/app.elf");
    assert!(matches!(
        station.start_flash(request),
        Err(StartError::Validation(ValidationError::FirmwarePath(_)))
    ));
    assert!(station.is_idle());
}

#[test]
fn failed_initial_blob_keeps_station_idle() {
    let blobs = FakeBlobs {
        fail_all: true,
        ..FakeBlobs::default()
    };
    let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), blobs);
    assert!(matches!(
        station.start_flash(flash_request("DEV", "00001")),
        Err(StartError::ConfigBlob(_))
    ));
    assert!(station.is_idle());
    assert!(station.steps().calls.is_empty());
}

#[test]
fn abort_skips_remaining_slots() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B)), (true, Some(PORT_C))],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station.start_flash(flash_request("DEV", "00001")).unwrap();
    station.tick();
    station.request_abort();

    let outcome = station.tick();
    assert_eq!(outcome.progress, RunProgress::Aborted);
    assert_eq!(outcome.slots.len(), 2);
    assert!(outcome
        .slots
        .iter()
        .all(|slot| slot.result == SlotResult::Ignored(IgnoreReason::Aborted)));
    assert_eq!(
        statuses(&station),
        vec![SlotStatus::Success, SlotStatus::Ignored, SlotStatus::Ignored]
    );
    assert!(station.is_idle());
    assert!(station.steps().calls_on(PORT_B).is_empty());
    assert!(station.last_summary().unwrap().aborted);
    assert_eq!(
        station.current_identity().map(ToString::to_string).as_deref(),
        Some("DEV00002")
    );
}

#[test]
fn abort_while_idle_does_nothing() {
    let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), FakeBlobs::default());
    station.request_abort();
    assert!(!station.state().abort_requested);
    assert_eq!(station.tick().progress, RunProgress::Idle);
    assert!(station.last_summary().is_none());
}

#[test]
fn last_identity_fails_following_slots() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B)), (false, None)],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station.start_flash(flash_request("DEV", "99999")).unwrap();
    assert_eq!(run_to_end(&mut station), RunProgress::Completed);

    assert_eq!(
        statuses(&station),
        vec![SlotStatus::Success, SlotStatus::Failed, SlotStatus::Ignored]
    );
    assert_eq!(station.registry().records()[0].device_identity, "DEV99999");
    assert_eq!(station.registry().len(), 1);
    assert!(station.steps().calls_on(PORT_B).is_empty());
    assert_eq!(station.blobs().generated, vec!["DEV99999"]);
    assert!(station.current_identity().is_none());

    let summary = station.last_summary().unwrap();
    assert!(summary.identities_exhausted);
    assert_eq!(summary.next_identity, None);
}

#[test]
fn used_up_sequence_never_offers_the_flashed_identity_again() {
    let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), FakeBlobs::default());
    station.start_flash(flash_request("DEV", "99999")).unwrap();

    let outcome = station.tick();
    assert_eq!(outcome.progress, RunProgress::Completed);
    assert!(outcome.identities_exhausted);
    assert_eq!(outcome.next_identity, None);
    assert_eq!(station.registry().records()[0].device_identity, "DEV99999");
    assert_ne!(
        station.last_summary().unwrap().next_identity.as_deref(),
        Some("DEV99999")
    );
    assert!(station.current_identity().is_none());
}

#[test]
fn blob_for_next_device_is_built_right_after_success() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station.start_flash(flash_request("DEV", "00041")).unwrap();
    assert_eq!(station.blobs().generated, vec!["DEV00041"]);
    station.tick();
    assert_eq!(station.blobs().generated, vec!["DEV00041", "DEV00042"]);
    match &station.state().mode {
        RunMode::Flashing(params) => {
            assert_eq!(params.identity.to_string(), "DEV00042");
            assert!(params.config_blob.is_some());
        }
        other => panic!("unexpected mode {other:?}"),
    }
    station.tick();
    assert_eq!(
        station.blobs().generated,
        vec!["DEV00041", "DEV00042", "DEV00043"]
    );
}

#[test]
fn missed_pregeneration_is_retried_before_next_slot() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default(),
        FakeBlobs::failing_once("DEV00002"),
    );
    station.start_flash(flash_request("DEV", "00001")).unwrap();
    assert_eq!(run_to_end(&mut station), RunProgress::Completed);
    assert_eq!(statuses(&station), vec![SlotStatus::Success; 2]);
    let identities: Vec<&str> = station
        .registry()
        .records()
        .iter()
        .map(|record| record.device_identity.as_str())
        .collect();
    assert_eq!(identities, vec!["DEV00001", "DEV00002"]);
}

#[test]
fn unavailable_blob_fails_slot_without_flashing() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default(),
        FakeBlobs::failing_always("DEV00002"),
    );
    station.start_flash(flash_request("DEV", "00001")).unwrap();
    station.tick();
    let outcome = station.tick();
    assert!(matches!(outcome.slots[0].result, SlotResult::ConfigBlobUnavailable(_)));
    assert_eq!(outcome.progress, RunProgress::Completed);
    assert!(station.steps().calls_on(PORT_B).is_empty());
    assert_eq!(station.registry().len(), 1);
}

#[test]
fn mac_failure_keeps_identity_for_next_device() {
    let mut steps = FakeSteps::default().fail(PORT_A, StepKind::ReadMac);
    steps.macs.insert(PORT_B.to_string(), "112233445566".to_string());
    let mut station = station(&[(true, Some(PORT_A)), (true, Some(PORT_B))], steps, FakeBlobs::default());
    station.start_flash(flash_request("DEV", "00001")).unwrap();

    let first = station.tick();
    assert!(matches!(first.slots[0].result, SlotResult::MacUnavailable(_)));
    assert!(station.registry().is_empty());
    assert_eq!(station.blobs().generated, vec!["DEV00001"]);

    station.tick();
    assert_eq!(
        station.registry().records(),
        &[ProvisionRecord::new("112233445566", "DEV00001")]
    );
    assert_eq!(
        statuses(&station),
        vec![SlotStatus::Failed, SlotStatus::Success]
    );
}

#[test]
fn ports_missing_from_enumeration_are_ignored() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default(),
        FakeBlobs::default(),
    );
    station
        .set_available_ports(Some(vec![PORT_A.to_string()]))
        .unwrap();
    station.start_erase(EraseParams {
        baud: BaudRate::default(),
        chip: ChipFamily::Esp32c3,
    });
    station.tick();
    let outcome = station.tick();
    assert_eq!(
        outcome.slots[0].result,
        SlotResult::Ignored(IgnoreReason::PortUnavailable)
    );
    assert!(station.steps().calls_on(PORT_B).is_empty());
}

#[test]
fn erase_run_reports_per_slot_results() {
    let mut station = station(
        &[(true, Some(PORT_A)), (true, Some(PORT_B))],
        FakeSteps::default().fail(PORT_B, StepKind::Erase),
        FakeBlobs::default(),
    );
    let handle = station
        .start_erase(EraseParams {
            baud: BaudRate::new(115_200).unwrap(),
            chip: ChipFamily::Esp32,
        })
        .unwrap();
    assert_eq!(handle.mode, "erase");
    assert_eq!(run_to_end(&mut station), RunProgress::Completed);

    assert_eq!(
        statuses(&station),
        vec![SlotStatus::Success, SlotStatus::Failed]
    );
    assert_eq!(station.steps().calls_on(PORT_A), vec![StepKind::Erase]);
    assert!(station.registry().is_empty());
    assert!(station.blobs().generated.is_empty());
    let summary = station.last_summary().unwrap();
    assert_eq!(summary.mode, "erase");
    assert_eq!(summary.run_id, handle.run_id);
    assert!(summary.next_identity.is_none());
}

#[test]
fn new_run_resets_previous_statuses_and_keeps_records() {
    let mut station = station(&[(true, Some(PORT_A))], FakeSteps::default(), FakeBlobs::default());
    station.start_flash(flash_request("DEV", "00001")).unwrap();
    run_to_end(&mut station);
    station.configure_slot(1, false, Some(PORT_A.to_string())).unwrap();

    station.start_flash(flash_request("DEV", "00002")).unwrap();
    assert_eq!(statuses(&station), vec![SlotStatus::Pending]);
    run_to_end(&mut station);
    assert_eq!(statuses(&station), vec![SlotStatus::Ignored]);
    assert_eq!(station.registry().len(), 1);
    assert!(station.last_summary().unwrap().records.is_empty());
}
