//! Integration tests for stopping the pipeline mid-run
//!
//! `CLOSE_ALL` during saving must flush every volume the saver received,
//! including a partial last chunk. A board fault must abort the run: the
//! camera shuts down, saving stops and the dataset is still finalized.

mod common;

use common::{chunk_sizes, eventually, mock_rig, read_metadata, scan, settings, FRAME_BYTES, N_PLANES};
use lightsheet_daq::state::TriggerSettings;
use lightsheet_daq::storage::RawDatasetWriter;
use lightsheet_daq::{GlobalPhase, GlobalState, SignalFlag};
use std::time::Duration;
use tempfile::tempdir;

fn untriggered() -> TriggerSettings {
    TriggerSettings {
        is_triggered: false,
        manual_duration_s: None,
    }
}

#[tokio::test]
async fn close_all_flushes_every_saved_volume() {
    let dir = tempdir().unwrap();
    let settings = settings(dir.path());
    let rig = mock_rig(&settings, None);
    let state = GlobalState::launch(&settings, rig.hardware, Box::new(RawDatasetWriter::new()));

    state.set_scan_settings(scan()).unwrap();
    state.set_trigger_settings(untriggered()).unwrap();
    state.start_experiment().unwrap();

    eventually("saved volumes", Duration::from_secs(5), || {
        state.get_save_status().i_volume >= 5
    })
    .await;
    state.wrap_up().await.unwrap();

    let saved = state.get_save_status();
    assert_eq!(saved.error, None);
    let metadata = read_metadata(dir.path());
    assert_eq!(metadata.n_volumes, saved.i_volume);
    assert_eq!(metadata.shape_full[0] as u64, saved.i_volume);

    let sizes = chunk_sizes(dir.path());
    let volume_bytes = N_PLANES as u64 * FRAME_BYTES;
    assert_eq!(sizes.len() as u64, saved.i_volume.div_ceil(4));
    assert_eq!(sizes.iter().sum::<u64>(), saved.i_volume * volume_bytes);
    assert!(sizes.iter().all(|size| *size <= 4 * volume_bytes));
}

#[tokio::test]
async fn board_fault_aborts_the_run() {
    let dir = tempdir().unwrap();
    let settings = settings(dir.path());
    let rig = mock_rig(&settings, None);
    let state = GlobalState::launch(&settings, rig.hardware, Box::new(RawDatasetWriter::new()));

    state.set_scan_settings(scan()).unwrap();
    state.set_trigger_settings(untriggered()).unwrap();
    state.start_experiment().unwrap();
    eventually("first pulses", Duration::from_secs(3), || {
        rig.board.pulses_emitted() > 0
    })
    .await;

    rig.board.inject_fault();
    eventually("abort", Duration::from_secs(3), || {
        state.phase() == GlobalPhase::Abort
    })
    .await;

    let bus = state.bus().clone();
    assert!(!bus.is_set(SignalFlag::IsSaving));
    tokio::time::timeout(
        Duration::from_secs(5),
        bus.wait_for(SignalFlag::SavingStopped, true),
    )
    .await
    .unwrap()
    .unwrap();
    eventually("camera shutdown", Duration::from_secs(3), || {
        rig.camera.is_shut_down()
    })
    .await;

    assert!(state.change_global_state(GlobalPhase::Paused).is_err());
    assert!(state.start_experiment().is_err());
    assert_eq!(
        read_metadata(dir.path()).n_volumes,
        state.get_save_status().i_volume
    );

    state.wrap_up().await.unwrap();
}
