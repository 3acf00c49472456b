//! Shared fixtures for pipeline integration tests
//!
//! Small frames and a fast sample clock keep a full run under a second:
//! 10 volumes per second of 5 planes, 16x16 pixels each.

#![allow(dead_code)]

use lightsheet_daq::camera::CameraParameters;
use lightsheet_daq::config::Settings;
use lightsheet_daq::hardware::{MockBoard, MockCamera, MockExternalTrigger, TriggerLink};
use lightsheet_daq::scanning::{GalvoSweep, ScanParameters, TriggerWindow, XYScan, ZScan};
use lightsheet_daq::storage::{DatasetMetadata, DATASET_DIR, METADATA_FILE};
use lightsheet_daq::waveforms::SyncCoefficients;
use lightsheet_daq::Hardware;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const N_PLANES: usize = 5;
pub const FRAME_BYTES: u64 = 16 * 16 * 2;

pub fn settings(output: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.scanning.sample_rate = 10_000;
    settings.scanning.n_samples_waveform = 500;
    settings.scanning.poll_interval_ms = 2;
    settings.camera.sensor_resolution = [16, 16];
    settings.camera.default_binning = 1;
    settings.camera.default_exposure_ms = 5.0;
    settings.camera.frame_pool_size = 128;
    settings.queues.put_timeout_ms = 500;
    settings.saving.output_dir = output.to_path_buf();
    // 4 volumes of 5 planes per chunk
    settings.saving.array_ram_mb = 0.01;
    settings
}

/// 10 volumes per second, one pulse every 200 samples.
pub fn scan() -> ScanParameters {
    let galvo = GalvoSweep {
        frequency: 1_000.0,
        v_min: -0.5,
        v_max: 0.5,
    };
    ScanParameters {
        triggering: TriggerWindow {
            frequency: None,
            n_planes: N_PLANES,
            n_skip_start: 0,
            n_skip_end: 0,
        },
        xy: XYScan {
            lateral: galvo,
            frontal: galvo,
        },
        z: ZScan::Scanning {
            frequency: 10.0,
            piezo_min: 0.0,
            piezo_max: 100.0,
            lateral_sync: SyncCoefficients::new(0.0, 0.01),
            frontal_sync: SyncCoefficients::new(0.0, 0.01),
        },
        ..Default::default()
    }
}

pub struct MockRig {
    pub hardware: Hardware,
    pub board: Arc<MockBoard>,
    pub camera: Arc<MockCamera>,
    pub trigger: Arc<MockExternalTrigger>,
}

pub fn mock_rig(settings: &Settings, duration_s: Option<f64>) -> MockRig {
    let link = TriggerLink::new();
    let board = Arc::new(
        MockBoard::new(
            settings.scanning.sample_rate,
            settings.scanning.n_samples_waveform,
            link.clone(),
        )
        .paced(true),
    );
    let [width, height] = settings.camera.sensor_resolution;
    let camera = Arc::new(
        MockCamera::new(
            (width, height),
            CameraParameters::from_config(&settings.camera).settings,
            settings.camera.frame_pool_size,
            link,
        )
        .unwrap(),
    );
    let trigger = Arc::new(MockExternalTrigger::new(duration_s));
    MockRig {
        hardware: Hardware {
            board: board.clone(),
            camera: camera.clone(),
            trigger: trigger.clone(),
        },
        board,
        camera,
        trigger,
    }
}

/// Poll `check` until it holds, failing the test after `timeout`.
pub async fn eventually(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn read_metadata(output: &Path) -> DatasetMetadata {
    let path = output.join(DATASET_DIR).join(METADATA_FILE);
    let json = std::fs::read(&path).unwrap();
    serde_json::from_slice(&json).unwrap()
}

/// Sizes of the chunk files in chunk order.
pub fn chunk_sizes(output: &Path) -> Vec<u64> {
    let dir = output.join(DATASET_DIR);
    let mut chunks: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "bin"))
        .collect();
    chunks.sort();
    chunks
        .iter()
        .map(|path| std::fs::metadata(path).unwrap().len())
        .collect()
}
