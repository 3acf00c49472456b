//! Galvo/piezo scanning and camera triggering.
//!
//! [`ScanParameters`] snapshots travel from the global state to the scanner
//! over a `watch` channel. The [`ScannerProcess`] task mounts a
//! [`ScanLoop`] for the requested scan mode, runs it until it asks to be
//! re-initialized, and mounts a fresh one. Board faults are reported on the
//! fault channel so the global state can abort the run.

pub mod scanloop;

pub use scanloop::{period_for, LoopKind, ScanLoop, ScanLoopState, ScanSample};

use crate::config::ScanningConfig;
use crate::error::{DaqError, Fault, FaultSender};
use crate::events::{EventBus, SignalFlag};
use crate::hardware::AnalogIOBoard;
use crate::waveforms::SyncCoefficients;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

/// Where an experiment is in its start sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentPhase {
    /// Stop scanning for good.
    Abort,
    /// Start signal received; pulses may flow.
    ExperimentStarted,
    /// Armed, waiting for the start signal.
    NoTrigger,
    /// No experiment; scanning for display only.
    #[default]
    Preview,
}

/// What the galvos and piezo are doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Outputs idle.
    #[default]
    Paused,
    /// One plane, xy sweep only.
    Planar,
    /// Piezo sweeps through the volume with the light sheet following.
    Volumetric,
}

/// Camera pulse placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerWindow {
    /// Planar trigger rate in Hz. `None` leaves the camera free-running.
    pub frequency: Option<f64>,
    /// Planes per volume
    pub n_planes: usize,
    /// Planes left dark at the start of each sweep
    pub n_skip_start: usize,
    /// Planes left dark at the end of each sweep
    pub n_skip_end: usize,
}

impl Default for TriggerWindow {
    fn default() -> Self {
        Self {
            frequency: None,
            n_planes: 1,
            n_skip_start: 0,
            n_skip_end: 0,
        }
    }
}

impl TriggerWindow {
    /// Planes that receive a camera pulse.
    pub fn n_imaged_planes(&self) -> usize {
        self.n_planes
            .saturating_sub(self.n_skip_start)
            .saturating_sub(self.n_skip_end)
    }
}

/// Triangle sweep of one galvo axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalvoSweep {
    /// Sweeps per second
    pub frequency: f64,
    /// Voltage at the start of the sweep
    pub v_min: f64,
    /// Voltage at mid-sweep
    pub v_max: f64,
}

impl Default for GalvoSweep {
    fn default() -> Self {
        Self {
            frequency: 800.0,
            v_min: -0.5,
            v_max: 0.5,
        }
    }
}

/// In-plane light-sheet scanning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct XYScan {
    /// Lateral galvo
    pub lateral: GalvoSweep,
    /// Frontal galvo
    pub frontal: GalvoSweep,
}

/// Axial positioning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ZScan {
    /// Every z output set by hand.
    Manual {
        /// Piezo voltage
        piezo: f64,
        /// Lateral z galvo voltage
        lateral: f64,
        /// Frontal z galvo voltage
        frontal: f64,
    },
    /// Piezo set by hand, galvos follow through the calibration.
    Synced {
        /// Piezo voltage
        piezo: f64,
        /// Lateral galvo calibration
        lateral_sync: SyncCoefficients,
        /// Frontal galvo calibration
        frontal_sync: SyncCoefficients,
    },
    /// Piezo sweeps, galvos follow the recorded piezo position.
    Scanning {
        /// Volumes per second
        frequency: f64,
        /// Piezo voltage at the top of the sweep
        piezo_min: f64,
        /// Piezo voltage at the bottom of the sweep
        piezo_max: f64,
        /// Lateral galvo calibration
        lateral_sync: SyncCoefficients,
        /// Frontal galvo calibration
        frontal_sync: SyncCoefficients,
    },
}

impl Default for ZScan {
    fn default() -> Self {
        ZScan::Manual {
            piezo: 0.0,
            lateral: 0.0,
            frontal: 0.0,
        }
    }
}

impl ZScan {
    /// Whether `other` is the same variant.
    pub fn same_kind(&self, other: &ZScan) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Immutable scanner configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Experiment start sequence
    pub experiment_state: ExperimentPhase,
    /// Scan mode
    pub scan_mode: ScanMode,
    /// Camera pulse placement
    pub triggering: TriggerWindow,
    /// In-plane scanning
    pub xy: XYScan,
    /// Axial positioning
    pub z: ZScan,
    /// Pulse-bearing periods to scan before stopping, unbounded if `None`
    pub volume_budget: Option<u64>,
}

/// Last recorded piezo period, published for display.
pub type WaveformSnapshot = Option<Arc<[f64]>>;

/// Timing knobs of the scan loop.
#[derive(Debug, Clone, Copy)]
pub struct ScanTiming {
    /// How long `check_start` waits before reporting a timeout
    pub trigger_timeout: Duration,
    /// Poll interval while waiting or paused
    pub poll_interval: Duration,
}

impl From<&ScanningConfig> for ScanTiming {
    fn from(config: &ScanningConfig) -> Self {
        Self {
            trigger_timeout: config.trigger_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Task that owns the board and keeps a scan loop mounted.
pub struct ScannerProcess {
    board: Arc<dyn AnalogIOBoard>,
    bus: EventBus,
    params_rx: watch::Receiver<ScanParameters>,
    waveform_tx: Arc<watch::Sender<WaveformSnapshot>>,
    timing: ScanTiming,
    faults: FaultSender,
}

impl ScannerProcess {
    /// Assemble the scanner task.
    pub fn new(
        board: Arc<dyn AnalogIOBoard>,
        bus: EventBus,
        params_rx: watch::Receiver<ScanParameters>,
        waveform_tx: Arc<watch::Sender<WaveformSnapshot>>,
        timing: ScanTiming,
        faults: FaultSender,
    ) -> Self {
        Self {
            board,
            bus,
            params_rx,
            waveform_tx,
            timing,
            faults,
        }
    }

    /// Run until `CLOSE_ALL`.
    pub async fn run(self) {
        let span = info_span!("scanner");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!("started");
        while !self.bus.is_set(SignalFlag::CloseAll) {
            let params = self.params_rx.borrow_and_update().clone();
            let kind = match params.scan_mode {
                ScanMode::Paused => {
                    if !self.idle().await {
                        break;
                    }
                    continue;
                }
                ScanMode::Planar => LoopKind::Planar,
                ScanMode::Volumetric => LoopKind::Volumetric,
            };
            if params.experiment_state == ExperimentPhase::Abort {
                if !self.idle().await {
                    break;
                }
                continue;
            }

            let outcome = match ScanLoop::new(
                kind,
                Arc::clone(&self.board),
                self.bus.clone(),
                self.params_rx.clone(),
                Arc::clone(&self.waveform_tx),
                self.timing,
            ) {
                Ok(scan_loop) => scan_loop.run().await,
                Err(e) => Err(e),
            };
            if let Err(e) = self.board.stop().await {
                warn!(error = %e, "board stop failed");
            }

            match outcome {
                Ok(ScanLoopState::Initializing | ScanLoopState::Paused) => {}
                Ok(state) => {
                    info!(?state, "scan loop ended");
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "scan loop failed");
                    self.report(e);
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.board.stop().await {
            warn!(error = %e, "board stop failed");
        }
        info!("stopped");
    }

    /// Wait for new parameters or `CLOSE_ALL`. Returns `false` to exit.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            changed = self.params_rx.changed() => changed.is_ok(),
            _ = self.bus.wait_for(SignalFlag::CloseAll, true) => false,
        }
    }

    fn report(&self, error: DaqError) {
        let _ = self.faults.send(Fault {
            source: "scanner",
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_variants_compare_by_kind() {
        let manual = ZScan::default();
        let other_manual = ZScan::Manual {
            piezo: 1.0,
            lateral: 0.2,
            frontal: 0.3,
        };
        let synced = ZScan::Synced {
            piezo: 0.0,
            lateral_sync: SyncCoefficients::default(),
            frontal_sync: SyncCoefficients::default(),
        };
        assert!(manual.same_kind(&other_manual));
        assert!(!manual.same_kind(&synced));
    }

    #[test]
    fn imaged_planes_exclude_skips() {
        let window = TriggerWindow {
            frequency: None,
            n_planes: 10,
            n_skip_start: 2,
            n_skip_end: 1,
        };
        assert_eq!(window.n_imaged_planes(), 7);
    }

    #[test]
    fn parameters_serialize_with_tagged_z() {
        let params = ScanParameters {
            z: ZScan::Scanning {
                frequency: 2.0,
                piezo_min: 0.0,
                piezo_max: 200.0,
                lateral_sync: SyncCoefficients::new(0.0, 0.01),
                frontal_sync: SyncCoefficients::new(0.1, 0.01),
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["z"]["kind"], "Scanning");
        let back: ScanParameters = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
