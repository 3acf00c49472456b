//! Global experiment state and pipeline wiring.
//!
//! [`GlobalState`] is the one place the global phase changes. Every phase
//! change goes through [`GlobalState::change_global_state`], which checks the
//! transition table in [`GlobalPhase::can_transition_to`] and then pushes a
//! coherent set of scan, camera and dispatcher parameters to the tasks over
//! `watch` channels. Tasks never see each other's parameters and never
//! mutate the global state; they report problems on the fault channel and
//! [`GlobalState::supervise`] decides what happens next.
//!
//! [`GlobalState::launch`] builds the whole pipeline:
//!
//! ```text
//!  ScannerProcess ──pulses──▶ CameraLoop ──frames──▶ VolumeDispatcher ──volumes──▶ StreamingSaver
//!        │                        │                        │                           │
//!        └── waveform snapshot    └── camera status        └── viewer / status         └── saving status
//!                                          ExternalComm ◀── TRIGGER_STYTRA
//! ```

use crate::camera::{CameraLoop, CameraMode, CameraParameters, CameraStatus, CameraTiming};
use crate::config::Settings;
use crate::dispatcher::{
    DispatcherChannels, DispatcherParameters, DispatcherStatus, NoiseReference, VolumeDispatcher,
    ViewerSnapshot,
};
use crate::error::{AppResult, DaqError, Fault, FaultReceiver};
use crate::events::{EventBus, SignalFlag};
use crate::external_comm::ExternalComm;
use crate::hardware::{
    AnalogIOBoard, Camera, CameraSettings, ExternalTrigger, MockBoard, MockCamera,
    MockExternalTrigger, TriggerLink, TriggerMode,
};
use crate::scanning::{
    period_for, ExperimentPhase, LoopKind, ScanMode, ScanParameters, ScanTiming, ScannerProcess,
    WaveformSnapshot, ZScan,
};
use crate::storage::streaming_save::SaverChannels;
use crate::storage::{DatasetWriter, SavingParameters, SavingStatus, StreamingSaver};
use crate::waveforms::pulse_times;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long `wrap_up` and `end_experiment` wait for a task.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What the microscope as a whole is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalPhase {
    /// Volumetric acquisition saved to disk.
    ExperimentRunning,
    /// Scanning and camera idle.
    #[default]
    Paused,
    /// Single plane with the galvos following the piezo calibration.
    PlanarPreview,
    /// Single plane at fixed z outputs, free-running camera.
    Preview,
    /// Volumetric scanning for display only.
    VolumePreview,
    /// Terminal. Every task winds down.
    Abort,
}

impl fmt::Display for GlobalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GlobalPhase::ExperimentRunning => "EXPERIMENT_RUNNING",
            GlobalPhase::Paused => "PAUSED",
            GlobalPhase::PlanarPreview => "PLANAR_PREVIEW",
            GlobalPhase::Preview => "PREVIEW",
            GlobalPhase::VolumePreview => "VOLUME_PREVIEW",
            GlobalPhase::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

impl GlobalPhase {
    /// Any of the display-only phases.
    pub fn is_preview(self) -> bool {
        matches!(
            self,
            GlobalPhase::Preview | GlobalPhase::PlanarPreview | GlobalPhase::VolumePreview
        )
    }

    /// Transition table.
    ///
    /// `armed` is true once `start_experiment` pushed the parameters of a run.
    ///
    /// ```
    /// use lightsheet_daq::state::GlobalPhase;
    ///
    /// assert!(GlobalPhase::Preview.can_transition_to(GlobalPhase::VolumePreview, false));
    /// assert!(!GlobalPhase::Paused.can_transition_to(GlobalPhase::ExperimentRunning, false));
    /// assert!(GlobalPhase::Paused.can_transition_to(GlobalPhase::ExperimentRunning, true));
    /// assert!(!GlobalPhase::Abort.can_transition_to(GlobalPhase::Paused, false));
    /// ```
    pub fn can_transition_to(self, next: GlobalPhase, armed: bool) -> bool {
        match (self, next) {
            (GlobalPhase::Abort, _) => false,
            (_, GlobalPhase::Paused | GlobalPhase::Abort) => true,
            (GlobalPhase::ExperimentRunning, GlobalPhase::VolumePreview) => true,
            (GlobalPhase::ExperimentRunning, _) => false,
            (_, GlobalPhase::ExperimentRunning) => armed,
            // Paused or a preview into a preview
            _ => true,
        }
    }
}

/// Start-signal settings of the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Wait for the operator's start signal before pulsing the camera.
    pub is_triggered: bool,
    /// Experiment length set by hand, used to size the dataset.
    pub manual_duration_s: Option<f64>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            is_triggered: true,
            manual_duration_s: None,
        }
    }
}

/// Device handles the pipeline runs on.
pub struct Hardware {
    /// Galvo, piezo and camera-trigger outputs
    pub board: Arc<dyn AnalogIOBoard>,
    /// Imaging camera
    pub camera: Arc<dyn Camera>,
    /// Behavior-tracking instrument
    pub trigger: Arc<dyn ExternalTrigger>,
}

impl Hardware {
    /// Simulated devices sized from `settings`.
    ///
    /// The board paces itself at the configured sample rate and drives the
    /// camera through a shared trigger link.
    pub fn mock(settings: &Settings) -> AppResult<Self> {
        for (what, name) in [
            ("scanning.board", &settings.scanning.board),
            ("camera.name", &settings.camera.name),
            ("external_trigger.name", &settings.external_trigger.name),
        ] {
            if name != "mock" {
                return Err(DaqError::Configuration(format!(
                    "{} '{}' is not available, only 'mock' is built in",
                    what, name
                )));
            }
        }

        let link = TriggerLink::new();
        let board = MockBoard::new(
            settings.scanning.sample_rate,
            settings.scanning.n_samples_waveform,
            link.clone(),
        )
        .paced(true);
        let [width, height] = settings.camera.sensor_resolution;
        let camera = MockCamera::new(
            (width, height),
            CameraParameters::from_config(&settings.camera).settings,
            settings.camera.frame_pool_size,
            link,
        )?;
        let trigger = MockExternalTrigger::new(settings.external_trigger.mock_duration_s);
        Ok(Self {
            board: Arc::new(board),
            camera: Arc::new(camera),
            trigger: Arc::new(trigger),
        })
    }
}

/// Channel ends the pipeline tasks are built from.
///
/// Returned by [`GlobalState::new`]; [`GlobalState::launch`] hands each end
/// to its task.
pub struct TaskEnds {
    /// Scanner parameters
    pub scan_rx: watch::Receiver<ScanParameters>,
    /// Camera parameters
    pub camera_rx: watch::Receiver<CameraParameters>,
    /// Dispatcher parameters
    pub dispatcher_rx: watch::Receiver<DispatcherParameters>,
    /// Saving parameters of the current run
    pub saving_rx: watch::Receiver<Option<SavingParameters>>,
    /// Experiment duration for the saver
    pub duration_rx: watch::Receiver<Option<f64>>,
    /// Dark reference for the dispatcher
    pub noise_rx: watch::Receiver<NoiseReference>,
    /// Experiment description for the tracking instrument
    pub config_rx: watch::Receiver<serde_json::Value>,
    /// Where the tracking instrument's duration goes
    pub duration_tx: Arc<watch::Sender<Option<f64>>>,
    /// Camera status surface
    pub camera_status_tx: Arc<watch::Sender<CameraStatus>>,
    /// Saving status surface
    pub saving_status_tx: Arc<watch::Sender<SavingStatus>>,
    /// Dispatcher status surface
    pub dispatcher_status_tx: Arc<watch::Sender<DispatcherStatus>>,
    /// Last assembled volume
    pub viewer_tx: Arc<watch::Sender<ViewerSnapshot>>,
    /// Last recorded piezo period
    pub waveform_tx: Arc<watch::Sender<WaveformSnapshot>>,
}

struct Links {
    scan_tx: watch::Sender<ScanParameters>,
    camera_tx: watch::Sender<CameraParameters>,
    dispatcher_tx: watch::Sender<DispatcherParameters>,
    saving_tx: watch::Sender<Option<SavingParameters>>,
    duration_tx: Arc<watch::Sender<Option<f64>>>,
    noise_tx: watch::Sender<NoiseReference>,
    config_tx: watch::Sender<serde_json::Value>,
    camera_status_rx: watch::Receiver<CameraStatus>,
    saving_status_rx: watch::Receiver<SavingStatus>,
    dispatcher_status_rx: watch::Receiver<DispatcherStatus>,
    viewer_rx: watch::Receiver<ViewerSnapshot>,
    waveform_rx: watch::Receiver<WaveformSnapshot>,
}

struct Control {
    phase: GlobalPhase,
    armed: bool,
    scan: ScanParameters,
    camera: CameraSettings,
    trigger: TriggerSettings,
    saving: SavingParameters,
}

/// Parameters one phase pushes to the tasks.
struct PhasePlan {
    scan: ScanParameters,
    camera: CameraParameters,
    dispatcher: DispatcherParameters,
}

impl PhasePlan {
    fn new(phase: GlobalPhase, control: &Control, sample_rate: u32) -> AppResult<Self> {
        let template = &control.scan;
        let camera = |camera_mode, trigger_mode, n_planes| CameraParameters {
            settings: control.camera.clone(),
            trigger_mode,
            camera_mode,
            n_planes,
        };
        let free_rate = 1_000.0 / control.camera.exposure_ms.max(f64::EPSILON);

        let plan = match phase {
            GlobalPhase::Paused | GlobalPhase::Abort => PhasePlan {
                scan: ScanParameters {
                    experiment_state: ExperimentPhase::Preview,
                    scan_mode: ScanMode::Paused,
                    volume_budget: None,
                    ..template.clone()
                },
                camera: camera(CameraMode::Paused, TriggerMode::Free, 1),
                dispatcher: DispatcherParameters::default(),
            },
            GlobalPhase::Preview => {
                let mut scan = planar(template);
                scan.triggering.frequency = None;
                PhasePlan {
                    scan,
                    camera: camera(CameraMode::Preview, TriggerMode::Free, 1),
                    dispatcher: DispatcherParameters {
                        n_planes: 1,
                        volumerate: free_rate,
                    },
                }
            }
            GlobalPhase::PlanarPreview => {
                let scan = planar(template);
                let frequency = scan.triggering.frequency.filter(|f| *f > 0.0);
                let camera = match frequency {
                    Some(_) => camera(CameraMode::Triggered, TriggerMode::ExternalTrigger, 1),
                    None => camera(CameraMode::Preview, TriggerMode::Free, 1),
                };
                PhasePlan {
                    scan,
                    camera,
                    dispatcher: DispatcherParameters {
                        n_planes: 1,
                        volumerate: frequency.unwrap_or(free_rate),
                    },
                }
            }
            GlobalPhase::VolumePreview | GlobalPhase::ExperimentRunning => {
                let running = phase == GlobalPhase::ExperimentRunning;
                let experiment_state = match (running, control.trigger.is_triggered) {
                    (false, _) => ExperimentPhase::Preview,
                    (true, true) => ExperimentPhase::NoTrigger,
                    (true, false) => ExperimentPhase::ExperimentStarted,
                };
                let mut scan = ScanParameters {
                    experiment_state,
                    scan_mode: ScanMode::Volumetric,
                    volume_budget: None,
                    ..template.clone()
                };
                let volumerate = volumerate(&scan, sample_rate)?;
                if running {
                    scan.volume_budget = template
                        .volume_budget
                        .or_else(|| n_volumes(volumerate, control.trigger.manual_duration_s));
                }
                let n_planes = scan.triggering.n_imaged_planes();
                let mode = if running {
                    CameraMode::ExperimentRunning
                } else {
                    CameraMode::Triggered
                };
                PhasePlan {
                    scan,
                    camera: camera(mode, TriggerMode::ExternalTrigger, n_planes),
                    dispatcher: DispatcherParameters {
                        n_planes,
                        volumerate,
                    },
                }
            }
        };
        Ok(plan)
    }
}

/// Single-plane version of `template`: a z sweep is parked at its midpoint.
fn planar(template: &ScanParameters) -> ScanParameters {
    let z = match template.z {
        ZScan::Scanning {
            piezo_min,
            piezo_max,
            lateral_sync,
            frontal_sync,
            ..
        } => ZScan::Synced {
            piezo: (piezo_min + piezo_max) / 2.0,
            lateral_sync,
            frontal_sync,
        },
        other => other,
    };
    ScanParameters {
        experiment_state: ExperimentPhase::Preview,
        scan_mode: ScanMode::Planar,
        z,
        volume_budget: None,
        ..template.clone()
    }
}

fn volumerate(scan: &ScanParameters, sample_rate: u32) -> AppResult<f64> {
    let period = period_for(LoopKind::Volumetric, scan, sample_rate)?;
    Ok(f64::from(sample_rate) / period as f64)
}

fn n_volumes(volumerate: f64, duration_s: Option<f64>) -> Option<u64> {
    duration_s.map(|d| (volumerate * d).ceil() as u64)
}

/// Owner of the global phase and of every task's parameters.
pub struct GlobalState {
    bus: EventBus,
    sample_rate: u32,
    control: Mutex<Control>,
    links: Links,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl GlobalState {
    /// Paused state and the channel ends for the tasks.
    pub fn new(settings: &Settings, bus: EventBus) -> (Self, TaskEnds) {
        let camera_params = CameraParameters::from_config(&settings.camera);
        let (scan_tx, scan_rx) = watch::channel(ScanParameters::default());
        let (camera_tx, camera_rx) = watch::channel(camera_params.clone());
        let (dispatcher_tx, dispatcher_rx) = watch::channel(DispatcherParameters::default());
        let (saving_tx, saving_rx) = watch::channel(None);
        let (duration_tx, duration_rx) = watch::channel(None);
        let (noise_tx, noise_rx) = watch::channel(None);
        let (config_tx, config_rx) = watch::channel(serde_json::Value::Null);
        let (camera_status_tx, camera_status_rx) = watch::channel(CameraStatus::default());
        let (saving_status_tx, saving_status_rx) = watch::channel(SavingStatus::default());
        let (dispatcher_status_tx, dispatcher_status_rx) =
            watch::channel(DispatcherStatus::default());
        let (viewer_tx, viewer_rx) = watch::channel(None);
        let (waveform_tx, waveform_rx) = watch::channel(None);
        let duration_tx = Arc::new(duration_tx);

        let state = Self {
            bus,
            sample_rate: settings.scanning.sample_rate,
            control: Mutex::new(Control {
                phase: GlobalPhase::Paused,
                armed: false,
                scan: ScanParameters::default(),
                camera: camera_params.settings,
                trigger: TriggerSettings::default(),
                saving: SavingParameters::from_config(&settings.saving, &settings.voxel_size),
            }),
            links: Links {
                scan_tx,
                camera_tx,
                dispatcher_tx,
                saving_tx,
                duration_tx: Arc::clone(&duration_tx),
                noise_tx,
                config_tx,
                camera_status_rx,
                saving_status_rx,
                dispatcher_status_rx,
                viewer_rx,
                waveform_rx,
            },
            tasks: Mutex::new(Vec::new()),
        };
        let ends = TaskEnds {
            scan_rx,
            camera_rx,
            dispatcher_rx,
            saving_rx,
            duration_rx,
            noise_rx,
            config_rx,
            duration_tx,
            camera_status_tx: Arc::new(camera_status_tx),
            saving_status_tx: Arc::new(saving_status_tx),
            dispatcher_status_tx: Arc::new(dispatcher_status_tx),
            viewer_tx: Arc::new(viewer_tx),
            waveform_tx: Arc::new(waveform_tx),
        };
        (state, ends)
    }

    /// Build the pipeline on `hardware` and spawn every task.
    ///
    /// Must be called from within a tokio runtime. The pipeline starts
    /// paused; call [`GlobalState::wrap_up`] to stop it.
    pub fn launch(
        settings: &Settings,
        hardware: Hardware,
        writer: Box<dyn DatasetWriter>,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let (state, ends) = Self::new(settings, bus.clone());
        let state = Arc::new(state);

        let (faults, fault_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(settings.queues.frame_capacity);
        let (saver_tx, volume_rx) = mpsc::channel(settings.queues.volume_capacity);
        let put_timeout = settings.queues.put_timeout();
        let poll_interval = settings.scanning.poll_interval();

        let scanner = ScannerProcess::new(
            hardware.board,
            bus.clone(),
            ends.scan_rx,
            ends.waveform_tx,
            ScanTiming::from(&settings.scanning),
            faults.clone(),
        );
        let camera = CameraLoop::new(
            hardware.camera,
            bus.clone(),
            ends.camera_rx,
            frame_tx,
            ends.camera_status_tx,
            faults.clone(),
            CameraTiming {
                n_fps_frames: settings.camera.n_fps_frames,
                put_timeout,
                poll_interval,
            },
        );
        let dispatcher = VolumeDispatcher::new(
            bus.clone(),
            DispatcherChannels {
                frame_rx,
                saver_tx,
                viewer_tx: ends.viewer_tx,
                status_tx: ends.dispatcher_status_tx,
                params_rx: ends.dispatcher_rx,
                noise_rx: ends.noise_rx,
            },
            faults.clone(),
            put_timeout,
            poll_interval,
        );
        let saver = StreamingSaver::new(
            bus.clone(),
            SaverChannels {
                volume_rx,
                params_rx: ends.saving_rx,
                duration_rx: ends.duration_rx,
                status_tx: ends.saving_status_tx,
            },
            faults.clone(),
            writer,
        );
        let external = ExternalComm::new(
            hardware.trigger,
            bus,
            ends.config_rx,
            ends.duration_tx,
            faults,
        );

        let supervisor = Arc::clone(&state);
        let handles = vec![
            ("scanner", tokio::spawn(scanner.run())),
            ("camera", tokio::spawn(camera.run())),
            ("dispatcher", tokio::spawn(dispatcher.run())),
            ("saver", tokio::spawn(saver.run())),
            ("external_comm", tokio::spawn(external.run())),
            (
                "supervisor",
                tokio::spawn(async move { supervisor.supervise(fault_rx).await }),
            ),
        ];
        state.tasks.lock().extend(handles);
        info!("pipeline launched");
        state
    }

    /// Signal bus shared with the tasks.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current phase.
    pub fn phase(&self) -> GlobalPhase {
        self.control.lock().phase
    }

    /// Whether `start_experiment` armed a run that has not ended.
    pub fn is_armed(&self) -> bool {
        self.control.lock().armed
    }

    /// Move to `next`, pushing its parameters to every task.
    ///
    /// # Errors
    /// `InvalidTransition` if the table forbids the move, or the scan error
    /// if the current scan settings cannot be realized in `next`. The phase
    /// is unchanged on error.
    pub fn change_global_state(&self, next: GlobalPhase) -> AppResult<()> {
        let mut control = self.control.lock();
        self.transition(&mut control, next)
    }

    fn transition(&self, control: &mut Control, next: GlobalPhase) -> AppResult<()> {
        let from = control.phase;
        if !from.can_transition_to(next, control.armed) {
            return Err(DaqError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        if next == GlobalPhase::Abort {
            self.links
                .scan_tx
                .send_modify(|p| p.experiment_state = ExperimentPhase::Abort);
            self.links
                .camera_tx
                .send_modify(|p| p.camera_mode = CameraMode::Abort);
            self.bus.clear(SignalFlag::IsSaving);
        } else {
            let plan = PhasePlan::new(next, control, self.sample_rate)?;
            self.push(plan);
        }

        control.phase = next;
        if next != GlobalPhase::ExperimentRunning {
            control.armed = false;
        }
        info!(%from, to = %next, "global phase changed");
        Ok(())
    }

    fn push(&self, plan: PhasePlan) {
        self.links.dispatcher_tx.send_replace(plan.dispatcher);
        self.links.camera_tx.send_replace(plan.camera);
        self.links.scan_tx.send_replace(plan.scan);
    }

    /// Re-push the current phase after a settings change.
    fn refresh(&self, control: &Control) -> AppResult<()> {
        if control.phase == GlobalPhase::Abort {
            return Ok(());
        }
        let plan = PhasePlan::new(control.phase, control, self.sample_rate)?;
        self.push(plan);
        Ok(())
    }

    fn check_unlocked(control: &Control, what: &str) -> AppResult<()> {
        if control.phase == GlobalPhase::ExperimentRunning {
            return Err(DaqError::Configuration(format!(
                "{} cannot change while an experiment runs",
                what
            )));
        }
        Ok(())
    }

    /// Replace the scan settings used by every phase.
    ///
    /// Rejected while an experiment runs, or if the current phase cannot
    /// realize them.
    pub fn set_scan_settings(&self, scan: ScanParameters) -> AppResult<()> {
        let mut control = self.control.lock();
        Self::check_unlocked(&control, "Scan settings")?;
        let previous = std::mem::replace(&mut control.scan, scan);
        if let Err(e) = self.refresh(&control) {
            control.scan = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Current scan settings.
    pub fn scan_settings(&self) -> ScanParameters {
        self.control.lock().scan.clone()
    }

    /// Replace exposure, binning and ROI.
    pub fn set_camera_settings(&self, settings: CameraSettings) -> AppResult<()> {
        let mut control = self.control.lock();
        Self::check_unlocked(&control, "Camera settings")?;
        control.camera = settings;
        self.refresh(&control)
    }

    /// Replace the start-signal settings of the next run.
    pub fn set_trigger_settings(&self, trigger: TriggerSettings) -> AppResult<()> {
        let mut control = self.control.lock();
        Self::check_unlocked(&control, "Trigger settings")?;
        control.trigger = trigger;
        Ok(())
    }

    /// Replace the output directory and chunking of the next run.
    ///
    /// Geometry fields are recomputed by `start_experiment`.
    pub fn set_save_settings(&self, saving: SavingParameters) -> AppResult<()> {
        let mut control = self.control.lock();
        Self::check_unlocked(&control, "Save settings")?;
        control.saving = saving;
        Ok(())
    }

    /// Set the experiment duration by hand.
    ///
    /// During a run the duration goes straight to the saver, which sizes the
    /// dataset from it.
    pub fn send_manual_duration(&self, duration_s: Option<f64>) -> AppResult<()> {
        if let Some(d) = duration_s {
            if !d.is_finite() || d <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "Invalid experiment duration {}",
                    d
                )));
            }
        }
        let mut control = self.control.lock();
        control.trigger.manual_duration_s = duration_s;
        if control.phase == GlobalPhase::ExperimentRunning && duration_s.is_some() {
            self.links.duration_tx.send_replace(duration_s);
        }
        Ok(())
    }

    /// Arm and enter `ExperimentRunning`.
    ///
    /// Pushes the run's saving parameters and experiment description, then
    /// the volumetric scan with `NoTrigger` (or `ExperimentStarted` when the
    /// run is not triggered). The scan loop restarts so it waits for the
    /// start signal before pulsing the camera; `IS_SAVING` is raised last.
    pub fn start_experiment(&self) -> AppResult<()> {
        let mut control = self.control.lock();
        if !control
            .phase
            .can_transition_to(GlobalPhase::ExperimentRunning, true)
        {
            return Err(DaqError::InvalidTransition {
                from: control.phase.to_string(),
                to: GlobalPhase::ExperimentRunning.to_string(),
            });
        }
        let plan = PhasePlan::new(GlobalPhase::ExperimentRunning, &control, self.sample_rate)?;
        let saving = self.run_saving_parameters(&control, &plan);
        let description = serde_json::json!({
            "lightsheet": {
                "n_planes": saving.n_planes,
                "volumerate": saving.volumerate,
                "voxel_size": saving.voxel_size,
                "n_volumes": saving.n_volumes,
            }
        });
        info!(
            n_planes = saving.n_planes,
            volumerate = saving.volumerate,
            n_volumes = ?saving.n_volumes,
            "starting experiment"
        );

        self.bus.set(SignalFlag::RestartScanning);
        self.links.saving_tx.send_replace(Some(saving));
        self.links.duration_tx.send_replace(None);
        self.links.config_tx.send_replace(description);
        self.bus.clear(SignalFlag::SavingStopped);

        control.armed = true;
        if let Err(e) = self.transition(&mut control, GlobalPhase::ExperimentRunning) {
            control.armed = false;
            self.bus.clear(SignalFlag::RestartScanning);
            return Err(e);
        }
        self.bus.set(SignalFlag::IsSaving);
        Ok(())
    }

    fn run_saving_parameters(&self, control: &Control, plan: &PhasePlan) -> SavingParameters {
        let n_planes = plan.dispatcher.n_planes;
        let voxel_z = match control.scan.z {
            ZScan::Scanning {
                piezo_min,
                piezo_max,
                ..
            } => (piezo_max - piezo_min).abs() / control.scan.triggering.n_planes.max(1) as f64,
            _ => 1.0,
        };
        let template = &control.saving;
        SavingParameters {
            voxel_size: [voxel_z, template.voxel_size[1], template.voxel_size[2]],
            volumerate: plan.dispatcher.volumerate,
            n_planes,
            n_volumes: n_volumes(plan.dispatcher.volumerate, control.trigger.manual_duration_s),
            ..template.clone()
        }
    }

    /// Operator start signal: the scan loop starts pulsing the camera.
    pub fn trigger_experiment(&self) -> AppResult<()> {
        let control = self.control.lock();
        if control.phase != GlobalPhase::ExperimentRunning {
            return Err(DaqError::InvalidTransition {
                from: control.phase.to_string(),
                to: "EXPERIMENT_STARTED".into(),
            });
        }
        self.links
            .scan_tx
            .send_modify(|p| p.experiment_state = ExperimentPhase::ExperimentStarted);
        info!("experiment triggered");
        Ok(())
    }

    /// End the run: stop saving, wait for the saver, return to volume preview.
    pub async fn end_experiment(&self) -> AppResult<()> {
        self.bus.clear(SignalFlag::IsSaving);
        let stopped = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            self.bus.wait_for(SignalFlag::SavingStopped, true),
        )
        .await;
        match stopped {
            Ok(result) => result?,
            Err(_) => warn!("saver did not confirm the end of the dataset"),
        }

        let mut control = self.control.lock();
        if control.phase != GlobalPhase::ExperimentRunning {
            return Ok(());
        }
        if let Err(e) = self.transition(&mut control, GlobalPhase::VolumePreview) {
            warn!(error = %e, "cannot return to volume preview");
            self.transition(&mut control, GlobalPhase::Paused)?;
        }
        info!("experiment ended");
        Ok(())
    }

    /// Stop every task and wait for it, at most [`SHUTDOWN_TIMEOUT`] each.
    ///
    /// A task that does not stop in time is aborted and reported.
    pub async fn wrap_up(&self) -> AppResult<()> {
        info!("wrapping up");
        self.bus.set(SignalFlag::CloseAll);
        let tasks = std::mem::take(&mut *self.tasks.lock());

        let mut failures = Vec::new();
        for (name, mut handle) in tasks {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "task panicked");
                    failures.push(format!("{} panicked: {}", name, e));
                }
                Err(_) => {
                    warn!(task = name, "task did not stop in time, aborting");
                    handle.abort();
                    failures.push(format!("{} did not stop within {:?}", name, SHUTDOWN_TIMEOUT));
                }
            }
        }

        if failures.is_empty() {
            info!("all tasks stopped");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }

    /// Handle task faults until `CLOSE_ALL`.
    ///
    /// Recoverable faults are logged. Any other fault aborts the run. A
    /// dataset the saver finished on its own ends the experiment.
    pub async fn supervise(&self, mut faults: FaultReceiver) {
        let span = info_span!("supervisor");
        async move {
            loop {
                let running = self.phase() == GlobalPhase::ExperimentRunning;
                tokio::select! {
                    biased;
                    _ = self.bus.wait_for(SignalFlag::CloseAll, true) => break,
                    fault = faults.recv() => match fault {
                        Some(fault) => self.handle_fault(fault),
                        None => break,
                    },
                    _ = self.bus.wait_for(SignalFlag::SavingStopped, true), if running => {
                        if let Err(e) = self.end_experiment().await {
                            warn!(error = %e, "ending the experiment failed");
                        }
                    }
                }
            }
            debug!("supervisor stopped");
        }
        .instrument(span)
        .await
    }

    fn handle_fault(&self, fault: Fault) {
        if fault.error.is_recoverable() {
            warn!(source = fault.source, error = %fault.error, "recoverable fault");
            return;
        }
        error!(source = fault.source, error = %fault.error, "fatal fault, aborting");
        if let Err(e) = self.change_global_state(GlobalPhase::Abort) {
            debug!(error = %e, "already aborted");
        }
    }

    /// Average the planes of the last assembled volume into a dark reference
    /// and turn on noise subtraction.
    ///
    /// Returns `false` if no volume has been assembled yet.
    pub fn obtain_noise_average(&self) -> bool {
        let Some(volume) = self.get_volume() else {
            return false;
        };
        let n_pixels = volume.width * volume.height;
        let mut sums = vec![0u64; n_pixels];
        for plane in &volume.planes {
            for (sum, px) in sums.iter_mut().zip(plane.pixels()) {
                *sum += u64::from(px);
            }
        }
        let n = volume.planes.len().max(1) as u64;
        let reference: Arc<[u16]> = sums
            .into_iter()
            .map(|sum| u16::try_from(sum / n).unwrap_or(u16::MAX))
            .collect();
        self.links.noise_tx.send_replace(Some(reference));
        self.bus.set(SignalFlag::NoiseSubtractionActive);
        info!(n_planes = volume.planes.len(), "noise reference updated");
        true
    }

    /// Drop the dark reference and stop subtracting it.
    pub fn reset_noise_subtraction(&self) {
        self.bus.clear(SignalFlag::NoiseSubtractionActive);
        self.links.noise_tx.send_replace(None);
    }

    /// Camera status as last published.
    pub fn get_camera_status(&self) -> CameraStatus {
        self.links.camera_status_rx.borrow().clone()
    }

    /// Saving progress as last published.
    pub fn get_save_status(&self) -> SavingStatus {
        self.links.saving_status_rx.borrow().clone()
    }

    /// Dispatcher counters as last published.
    pub fn get_dispatcher_status(&self) -> DispatcherStatus {
        *self.links.dispatcher_status_rx.borrow()
    }

    /// Last assembled volume.
    pub fn get_volume(&self) -> ViewerSnapshot {
        self.links.viewer_rx.borrow().clone()
    }

    /// Last recorded piezo period.
    pub fn get_waveform(&self) -> WaveformSnapshot {
        self.links.waveform_rx.borrow().clone()
    }

    /// Frame rate the scan pulses impose on the camera, `None` when it runs
    /// free.
    pub fn get_triggered_frame_rate(&self) -> Option<f64> {
        let camera = self.links.camera_tx.borrow();
        if camera.trigger_mode != TriggerMode::ExternalTrigger {
            return None;
        }
        let dispatcher = *self.links.dispatcher_tx.borrow();
        Some(dispatcher.volumerate * dispatcher.n_planes as f64)
    }

    /// Camera pulse times within one volume of the current volumetric
    /// settings, in seconds. Empty if they do not describe a volume.
    pub fn calculate_pulse_times(&self) -> Vec<f64> {
        let control = self.control.lock();
        let scan = ScanParameters {
            scan_mode: ScanMode::Volumetric,
            ..control.scan.clone()
        };
        match volumerate(&scan, self.sample_rate) {
            Ok(rate) => pulse_times(
                rate,
                scan.triggering.n_planes,
                scan.triggering.n_skip_start,
                scan.triggering.n_skip_end,
            ),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Frame, Volume};
    use crate::scanning::{GalvoSweep, TriggerWindow, XYScan};
    use crate::waveforms::SyncCoefficients;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.scanning.sample_rate = 1_000;
        settings.scanning.n_samples_waveform = 100;
        settings
    }

    fn volumetric_settings() -> ScanParameters {
        let sweep = GalvoSweep {
            frequency: 100.0,
            v_min: -0.5,
            v_max: 0.5,
        };
        ScanParameters {
            triggering: TriggerWindow {
                frequency: None,
                n_planes: 10,
                n_skip_start: 1,
                n_skip_end: 1,
            },
            xy: XYScan {
                lateral: sweep,
                frontal: sweep,
            },
            z: ZScan::Scanning {
                frequency: 2.0,
                piezo_min: 0.0,
                piezo_max: 200.0,
                lateral_sync: SyncCoefficients::new(0.0, 0.01),
                frontal_sync: SyncCoefficients::new(0.0, 0.01),
            },
            ..Default::default()
        }
    }

    fn state() -> (GlobalState, TaskEnds) {
        let (state, ends) = GlobalState::new(&settings(), EventBus::new());
        state.set_scan_settings(volumetric_settings()).unwrap();
        (state, ends)
    }

    #[test]
    fn transition_table() {
        use GlobalPhase::*;
        let all = [ExperimentRunning, Paused, PlanarPreview, Preview, VolumePreview, Abort];
        for from in all {
            assert_eq!(from.can_transition_to(Abort, false), from != Abort);
            assert_eq!(from.can_transition_to(Paused, false), from != Abort);
        }
        assert!(Preview.can_transition_to(VolumePreview, false));
        assert!(VolumePreview.can_transition_to(PlanarPreview, false));
        assert!(ExperimentRunning.can_transition_to(VolumePreview, false));
        assert!(!ExperimentRunning.can_transition_to(Preview, true));
        assert!(!ExperimentRunning.can_transition_to(ExperimentRunning, true));
        assert!(!VolumePreview.can_transition_to(ExperimentRunning, false));
        assert!(VolumePreview.can_transition_to(ExperimentRunning, true));
    }

    #[test]
    fn running_without_start_is_rejected() {
        let (state, _ends) = state();
        let err = state
            .change_global_state(GlobalPhase::ExperimentRunning)
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidTransition { .. }));
        assert_eq!(state.phase(), GlobalPhase::Paused);
    }

    #[test]
    fn volume_preview_pushes_volumetric_parameters() {
        let (state, ends) = state();
        state.change_global_state(GlobalPhase::VolumePreview).unwrap();

        let scan = ends.scan_rx.borrow().clone();
        assert_eq!(scan.scan_mode, ScanMode::Volumetric);
        assert_eq!(scan.experiment_state, ExperimentPhase::Preview);

        let camera = ends.camera_rx.borrow().clone();
        assert_eq!(camera.camera_mode, CameraMode::Triggered);
        assert_eq!(camera.trigger_mode, TriggerMode::ExternalTrigger);
        assert_eq!(camera.n_planes, 8);

        // 2 Hz at 1 kHz is 500 samples, padded to the 10 sample xy cycle
        let dispatcher = *ends.dispatcher_rx.borrow();
        assert_eq!(dispatcher.n_planes, 8);
        assert!((dispatcher.volumerate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn planar_preview_parks_the_sweep() {
        let (state, ends) = state();
        state.change_global_state(GlobalPhase::PlanarPreview).unwrap();
        let scan = ends.scan_rx.borrow().clone();
        assert_eq!(scan.scan_mode, ScanMode::Planar);
        match scan.z {
            ZScan::Synced { piezo, .. } => assert!((piezo - 100.0).abs() < 1e-9),
            other => panic!("unexpected z {:?}", other),
        }
        assert_eq!(ends.camera_rx.borrow().camera_mode, CameraMode::Preview);
        assert_eq!(state.get_triggered_frame_rate(), None);
    }

    #[test]
    fn volume_preview_needs_a_z_sweep() {
        let (state, _ends) = GlobalState::new(&settings(), EventBus::new());
        let err = state
            .change_global_state(GlobalPhase::VolumePreview)
            .unwrap_err();
        assert!(matches!(err, DaqError::Scanning(_)));
        assert_eq!(state.phase(), GlobalPhase::Paused);
    }

    #[test]
    fn start_experiment_arms_and_pushes_a_run() {
        let (state, ends) = state();
        state.change_global_state(GlobalPhase::Preview).unwrap();
        state.send_manual_duration(Some(3.0)).unwrap();
        state.bus().set(SignalFlag::SavingStopped);

        state.start_experiment().unwrap();

        assert_eq!(state.phase(), GlobalPhase::ExperimentRunning);
        assert!(state.is_armed());
        let scan = ends.scan_rx.borrow().clone();
        assert_eq!(scan.experiment_state, ExperimentPhase::NoTrigger);
        assert_eq!(scan.volume_budget, Some(6));
        assert_eq!(
            ends.camera_rx.borrow().camera_mode,
            CameraMode::ExperimentRunning
        );

        let saving = ends.saving_rx.borrow().clone().unwrap();
        assert_eq!(saving.n_planes, 8);
        assert_eq!(saving.n_volumes, Some(6));
        assert!((saving.voxel_size[0] - 20.0).abs() < 1e-9);
        assert_eq!(ends.config_rx.borrow()["lightsheet"]["n_planes"], 8);

        let bus = state.bus();
        assert!(bus.is_set(SignalFlag::IsSaving));
        assert!(bus.is_set(SignalFlag::RestartScanning));
        assert!(!bus.is_set(SignalFlag::SavingStopped));
        assert!((state.get_triggered_frame_rate().unwrap() - 16.0).abs() < 1e-9);

        state.trigger_experiment().unwrap();
        assert_eq!(
            ends.scan_rx.borrow().experiment_state,
            ExperimentPhase::ExperimentStarted
        );
        assert!(state.set_scan_settings(volumetric_settings()).is_err());
        assert!(state.start_experiment().is_err());
    }

    #[test]
    fn untriggered_run_starts_at_once() {
        let (state, ends) = state();
        state
            .set_trigger_settings(TriggerSettings {
                is_triggered: false,
                manual_duration_s: None,
            })
            .unwrap();
        state.start_experiment().unwrap();
        assert_eq!(
            ends.scan_rx.borrow().experiment_state,
            ExperimentPhase::ExperimentStarted
        );
        assert_eq!(ends.saving_rx.borrow().as_ref().unwrap().n_volumes, None);
    }

    #[test]
    fn trigger_outside_a_run_is_rejected() {
        let (state, _ends) = state();
        assert!(state.trigger_experiment().is_err());
    }

    #[test]
    fn manual_duration_reaches_the_saver_during_a_run() {
        let (state, ends) = state();
        assert!(state.send_manual_duration(Some(-1.0)).is_err());
        state.send_manual_duration(Some(5.0)).unwrap();
        assert!(ends.duration_rx.borrow().is_none());

        state.start_experiment().unwrap();
        state.send_manual_duration(Some(8.0)).unwrap();
        assert_eq!(*ends.duration_rx.borrow(), Some(8.0));
    }

    #[test]
    fn fatal_fault_cascades_abort() {
        let (state, ends) = state();
        state.start_experiment().unwrap();

        state.handle_fault(Fault {
            source: "scanner",
            error: DaqError::HardwareTimeout("no trigger".into()),
        });
        assert_eq!(state.phase(), GlobalPhase::ExperimentRunning);

        state.handle_fault(Fault {
            source: "scanner",
            error: DaqError::Scanning("board fault".into()),
        });
        assert_eq!(state.phase(), GlobalPhase::Abort);
        assert_eq!(ends.scan_rx.borrow().experiment_state, ExperimentPhase::Abort);
        assert_eq!(ends.camera_rx.borrow().camera_mode, CameraMode::Abort);
        assert!(!state.bus().is_set(SignalFlag::IsSaving));
        assert!(state.change_global_state(GlobalPhase::Paused).is_err());
    }

    #[test]
    fn noise_average_of_last_volume() {
        let (state, ends) = state();
        assert!(!state.obtain_noise_average());

        let planes = vec![
            Frame::from_pixels(&[10, 20, 30, 40], 2, 2, 0),
            Frame::from_pixels(&[30, 40, 50, 60], 2, 2, 1).with_plane(1),
        ];
        ends.viewer_tx.send_replace(Some(Arc::new(Volume {
            index: 0,
            planes,
            volumerate: 1.0,
            width: 2,
            height: 2,
        })));

        assert!(state.obtain_noise_average());
        let reference = ends.noise_rx.borrow().clone().unwrap();
        assert_eq!(&reference[..], &[20, 30, 40, 50]);
        assert!(state.bus().is_set(SignalFlag::NoiseSubtractionActive));

        state.reset_noise_subtraction();
        assert!(ends.noise_rx.borrow().is_none());
        assert!(!state.bus().is_set(SignalFlag::NoiseSubtractionActive));
    }

    #[test]
    fn pulse_times_follow_volume_settings() {
        let (state, _ends) = state();
        let times = state.calculate_pulse_times();
        // 8 imaged planes of 10 at 2 volumes/s
        assert_eq!(times.len(), 8);
        assert!((times[0] - 0.05).abs() < 1e-9);
        assert!((times[1] - 0.10).abs() < 1e-9);
    }

    #[test]
    fn mock_hardware_rejects_unknown_devices() {
        let mut settings = settings();
        settings.camera.sensor_resolution = [64, 64];
        assert!(Hardware::mock(&settings).is_ok());
        settings.scanning.board = "ni_6343".into();
        assert!(Hardware::mock(&settings).is_err());
    }
}
