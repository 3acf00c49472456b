//! Camera acquisition task.
//!
//! The [`CameraLoop`] polls the camera, tags frames with their plane index
//! and pushes them onto the bounded frame queue. Parameter snapshots arrive
//! on a `watch` channel and are applied between polls, never while a frame
//! is being read out.

use crate::config::CameraConfig;
use crate::data::Frame;
use crate::error::{AppResult, DaqError, Fault, FaultSender};
use crate::events::{EventBus, SignalFlag};
use crate::hardware::{Camera, CameraSettings, TriggerMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What the camera task is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraMode {
    /// Release the camera and exit.
    Abort,
    /// Triggered acquisition of an experiment.
    ExperimentRunning,
    /// Acquisition stopped, camera kept open.
    #[default]
    Paused,
    /// Free-running display acquisition.
    Preview,
    /// One frame per scan pulse, not saved.
    Triggered,
}

impl CameraMode {
    /// Whether frames belong to volumes and carry a plane index.
    pub fn tags_planes(self) -> bool {
        matches!(self, CameraMode::Triggered | CameraMode::ExperimentRunning)
    }
}

/// Camera parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Exposure, binning and ROI
    pub settings: CameraSettings,
    /// Free-running or triggered
    pub trigger_mode: TriggerMode,
    /// Task mode
    pub camera_mode: CameraMode,
    /// Imaged planes per volume, used for plane tagging
    pub n_planes: usize,
}

impl CameraParameters {
    /// Paused camera with the configured default exposure and binning.
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            settings: CameraSettings {
                exposure_ms: config.default_exposure_ms,
                binning: config.default_binning,
                roi: None,
            },
            trigger_mode: TriggerMode::Free,
            camera_mode: CameraMode::Paused,
            n_planes: 1,
        }
    }
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self::from_config(&CameraConfig::default())
    }
}

/// Camera status published after every framerate update and parameter change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    /// Current task mode
    pub mode: CameraMode,
    /// `(width, height)` of the frames being acquired
    pub frame_shape: (usize, usize),
    /// Frames per second over the last measurement window
    pub framerate: Option<f64>,
    /// Frames pushed since the task started
    pub frames_acquired: u64,
}

/// Estimates the frame rate once every `n_fps_frames` frames.
#[derive(Debug, Clone)]
pub struct FramerateRecorder {
    n_fps_frames: usize,
    i_fps: usize,
    previous: Option<Instant>,
    current_framerate: Option<f64>,
}

impl FramerateRecorder {
    /// Recorder measuring over windows of `n_fps_frames` frames.
    pub fn new(n_fps_frames: usize) -> Self {
        Self {
            n_fps_frames: n_fps_frames.max(1),
            i_fps: 0,
            previous: None,
            current_framerate: None,
        }
    }

    /// Last estimate, `None` until two windows have completed.
    pub fn current_framerate(&self) -> Option<f64> {
        self.current_framerate
    }

    /// Count one frame arriving now. Returns `true` when a window closed.
    pub fn update_framerate(&mut self) -> bool {
        self.update_framerate_at(Instant::now())
    }

    /// Count one frame arriving at `now`.
    pub fn update_framerate_at(&mut self, now: Instant) -> bool {
        let closed = self.i_fps == self.n_fps_frames - 1;
        if closed {
            if let Some(previous) = self.previous {
                let elapsed = now.saturating_duration_since(previous).as_secs_f64();
                self.current_framerate = Some(if elapsed > 0.0 {
                    self.n_fps_frames as f64 / elapsed
                } else {
                    0.0
                });
            }
            self.previous = Some(now);
        }
        self.i_fps = (self.i_fps + 1) % self.n_fps_frames;
        closed
    }

    /// Forget the current estimate.
    pub fn restart(&mut self) {
        self.current_framerate = None;
    }
}

/// Timing knobs of the camera task.
#[derive(Debug, Clone, Copy)]
pub struct CameraTiming {
    /// Frames per framerate window
    pub n_fps_frames: usize,
    /// How long a full frame queue may block a frame
    pub put_timeout: Duration,
    /// Sleep between empty polls
    pub poll_interval: Duration,
}

/// Task that owns the camera.
pub struct CameraLoop {
    camera: Arc<dyn Camera>,
    bus: EventBus,
    params_rx: watch::Receiver<CameraParameters>,
    frame_tx: mpsc::Sender<Frame>,
    status_tx: Arc<watch::Sender<CameraStatus>>,
    faults: FaultSender,
    timing: CameraTiming,
    parameters: CameraParameters,
    framerate: FramerateRecorder,
    was_waiting: bool,
    n_frames: u64,
}

impl CameraLoop {
    /// Assemble the camera task.
    pub fn new(
        camera: Arc<dyn Camera>,
        bus: EventBus,
        params_rx: watch::Receiver<CameraParameters>,
        frame_tx: mpsc::Sender<Frame>,
        status_tx: Arc<watch::Sender<CameraStatus>>,
        faults: FaultSender,
        timing: CameraTiming,
    ) -> Self {
        let parameters = params_rx.borrow().clone();
        Self {
            camera,
            bus,
            params_rx,
            frame_tx,
            status_tx,
            faults,
            framerate: FramerateRecorder::new(timing.n_fps_frames),
            timing,
            parameters,
            was_waiting: false,
            n_frames: 0,
        }
    }

    /// Run until `CLOSE_ALL` or `CameraMode::Abort`, then shut the camera down.
    pub async fn run(self) {
        let span = info_span!("camera");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!("started");
        self.parameters = self.params_rx.borrow_and_update().clone();
        if let Err(e) = self.camera.apply_settings(&self.parameters.settings).await {
            self.report(e);
        }
        self.publish_status();

        while !self.bus.is_set(SignalFlag::CloseAll) {
            match self.parameters.camera_mode {
                CameraMode::Abort => break,
                CameraMode::Paused => {
                    if !self.pause_loop().await {
                        break;
                    }
                }
                _ => {
                    if let Err(e) = self.acquire().await {
                        error!(error = %e, "acquisition failed");
                        if let Err(e) = self.camera.stop_acquisition().await {
                            warn!(error = %e, "stop acquisition failed");
                        }
                        self.report(e);
                        if !self.pause_loop().await {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.camera.stop_acquisition().await {
            warn!(error = %e, "stop acquisition failed");
        }
        if let Err(e) = self.camera.shutdown().await {
            warn!(error = %e, "camera shutdown failed");
        }
        self.publish_status();
        info!(frames = self.n_frames, "stopped");
    }

    /// Wait for new parameters. Returns `false` on `CLOSE_ALL`.
    async fn pause_loop(&mut self) -> bool {
        let changed = tokio::select! {
            changed = self.params_rx.changed() => changed.is_ok(),
            _ = self.bus.wait_for(SignalFlag::CloseAll, true) => false,
        };
        if !changed {
            return false;
        }
        let new = self.params_rx.borrow_and_update().clone();
        if let Err(e) = self.camera.apply_settings(&new.settings).await {
            self.report(e);
        }
        self.parameters = new;
        self.framerate.restart();
        self.publish_status();
        true
    }

    async fn acquire(&mut self) -> AppResult<()> {
        self.camera
            .start_acquisition(self.parameters.trigger_mode)
            .await?;
        info!(mode = ?self.parameters.camera_mode, trigger = ?self.parameters.trigger_mode, "acquisition started");
        self.n_frames = 0;

        while !self.bus.is_set(SignalFlag::CloseAll) {
            let is_waiting = self.bus.is_set(SignalFlag::WaitingForTrigger);
            if is_waiting {
                // First pulse after the wait is plane 0
                self.n_frames = 0;
            }

            let frames = self.camera.get_frames().await?;
            if frames.is_empty() {
                tokio::time::sleep(self.timing.poll_interval).await;
            }
            for frame in frames {
                self.push(frame, is_waiting).await?;
            }

            if self.params_rx.has_changed().unwrap_or(false) {
                let new = self.params_rx.borrow_and_update().clone();
                if new != self.parameters || new.camera_mode == CameraMode::Abort {
                    let keep_running = self.update_parameters(new).await?;
                    if !keep_running {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn push(&mut self, mut frame: Frame, is_waiting: bool) -> AppResult<()> {
        if self.parameters.camera_mode.tags_planes() {
            frame.plane_index = (self.n_frames % self.parameters.n_planes.max(1) as u64) as usize;
        }
        self.n_frames += 1;

        if self.was_waiting && !is_waiting {
            self.bus.set(SignalFlag::TriggerStytra);
        }
        self.was_waiting = is_waiting;

        match self.frame_tx.send_timeout(frame, self.timing.put_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(DaqError::QueueTimeout("frames")),
            Err(SendTimeoutError::Closed(_)) => return Err(DaqError::ChannelClosed("frames")),
        }
        self.status_tx.send_modify(|s| s.frames_acquired += 1);

        if self.framerate.update_framerate() {
            debug!(framerate = ?self.framerate.current_framerate(), "framerate");
            self.publish_status();
        }
        Ok(())
    }

    /// Restart acquisition with `new`. Returns `false` when acquisition
    /// should not resume.
    async fn update_parameters(&mut self, new: CameraParameters) -> AppResult<bool> {
        self.camera.stop_acquisition().await?;
        self.camera.apply_settings(&new.settings).await?;
        info!(
            mode = ?new.camera_mode,
            exposure_ms = new.settings.exposure_ms,
            binning = new.settings.binning,
            n_planes = new.n_planes,
            "updated parameters"
        );
        self.parameters = new;
        self.framerate.restart();
        self.publish_status();

        if matches!(
            self.parameters.camera_mode,
            CameraMode::Paused | CameraMode::Abort
        ) {
            return Ok(false);
        }
        self.camera
            .start_acquisition(self.parameters.trigger_mode)
            .await?;
        self.n_frames = 0;
        Ok(true)
    }

    fn publish_status(&self) {
        let shape = self
            .parameters
            .settings
            .frame_shape(self.camera.sensor_resolution());
        let mode = self.parameters.camera_mode;
        let framerate = self.framerate.current_framerate();
        self.status_tx.send_modify(|s| {
            s.mode = mode;
            s.frame_shape = shape;
            s.framerate = framerate;
        });
    }

    fn report(&self, error: DaqError) {
        let _ = self.faults.send(Fault {
            source: "camera",
            error,
        });
    }
}
