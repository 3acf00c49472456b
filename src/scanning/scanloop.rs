//! The scan loop state machine.
//!
//! One [`ScanLoop`] drives the board for as long as the scan mode and the
//! z variant stay the same. Each hardware cycle:
//!
//! ```text
//! refill:  update_settings() -> fill_arrays() -> RollingBuffer::write   (whole periods)
//! chunk:   RollingBuffer::read(n) -> camera_trigger() -> write()
//! first:   check_start()  (waits while the experiment is armed but not started)
//! always:  read() -> record piezo feedback -> publish the recorded period
//! ```
//!
//! New parameters are only applied when the next period is generated, so the
//! outputs never jump in the middle of a sweep. Camera pulses start on a
//! period boundary once one full period of feedback has been read back.

use super::{
    ExperimentPhase, ScanMode, ScanParameters, ScanTiming, TriggerWindow, WaveformSnapshot, ZScan,
};
use crate::data::{FillingRollingBuffer, RollingBuffer};
use crate::error::{AppResult, DaqError};
use crate::events::{EventBus, SignalFlag};
use crate::hardware::{AnalogChunk, AnalogIOBoard};
use crate::waveforms::{
    calc_sync, lcm, period_samples, set_impulses, SyncCoefficients, Waveform, CAMERA_PULSE_HIGH,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest scan period accepted, in seconds of output.
const MAX_PERIOD_SECONDS: usize = 60;

/// One sample on every output line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanSample {
    /// Lateral xy galvo
    pub xy_lateral: f64,
    /// Frontal xy galvo
    pub xy_frontal: f64,
    /// Piezo
    pub z_piezo: f64,
    /// Lateral z galvo
    pub z_lateral: f64,
    /// Frontal z galvo
    pub z_frontal: f64,
    /// Camera trigger line
    pub camera: f64,
}

impl From<&[ScanSample]> for AnalogChunk {
    fn from(samples: &[ScanSample]) -> Self {
        AnalogChunk {
            xy_lateral: samples.iter().map(|s| s.xy_lateral).collect(),
            xy_frontal: samples.iter().map(|s| s.xy_frontal).collect(),
            z_piezo: samples.iter().map(|s| s.z_piezo).collect(),
            z_lateral: samples.iter().map(|s| s.z_lateral).collect(),
            z_frontal: samples.iter().map(|s| s.z_frontal).collect(),
        }
    }
}

impl ZScan {
    /// Write the z lines of `out`.
    ///
    /// # Arguments
    /// * `start` - sample index of `out[0]` within the current geometry
    /// * `sweep` - piezo sweep, used by `Scanning`
    /// * `feedback` - one recorded period of piezo position aligned with
    ///   `out`, used by `Scanning` once available
    pub fn fill_z_samples(
        &self,
        out: &mut [ScanSample],
        start: u64,
        sweep: Option<&Waveform>,
        feedback: Option<&[f64]>,
    ) {
        match *self {
            ZScan::Manual {
                piezo,
                lateral,
                frontal,
            } => {
                for s in out.iter_mut() {
                    s.z_piezo = piezo;
                    s.z_lateral = lateral;
                    s.z_frontal = frontal;
                }
            }
            ZScan::Synced {
                piezo,
                lateral_sync,
                frontal_sync,
            } => {
                for s in out.iter_mut() {
                    s.z_piezo = piezo;
                    s.z_lateral = lateral_sync.apply(piezo);
                    s.z_frontal = frontal_sync.apply(piezo);
                }
            }
            ZScan::Scanning {
                piezo_min,
                lateral_sync,
                frontal_sync,
                ..
            } => {
                for (k, s) in out.iter_mut().enumerate() {
                    s.z_piezo = sweep.map_or(piezo_min, |w| w.value_at(start + k as u64));
                }
                // Galvos follow where the piezo actually is, falling back to
                // where it was told to be
                let source: Vec<f64> = match feedback {
                    Some(f) if f.len() == out.len() => f.to_vec(),
                    _ => out.iter().map(|s| s.z_piezo).collect(),
                };
                follow(out, &source, lateral_sync, |s| &mut s.z_lateral);
                follow(out, &source, frontal_sync, |s| &mut s.z_frontal);
            }
        }
    }
}

fn follow(
    out: &mut [ScanSample],
    piezo: &[f64],
    sync: SyncCoefficients,
    line: impl Fn(&mut ScanSample) -> &mut f64,
) {
    let in_range = sync.keeps_in_range(piezo);
    for (s, z) in out.iter_mut().zip(piezo) {
        *line(s) = if in_range { sync.apply(*z) } else { 0.0 };
    }
}

/// Which scan loop variant is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// One plane.
    Planar,
    /// Piezo sweep.
    Volumetric,
}

impl LoopKind {
    fn scan_mode(self) -> ScanMode {
        match self {
            LoopKind::Planar => ScanMode::Planar,
            LoopKind::Volumetric => ScanMode::Volumetric,
        }
    }
}

/// Scan loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanLoopState {
    /// Mounted but not yet scanning, or exited to be rebuilt.
    Initializing,
    /// Planar scanning.
    Planar,
    /// Volumetric scanning.
    Volumetric,
    /// Exited because the scan mode became `Paused`.
    Paused,
    /// Exited on an experiment abort.
    Aborted,
    /// Exited on `CLOSE_ALL` or an exhausted volume budget.
    Stopped,
}

#[derive(Debug, Clone)]
struct Geometry {
    period: usize,
    lateral: Waveform,
    frontal: Waveform,
    sweep: Option<Waveform>,
    pulses: Option<Vec<f64>>,
}

impl Geometry {
    fn new(kind: LoopKind, params: &ScanParameters, sample_rate: u32) -> AppResult<Self> {
        let xy = &params.xy;
        let lateral =
            Waveform::triangle(xy.lateral.frequency, sample_rate, xy.lateral.v_min, xy.lateral.v_max)?;
        let frontal =
            Waveform::triangle(xy.frontal.frequency, sample_rate, xy.frontal.v_min, xy.frontal.v_max)?;
        let xy_period = lcm(
            lateral.period_samples().unwrap_or(1),
            frontal.period_samples().unwrap_or(1),
        );

        let (period, sweep, pulses) = match kind {
            LoopKind::Planar => {
                if matches!(params.z, ZScan::Scanning { .. }) {
                    return Err(DaqError::Scanning(
                        "Planar scanning needs a fixed z position".into(),
                    ));
                }
                match params.triggering.frequency.filter(|f| *f > 0.0) {
                    Some(frequency) => {
                        let trigger_period = period_samples(frequency, sample_rate)?;
                        let period = lcm(xy_period, trigger_period);
                        let mut pulses = vec![0.0; period];
                        set_impulses(&mut pulses, period / trigger_period, 0, 0, CAMERA_PULSE_HIGH);
                        (period, None, Some(pulses))
                    }
                    None => (xy_period, None, None),
                }
            }
            LoopKind::Volumetric => {
                let ZScan::Scanning {
                    frequency,
                    piezo_min,
                    piezo_max,
                    ..
                } = params.z
                else {
                    return Err(DaqError::Scanning(
                        "Volumetric scanning needs a z sweep".into(),
                    ));
                };
                let z_period = period_samples(frequency, sample_rate)?;
                if z_period < xy_period {
                    return Err(DaqError::Scanning(format!(
                        "z sweep of {} samples is shorter than the xy cycle of {} samples",
                        z_period, xy_period
                    )));
                }
                let TriggerWindow {
                    n_planes,
                    n_skip_start,
                    n_skip_end,
                    ..
                } = params.triggering;
                if n_planes == 0 || n_planes > z_period {
                    return Err(DaqError::Scanning(format!(
                        "Cannot place {} planes in a {} sample sweep",
                        n_planes, z_period
                    )));
                }
                let period = z_period + calc_sync(xy_period, z_period).z_offset;
                let sweep = Waveform::Sawtooth {
                    period_samples: period,
                    v_min: piezo_min,
                    v_max: piezo_max,
                };
                let mut pulses = vec![0.0; period];
                set_impulses(&mut pulses, n_planes, n_skip_start, n_skip_end, CAMERA_PULSE_HIGH);
                (period, Some(sweep), Some(pulses))
            }
        };

        if period == 0 || period > sample_rate as usize * MAX_PERIOD_SECONDS {
            return Err(DaqError::Scanning(format!(
                "Scan period of {} samples is out of range",
                period
            )));
        }

        Ok(Self {
            period,
            lateral,
            frontal,
            sweep,
            pulses,
        })
    }
}

/// Samples in one scan period of `kind` for `params`.
///
/// Fails for the same geometries [`ScanLoop::new`] rejects.
pub fn period_for(kind: LoopKind, params: &ScanParameters, sample_rate: u32) -> AppResult<usize> {
    Geometry::new(kind, params, sample_rate).map(|geometry| geometry.period)
}

/// Drives one scan mode until it needs to be rebuilt.
pub struct ScanLoop {
    kind: LoopKind,
    board: Arc<dyn AnalogIOBoard>,
    bus: EventBus,
    params_rx: watch::Receiver<ScanParameters>,
    waveform_tx: Arc<watch::Sender<WaveformSnapshot>>,
    timing: ScanTiming,
    sample_rate: u32,
    n_samples: usize,
    parameters: ScanParameters,
    initial_z: ZScan,
    geometry: Geometry,
    state: ScanLoopState,
    buffer: RollingBuffer<ScanSample>,
    recorded: FillingRollingBuffer<f64>,
    /// Sample index where the current geometry began
    origin: u64,
    /// Sample index of the next generated period
    next_period_start: u64,
    /// Sample index of the next chunk read back from the board
    i_sample: u64,
    n_read_since_config: u64,
    started: bool,
    camera_on: bool,
    /// A started loop was armed again and must wait for the start signal
    rearm: bool,
    n_pulsed_periods: u64,
    pulsed_until: u64,
}

impl ScanLoop {
    /// Mount a loop on `board` with the latest parameters.
    ///
    /// # Errors
    /// Returns [`DaqError::Scanning`] if the parameters do not describe a
    /// scan of this kind.
    pub fn new(
        kind: LoopKind,
        board: Arc<dyn AnalogIOBoard>,
        bus: EventBus,
        mut params_rx: watch::Receiver<ScanParameters>,
        waveform_tx: Arc<watch::Sender<WaveformSnapshot>>,
        timing: ScanTiming,
    ) -> AppResult<Self> {
        let parameters = params_rx.borrow_and_update().clone();
        let sample_rate = board.sample_rate();
        let n_samples = board.n_samples();
        if n_samples == 0 {
            return Err(DaqError::Scanning("Board chunk length is zero".into()));
        }
        let geometry = Geometry::new(kind, &parameters, sample_rate)?;
        let recorded_len = match kind {
            LoopKind::Planar => 0,
            LoopKind::Volumetric => geometry.period,
        };

        Ok(Self {
            kind,
            board,
            bus,
            params_rx,
            waveform_tx,
            timing,
            sample_rate,
            n_samples,
            initial_z: parameters.z,
            parameters,
            buffer: RollingBuffer::new(geometry.period + n_samples),
            recorded: FillingRollingBuffer::new(recorded_len),
            geometry,
            state: ScanLoopState::Initializing,
            origin: 0,
            next_period_start: 0,
            i_sample: 0,
            n_read_since_config: 0,
            started: false,
            camera_on: false,
            rearm: false,
            n_pulsed_periods: 0,
            pulsed_until: 0,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanLoopState {
        self.state
    }

    /// Samples in one full scan period.
    pub fn n_samples_period(&self) -> usize {
        self.geometry.period
    }

    /// Parameters currently applied.
    pub fn parameters(&self) -> &ScanParameters {
        &self.parameters
    }

    fn expects_pulses(&self) -> bool {
        self.geometry.pulses.is_some()
    }

    /// Reset counters and announce that no camera pulses have been issued.
    pub fn initialize(&mut self) {
        self.state = match self.kind {
            LoopKind::Planar => ScanLoopState::Planar,
            LoopKind::Volumetric => ScanLoopState::Volumetric,
        };
        self.camera_on = false;
        self.n_read_since_config = 0;
        if self.expects_pulses() {
            self.bus.set(SignalFlag::WaitingForTrigger);
        } else {
            self.bus.clear(SignalFlag::WaitingForTrigger);
        }
    }

    /// Generate the next full period of every output line.
    pub fn fill_arrays(&mut self) -> AppResult<Vec<ScanSample>> {
        let period = self.geometry.period;
        let start = self.next_period_start.saturating_sub(self.origin);
        let mut out = vec![ScanSample::default(); period];

        for (k, s) in out.iter_mut().enumerate() {
            let i = start + k as u64;
            s.xy_lateral = self.geometry.lateral.value_at(i);
            s.xy_frontal = self.geometry.frontal.value_at(i);
        }

        let feedback = self
            .recorded
            .is_complete()
            .then(|| self.recorded.snapshot());
        self.parameters.z.fill_z_samples(
            &mut out,
            start,
            self.geometry.sweep.as_ref(),
            feedback.as_deref(),
        );

        if self.camera_on && !self.budget_reached() {
            if let Some(pulses) = &self.geometry.pulses {
                for (s, p) in out.iter_mut().zip(pulses) {
                    s.camera = *p;
                }
                self.n_pulsed_periods += 1;
                self.pulsed_until = self.next_period_start + period as u64;
            }
        }

        self.next_period_start += period as u64;
        Ok(out)
    }

    /// Apply the latest parameters, if any arrived. Only called at a period
    /// boundary. Returns whether new parameters were seen.
    pub fn update_settings(&mut self) -> AppResult<bool> {
        let changed = self.params_rx.has_changed().unwrap_or(false);
        if changed {
            let new = self.params_rx.borrow_and_update().clone();
            let same_shape =
                new.scan_mode == self.kind.scan_mode() && new.z.same_kind(&self.initial_z);
            if self.started
                && new.experiment_state == ExperimentPhase::NoTrigger
                && self.parameters.experiment_state != ExperimentPhase::NoTrigger
            {
                info!("armed while running, waiting for the start signal again");
                self.rearm = true;
            }
            if same_shape && !self.rearm {
                let geometry = Geometry::new(self.kind, &new, self.sample_rate)?;
                self.parameters = new;
                self.apply_geometry(geometry)?;
            } else {
                // loop_condition() sends the loop back for re-initialization
                self.parameters = new;
            }
        }

        if !self.camera_on
            && self.started
            && self.n_read_since_config >= self.geometry.period as u64
        {
            self.camera_on = true;
            info!(period = self.geometry.period, "camera pulses enabled");
        }
        Ok(changed)
    }

    fn apply_geometry(&mut self, geometry: Geometry) -> AppResult<()> {
        if geometry.period != self.geometry.period {
            debug!(
                old = self.geometry.period,
                new = geometry.period,
                "scan period changed"
            );
            let pending = self.buffer.read(self.buffer.available())?;
            self.buffer = RollingBuffer::new(geometry.period + self.n_samples);
            self.buffer.write(&pending)?;
            if self.kind == LoopKind::Volumetric {
                self.recorded = FillingRollingBuffer::new(geometry.period);
            }
            self.origin = self.next_period_start;
            self.geometry = geometry;
            self.initialize();
        } else {
            self.geometry = geometry;
        }
        Ok(())
    }

    fn needs_reinit(&self) -> bool {
        self.rearm
            || self.parameters.scan_mode != self.kind.scan_mode()
            || !self.parameters.z.same_kind(&self.initial_z)
    }

    fn budget_reached(&self) -> bool {
        self.parameters
            .volume_budget
            .is_some_and(|budget| self.n_pulsed_periods >= budget)
    }

    /// Whether the loop should run another cycle.
    pub fn loop_condition(&mut self) -> bool {
        if self.bus.is_set(SignalFlag::CloseAll) {
            self.state = ScanLoopState::Stopped;
            return false;
        }
        if self.params_rx.borrow().experiment_state == ExperimentPhase::Abort {
            self.state = ScanLoopState::Aborted;
            return false;
        }
        if self.bus.take(SignalFlag::RestartScanning) {
            self.state = ScanLoopState::Initializing;
            return false;
        }
        if self.needs_reinit() {
            self.state = if self.parameters.scan_mode == ScanMode::Paused {
                ScanLoopState::Paused
            } else {
                ScanLoopState::Initializing
            };
            return false;
        }
        if self.budget_reached() && self.i_sample >= self.pulsed_until {
            info!(volumes = self.n_pulsed_periods, "volume budget reached");
            self.state = ScanLoopState::Stopped;
            return false;
        }
        true
    }

    /// Start the board on the first cycle, waiting while the experiment is
    /// armed but not yet started.
    ///
    /// Returns early without starting on `CLOSE_ALL` or an abort.
    ///
    /// # Errors
    /// Returns [`DaqError::HardwareTimeout`] if the start signal does not
    /// arrive within the trigger timeout.
    pub async fn check_start(&mut self) -> AppResult<()> {
        if self.started {
            return Ok(());
        }
        let deadline = Instant::now() + self.timing.trigger_timeout;
        loop {
            if self.bus.is_set(SignalFlag::CloseAll) {
                return Ok(());
            }
            let phase = self.params_rx.borrow().experiment_state;
            match phase {
                ExperimentPhase::Abort => return Ok(()),
                ExperimentPhase::NoTrigger => {
                    self.bus.set(SignalFlag::WaitingForTrigger);
                    if Instant::now() >= deadline {
                        return Err(DaqError::HardwareTimeout(format!(
                            "no start signal within {:?}",
                            self.timing.trigger_timeout
                        )));
                    }
                    tokio::time::sleep(self.timing.poll_interval).await;
                }
                ExperimentPhase::Preview | ExperimentPhase::ExperimentStarted => break,
            }
        }
        self.board.start().await?;
        self.started = true;
        info!("board started");
        Ok(())
    }

    async fn check_start_retrying(&mut self) -> AppResult<()> {
        loop {
            match self.check_start().await {
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "still waiting for the start signal");
                }
                other => return other,
            }
        }
    }

    async fn write(&mut self, chunk: &AnalogChunk, pulses: &[f64]) -> AppResult<()> {
        self.board.write(chunk).await?;
        if self.bus.is_set(SignalFlag::WaitingForTrigger)
            && (!self.expects_pulses() || pulses.iter().any(|p| *p > 0.0))
        {
            self.bus.clear(SignalFlag::WaitingForTrigger);
        }
        Ok(())
    }

    /// Read back one chunk of feedback and record the piezo position.
    pub async fn read(&mut self) -> AppResult<()> {
        let readback = self.board.read(self.n_samples).await?;
        let chunk_start = self.i_sample;
        self.i_sample += self.n_samples as u64;
        self.n_read_since_config += self.n_samples as u64;

        if self.kind == LoopKind::Volumetric && chunk_start >= self.origin {
            let local = chunk_start - self.origin;
            self.recorded.write_at(local, &readback.z_piezo);
            let period = self.geometry.period as u64;
            let end = local + self.n_samples as u64;
            if self.recorded.is_complete() && end / period > local / period {
                self.waveform_tx
                    .send_replace(Some(Arc::from(self.recorded.snapshot())));
            }
        }
        Ok(())
    }

    async fn step(&mut self) -> AppResult<()> {
        while self.buffer.available() < self.n_samples {
            self.update_settings()?;
            if self.needs_reinit() {
                return Ok(());
            }
            let period = self.fill_arrays()?;
            self.buffer.write(&period)?;
        }

        let samples = self.buffer.read(self.n_samples)?;
        let chunk = AnalogChunk::from(samples.as_slice());
        let pulses: Vec<f64> = samples.iter().map(|s| s.camera).collect();
        self.board.camera_trigger(&pulses).await?;
        self.write(&chunk, &pulses).await?;

        self.check_start_retrying().await?;
        if !self.started {
            return Ok(());
        }
        self.read().await
    }

    /// Run until the loop condition fails. Returns the exit state.
    pub async fn run(mut self) -> AppResult<ScanLoopState> {
        self.initialize();
        info!(
            kind = ?self.kind,
            period = self.geometry.period,
            chunk = self.n_samples,
            "scan loop mounted"
        );
        while self.loop_condition() {
            self.step().await?;
        }
        debug!(state = ?self.state, "scan loop exiting");
        Ok(self.state)
    }
}
