//! Mock Hardware Implementations
//!
//! Simulated devices for running the full pipeline without a microscope.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockBoard` - Analog board that echoes the piezo command as feedback and
//!   counts camera trigger pulses once its clock is started
//! - `MockCamera` - Camera that free-runs at its exposure time or emits one
//!   frame per pulse counted by a linked `MockBoard`
//! - `MockExternalTrigger` - Tracking instrument that answers with a fixed
//!   experiment duration
//!
//! Board and camera share a [`TriggerLink`], standing in for the trigger
//! cable between them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::data::{Frame, FramePool};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    AnalogChunk, AnalogIOBoard, AnalogReadback, Camera, CameraSettings, ExternalTrigger,
    TriggerMode,
};

/// Trigger line level above which a sample counts as high.
const TRIGGER_THRESHOLD: f64 = 2.5;

/// Most frames a free-running mock camera reports per poll.
const MAX_FREE_FRAMES_PER_POLL: u64 = 4;

// =============================================================================
// TriggerLink - Simulated trigger cable
// =============================================================================

/// Counts rising edges emitted by a board for a camera to consume.
#[derive(Debug, Clone, Default)]
pub struct TriggerLink {
    issued: Arc<AtomicU64>,
}

impl TriggerLink {
    /// Create a link with no pulses issued.
    pub fn new() -> Self {
        Self::default()
    }

    fn fire(&self, n: u64) {
        self.issued.fetch_add(n, Ordering::SeqCst);
    }

    /// Pulses issued since creation.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

// =============================================================================
// MockBoard - Simulated analog IO board
// =============================================================================

#[derive(Debug, Default)]
struct BoardState {
    started: bool,
    staged_trigger: Vec<f64>,
    last_level: f64,
    last_piezo: Vec<f64>,
}

/// Mock analog board
///
/// - `write` checks chunk shape and counts trigger rising edges, but only
///   while the clock runs
/// - `read` returns the last piezo command as position feedback and, when
///   paced, sleeps for the chunk duration like a real sample clock
///
/// # Example
///
/// ```rust,ignore
/// let link = TriggerLink::new();
/// let board = MockBoard::new(40_000, 1_000, link.clone()).paced(true);
/// board.start().await?;
/// ```
pub struct MockBoard {
    sample_rate: u32,
    n_samples: usize,
    paced: bool,
    link: TriggerLink,
    state: Mutex<BoardState>,
    pulses_emitted: AtomicU64,
    fault: AtomicBool,
}

impl MockBoard {
    /// Create an unpaced board.
    ///
    /// # Arguments
    /// * `sample_rate` - samples per second
    /// * `n_samples` - chunk length
    /// * `link` - trigger cable to a `MockCamera`
    pub fn new(sample_rate: u32, n_samples: usize, link: TriggerLink) -> Self {
        Self {
            sample_rate,
            n_samples,
            paced: false,
            link,
            state: Mutex::new(BoardState::default()),
            pulses_emitted: AtomicU64::new(0),
            fault: AtomicBool::new(false),
        }
    }

    /// Sleep for the chunk duration on every read.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Make every subsequent write fail.
    pub fn inject_fault(&self) {
        self.fault.store(true, Ordering::SeqCst);
    }

    /// Trigger pulses emitted while the clock was running.
    pub fn pulses_emitted(&self) -> u64 {
        self.pulses_emitted.load(Ordering::SeqCst)
    }

    /// Whether the sample clock is running.
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.n_samples as f64 / f64::from(self.sample_rate.max(1)))
    }
}

#[async_trait]
impl AnalogIOBoard for MockBoard {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn n_samples(&self) -> usize {
        self.n_samples
    }

    async fn start(&self) -> AppResult<()> {
        self.state.lock().started = true;
        debug!("MockBoard clock started");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.started = false;
        state.last_level = 0.0;
        Ok(())
    }

    async fn camera_trigger(&self, pulses: &[f64]) -> AppResult<()> {
        if pulses.len() != self.n_samples {
            return Err(DaqError::Scanning(format!(
                "Trigger line has {} samples, board chunk is {}",
                pulses.len(),
                self.n_samples
            )));
        }
        self.state.lock().staged_trigger = pulses.to_vec();
        Ok(())
    }

    async fn write(&self, chunk: &AnalogChunk) -> AppResult<()> {
        if self.fault.load(Ordering::SeqCst) {
            return Err(DaqError::Scanning("MockBoard write fault".into()));
        }
        let lengths = [
            chunk.xy_lateral.len(),
            chunk.xy_frontal.len(),
            chunk.z_piezo.len(),
            chunk.z_lateral.len(),
            chunk.z_frontal.len(),
        ];
        if lengths.iter().any(|len| *len != self.n_samples) {
            return Err(DaqError::Scanning(format!(
                "Chunk channel lengths {:?} do not match board chunk {}",
                lengths, self.n_samples
            )));
        }

        let mut state = self.state.lock();
        let staged = std::mem::take(&mut state.staged_trigger);
        if state.started {
            let mut level = state.last_level;
            let mut edges = 0;
            for v in &staged {
                if *v > TRIGGER_THRESHOLD && level <= TRIGGER_THRESHOLD {
                    edges += 1;
                }
                level = *v;
            }
            state.last_level = level;
            if edges > 0 {
                self.pulses_emitted.fetch_add(edges, Ordering::SeqCst);
                self.link.fire(edges);
            }
        }
        state.last_piezo = chunk.z_piezo.clone();
        Ok(())
    }

    async fn read(&self, n_samples: usize) -> AppResult<AnalogReadback> {
        if self.paced {
            tokio::time::sleep(self.chunk_duration()).await;
        } else {
            tokio::task::yield_now().await;
        }
        let state = self.state.lock();
        let mut z_piezo = state.last_piezo.clone();
        z_piezo.resize(n_samples, z_piezo.last().copied().unwrap_or(0.0));
        Ok(AnalogReadback { z_piezo })
    }
}

// =============================================================================
// MockCamera - Simulated camera
// =============================================================================

struct CameraState {
    settings: CameraSettings,
    pool: FramePool,
    mode: Option<TriggerMode>,
    frame_number: u64,
    consumed_pulses: u64,
    last_frame_at: Instant,
    shut_down: bool,
}

/// Mock camera with pool-backed frames
///
/// Pixel values follow a deterministic ramp offset by the frame number, so
/// tests can recognise frames after they pass through the pipeline.
pub struct MockCamera {
    sensor: (usize, usize),
    pool_size: usize,
    link: TriggerLink,
    state: Mutex<CameraState>,
    frames_emitted: AtomicUsize,
}

impl MockCamera {
    /// Create a stopped camera.
    ///
    /// # Arguments
    /// * `sensor` - full sensor `(width, height)`
    /// * `settings` - initial exposure, binning and ROI
    /// * `pool_size` - frame buffers kept in flight
    /// * `link` - trigger cable from a `MockBoard`
    pub fn new(
        sensor: (usize, usize),
        settings: CameraSettings,
        pool_size: usize,
        link: TriggerLink,
    ) -> AppResult<Self> {
        let pool = Self::pool_for(sensor, &settings, pool_size)?;
        Ok(Self {
            sensor,
            pool_size,
            link,
            state: Mutex::new(CameraState {
                settings,
                pool,
                mode: None,
                frame_number: 0,
                consumed_pulses: 0,
                last_frame_at: Instant::now(),
                shut_down: false,
            }),
            frames_emitted: AtomicUsize::new(0),
        })
    }

    fn pool_for(
        sensor: (usize, usize),
        settings: &CameraSettings,
        pool_size: usize,
    ) -> AppResult<FramePool> {
        let (w, h) = settings.frame_shape(sensor);
        FramePool::new(pool_size, w * h * crate::data::frame::BYTES_PER_PIXEL)
    }

    /// Frames handed out since creation.
    pub fn frames_emitted(&self) -> usize {
        self.frames_emitted.load(Ordering::SeqCst)
    }

    /// Current acquisition mode, `None` when stopped.
    pub fn mode(&self) -> Option<TriggerMode> {
        self.state.lock().mode
    }

    /// Current settings.
    pub fn settings(&self) -> CameraSettings {
        self.state.lock().settings.clone()
    }

    /// Whether `shutdown` was called.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    fn ensure_open(state: &CameraState) -> AppResult<()> {
        if state.shut_down {
            return Err(DaqError::Configuration("MockCamera already shut down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn sensor_resolution(&self) -> (usize, usize) {
        self.sensor
    }

    async fn apply_settings(&self, settings: &CameraSettings) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if settings.frame_shape(self.sensor) != state.settings.frame_shape(self.sensor) {
            state.pool = Self::pool_for(self.sensor, settings, self.pool_size)?;
        }
        state.settings = settings.clone();
        Ok(())
    }

    async fn start_acquisition(&self, mode: TriggerMode) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.mode = Some(mode);
        state.frame_number = 0;
        // Pulses sent before arming are lost
        state.consumed_pulses = self.link.issued();
        state.last_frame_at = Instant::now();
        debug!(?mode, "MockCamera acquisition started");
        Ok(())
    }

    async fn stop_acquisition(&self) -> AppResult<()> {
        self.state.lock().mode = None;
        Ok(())
    }

    async fn get_frames(&self) -> AppResult<Vec<Frame>> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        let pending = match state.mode {
            None => 0,
            Some(TriggerMode::ExternalTrigger) => self.link.issued() - state.consumed_pulses,
            Some(TriggerMode::Free) => {
                let exposure = Duration::from_secs_f64(state.settings.exposure_ms.max(0.001) / 1e3);
                let elapsed = state.last_frame_at.elapsed();
                let n = (elapsed.as_secs_f64() / exposure.as_secs_f64()) as u64;
                n.min(MAX_FREE_FRAMES_PER_POLL)
            }
        };

        let (width, height) = state.settings.frame_shape(self.sensor);
        let mut frames = Vec::new();
        for _ in 0..pending {
            // An exhausted pool leaves the remaining triggers pending
            let Some(mut buffer) = state.pool.try_acquire() else {
                break;
            };
            let offset = state.frame_number;
            buffer.fill_pixels(width * height, |i| ((i as u64 + offset) % 4096) as u16);
            frames.push(Frame::new(buffer.freeze(), width, height, state.frame_number));
            state.frame_number += 1;
            if state.mode == Some(TriggerMode::ExternalTrigger) {
                state.consumed_pulses += 1;
            }
        }
        if state.mode == Some(TriggerMode::Free) && !frames.is_empty() {
            state.last_frame_at = Instant::now();
        }
        self.frames_emitted.fetch_add(frames.len(), Ordering::SeqCst);
        Ok(frames)
    }

    async fn shutdown(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.mode = None;
        state.shut_down = true;
        Ok(())
    }
}

// =============================================================================
// MockExternalTrigger - Simulated tracking instrument
// =============================================================================

/// Tracking instrument that always reports the same duration.
#[derive(Debug, Default)]
pub struct MockExternalTrigger {
    duration_s: Option<f64>,
    calls: AtomicUsize,
    last_config: Mutex<Option<serde_json::Value>>,
}

impl MockExternalTrigger {
    /// Create a mock answering with `duration_s`.
    pub fn new(duration_s: Option<f64>) -> Self {
        Self {
            duration_s,
            ..Default::default()
        }
    }

    /// Times the instrument was triggered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Configuration sent with the last trigger.
    pub fn last_config(&self) -> Option<serde_json::Value> {
        self.last_config.lock().clone()
    }
}

#[async_trait]
impl ExternalTrigger for MockExternalTrigger {
    async fn trigger_and_receive_duration(
        &self,
        config: &serde_json::Value,
    ) -> AppResult<Option<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());
        Ok(self.duration_s)
    }
}

// =============================================================================
// Tests
// =============================================================================
