//! Hardware capabilities used by the pipeline.
//!
//! The core never touches vendor SDK structures. It drives hardware through
//! three small traits:
//!
//! - [`AnalogIOBoard`]: the multi-channel analog output/input board that
//!   plays the galvo and piezo waveforms and the camera trigger line
//! - [`Camera`]: the sCMOS camera, free-running or externally triggered
//! - [`ExternalTrigger`]: the behavior-tracking instrument that is started
//!   with the experiment and reports its duration
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; implementations use interior mutability
//! - Returns [`AppResult`] so hardware faults flow into the pipeline's
//!   fault handling
//!
//! Mock implementations live in [`super::mock`].

use crate::data::Frame;
use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One hardware chunk of output samples, channel by channel.
///
/// Every channel holds exactly the board's chunk length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalogChunk {
    /// Lateral xy galvo
    pub xy_lateral: Vec<f64>,
    /// Frontal xy galvo
    pub xy_frontal: Vec<f64>,
    /// Piezo objective positioner
    pub z_piezo: Vec<f64>,
    /// Lateral z galvo
    pub z_lateral: Vec<f64>,
    /// Frontal z galvo
    pub z_frontal: Vec<f64>,
}

impl AnalogChunk {
    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.xy_lateral.len()
    }

    /// Whether the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.xy_lateral.is_empty()
    }
}

/// Position feedback sampled alongside a written chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalogReadback {
    /// Piezo position sensor, in volts
    pub z_piezo: Vec<f64>,
}

/// Capability: Analog scan board
///
/// # Contract
/// - `write` queues exactly one chunk of `n_samples()` samples per channel
/// - `camera_trigger` stages the trigger line for the next `write`
/// - `read` blocks until `n_samples` feedback samples have been acquired
/// - Output starts on the first `start`; nothing plays before it
///
/// # Errors
/// Hardware faults are reported as [`DaqError::Scanning`](crate::error::DaqError::Scanning).
#[async_trait]
pub trait AnalogIOBoard: Send + Sync {
    /// Samples per second on every channel.
    fn sample_rate(&self) -> u32;

    /// Samples per hardware chunk.
    fn n_samples(&self) -> usize;

    /// Start the sample clock.
    async fn start(&self) -> AppResult<()>;

    /// Stop the sample clock.
    async fn stop(&self) -> AppResult<()> {
        Ok(())
    }

    /// Stage the camera trigger line for the next written chunk.
    ///
    /// # Arguments
    /// * `pulses` - one value per sample; pulses are rising edges
    async fn camera_trigger(&self, pulses: &[f64]) -> AppResult<()>;

    /// Push one chunk to the output buffer.
    async fn write(&self, chunk: &AnalogChunk) -> AppResult<()>;

    /// Read `n_samples` of position feedback.
    async fn read(&self, n_samples: usize) -> AppResult<AnalogReadback>;
}

/// How the camera decides when to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Exposes back to back at its own rate.
    Free,
    /// Exposes once per trigger pulse from the scan board.
    ExternalTrigger,
}

/// Sensor region of interest, in unbinned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge
    pub x: usize,
    /// Top edge
    pub y: usize,
    /// Width
    pub width: usize,
    /// Height
    pub height: usize,
}

/// Settings the camera applies between frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure per frame in milliseconds
    pub exposure_ms: f64,
    /// Square binning factor
    pub binning: usize,
    /// Readout region, full sensor if `None`
    pub roi: Option<Roi>,
}

impl CameraSettings {
    /// `(width, height)` of the frames produced on a sensor of `sensor` size.
    pub fn frame_shape(&self, sensor: (usize, usize)) -> (usize, usize) {
        let (w, h) = match self.roi {
            Some(roi) => (roi.width, roi.height),
            None => sensor,
        };
        let b = self.binning.max(1);
        (w / b, h / b)
    }
}

/// Capability: Frame source
///
/// # Contract
/// - `get_frames` never blocks; it returns whatever frames are ready
/// - Settings are applied only while acquisition is stopped or between
///   frames
/// - `shutdown` releases the device; no call is valid afterwards
#[async_trait]
pub trait Camera: Send + Sync {
    /// Full sensor size `(width, height)`.
    fn sensor_resolution(&self) -> (usize, usize);

    /// Apply exposure, binning and ROI.
    async fn apply_settings(&self, _settings: &CameraSettings) -> AppResult<()> {
        Ok(())
    }

    /// Begin acquiring.
    async fn start_acquisition(&self, mode: TriggerMode) -> AppResult<()>;

    /// Stop acquiring. Frames not yet read are discarded.
    async fn stop_acquisition(&self) -> AppResult<()>;

    /// Frames acquired since the last call, oldest first.
    async fn get_frames(&self) -> AppResult<Vec<Frame>>;

    /// Release the device.
    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Capability: Behavior-tracking instrument
///
/// Opaque collaborator started together with an experiment.
#[async_trait]
pub trait ExternalTrigger: Send + Sync {
    /// Send the experiment configuration as a start signal.
    ///
    /// # Returns
    /// The experiment duration in seconds, if the instrument reported one.
    async fn trigger_and_receive_duration(
        &self,
        config: &serde_json::Value,
    ) -> AppResult<Option<f64>>;
}
