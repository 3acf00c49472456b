//! Pipeline configuration using Figment
//!
//! Settings are layered from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/lightsheet.toml` by default)
//! 3. Environment variables prefixed with `LIGHTSHEET_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use lightsheet_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Board sample rate: {}", settings.scanning.sample_rate);
//! # Ok(())
//! # }
//! ```
//!
//! `LIGHTSHEET_SCANNING__SAMPLE_RATE=20000` overrides `scanning.sample_rate`.

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lightsheet.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Analog IO board and scan loop timing
    #[serde(default)]
    pub scanning: ScanningConfig,
    /// Camera defaults
    #[serde(default)]
    pub camera: CameraConfig,
    /// Inter-task queue sizing
    #[serde(default)]
    pub queues: QueueConfig,
    /// Dataset output
    #[serde(default)]
    pub saving: SavingConfig,
    /// Tracking-instrument trigger bridge
    #[serde(default)]
    pub external_trigger: ExternalTriggerConfig,
    /// Physical pixel size in micrometres
    #[serde(default)]
    pub voxel_size: VoxelSizeConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Board and scan loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningConfig {
    /// Board driver name. Only "mock" ships with this crate.
    #[serde(default = "default_board")]
    pub board: String,
    /// Samples per second on every analog channel
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Samples written to the board per hardware cycle
    #[serde(default = "default_n_samples_waveform")]
    pub n_samples_waveform: usize,
    /// How long `check_start` waits for the start trigger before timing out
    #[serde(default = "default_trigger_timeout_ms")]
    pub trigger_timeout_ms: u64,
    /// Poll interval while waiting on the start trigger or while paused
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera driver name. Only "mock" ships with this crate.
    #[serde(default = "default_camera")]
    pub name: String,
    /// Full sensor size in pixels, `[width, height]`
    #[serde(default = "default_sensor_resolution")]
    pub sensor_resolution: [usize; 2],
    /// Exposure applied until the operator changes it
    #[serde(default = "default_exposure_ms")]
    pub default_exposure_ms: f64,
    /// Binning applied until the operator changes it
    #[serde(default = "default_binning")]
    pub default_binning: usize,
    /// Frames between two framerate estimates
    #[serde(default = "default_n_fps_frames")]
    pub n_fps_frames: usize,
    /// Preallocated frame buffers
    #[serde(default = "default_frame_pool_size")]
    pub frame_pool_size: usize,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Camera to dispatcher queue capacity (frames)
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
    /// Dispatcher to saver queue capacity (volumes)
    #[serde(default = "default_volume_capacity")]
    pub volume_capacity: usize,
    /// How long a producer blocks on a full queue before faulting
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
}

/// Dataset output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingConfig {
    /// Directory new datasets are written under
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// RAM budget for one chunk, in MB
    #[serde(default = "default_array_ram_mb")]
    pub array_ram_mb: f64,
    /// Address notified when a dataset completes
    #[serde(default)]
    pub notification_email: Option<String>,
}

/// External trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTriggerConfig {
    /// Collaborator name. "mock" answers with `mock_duration_s`.
    #[serde(default = "default_trigger_name")]
    pub name: String,
    /// Experiment duration reported by the mock collaborator
    #[serde(default)]
    pub mock_duration_s: Option<f64>,
}

/// Pixel size configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelSizeConfig {
    /// Pixel width in micrometres
    #[serde(default = "default_pixel_um")]
    pub x: f64,
    /// Pixel height in micrometres
    #[serde(default = "default_pixel_um")]
    pub y: f64,
}

// Default value functions
fn default_name() -> String {
    "Lightsheet DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_board() -> String {
    "mock".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_sample_rate() -> u32 {
    40_000
}

fn default_n_samples_waveform() -> usize {
    10_000
}

fn default_trigger_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_camera() -> String {
    "mock".to_string()
}

fn default_sensor_resolution() -> [usize; 2] {
    [2048, 2048]
}

fn default_exposure_ms() -> f64 {
    30.0
}

fn default_binning() -> usize {
    2
}

fn default_n_fps_frames() -> usize {
    20
}

fn default_frame_pool_size() -> usize {
    64
}

fn default_frame_capacity() -> usize {
    32
}

fn default_volume_capacity() -> usize {
    8
}

fn default_put_timeout_ms() -> u64 {
    1_000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_array_ram_mb() -> f64 {
    450.0
}

fn default_trigger_name() -> String {
    "mock".to_string()
}

fn default_pixel_um() -> f64 {
    0.6
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            board: default_board(),
            sample_rate: default_sample_rate(),
            n_samples_waveform: default_n_samples_waveform(),
            trigger_timeout_ms: default_trigger_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera(),
            sensor_resolution: default_sensor_resolution(),
            default_exposure_ms: default_exposure_ms(),
            default_binning: default_binning(),
            n_fps_frames: default_n_fps_frames(),
            frame_pool_size: default_frame_pool_size(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frame_capacity: default_frame_capacity(),
            volume_capacity: default_volume_capacity(),
            put_timeout_ms: default_put_timeout_ms(),
        }
    }
}

impl Default for SavingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            array_ram_mb: default_array_ram_mb(),
            notification_email: None,
        }
    }
}

impl Default for ExternalTriggerConfig {
    fn default() -> Self {
        Self {
            name: default_trigger_name(),
            mock_duration_s: None,
        }
    }
}

impl Default for VoxelSizeConfig {
    fn default() -> Self {
        Self {
            x: default_pixel_um(),
            y: default_pixel_um(),
        }
    }
}

impl QueueConfig {
    /// Put timeout as a `Duration`.
    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }
}

impl ScanningConfig {
    /// Start-trigger timeout as a `Duration`.
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Settings {
    /// Load settings from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path
    ///
    /// A missing file is not an error; the defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LIGHTSHEET_").split("__"))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        self.application
            .log_format
            .parse::<crate::logging::OutputFormat>()?;

        if self.scanning.sample_rate == 0 {
            return Err(DaqError::Configuration(
                "scanning.sample_rate must be positive".into(),
            ));
        }
        if self.scanning.n_samples_waveform == 0 {
            return Err(DaqError::Configuration(
                "scanning.n_samples_waveform must be positive".into(),
            ));
        }

        let [width, height] = self.camera.sensor_resolution;
        if width == 0 || height == 0 {
            return Err(DaqError::Configuration(format!(
                "Invalid sensor_resolution {}x{}",
                width, height
            )));
        }
        if self.camera.default_binning == 0
            || width % self.camera.default_binning != 0
            || height % self.camera.default_binning != 0
        {
            return Err(DaqError::Configuration(format!(
                "Binning {} does not divide the sensor {}x{}",
                self.camera.default_binning, width, height
            )));
        }
        if self.camera.default_exposure_ms <= 0.0 {
            return Err(DaqError::Configuration(
                "camera.default_exposure_ms must be positive".into(),
            ));
        }
        if self.camera.n_fps_frames == 0 || self.camera.frame_pool_size == 0 {
            return Err(DaqError::Configuration(
                "camera.n_fps_frames and camera.frame_pool_size must be positive".into(),
            ));
        }

        if self.queues.frame_capacity == 0 || self.queues.volume_capacity == 0 {
            return Err(DaqError::Configuration(
                "Queue capacities must be positive".into(),
            ));
        }

        if self.saving.array_ram_mb <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid saving.array_ram_mb {}. Must be positive",
                self.saving.array_ram_mb
            )));
        }

        Ok(())
    }
}
