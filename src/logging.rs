//! Tracing setup for the pipeline binary and tests.
//!
//! Every task logs through `tracing` with structured fields and runs inside
//! its own span (`scanner`, `camera`, `dispatcher`, `saver`,
//! `external_comm`, `supervisor`). This module installs the
//! `tracing-subscriber` registry:
//! - `RUST_LOG` wins over the configured level
//! - Pretty output for the bench, compact for long runs, JSON for log shipping
//! - JSON lines carry the task span so events can be grouped per task
//! - Span close events report how long each task ran
//!
//! # Example
//! ```no_run
//! use lightsheet_daq::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!(sample_rate = settings.scanning.sample_rate, "pipeline starting");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines
    Json,
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Fallback level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Emit an event when a task span closes
    pub task_lifetimes: bool,
    /// Source location on every event
    pub with_file_and_line: bool,
    /// Colors, pretty format only
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            task_lifetimes: true,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Level and format from `[application]`.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] for an unknown level or format.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Default options at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span close events.
    pub fn with_task_lifetimes(mut self, enabled: bool) -> Self {
        self.task_lifetimes = enabled;
        self
    }

    /// Toggle colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.task_lifetimes {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line)
            .with_target(false);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .boxed(),
        }
    }
}

/// Install the subscriber described by `[application]`.
///
/// # Errors
/// See [`TracingConfig::from_settings`] and [`init`].
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install a global subscriber.
///
/// A second call after a subscriber is installed returns `Ok(())`, so tests
/// may call this freely.
///
/// # Errors
/// Returns [`DaqError::Configuration`] if the subscriber cannot be set for
/// any other reason.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(config.fmt_layer().with_filter(env_filter))
        .try_init()
        .or_else(already_initialized_is_ok)
}

fn already_initialized_is_ok(err: TryInitError) -> AppResult<()> {
    if err
        .to_string()
        .contains("a global default trace dispatcher has already been set")
    {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {}",
            err
        )))
    }
}

/// Level name, case-insensitive.
///
/// # Errors
/// Returns [`DaqError::Configuration`] for anything but the five level names.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level.trim())
        .ok()
        .filter(|_| !level.trim().chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| {
            DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: trace, debug, info, warn, error",
                level
            ))
        })
}
