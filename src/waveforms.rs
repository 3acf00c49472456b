//! Deterministic waveform generation for the galvo, piezo and camera lines.
//!
//! Every periodic waveform is defined by its period in samples, not in
//! seconds, so the shape of one period is identical whatever the board's
//! sample clock. Values are evaluated at an absolute sample index, which
//! keeps consecutive calls phase-continuous without any hidden cursor.
//!
//! # Example
//! ```
//! use lightsheet_daq::waveforms::Waveform;
//!
//! let ramp = Waveform::Sawtooth { period_samples: 4, v_min: 0.0, v_max: 1.0 };
//! assert_eq!(ramp.values(0, 5), vec![0.0, 0.25, 0.5, 0.75, 0.0]);
//! // Continuing from sample 5 picks up where the last call stopped
//! assert_eq!(ramp.values(5, 2), vec![0.25, 0.5]);
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Voltage of a camera trigger pulse.
pub const CAMERA_PULSE_HIGH: f64 = 5.0;

/// Largest galvo command accepted from a piezo calibration, in volts.
pub const GALVO_SAFE_RANGE: f64 = 2.0;

/// Voltage sequence for one analog channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    /// Flat value.
    Constant(f64),
    /// Linear ramp from `v_min` to `v_max`, then an instant flyback.
    Sawtooth {
        /// Samples per ramp
        period_samples: usize,
        /// Voltage at the start of each period
        v_min: f64,
        /// Voltage approached at the end of each period
        v_max: f64,
    },
    /// Symmetric ramp `v_min -> v_max -> v_min`.
    Triangle {
        /// Samples per up-down cycle
        period_samples: usize,
        /// Voltage at the start of each period
        v_min: f64,
        /// Voltage at mid-period
        v_max: f64,
    },
    /// Replays a captured sequence, looping when asked for more.
    Recorded(Arc<[f64]>),
}

impl Waveform {
    /// Sawtooth from a frequency in Hz and the board sample rate.
    pub fn sawtooth(frequency: f64, sample_rate: u32, v_min: f64, v_max: f64) -> AppResult<Self> {
        Ok(Waveform::Sawtooth {
            period_samples: period_samples(frequency, sample_rate)?,
            v_min,
            v_max,
        })
    }

    /// Triangle from a frequency in Hz and the board sample rate.
    pub fn triangle(frequency: f64, sample_rate: u32, v_min: f64, v_max: f64) -> AppResult<Self> {
        Ok(Waveform::Triangle {
            period_samples: period_samples(frequency, sample_rate)?,
            v_min,
            v_max,
        })
    }

    /// Samples per period, if the waveform is periodic.
    pub fn period_samples(&self) -> Option<usize> {
        match self {
            Waveform::Constant(_) => None,
            Waveform::Sawtooth { period_samples, .. } | Waveform::Triangle { period_samples, .. } => {
                Some(*period_samples)
            }
            Waveform::Recorded(samples) => Some(samples.len()),
        }
    }

    /// Value at absolute sample index `sample`.
    pub fn value_at(&self, sample: u64) -> f64 {
        match self {
            Waveform::Constant(v) => *v,
            Waveform::Sawtooth {
                period_samples,
                v_min,
                v_max,
            } => {
                let p = phase(sample, *period_samples);
                clip(v_min + (v_max - v_min) * p, *v_min, *v_max)
            }
            Waveform::Triangle {
                period_samples,
                v_min,
                v_max,
            } => {
                let p = phase(sample, *period_samples);
                clip(
                    v_min + (v_max - v_min) * (1.0 - (2.0 * p - 1.0).abs()),
                    *v_min,
                    *v_max,
                )
            }
            Waveform::Recorded(samples) => {
                if samples.is_empty() {
                    0.0
                } else {
                    samples[(sample % samples.len() as u64) as usize]
                }
            }
        }
    }

    /// `n` values starting at absolute sample index `start`.
    pub fn values(&self, start: u64, n: usize) -> Vec<f64> {
        (0..n as u64).map(|k| self.value_at(start + k)).collect()
    }
}

fn phase(sample: u64, period_samples: usize) -> f64 {
    let period = period_samples.max(1) as u64;
    (sample % period) as f64 / period as f64
}

fn clip(v: f64, a: f64, b: f64) -> f64 {
    v.clamp(a.min(b), a.max(b))
}

/// Samples per period for `frequency` Hz at `sample_rate` samples per second.
///
/// # Errors
///
/// Returns [`DaqError::Scanning`] unless the frequency is positive, finite
/// and no faster than the sample clock.
pub fn period_samples(frequency: f64, sample_rate: u32) -> AppResult<usize> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(DaqError::Scanning(format!(
            "Frequency must be positive, got {}",
            frequency
        )));
    }
    let n = (f64::from(sample_rate) / frequency).round();
    if n < 1.0 {
        return Err(DaqError::Scanning(format!(
            "Frequency {} Hz exceeds the {} Hz sample clock",
            frequency, sample_rate
        )));
    }
    Ok(n as usize)
}

/// Greatest common divisor.
pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Lowest common multiple. Zero if either argument is zero.
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// Alignment of the xy and z sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOffsets {
    /// Shortest cycle after which both sweeps repeat together
    pub cycle_samples: usize,
    /// Samples to delay the xy sweep. The xy sweep is the reference, so zero.
    pub xy_offset: usize,
    /// Samples to add after each z sweep so the next one starts on an xy
    /// zero crossing
    pub z_offset: usize,
}

/// Offsets that align the z sweep start with the xy sweep start.
///
/// `cycle_samples` is the lowest common multiple of the two periods. When
/// either period divides the other the sweeps already line up and both
/// offsets are zero.
pub fn calc_sync(xy_period: usize, z_period: usize) -> SyncOffsets {
    let cycle_samples = lcm(xy_period, z_period);
    if xy_period == 0 || z_period == 0 || z_period % xy_period == 0 || xy_period % z_period == 0 {
        return SyncOffsets {
            cycle_samples,
            xy_offset: 0,
            z_offset: 0,
        };
    }
    SyncOffsets {
        cycle_samples,
        xy_offset: 0,
        z_offset: (xy_period - z_period % xy_period) % xy_period,
    }
}

/// Linear calibration mapping piezo volts to galvo volts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCoefficients {
    /// Galvo voltage at zero piezo voltage
    pub offset: f64,
    /// Galvo volts per piezo volt
    pub slope: f64,
}

impl SyncCoefficients {
    /// Create a calibration.
    pub fn new(offset: f64, slope: f64) -> Self {
        Self { offset, slope }
    }

    /// Galvo voltage for piezo voltage `z`.
    pub fn apply(&self, z: f64) -> f64 {
        self.offset + self.slope * z
    }

    /// Whether the calibration keeps the galvo inside the safe range for
    /// every piezo value in `samples`.
    pub fn keeps_in_range(&self, samples: &[f64]) -> bool {
        let (lo, hi) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), z| {
                (lo.min(*z), hi.max(*z))
            });
        if !lo.is_finite() {
            return false;
        }
        [self.apply(lo), self.apply(hi)]
            .iter()
            .all(|v| v.abs() < GALVO_SAFE_RANGE)
    }
}

/// Zero `buffer`, then place one pulse per imaged plane.
///
/// Pulses sit every `round(len / n_planes)` samples; the first
/// `n_skip_start` and last `n_skip_end` planes stay dark.
pub fn set_impulses(
    buffer: &mut [f64],
    n_planes: usize,
    n_skip_start: usize,
    n_skip_end: usize,
    high: f64,
) {
    buffer.iter_mut().for_each(|v| *v = 0.0);
    if n_planes == 0 || buffer.is_empty() {
        return;
    }
    let n_between = (buffer.len() as f64 / n_planes as f64).round() as usize;
    for i in n_skip_start..n_planes.saturating_sub(n_skip_end) {
        if let Some(slot) = buffer.get_mut(i * n_between) {
            *slot = high;
        }
    }
}

/// Trigger times within one volume, in seconds from the volume start.
pub fn pulse_times(
    volumerate: f64,
    n_planes: usize,
    n_skip_start: usize,
    n_skip_end: usize,
) -> Vec<f64> {
    if volumerate <= 0.0 || n_planes == 0 {
        return Vec::new();
    }
    (n_skip_start..n_planes.saturating_sub(n_skip_end))
        .map(|i| i as f64 / (volumerate * n_planes as f64))
        .collect()
}
