//! Camera frames and assembled volumes.
//!
//! Pixel data is 16-bit little-endian, held in a `bytes::Bytes` handle so
//! frames move between tasks without copying. Frames acquired through a
//! [`FramePool`](super::frame_pool::FramePool) hand their buffer back to the
//! pool once the last handle drops.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Bytes per pixel of every frame.
pub const BYTES_PER_PIXEL: usize = 2;

/// One image read from the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major u16 LE pixels, `width * height * 2` bytes
    pub data: Bytes,
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Sequence number since acquisition start
    pub frame_number: u64,
    /// Position of the frame within its volume
    pub plane_index: usize,
    /// Time the frame was read out
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Build a frame from raw pixel bytes.
    pub fn new(data: Bytes, width: usize, height: usize, frame_number: u64) -> Self {
        Self {
            data,
            width,
            height,
            frame_number,
            plane_index: 0,
            timestamp: Utc::now(),
        }
    }

    /// Build a frame from pixel values, copying them into a fresh buffer.
    pub fn from_pixels(pixels: &[u16], width: usize, height: usize, frame_number: u64) -> Self {
        Self::new(pixels_to_bytes(pixels), width, height, frame_number)
    }

    /// Tag the frame with its plane index.
    pub fn with_plane(mut self, plane_index: usize) -> Self {
        self.plane_index = plane_index;
        self
    }

    /// Bytes per frame.
    pub fn n_bytes(&self) -> usize {
        self.width * self.height * BYTES_PER_PIXEL
    }

    /// Decode the pixel values.
    pub fn pixels(&self) -> Vec<u16> {
        self.data
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect()
    }
}

/// Encode pixel values as little-endian bytes.
pub fn pixels_to_bytes(pixels: &[u16]) -> Bytes {
    let mut out = Vec::with_capacity(pixels.len() * BYTES_PER_PIXEL);
    for px in pixels {
        out.extend_from_slice(&px.to_le_bytes());
    }
    Bytes::from(out)
}

/// A complete stack of planes, ordered by plane index.
///
/// Only the dispatcher builds volumes, and only once every plane is present;
/// downstream consumers share them as `Arc<Volume>`.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Index of the volume since the dispatcher was last reset
    pub index: u64,
    /// `planes[i].plane_index == i`
    pub planes: Vec<Frame>,
    /// Volumes per second at acquisition time
    pub volumerate: f64,
    /// Plane width in pixels
    pub width: usize,
    /// Plane height in pixels
    pub height: usize,
}

/// Shared handle to an assembled volume.
pub type SharedVolume = Arc<Volume>;

impl Volume {
    /// Number of planes.
    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }

    /// `[n_planes, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.n_planes(), self.height, self.width]
    }

    /// Bytes across every plane.
    pub fn n_bytes(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}
