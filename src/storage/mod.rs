//! Dataset persistence.
//!
//! A dataset is one directory per run:
//!
//! ```text
//! <output_dir>/original/
//!     0000.bin | 0000.h5     chunk 0: (chunk_size, n_planes, height, width) u16
//!     0001.bin | 0001.h5     chunk 1
//!     ...
//!     stack_metadata.json    written once at finalize
//! ```
//!
//! Chunks are append-only: chunk `i` is written exactly once, in order.
//! [`StreamingSaver`] decides what goes into each chunk; a [`DatasetWriter`]
//! puts it on disk.

pub mod streaming_save;

pub use streaming_save::{SavingParameters, SavingStatus, StreamingSaver};

use crate::data::Volume;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Name of the dataset directory inside the output directory.
pub const DATASET_DIR: &str = "original";

/// Name of the metadata record.
pub const METADATA_FILE: &str = "stack_metadata.json";

/// Bytes in one MB of the chunk RAM budget.
const BYTES_PER_MB: f64 = 1_048_576.0;

/// Volumes per chunk that fit in `optimal_chunk_mb_ram`.
///
/// The largest integer `k` with `k * n_planes * plane_bytes` not above the
/// budget, and at least 1.
///
/// # Example
/// ```
/// use lightsheet_daq::storage::calculate_optimal_size;
///
/// // 10 planes of 2048 x 2048 u16 are 80 MB per volume
/// assert_eq!(calculate_optimal_size(450.0, 10, 2048 * 2048 * 2), 5);
/// ```
pub fn calculate_optimal_size(optimal_chunk_mb_ram: f64, n_planes: usize, plane_bytes: usize) -> usize {
    let volume_bytes = (n_planes * plane_bytes) as f64;
    if volume_bytes <= 0.0 {
        return 1;
    }
    let fits = (optimal_chunk_mb_ram * BYTES_PER_MB / volume_bytes).floor();
    if fits.is_finite() && fits >= 1.0 {
        fits as usize
    } else {
        1
    }
}

/// Consecutive volumes buffered for one chunk file.
///
/// Pixel bytes are copied in, so the frames of a buffered volume go back
/// to the camera pool right away.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    volume_shape: [usize; 3],
    n_volumes: usize,
    data: Vec<u8>,
}

impl ChunkBuffer {
    /// Empty chunk for volumes of `volume_shape` (`[n_planes, height, width]`).
    pub fn new(volume_shape: [usize; 3], capacity_volumes: usize) -> Self {
        let volume_bytes = volume_shape.iter().product::<usize>() * crate::data::frame::BYTES_PER_PIXEL;
        Self {
            volume_shape,
            n_volumes: 0,
            data: Vec::with_capacity(volume_bytes * capacity_volumes),
        }
    }

    /// Append one volume.
    ///
    /// # Errors
    /// [`DaqError::Saving`] if the volume shape differs from the chunk's.
    pub fn push(&mut self, volume: &Volume) -> AppResult<()> {
        if volume.shape() != self.volume_shape {
            return Err(DaqError::Saving(format!(
                "volume shape {:?} does not match dataset shape {:?}",
                volume.shape(),
                self.volume_shape
            )));
        }
        for plane in &volume.planes {
            self.data.extend_from_slice(&plane.data);
        }
        self.n_volumes += 1;
        Ok(())
    }

    /// Volumes held.
    pub fn n_volumes(&self) -> usize {
        self.n_volumes
    }

    /// Whether no volume has been pushed.
    pub fn is_empty(&self) -> bool {
        self.n_volumes == 0
    }

    /// `[n_volumes, n_planes, height, width]`.
    pub fn shape(&self) -> [usize; 4] {
        let [p, h, w] = self.volume_shape;
        [self.n_volumes, p, h, w]
    }

    /// Raw u16 LE pixels.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Metadata record written once per dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// `[n_volumes, n_planes, height, width]` of the whole dataset
    pub shape_full: [usize; 4],
    /// `[chunk_size, n_planes, height, width]` of one chunk file
    pub shape_block: [usize; 4],
    /// `[z, y, x]` in micrometres
    pub voxel_size: [f64; 3],
    /// Volumes per second
    pub volumerate: f64,
    /// Planes per volume
    pub n_planes: usize,
    /// Volumes saved
    pub n_volumes: u64,
    /// Pixel type
    pub dtype: String,
    /// Identifier shared with the saving status of the run
    pub run_id: Uuid,
}

/// Writes a dataset chunk by chunk.
#[async_trait]
pub trait DatasetWriter: Send {
    /// Prepare writing into `dir`, which exists and is empty.
    async fn init(&mut self, dir: &Path) -> AppResult<()>;

    /// Write chunk `index`. Called once per index, in increasing order.
    async fn write_chunk(&mut self, index: usize, chunk: &ChunkBuffer) -> AppResult<()>;

    /// Write the metadata record and close the dataset.
    async fn finalize(&mut self, metadata: &DatasetMetadata) -> AppResult<()>;
}

/// Writer for the enabled storage backend: HDF5 with `storage_hdf5`, raw
/// binary otherwise.
pub fn default_writer() -> Box<dyn DatasetWriter> {
    #[cfg(feature = "storage_hdf5")]
    {
        Box::new(Hdf5DatasetWriter::new())
    }
    #[cfg(not(feature = "storage_hdf5"))]
    {
        Box::new(RawDatasetWriter::new())
    }
}

fn saving_error(context: &str, path: &Path, err: impl std::fmt::Display) -> DaqError {
    DaqError::Saving(format!("{} '{}': {}", context, path.display(), err))
}

async fn write_metadata(dir: &Path, metadata: &DatasetMetadata) -> AppResult<()> {
    let path = dir.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(metadata)
        .map_err(|e| saving_error("cannot encode metadata for", &path, e))?;
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| saving_error("cannot write", &path, e))
}

/// Chunks as headerless u16 little-endian files, `{:04}.bin`.
#[derive(Debug, Default)]
pub struct RawDatasetWriter {
    dir: Option<PathBuf>,
}

impl RawDatasetWriter {
    /// Writer with no directory yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn dir(&self) -> AppResult<&Path> {
        self.dir
            .as_deref()
            .ok_or_else(|| DaqError::Saving("dataset writer used before init".into()))
    }
}

#[async_trait]
impl DatasetWriter for RawDatasetWriter {
    async fn init(&mut self, dir: &Path) -> AppResult<()> {
        self.dir = Some(dir.to_path_buf());
        Ok(())
    }

    async fn write_chunk(&mut self, index: usize, chunk: &ChunkBuffer) -> AppResult<()> {
        let path = self.dir()?.join(format!("{:04}.bin", index));
        tokio::fs::write(&path, chunk.data())
            .await
            .map_err(|e| saving_error("cannot write", &path, e))?;
        debug!(path = %path.display(), volumes = chunk.n_volumes(), "chunk written");
        Ok(())
    }

    async fn finalize(&mut self, metadata: &DatasetMetadata) -> AppResult<()> {
        write_metadata(self.dir()?, metadata).await
    }
}

/// Chunks as HDF5 files, `{:04}.h5`, each with a `stack_4D` u16 dataset.
#[cfg(feature = "storage_hdf5")]
#[derive(Debug, Default)]
pub struct Hdf5DatasetWriter {
    dir: Option<PathBuf>,
}

#[cfg(feature = "storage_hdf5")]
impl Hdf5DatasetWriter {
    /// Writer with no directory yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "storage_hdf5")]
#[async_trait]
impl DatasetWriter for Hdf5DatasetWriter {
    async fn init(&mut self, dir: &Path) -> AppResult<()> {
        self.dir = Some(dir.to_path_buf());
        Ok(())
    }

    async fn write_chunk(&mut self, index: usize, chunk: &ChunkBuffer) -> AppResult<()> {
        let dir = self
            .dir
            .as_deref()
            .ok_or_else(|| DaqError::Saving("dataset writer used before init".into()))?;
        let path = dir.join(format!("{:04}.h5", index));
        let shape = chunk.shape().to_vec();
        let pixels: Vec<u16> = chunk
            .data()
            .chunks_exact(crate::data::frame::BYTES_PER_PIXEL)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect();

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> hdf5::Result<()> {
            let file = hdf5::File::create(&target)?;
            file.new_dataset::<u16>()
                .shape(shape)
                .create("stack_4D")?
                .write_raw(&pixels)?;
            Ok(())
        })
        .await
        .map_err(|e| saving_error("writer task failed for", &path, e))?
        .map_err(|e| saving_error("cannot write", &path, e))?;
        debug!(path = %path.display(), volumes = chunk.n_volumes(), "chunk written");
        Ok(())
    }

    async fn finalize(&mut self, metadata: &DatasetMetadata) -> AppResult<()> {
        let dir = self
            .dir
            .as_deref()
            .ok_or_else(|| DaqError::Saving("dataset writer used before init".into()))?;
        write_metadata(dir, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Frame;
    use tempfile::tempdir;

    fn volume(n_planes: usize, value: u16) -> Volume {
        Volume {
            index: 0,
            planes: (0..n_planes)
                .map(|i| Frame::from_pixels(&[value; 6], 3, 2, i as u64).with_plane(i))
                .collect(),
            volumerate: 1.0,
            width: 3,
            height: 2,
        }
    }

    #[test]
    fn optimal_size_is_largest_fitting_chunk() {
        let plane_bytes = 2048 * 2048 * 2;
        for n_planes in [1, 3, 10, 25, 60] {
            let size = calculate_optimal_size(450.0, n_planes, plane_bytes);
            let budget = 450 * 1_048_576;
            assert!(size >= 1);
            if size * n_planes * plane_bytes > budget {
                // only allowed when even one volume is over budget
                assert_eq!(size, 1);
            } else {
                assert!((size + 1) * n_planes * plane_bytes > budget);
            }
        }
        assert_eq!(calculate_optimal_size(450.0, 60, plane_bytes), 1);
        assert_eq!(calculate_optimal_size(450.0, 0, plane_bytes), 1);
    }

    #[test]
    fn chunk_rejects_shape_change() {
        let mut chunk = ChunkBuffer::new([2, 2, 3], 2);
        chunk.push(&volume(2, 1)).unwrap();
        assert!(matches!(chunk.push(&volume(3, 1)), Err(DaqError::Saving(_))));
        assert_eq!(chunk.shape(), [1, 2, 2, 3]);
        assert_eq!(chunk.data().len(), 2 * 6 * 2);
    }

    #[tokio::test]
    async fn raw_writer_lays_out_dataset() {
        let dir = tempdir().unwrap();
        let mut writer = RawDatasetWriter::new();
        writer.init(dir.path()).await.unwrap();

        let mut chunk = ChunkBuffer::new([2, 2, 3], 2);
        chunk.push(&volume(2, 7)).unwrap();
        writer.write_chunk(0, &chunk).await.unwrap();

        let metadata = DatasetMetadata {
            shape_full: [1, 2, 2, 3],
            shape_block: [2, 2, 2, 3],
            voxel_size: [1.0, 0.6, 0.6],
            volumerate: 1.0,
            n_planes: 2,
            n_volumes: 1,
            dtype: "uint16".into(),
            run_id: Uuid::new_v4(),
        };
        writer.finalize(&metadata).await.unwrap();

        let bytes = std::fs::read(dir.path().join("0000.bin")).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..2], &7u16.to_le_bytes());
        let json = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        let back: DatasetMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }

    #[tokio::test]
    async fn raw_writer_requires_init() {
        let mut writer = RawDatasetWriter::new();
        let chunk = ChunkBuffer::new([1, 1, 1], 1);
        assert!(writer.write_chunk(0, &chunk).await.is_err());
    }
}
