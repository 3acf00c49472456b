//! Streaming saver task.
//!
//! While `IS_SAVING` is set, the [`StreamingSaver`] pulls complete volumes
//! off the volume queue, buffers them into chunks sized to the RAM budget
//! and hands every full chunk to its [`DatasetWriter`]. The dataset is
//! finalized exactly once per run: when the volume target is reached, when
//! `IS_SAVING` is cleared or on `CLOSE_ALL`. A partial last chunk is always
//! flushed.

use super::{calculate_optimal_size, ChunkBuffer, DatasetMetadata, DatasetWriter, DATASET_DIR};
use crate::config::{SavingConfig, VoxelSizeConfig};
use crate::data::frame::BYTES_PER_PIXEL;
use crate::data::{SharedVolume, Volume};
use crate::error::{AppResult, DaqError, Fault, FaultSender};
use crate::events::{EventBus, SignalFlag};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// One run's saving configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingParameters {
    /// Directory the dataset directory is created in
    pub output_dir: PathBuf,
    /// `[z, y, x]` in micrometres
    pub voxel_size: [f64; 3],
    /// Volumes per second
    pub volumerate: f64,
    /// Planes per volume
    pub n_planes: usize,
    /// Volumes to save, unbounded if `None`
    pub n_volumes: Option<u64>,
    /// Volumes per chunk, computed from the RAM budget if `None`
    pub chunk_size: Option<usize>,
    /// RAM budget for one chunk, in MB
    pub optimal_chunk_mb_ram: f64,
    /// Address notified when the dataset completes
    pub notification_email: Option<String>,
}

impl SavingParameters {
    /// Parameters for a run using the configured output directory and
    /// budget. The caller fills in the geometry.
    pub fn from_config(saving: &SavingConfig, voxel: &VoxelSizeConfig) -> Self {
        Self {
            output_dir: saving.output_dir.clone(),
            voxel_size: [1.0, voxel.y, voxel.x],
            volumerate: 0.0,
            n_planes: 1,
            n_volumes: None,
            chunk_size: None,
            optimal_chunk_mb_ram: saving.array_ram_mb,
            notification_email: saving.notification_email.clone(),
        }
    }

    /// Dataset directory of this run.
    pub fn dataset_dir(&self) -> PathBuf {
        self.output_dir.join(DATASET_DIR)
    }
}

/// Saving progress, republished after every volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingStatus {
    /// Volumes saved in this run
    pub i_volume: u64,
    /// Chunks written
    pub i_chunk: usize,
    /// Volumes buffered in the current chunk
    pub i_in_chunk: usize,
    /// Volume target, if known
    pub n_volumes: Option<u64>,
    /// Parameters of the run
    pub target_params: Option<SavingParameters>,
    /// Set when the writer failed; the run is aborted
    pub error: Option<String>,
    /// Identifier of the dataset being written
    pub run_id: Option<Uuid>,
}

/// Queue ends and shared state the saver works with.
pub struct SaverChannels {
    /// Complete volumes from the dispatcher
    pub volume_rx: mpsc::Receiver<SharedVolume>,
    /// Parameters for the next run
    pub params_rx: watch::Receiver<Option<SavingParameters>>,
    /// Experiment duration in seconds, from the external trigger or the operator
    pub duration_rx: watch::Receiver<Option<f64>>,
    /// Progress
    pub status_tx: Arc<watch::Sender<SavingStatus>>,
}

/// Task that streams volumes to disk.
pub struct StreamingSaver {
    bus: EventBus,
    channels: SaverChannels,
    faults: FaultSender,
    writer: Box<dyn DatasetWriter>,
    parameters: Option<SavingParameters>,
    status: SavingStatus,
    chunk: Option<ChunkBuffer>,
    chunk_size: usize,
    volume_shape: Option<[usize; 3]>,
    /// Volumes in chunks the writer accepted
    n_persisted: u64,
    finalized: bool,
}

impl StreamingSaver {
    /// Assemble the saver task around `writer`.
    pub fn new(
        bus: EventBus,
        channels: SaverChannels,
        faults: FaultSender,
        writer: Box<dyn DatasetWriter>,
    ) -> Self {
        Self {
            bus,
            channels,
            faults,
            writer,
            parameters: None,
            status: SavingStatus::default(),
            chunk: None,
            chunk_size: 0,
            volume_shape: None,
            n_persisted: 0,
            finalized: true,
        }
    }

    /// Current progress.
    pub fn status(&self) -> &SavingStatus {
        &self.status
    }

    /// Run until `CLOSE_ALL`, saving one dataset each time `IS_SAVING` is set.
    pub async fn run(self) {
        let span = info_span!("saver");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!("started");
        loop {
            tokio::select! {
                biased;
                _ = self.bus.wait_for(SignalFlag::CloseAll, true) => break,
                _ = self.bus.wait_for(SignalFlag::IsSaving, true) => {}
            }

            match self.receive_save_parameters() {
                Some(params) => {
                    if let Err(e) = self.save_loop(params).await {
                        error!(error = %e, "saving failed");
                        self.status.error = Some(e.to_string());
                        self.update_saved_status_queue();
                        self.report(e);
                    }
                }
                None => warn!("saving requested without parameters"),
            }
            self.bus.set(SignalFlag::SavingStopped);

            tokio::select! {
                biased;
                _ = self.bus.wait_for(SignalFlag::CloseAll, true) => break,
                _ = self.bus.wait_for(SignalFlag::IsSaving, false) => {}
            }
        }
        info!("stopped");
    }

    /// Latest parameters pushed by the global state.
    pub fn receive_save_parameters(&mut self) -> Option<SavingParameters> {
        self.channels.params_rx.borrow_and_update().clone()
    }

    /// Save one dataset with `params`, then finalize it.
    pub async fn save_loop(&mut self, params: SavingParameters) -> AppResult<()> {
        self.begin(params).await?;
        let streamed = self.stream().await;
        let finalized = self.finalize_dataset().await;
        streamed.and(finalized)
    }

    async fn begin(&mut self, params: SavingParameters) -> AppResult<()> {
        let dir = params.dataset_dir();
        remove_stale_dataset(&dir).await?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DaqError::Saving(format!("cannot create '{}': {}", dir.display(), e)))?;
        self.writer.init(&dir).await?;

        // Durations from a previous run do not apply
        let _ = self.channels.duration_rx.borrow_and_update();

        let run_id = Uuid::new_v4();
        info!(
            dir = %dir.display(),
            %run_id,
            n_planes = params.n_planes,
            n_volumes = ?params.n_volumes,
            "dataset started"
        );
        self.status = SavingStatus {
            n_volumes: params.n_volumes,
            target_params: Some(params.clone()),
            run_id: Some(run_id),
            ..Default::default()
        };
        self.chunk = None;
        self.chunk_size = params.chunk_size.unwrap_or(0);
        self.volume_shape = None;
        self.n_persisted = 0;
        self.finalized = false;
        self.parameters = Some(params);
        self.update_saved_status_queue();
        Ok(())
    }

    async fn stream(&mut self) -> AppResult<()> {
        let mut duration_open = true;
        while !self.dataset_complete() {
            tokio::select! {
                biased;
                _ = self.bus.wait_for(SignalFlag::CloseAll, true) => break,
                _ = self.bus.wait_for(SignalFlag::IsSaving, false) => break,
                changed = self.channels.duration_rx.changed(), if duration_open => {
                    if changed.is_err() {
                        duration_open = false;
                        continue;
                    }
                    let duration = *self.channels.duration_rx.borrow_and_update();
                    if let Some(duration) = duration {
                        self.apply_duration(duration);
                    }
                }
                volume = self.channels.volume_rx.recv() => match volume {
                    Some(volume) => self.fill_dataset(&volume).await?,
                    None => return Ok(()),
                },
            }
        }

        // Volumes already queued when saving stopped still belong to the run
        while !self.dataset_complete() {
            match self.channels.volume_rx.try_recv() {
                Ok(volume) => self.fill_dataset(&volume).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn apply_duration(&mut self, duration_s: f64) {
        let Some(params) = self.parameters.as_mut() else {
            return;
        };
        let n_volumes = (params.volumerate * duration_s).ceil();
        if !n_volumes.is_finite() || n_volumes < 1.0 {
            warn!(duration_s, "ignoring experiment duration");
            return;
        }
        let n_volumes = n_volumes as u64;
        params.n_volumes = Some(n_volumes);
        self.status.n_volumes = Some(n_volumes);
        if let Some(target) = self.status.target_params.as_mut() {
            target.n_volumes = Some(n_volumes);
        }
        info!(duration_s, n_volumes, "experiment duration received");
        self.update_saved_status_queue();
    }

    fn dataset_complete(&self) -> bool {
        self.status
            .n_volumes
            .is_some_and(|n| self.status.i_volume >= n)
    }

    /// Buffer one volume, writing the chunk out when it is full or the run
    /// has all its volumes.
    pub async fn fill_dataset(&mut self, volume: &Volume) -> AppResult<()> {
        let params = self
            .parameters
            .as_ref()
            .ok_or_else(|| DaqError::Saving("volume received before parameters".into()))?;

        if self.chunk.is_none() {
            let shape = *self.volume_shape.get_or_insert(volume.shape());
            if self.chunk_size == 0 {
                let [n_planes, height, width] = shape;
                self.chunk_size = calculate_optimal_size(
                    params.optimal_chunk_mb_ram,
                    n_planes,
                    height * width * BYTES_PER_PIXEL,
                );
                info!(chunk_size = self.chunk_size, "chunk size");
            }
            let remaining = self
                .status
                .n_volumes
                .map_or(self.chunk_size, |n| n.saturating_sub(self.status.i_volume) as usize);
            self.chunk = Some(ChunkBuffer::new(shape, self.chunk_size.min(remaining)));
        }
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.push(volume)?;
        }
        self.status.i_volume += 1;
        self.status.i_in_chunk += 1;
        debug!(volume = volume.index, saved = self.status.i_volume, "volume buffered");

        if self.status.i_in_chunk >= self.chunk_size || self.dataset_complete() {
            self.save_chunk().await?;
        }
        self.update_saved_status_queue();
        Ok(())
    }

    /// Write the buffered chunk, if it holds any volume.
    ///
    /// A chunk the writer rejects is dropped and its volumes are left out of
    /// the metadata.
    pub async fn save_chunk(&mut self) -> AppResult<()> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };
        if chunk.is_empty() {
            return Ok(());
        }
        self.writer.write_chunk(self.status.i_chunk, &chunk).await?;
        self.n_persisted += chunk.n_volumes() as u64;
        debug!(chunk = self.status.i_chunk, volumes = chunk.n_volumes(), "chunk saved");
        self.status.i_chunk += 1;
        self.status.i_in_chunk = 0;
        Ok(())
    }

    /// Flush the partial chunk and write the metadata. Does nothing after
    /// the first call of a run.
    pub async fn finalize_dataset(&mut self) -> AppResult<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.save_chunk().await?;

        let Some(params) = self.parameters.as_ref() else {
            return Ok(());
        };
        let [n_planes, height, width] = self.volume_shape.unwrap_or([params.n_planes, 0, 0]);
        let n_volumes = self.n_persisted;
        let metadata = DatasetMetadata {
            shape_full: [n_volumes as usize, n_planes, height, width],
            shape_block: [self.chunk_size.max(1), n_planes, height, width],
            voxel_size: params.voxel_size,
            volumerate: params.volumerate,
            n_planes,
            n_volumes,
            dtype: "uint16".into(),
            run_id: self.status.run_id.unwrap_or_else(Uuid::nil),
        };
        let email = params.notification_email.clone();
        self.writer.finalize(&metadata).await?;

        info!(
            volumes = n_volumes,
            chunks = self.status.i_chunk,
            "dataset finalized"
        );
        if let Some(email) = email {
            info!(to = %email, volumes = n_volumes, "completion notification");
        }
        self.update_saved_status_queue();
        Ok(())
    }

    /// Publish the current progress.
    pub fn update_saved_status_queue(&self) {
        self.channels.status_tx.send_replace(self.status.clone());
    }

    fn report(&self, error: DaqError) {
        let _ = self.faults.send(Fault {
            source: "saver",
            error,
        });
    }
}

async fn remove_stale_dataset(dir: &Path) -> AppResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            info!(dir = %dir.display(), "removed stale dataset");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DaqError::Saving(format!(
            "cannot remove stale dataset '{}': {}",
            dir.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Frame;
    use crate::storage::{RawDatasetWriter, METADATA_FILE};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct Journal {
        chunks: Vec<(usize, usize)>,
        finalized: Vec<DatasetMetadata>,
    }

    struct RecordingWriter {
        journal: Arc<Mutex<Journal>>,
        /// First chunk index the writer rejects
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl DatasetWriter for RecordingWriter {
        async fn init(&mut self, _dir: &Path) -> AppResult<()> {
            Ok(())
        }

        async fn write_chunk(&mut self, index: usize, chunk: &ChunkBuffer) -> AppResult<()> {
            if self.fail_from.is_some_and(|first| index >= first) {
                return Err(DaqError::Saving("disk full".into()));
            }
            self.journal.lock().chunks.push((index, chunk.n_volumes()));
            Ok(())
        }

        async fn finalize(&mut self, metadata: &DatasetMetadata) -> AppResult<()> {
            self.journal.lock().finalized.push(metadata.clone());
            Ok(())
        }
    }

    struct Rig {
        bus: EventBus,
        volume_tx: mpsc::Sender<SharedVolume>,
        params_tx: watch::Sender<Option<SavingParameters>>,
        duration_tx: watch::Sender<Option<f64>>,
        status_rx: watch::Receiver<SavingStatus>,
        faults_rx: crate::error::FaultReceiver,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn(writer: Box<dyn DatasetWriter>) -> Rig {
        let bus = EventBus::new();
        let (volume_tx, volume_rx) = mpsc::channel(16);
        let (params_tx, params_rx) = watch::channel(None);
        let (duration_tx, duration_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(SavingStatus::default());
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let saver = StreamingSaver::new(
            bus.clone(),
            SaverChannels {
                volume_rx,
                params_rx,
                duration_rx,
                status_tx: Arc::new(status_tx),
            },
            faults,
            writer,
        );
        Rig {
            bus,
            volume_tx,
            params_tx,
            duration_tx,
            status_rx,
            faults_rx,
            handle: tokio::spawn(saver.run()),
        }
    }

    fn recording(fail_writes: bool) -> (Box<dyn DatasetWriter>, Arc<Mutex<Journal>>) {
        recording_failing_from(fail_writes.then_some(0))
    }

    fn recording_failing_from(
        fail_from: Option<usize>,
    ) -> (Box<dyn DatasetWriter>, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = RecordingWriter {
            journal: journal.clone(),
            fail_from,
        };
        (Box::new(writer), journal)
    }

    fn params(dir: &Path, n_volumes: Option<u64>, chunk_size: Option<usize>) -> SavingParameters {
        SavingParameters {
            output_dir: dir.to_path_buf(),
            voxel_size: [2.0, 0.6, 0.6],
            volumerate: 2.0,
            n_planes: 2,
            n_volumes,
            chunk_size,
            optimal_chunk_mb_ram: 450.0,
            notification_email: None,
        }
    }

    fn volume(index: u64) -> SharedVolume {
        Arc::new(Volume {
            index,
            planes: (0..2)
                .map(|i| Frame::from_pixels(&[index as u16; 4], 2, 2, index).with_plane(i))
                .collect(),
            volumerate: 2.0,
            width: 2,
            height: 2,
        })
    }

    async fn wait_saved(rig: &mut Rig, n: u64) {
        tokio::time::timeout(
            Duration::from_secs(2),
            rig.status_rx.wait_for(|s| s.i_volume >= n),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn close_all_flushes_partial_chunk_once() {
        let dir = tempdir().unwrap();
        let (writer, journal) = recording(false);
        let mut rig = spawn(writer);
        rig.params_tx
            .send_replace(Some(params(dir.path(), None, Some(4))));
        rig.bus.set(SignalFlag::IsSaving);

        for i in 0..6 {
            rig.volume_tx.send(volume(i)).await.unwrap();
        }
        wait_saved(&mut rig, 6).await;
        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();

        let journal = journal.lock();
        assert_eq!(journal.chunks, vec![(0, 4), (1, 2)]);
        assert_eq!(journal.finalized.len(), 1);
        assert_eq!(journal.finalized[0].n_volumes, 6);
        assert_eq!(journal.finalized[0].shape_full, [6, 2, 2, 2]);
        assert_eq!(journal.finalized[0].shape_block, [4, 2, 2, 2]);
        assert!(rig.bus.is_set(SignalFlag::SavingStopped));
    }

    #[tokio::test]
    async fn volume_target_completes_dataset() {
        let dir = tempdir().unwrap();
        let (writer, journal) = recording(false);
        let mut rig = spawn(writer);
        rig.params_tx
            .send_replace(Some(params(dir.path(), Some(3), Some(2))));
        rig.bus.set(SignalFlag::IsSaving);
        for i in 0..3 {
            rig.volume_tx.send(volume(i)).await.unwrap();
        }
        tokio::time::timeout(
            Duration::from_secs(2),
            rig.bus.wait_for(SignalFlag::SavingStopped, true),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(journal.lock().chunks, vec![(0, 2), (1, 1)]);
        assert_eq!(journal.lock().finalized.len(), 1);
        assert_eq!(rig.status_rx.borrow().i_volume, 3);

        // Clearing IS_SAVING afterwards does not finalize again
        rig.bus.clear(SignalFlag::IsSaving);
        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
        assert_eq!(journal.lock().finalized.len(), 1);
    }

    #[tokio::test]
    async fn duration_sets_volume_target() {
        let dir = tempdir().unwrap();
        let (writer, _journal) = recording(false);
        let mut rig = spawn(writer);
        rig.params_tx
            .send_replace(Some(params(dir.path(), None, Some(1))));
        rig.bus.set(SignalFlag::IsSaving);
        tokio::time::sleep(Duration::from_millis(20)).await;

        rig.duration_tx.send_replace(Some(1.5));
        tokio::time::timeout(
            Duration::from_secs(2),
            rig.status_rx.wait_for(|s| s.n_volumes == Some(3)),
        )
        .await
        .unwrap()
        .unwrap();

        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let dir = tempdir().unwrap();
        let (writer, journal) = recording(true);
        let mut rig = spawn(writer);
        rig.params_tx
            .send_replace(Some(params(dir.path(), None, Some(1))));
        rig.bus.set(SignalFlag::IsSaving);
        rig.volume_tx.send(volume(0)).await.unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(2), rig.faults_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fault.source, "saver");
        assert!(matches!(fault.error, DaqError::Saving(_)));
        assert!(rig.status_rx.borrow().error.is_some());
        {
            let journal = journal.lock();
            assert!(journal.chunks.is_empty());
            let finalized: Vec<u64> = journal.finalized.iter().map(|m| m.n_volumes).collect();
            assert_eq!(finalized, vec![0]);
            assert_eq!(journal.finalized[0].shape_full[0], 0);
        }

        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn metadata_counts_only_written_chunks() {
        let dir = tempdir().unwrap();
        let (writer, journal) = recording_failing_from(Some(1));
        let mut rig = spawn(writer);
        rig.params_tx
            .send_replace(Some(params(dir.path(), None, Some(1))));
        rig.bus.set(SignalFlag::IsSaving);
        rig.volume_tx.send(volume(0)).await.unwrap();
        rig.volume_tx.send(volume(1)).await.unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(2), rig.faults_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fault.error, DaqError::Saving(_)));
        assert_eq!(rig.status_rx.borrow().i_volume, 2);

        {
            let journal = journal.lock();
            assert_eq!(journal.chunks, vec![(0, 1)]);
            let written: usize = journal.chunks.iter().map(|(_, n)| n).sum();
            assert_eq!(journal.finalized.len(), 1);
            assert_eq!(journal.finalized[0].n_volumes, written as u64);
            assert_eq!(journal.finalized[0].shape_full, [1, 2, 2, 2]);
        }

        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn stale_dataset_is_replaced() {
        let dir = tempdir().unwrap();
        let dataset = dir.path().join(DATASET_DIR);
        std::fs::create_dir_all(&dataset).unwrap();
        std::fs::write(dataset.join("stale.bin"), b"old").unwrap();

        let mut rig = spawn(Box::new(RawDatasetWriter::new()));
        rig.params_tx
            .send_replace(Some(params(dir.path(), Some(2), None)));
        rig.bus.set(SignalFlag::IsSaving);
        rig.volume_tx.send(volume(0)).await.unwrap();
        rig.volume_tx.send(volume(1)).await.unwrap();
        wait_saved(&mut rig, 2).await;
        rig.bus
            .wait_for(SignalFlag::SavingStopped, true)
            .await
            .unwrap();

        assert!(!dataset.join("stale.bin").exists());
        let bytes = std::fs::read(dataset.join("0000.bin")).unwrap();
        assert_eq!(bytes.len(), 2 * 2 * 4 * 2);
        let metadata: DatasetMetadata =
            serde_json::from_slice(&std::fs::read(dataset.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(metadata.n_volumes, 2);
        assert_eq!(metadata.voxel_size, [2.0, 0.6, 0.6]);

        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }
}
