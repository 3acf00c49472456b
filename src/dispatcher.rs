//! Volume assembly.
//!
//! The [`VolumeDispatcher`] drains the frame queue, slots each frame by its
//! plane index and emits a [`Volume`] once every plane is present. Complete
//! volumes always go to the viewer and, while `IS_SAVING` is set, to the
//! saver. Partial volumes are never forwarded.
//!
//! Two volumes are assembled at once, so frames swapped across a volume
//! boundary still land in the right volume.

use crate::data::{Frame, SharedVolume, Volume};
use crate::data::frame::pixels_to_bytes;
use crate::error::{AppResult, DaqError, Fault, FaultSender};
use crate::events::{EventBus, SignalFlag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Volume geometry pushed by the global state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatcherParameters {
    /// Planes per volume
    pub n_planes: usize,
    /// Volumes per second
    pub volumerate: f64,
}

impl Default for DispatcherParameters {
    fn default() -> Self {
        Self {
            n_planes: 1,
            volumerate: 0.0,
        }
    }
}

/// Counters reported on every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    /// Index the next complete volume will get
    pub volume_index: u64,
    /// Frames received
    pub n_frames: u64,
    /// Frames dropped for an out-of-range plane index
    pub n_dropped: u64,
    /// Partial volumes thrown away
    pub n_discarded: u64,
}

/// Planes of one volume under assembly.
#[derive(Debug)]
struct Accumulator {
    slots: Vec<Option<Frame>>,
    n_filled: usize,
}

impl Accumulator {
    fn new(n_planes: usize) -> Self {
        Self {
            slots: vec![None; n_planes.max(1)],
            n_filled: 0,
        }
    }

    fn has(&self, plane: usize) -> bool {
        self.slots[plane].is_some()
    }

    fn insert(&mut self, frame: Frame) {
        let plane = frame.plane_index;
        self.slots[plane] = Some(frame);
        self.n_filled += 1;
    }

    fn is_empty(&self) -> bool {
        self.n_filled == 0
    }

    fn is_complete(&self) -> bool {
        self.n_filled == self.slots.len()
    }

    fn frame_shape(&self) -> Option<(usize, usize)> {
        self.slots.iter().flatten().next().map(|f| (f.width, f.height))
    }

    fn take_planes(&mut self) -> Vec<Frame> {
        self.n_filled = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Dark-frame reference subtracted from every frame when enabled.
pub type NoiseReference = Option<Arc<[u16]>>;

/// Latest complete volume, for display.
pub type ViewerSnapshot = Option<SharedVolume>;

/// Queue ends and shared state the dispatcher works with.
pub struct DispatcherChannels {
    /// Frames from the camera
    pub frame_rx: mpsc::Receiver<Frame>,
    /// Complete volumes to the saver
    pub saver_tx: mpsc::Sender<SharedVolume>,
    /// Latest complete volume
    pub viewer_tx: Arc<watch::Sender<ViewerSnapshot>>,
    /// Counters
    pub status_tx: Arc<watch::Sender<DispatcherStatus>>,
    /// Volume geometry
    pub params_rx: watch::Receiver<DispatcherParameters>,
    /// Dark-frame reference
    pub noise_rx: watch::Receiver<NoiseReference>,
}

/// Task that turns frames into volumes.
pub struct VolumeDispatcher {
    bus: EventBus,
    channels: DispatcherChannels,
    faults: FaultSender,
    put_timeout: Duration,
    poll_interval: Duration,
    parameters: DispatcherParameters,
    noise_reference: NoiseReference,
    /// Oldest volume under assembly
    current: Accumulator,
    /// The volume after it, started by a plane `current` already holds
    next: Accumulator,
    status: DispatcherStatus,
}

impl VolumeDispatcher {
    /// Assemble the dispatcher task.
    pub fn new(
        bus: EventBus,
        channels: DispatcherChannels,
        faults: FaultSender,
        put_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let parameters = *channels.params_rx.borrow();
        let noise_reference = channels.noise_rx.borrow().clone();
        Self {
            bus,
            channels,
            faults,
            put_timeout,
            poll_interval,
            current: Accumulator::new(parameters.n_planes),
            next: Accumulator::new(parameters.n_planes),
            parameters,
            noise_reference,
            status: DispatcherStatus::default(),
        }
    }

    /// Current counters.
    pub fn status(&self) -> DispatcherStatus {
        self.status
    }

    /// Run until `CLOSE_ALL` or until the camera side closes the frame queue.
    pub async fn run(self) {
        let span = info_span!("dispatcher");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!(n_planes = self.parameters.n_planes, "started");
        while !self.bus.is_set(SignalFlag::CloseAll) {
            self.send_receive();
            let frame = match self.get_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(DaqError::ChannelClosed(_)) => break,
                Err(e) => {
                    self.report(e);
                    continue;
                }
            };
            if let Err(e) = self.dispatch(frame).await {
                self.report(e);
            }
        }
        info!(
            volumes = self.status.volume_index,
            dropped = self.status.n_dropped,
            "stopped"
        );
    }

    /// Place one frame and forward the volume it completes, if any.
    ///
    /// Out-of-range frames are counted and logged, not returned as errors.
    pub async fn dispatch(&mut self, frame: Frame) -> AppResult<()> {
        match self.process_frame(frame) {
            Ok(Some(volume)) => self.fill_queues(volume).await,
            Ok(None) => Ok(()),
            Err(e) if e.is_recoverable() => {
                self.status.n_dropped += 1;
                warn!(error = %e, dropped = self.status.n_dropped, "dropped frame");
                self.publish_status();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Pick up new geometry and noise reference, then publish the counters.
    pub fn send_receive(&mut self) {
        if self.channels.params_rx.has_changed().unwrap_or(false) {
            let parameters = *self.channels.params_rx.borrow_and_update();
            if parameters != self.parameters {
                info!(
                    n_planes = parameters.n_planes,
                    volumerate = parameters.volumerate,
                    "new volume geometry"
                );
                self.parameters = parameters;
                self.reset();
            }
        }
        if self.channels.noise_rx.has_changed().unwrap_or(false) {
            self.noise_reference = self.channels.noise_rx.borrow_and_update().clone();
            debug!(set = self.noise_reference.is_some(), "noise reference updated");
        }
        self.publish_status();
    }

    /// Next frame from the camera, `None` if none arrived within the poll
    /// interval.
    ///
    /// Frames arriving while `WAITING_FOR_TRIGGER` is set precede the first
    /// camera pulse and are discarded.
    ///
    /// # Errors
    /// [`DaqError::ChannelClosed`] once the camera side is gone.
    pub async fn get_frame(&mut self) -> AppResult<Option<Frame>> {
        if self.bus.is_set(SignalFlag::WaitingForTrigger) {
            debug!("wait starting");
            let mut discarded = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = self.bus.wait_for(SignalFlag::CloseAll, true) => return Ok(None),
                    _ = self.bus.wait_for(SignalFlag::WaitingForTrigger, false) => break,
                    frame = self.channels.frame_rx.recv() => match frame {
                        Some(_) => discarded += 1,
                        None => return Err(DaqError::ChannelClosed("frames")),
                    },
                }
            }
            debug!(discarded, "wait over");
            self.reset();
        }

        match tokio::time::timeout(self.poll_interval, self.channels.frame_rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(DaqError::ChannelClosed("frames")),
            Err(_) => Ok(None),
        }
    }

    /// Slot a frame into the volume being assembled.
    ///
    /// A plane the current volume already holds starts the next volume.
    /// When the next volume also holds it, planes of the current one went
    /// missing and it is thrown away. A change of frame shape throws away
    /// both.
    ///
    /// # Errors
    /// [`DaqError::Dispatch`] if the plane index is outside `[0, n_planes)`.
    pub fn process_frame(&mut self, frame: Frame) -> AppResult<Option<SharedVolume>> {
        self.status.n_frames += 1;
        let n_planes = self.parameters.n_planes.max(1);
        if frame.plane_index >= n_planes {
            return Err(DaqError::Dispatch {
                plane_index: frame.plane_index,
                n_planes,
            });
        }

        let frame = self.subtract_noise(frame);

        let shape = (frame.width, frame.height);
        let shape_changed = [&self.current, &self.next]
            .iter()
            .filter_map(|acc| acc.frame_shape())
            .any(|s| s != shape);
        if shape_changed {
            let partial = [&self.current, &self.next]
                .iter()
                .filter(|acc| !acc.is_empty())
                .count();
            warn!(width = shape.0, height = shape.1, partial, "frame shape changed");
            self.status.n_discarded += partial as u64;
            self.reset();
        }

        let plane = frame.plane_index;
        if !self.current.has(plane) {
            self.current.insert(frame);
        } else {
            if self.next.has(plane) {
                self.discard_current(plane);
            }
            self.next.insert(frame);
        }

        // `next` only holds planes `current` already has, so it never
        // completes first
        if self.current.is_complete() {
            return Ok(Some(self.emit()));
        }
        Ok(None)
    }

    fn discard_current(&mut self, plane: usize) {
        warn!(
            plane,
            filled = self.current.n_filled,
            "incomplete volume discarded"
        );
        self.status.n_discarded += 1;
        self.promote();
    }

    fn promote(&mut self) {
        let fresh = Accumulator::new(self.parameters.n_planes);
        self.current = std::mem::replace(&mut self.next, fresh);
    }

    fn emit(&mut self) -> SharedVolume {
        let planes = self.current.take_planes();
        self.promote();
        let (width, height) = (planes[0].width, planes[0].height);
        let volume = Volume {
            index: self.status.volume_index,
            planes,
            volumerate: self.parameters.volumerate,
            width,
            height,
        };
        self.status.volume_index += 1;
        debug!(index = volume.index, "volume complete");
        Arc::new(volume)
    }

    fn subtract_noise(&self, frame: Frame) -> Frame {
        if !self.bus.is_set(SignalFlag::NoiseSubtractionActive) {
            return frame;
        }
        let Some(reference) = &self.noise_reference else {
            return frame;
        };
        if reference.len() != frame.width * frame.height {
            return frame;
        }
        let pixels: Vec<u16> = frame
            .pixels()
            .iter()
            .zip(reference.iter())
            .map(|(px, dark)| px.saturating_sub(*dark))
            .collect();
        Frame {
            data: pixels_to_bytes(&pixels),
            ..frame
        }
    }

    /// Hand a complete volume to the viewer and, while saving, to the saver.
    ///
    /// # Errors
    /// [`DaqError::QueueTimeout`] if the saver queue stays full past the put
    /// timeout.
    pub async fn fill_queues(&mut self, volume: SharedVolume) -> AppResult<()> {
        self.channels.viewer_tx.send_replace(Some(Arc::clone(&volume)));
        if self.bus.is_set(SignalFlag::IsSaving) {
            match self
                .channels
                .saver_tx
                .send_timeout(volume, self.put_timeout)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => return Err(DaqError::QueueTimeout("volumes")),
                Err(SendTimeoutError::Closed(_)) => return Err(DaqError::ChannelClosed("volumes")),
            }
        }
        self.publish_status();
        Ok(())
    }

    /// Throw away the partial volumes.
    pub fn reset(&mut self) {
        self.current = Accumulator::new(self.parameters.n_planes);
        self.next = Accumulator::new(self.parameters.n_planes);
    }

    fn publish_status(&self) {
        let status = self.status;
        self.channels.status_tx.send_if_modified(|s| {
            if *s == status {
                false
            } else {
                *s = status;
                true
            }
        });
    }

    fn report(&self, error: DaqError) {
        let _ = self.faults.send(Fault {
            source: "dispatcher",
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct Rig {
        dispatcher: VolumeDispatcher,
        bus: EventBus,
        frame_tx: mpsc::Sender<Frame>,
        saver_rx: mpsc::Receiver<SharedVolume>,
        viewer_rx: watch::Receiver<ViewerSnapshot>,
        params_tx: watch::Sender<DispatcherParameters>,
        noise_tx: watch::Sender<NoiseReference>,
    }

    fn rig(n_planes: usize) -> Rig {
        let bus = EventBus::new();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (saver_tx, saver_rx) = mpsc::channel(8);
        let (viewer_tx, viewer_rx) = watch::channel(None);
        let (status_tx, _) = watch::channel(DispatcherStatus::default());
        let (params_tx, params_rx) = watch::channel(DispatcherParameters {
            n_planes,
            volumerate: 2.0,
        });
        let (noise_tx, noise_rx) = watch::channel(None);
        let (faults, _) = mpsc::unbounded_channel();
        let dispatcher = VolumeDispatcher::new(
            bus.clone(),
            DispatcherChannels {
                frame_rx,
                saver_tx,
                viewer_tx: Arc::new(viewer_tx),
                status_tx: Arc::new(status_tx),
                params_rx,
                noise_rx,
            },
            faults,
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        Rig {
            dispatcher,
            bus,
            frame_tx,
            saver_rx,
            viewer_rx,
            params_tx,
            noise_tx,
        }
    }

    fn frame(plane: usize, n: u64) -> Frame {
        Frame::from_pixels(&[n as u16; 4], 2, 2, n).with_plane(plane)
    }

    #[tokio::test]
    #[traced_test]
    async fn stray_planes_are_dropped_and_logged() {
        let mut rig = rig(10);
        rig.bus.set(SignalFlag::IsSaving);
        let mut n = 0;
        for _ in 0..3 {
            for plane in 0..10 {
                rig.dispatcher.dispatch(frame(plane, n)).await.unwrap();
                n += 1;
            }
            rig.dispatcher.dispatch(frame(15, n)).await.unwrap();
            n += 1;
        }
        assert_eq!(n, 33);

        let status = rig.dispatcher.status();
        assert_eq!(status.volume_index, 3);
        assert_eq!(status.n_dropped, 3);
        assert!(logs_contain("dropped frame"));

        for index in 0..3 {
            let volume = rig.saver_rx.try_recv().unwrap();
            assert_eq!(volume.index, index);
            let planes: Vec<usize> = volume.planes.iter().map(|f| f.plane_index).collect();
            assert_eq!(planes, (0..10).collect::<Vec<_>>());
        }
        assert!(rig.saver_rx.try_recv().is_err());
    }

    #[test]
    fn planes_are_ordered_by_index_not_arrival() {
        let mut rig = rig(3);
        assert!(rig.dispatcher.process_frame(frame(2, 0)).unwrap().is_none());
        assert!(rig.dispatcher.process_frame(frame(0, 1)).unwrap().is_none());
        let volume = rig.dispatcher.process_frame(frame(1, 2)).unwrap().unwrap();
        let numbers: Vec<u64> = volume.planes.iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![1, 2, 0]);
        assert_eq!(volume.shape(), [3, 2, 2]);
        assert_eq!(volume.volumerate, 2.0);
    }

    /// Feed `planes` in order, numbering frames by arrival.
    fn assemble(n_planes: usize, planes: &[usize]) -> (Vec<SharedVolume>, DispatcherStatus) {
        let mut rig = rig(n_planes);
        let volumes = planes
            .iter()
            .enumerate()
            .filter_map(|(n, plane)| rig.dispatcher.process_frame(frame(*plane, n as u64)).unwrap())
            .collect();
        (volumes, rig.dispatcher.status())
    }

    fn frame_numbers(volume: &Volume) -> Vec<u64> {
        volume.planes.iter().map(|f| f.frame_number).collect()
    }

    #[test]
    fn frames_swapped_across_a_boundary_keep_both_volumes() {
        let (volumes, status) = assemble(3, &[0, 1, 0, 2, 1, 2]);
        assert_eq!(volumes.len(), 2);
        assert_eq!(frame_numbers(&volumes[0]), vec![0, 1, 3]);
        assert_eq!(frame_numbers(&volumes[1]), vec![2, 4, 5]);
        assert_eq!(status.n_discarded, 0);
    }

    #[test]
    fn reordered_sweeps_yield_one_volume_per_n_planes_frames() {
        let cases: [(usize, &[usize]); 5] = [
            (3, &[2, 1, 0, 1, 0, 2, 0, 2, 1]),
            (3, &[0, 1, 0, 2, 1, 0, 2, 1, 2]),
            (4, &[0, 1, 2, 0, 3, 1, 2, 3]),
            (4, &[0, 1, 2, 0, 1, 3, 2, 3, 0, 1, 2, 3, 0]),
            (2, &[1, 0, 0, 1, 1, 0, 0, 1, 1]),
        ];
        for (n_planes, planes) in cases {
            let (volumes, status) = assemble(n_planes, planes);
            assert_eq!(volumes.len(), planes.len() / n_planes, "{:?}", planes);
            assert_eq!(status.n_discarded, 0, "{:?}", planes);
            for (index, volume) in volumes.iter().enumerate() {
                assert_eq!(volume.index, index as u64);
                let order: Vec<usize> = volume.planes.iter().map(|f| f.plane_index).collect();
                assert_eq!(order, (0..n_planes).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn missing_plane_is_filled_from_the_next_sweep() {
        // plane 2 of the first sweep never arrives
        let (volumes, status) = assemble(3, &[0, 1, 0, 1, 2]);
        assert_eq!(volumes.len(), 1);
        assert_eq!(frame_numbers(&volumes[0]), vec![0, 1, 4]);
        assert_eq!(status.n_discarded, 0);
    }

    #[test]
    fn third_overlapping_sweep_discards_the_oldest() {
        let (volumes, status) = assemble(3, &[0, 1, 0, 1, 0, 2]);
        assert_eq!(status.n_discarded, 1);
        assert_eq!(volumes.len(), 1);
        assert_eq!(frame_numbers(&volumes[0]), vec![2, 3, 5]);
    }

    #[test]
    fn shape_change_discards_partial_volumes() {
        let mut rig = rig(2);
        rig.dispatcher.process_frame(frame(0, 0)).unwrap();
        let wide = Frame::from_pixels(&[0u16; 8], 4, 2, 1).with_plane(1);
        assert!(rig.dispatcher.process_frame(wide).unwrap().is_none());
        assert_eq!(rig.dispatcher.status().n_discarded, 1);
    }

    #[test]
    fn reset_discards_partial_volume() {
        let mut rig = rig(2);
        rig.dispatcher.process_frame(frame(0, 0)).unwrap();
        rig.dispatcher.reset();
        assert!(rig.dispatcher.process_frame(frame(1, 1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn volumes_reach_saver_only_while_saving() {
        let mut rig = rig(1);
        rig.dispatcher.dispatch(frame(0, 0)).await.unwrap();
        assert!(rig.saver_rx.try_recv().is_err());
        assert_eq!(rig.viewer_rx.borrow_and_update().as_ref().unwrap().index, 0);

        rig.bus.set(SignalFlag::IsSaving);
        rig.dispatcher.dispatch(frame(0, 1)).await.unwrap();
        assert_eq!(rig.saver_rx.try_recv().unwrap().index, 1);
    }

    #[tokio::test]
    async fn full_saver_queue_times_out() {
        let mut rig = rig(1);
        rig.bus.set(SignalFlag::IsSaving);
        for n in 0..8 {
            rig.dispatcher.dispatch(frame(0, n)).await.unwrap();
        }
        let err = rig.dispatcher.dispatch(frame(0, 8)).await.unwrap_err();
        assert!(matches!(err, DaqError::QueueTimeout("volumes")));
    }

    #[test]
    fn new_geometry_resets_assembly() {
        let mut rig = rig(3);
        rig.dispatcher.process_frame(frame(0, 0)).unwrap();
        rig.params_tx.send_replace(DispatcherParameters {
            n_planes: 2,
            volumerate: 4.0,
        });
        rig.dispatcher.send_receive();
        rig.dispatcher.process_frame(frame(1, 1)).unwrap();
        let volume = rig.dispatcher.process_frame(frame(0, 2)).unwrap().unwrap();
        assert_eq!(volume.n_planes(), 2);
        assert_eq!(volume.volumerate, 4.0);
    }

    #[test]
    fn noise_reference_is_subtracted_when_active() {
        let mut rig = rig(1);
        rig.noise_tx.send_replace(Some(Arc::from(vec![3u16, 3, 10, 10])));
        rig.dispatcher.send_receive();

        let raw = Frame::from_pixels(&[5, 5, 5, 5], 2, 2, 0);
        let volume = rig.dispatcher.process_frame(raw.clone()).unwrap().unwrap();
        assert_eq!(volume.planes[0].pixels(), vec![5, 5, 5, 5]);

        rig.bus.set(SignalFlag::NoiseSubtractionActive);
        let volume = rig.dispatcher.process_frame(raw).unwrap().unwrap();
        assert_eq!(volume.planes[0].pixels(), vec![2, 2, 0, 0]);
    }

    #[tokio::test]
    async fn frames_during_wait_are_discarded() {
        let mut rig = rig(2);
        rig.bus.set(SignalFlag::WaitingForTrigger);
        rig.frame_tx.send(frame(0, 0)).await.unwrap();
        rig.frame_tx.send(frame(1, 1)).await.unwrap();

        let bus = rig.bus.clone();
        let tx = rig.frame_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.clear(SignalFlag::WaitingForTrigger);
            tx.send(frame(0, 2)).await.unwrap();
        });

        let next = loop {
            if let Some(frame) = rig.dispatcher.get_frame().await.unwrap() {
                break frame;
            }
        };
        assert_eq!(next.frame_number, 2);
    }

    #[tokio::test]
    async fn run_exits_when_camera_side_closes() {
        let rig = rig(1);
        let Rig {
            dispatcher,
            frame_tx,
            ..
        } = rig;
        drop(frame_tx);
        tokio::time::timeout(Duration::from_secs(1), dispatcher.run())
            .await
            .unwrap();
    }
}
