//! Bridge to the behavior-tracking instrument.
//!
//! The camera raises `TRIGGER_STYTRA` on the first frame after the scan loop
//! starts pulsing. If a dataset is being saved, [`ExternalComm`] starts the
//! tracking instrument with the current experiment description and forwards
//! the duration it reports to the saver, which sizes the run from it.

use crate::error::{DaqError, Fault, FaultSender};
use crate::events::{EventBus, SignalFlag};
use crate::hardware::ExternalTrigger;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Task that owns the external trigger.
pub struct ExternalComm {
    trigger: Arc<dyn ExternalTrigger>,
    bus: EventBus,
    config_rx: watch::Receiver<serde_json::Value>,
    duration_tx: Arc<watch::Sender<Option<f64>>>,
    faults: FaultSender,
}

impl ExternalComm {
    /// Assemble the task.
    ///
    /// # Arguments
    /// * `config_rx` - experiment description sent with the start signal
    /// * `duration_tx` - where the reported duration goes
    pub fn new(
        trigger: Arc<dyn ExternalTrigger>,
        bus: EventBus,
        config_rx: watch::Receiver<serde_json::Value>,
        duration_tx: Arc<watch::Sender<Option<f64>>>,
        faults: FaultSender,
    ) -> Self {
        Self {
            trigger,
            bus,
            config_rx,
            duration_tx,
            faults,
        }
    }

    /// Run until `CLOSE_ALL`.
    pub async fn run(self) {
        let span = info_span!("external_comm");
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) {
        info!("started");
        loop {
            tokio::select! {
                biased;
                _ = self.bus.wait_for(SignalFlag::CloseAll, true) => break,
                _ = self.bus.wait_for(SignalFlag::TriggerStytra, true) => {}
            }
            self.handle_trigger().await;
            self.bus.clear(SignalFlag::TriggerStytra);
        }
        info!("stopped");
    }

    async fn handle_trigger(&self) {
        if !self.bus.is_set(SignalFlag::IsSaving) || self.bus.is_set(SignalFlag::WaitingForTrigger) {
            debug!("not saving, trigger ignored");
            return;
        }
        let config = self.config_rx.borrow().clone();
        match self.trigger.trigger_and_receive_duration(&config).await {
            Ok(Some(duration)) => {
                info!(duration_s = duration, "tracking started");
                self.duration_tx.send_replace(Some(duration));
            }
            Ok(None) => info!("tracking started without a duration"),
            Err(e) => {
                warn!(error = %e, "external trigger failed");
                let _ = self.faults.send(Fault {
                    source: "external_comm",
                    error: DaqError::HardwareTimeout(e.to_string()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockExternalTrigger;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Rig {
        trigger: Arc<MockExternalTrigger>,
        bus: EventBus,
        duration_rx: watch::Receiver<Option<f64>>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn(duration: Option<f64>) -> Rig {
        let trigger = Arc::new(MockExternalTrigger::new(duration));
        let bus = EventBus::new();
        let (_config_tx, config_rx) = watch::channel(serde_json::json!({"n_planes": 10}));
        let (duration_tx, duration_rx) = watch::channel(None);
        let (faults, _) = mpsc::unbounded_channel();
        let comm = ExternalComm::new(
            trigger.clone(),
            bus.clone(),
            config_rx,
            Arc::new(duration_tx),
            faults,
        );
        Rig {
            trigger,
            bus,
            duration_rx,
            handle: tokio::spawn(comm.run()),
        }
    }

    #[tokio::test]
    async fn duration_is_forwarded_while_saving() {
        let mut rig = spawn(Some(12.0));
        rig.bus.set(SignalFlag::IsSaving);
        rig.bus.set(SignalFlag::TriggerStytra);

        tokio::time::timeout(Duration::from_secs(1), rig.duration_rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rig.duration_rx.borrow(), Some(12.0));
        assert_eq!(rig.trigger.calls(), 1);
        assert_eq!(rig.trigger.last_config().unwrap()["n_planes"], 10);

        tokio::time::timeout(
            Duration::from_secs(1),
            rig.bus.wait_for(SignalFlag::TriggerStytra, false),
        )
        .await
        .unwrap()
        .unwrap();
        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }

    #[tokio::test]
    async fn trigger_without_saving_is_cleared() {
        let rig = spawn(Some(12.0));
        rig.bus.set(SignalFlag::TriggerStytra);
        tokio::time::timeout(
            Duration::from_secs(1),
            rig.bus.wait_for(SignalFlag::TriggerStytra, false),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(rig.trigger.calls(), 0);
        assert!(rig.duration_rx.borrow().is_none());

        rig.bus.set(SignalFlag::CloseAll);
        rig.handle.await.unwrap();
    }
}
