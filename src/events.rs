//! Typed signal bus shared by every pipeline task.
//!
//! Each [`SignalFlag`] is a boolean owned by the whole pipeline. The bus
//! keeps the current value of every flag in a `watch` channel, so a task can
//! ask "is it set right now" or await a value, and publishes each transition
//! once on a `broadcast` channel. Setting a flag that is already set emits
//! nothing, so a subscriber sees every edge exactly once.
//!
//! # Example
//! ```
//! use lightsheet_daq::events::{EventBus, SignalFlag};
//!
//! let bus = EventBus::new();
//! let mut events = bus.subscribe();
//! assert!(bus.set(SignalFlag::IsSaving));
//! assert!(!bus.set(SignalFlag::IsSaving)); // already set, no event
//! let event = events.try_recv().unwrap();
//! assert_eq!(event.flag, SignalFlag::IsSaving);
//! assert!(event.set);
//! assert!(events.try_recv().is_err());
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

const EVENT_CAPACITY: usize = 256;

/// Pipeline-wide boolean signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalFlag {
    /// Every task must wind down.
    CloseAll,
    /// Assembled volumes go to the saver.
    IsSaving,
    /// The dispatcher subtracts the dark reference.
    NoiseSubtractionActive,
    /// The scan loop must exit and re-initialize.
    RestartScanning,
    /// The saver finished its dataset.
    SavingStopped,
    /// The tracking instrument should be started.
    TriggerStytra,
    /// The scan loop has not issued camera pulses yet.
    WaitingForTrigger,
}

impl SignalFlag {
    /// Every flag.
    pub const ALL: [SignalFlag; 7] = [
        SignalFlag::CloseAll,
        SignalFlag::IsSaving,
        SignalFlag::NoiseSubtractionActive,
        SignalFlag::RestartScanning,
        SignalFlag::SavingStopped,
        SignalFlag::TriggerStytra,
        SignalFlag::WaitingForTrigger,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Upper-case signal name.
    pub fn name(self) -> &'static str {
        match self {
            SignalFlag::CloseAll => "CLOSE_ALL",
            SignalFlag::IsSaving => "IS_SAVING",
            SignalFlag::NoiseSubtractionActive => "NOISE_SUBTRACTION_ACTIVE",
            SignalFlag::RestartScanning => "RESTART_SCANNING",
            SignalFlag::SavingStopped => "SAVING_STOPPED",
            SignalFlag::TriggerStytra => "TRIGGER_STYTRA",
            SignalFlag::WaitingForTrigger => "WAITING_FOR_TRIGGER",
        }
    }
}

impl fmt::Display for SignalFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One flag transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEvent {
    /// The flag that changed
    pub flag: SignalFlag,
    /// Its new value
    pub set: bool,
}

/// Shared handle to the pipeline's signal flags.
///
/// Cloning is cheap; every clone talks to the same flags.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<watch::Sender<u8>>,
    events: broadcast::Sender<SignalEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<&str> = SignalFlag::ALL
            .iter()
            .filter(|flag| self.is_set(**flag))
            .map(|flag| flag.name())
            .collect();
        f.debug_struct("EventBus").field("set", &set).finish()
    }
}

impl EventBus {
    /// Create a bus with every flag clear.
    pub fn new() -> Self {
        let (state, _) = watch::channel(0u8);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(state),
            events,
        }
    }

    /// Raise `flag`. Returns `true` if it was clear before.
    pub fn set(&self, flag: SignalFlag) -> bool {
        self.update(flag, true)
    }

    /// Lower `flag`. Returns `true` if it was set before.
    pub fn clear(&self, flag: SignalFlag) -> bool {
        self.update(flag, false)
    }

    /// Lower `flag` and report whether it had been set.
    ///
    /// Used for one-shot requests such as `RESTART_SCANNING`, where exactly
    /// one consumer acts on each request.
    pub fn take(&self, flag: SignalFlag) -> bool {
        self.clear(flag)
    }

    /// Current value of `flag`.
    pub fn is_set(&self, flag: SignalFlag) -> bool {
        *self.state.borrow() & flag.bit() != 0
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    /// Wait until `flag` has value `set`.
    pub async fn wait_for(&self, flag: SignalFlag, set: bool) -> AppResult<()> {
        let mut rx = self.state.subscribe();
        rx.wait_for(|bits| (bits & flag.bit() != 0) == set)
            .await
            .map(|_| ())
            .map_err(|_| DaqError::ChannelClosed("signal flags"))
    }

    fn update(&self, flag: SignalFlag, set: bool) -> bool {
        let changed = self.state.send_if_modified(|bits| {
            let was_set = *bits & flag.bit() != 0;
            if was_set == set {
                return false;
            }
            if set {
                *bits |= flag.bit();
            } else {
                *bits &= !flag.bit();
            }
            true
        });
        if changed {
            info!(flag = %flag, set, "signal");
            // No subscribers is fine; the watch value is still current
            let _ = self.events.send(SignalEvent { flag, set });
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn flags_start_clear() {
        let bus = EventBus::new();
        assert!(SignalFlag::ALL.iter().all(|f| !bus.is_set(*f)));
    }

    #[test]
    fn flags_are_independent() {
        let bus = EventBus::new();
        bus.set(SignalFlag::CloseAll);
        bus.set(SignalFlag::WaitingForTrigger);
        bus.clear(SignalFlag::CloseAll);
        assert!(!bus.is_set(SignalFlag::CloseAll));
        assert!(bus.is_set(SignalFlag::WaitingForTrigger));
        assert!(!bus.is_set(SignalFlag::IsSaving));
    }

    #[test]
    fn each_edge_is_published_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.set(SignalFlag::IsSaving);
        bus.set(SignalFlag::IsSaving);
        bus.clear(SignalFlag::IsSaving);
        bus.clear(SignalFlag::IsSaving);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(
            (first.flag, first.set, second.flag, second.set),
            (SignalFlag::IsSaving, true, SignalFlag::IsSaving, false)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn take_consumes_request() {
        let bus = EventBus::new();
        assert!(!bus.take(SignalFlag::RestartScanning));
        bus.set(SignalFlag::RestartScanning);
        assert!(bus.take(SignalFlag::RestartScanning));
        assert!(!bus.is_set(SignalFlag::RestartScanning));
    }

    #[test]
    fn clones_share_state() {
        let bus = EventBus::new();
        let other = bus.clone();
        other.set(SignalFlag::TriggerStytra);
        assert!(bus.is_set(SignalFlag::TriggerStytra));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_set() {
        let bus = EventBus::new();
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_for(SignalFlag::SavingStopped, true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.set(SignalFlag::SavingStopped);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn display_uses_signal_names() {
        assert_eq!(SignalFlag::CloseAll.to_string(), "CLOSE_ALL");
        assert_eq!(
            SignalFlag::WaitingForTrigger.to_string(),
            "WAITING_FOR_TRIGGER"
        );
    }
}
