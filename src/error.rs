//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! task in the pipeline. Using the `thiserror` crate, it provides a centralized
//! way to describe the failures that can occur while scanning, acquiring,
//! dispatching and saving.
//!
//! ## Error Hierarchy
//!
//! - **`Scanning`**: the analog IO board reported a fault or the requested scan
//!   geometry cannot be generated. Fatal for the current run.
//! - **`Overrun` / `Underrun`**: a [`RollingBuffer`](crate::data::rolling_buffer::RollingBuffer)
//!   was asked to hold more than its free space, or to yield more samples than
//!   it has.
//! - **`Dispatch`**: a frame carried a plane index outside `[0, n_planes)`. The
//!   frame is dropped and counted; the run continues.
//! - **`HardwareTimeout`**: the scan loop waited too long for the start trigger.
//!   The loop logs it and waits again.
//! - **`QueueTimeout`**: a bounded queue stayed full past the put timeout.
//! - **`Saving`**: the dataset writer failed. Aborts the run.
//! - **`InvalidTransition`**: a global phase change that the transition table
//!   does not allow.
//! - **`Config` / `Configuration`**: parse errors from `figment` and semantic
//!   errors found by validation.
//! - **`Io`**: wraps `std::io::Error`.
//! - **`ShutdownFailed`**: one or more tasks did not stop cleanly during
//!   `wrap_up`.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Error type for every pipeline component.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Figment failed to parse or extract the settings.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or OS level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Board fault or unrealizable scan geometry.
    #[error("Scanning error: {0}")]
    Scanning(String),

    /// Write larger than the free space of a rolling buffer.
    #[error("Buffer overrun: tried to write {requested} samples with {free} free")]
    Overrun {
        /// Samples offered to the buffer.
        requested: usize,
        /// Free slots at the time of the write.
        free: usize,
    },

    /// Read larger than the samples held by a rolling buffer.
    #[error("Buffer underrun: requested {requested} samples with {available} available")]
    Underrun {
        /// Samples requested by the reader.
        requested: usize,
        /// Samples currently held.
        available: usize,
    },

    /// Frame that cannot be placed in a volume.
    #[error("Dispatch error: plane index {plane_index} outside 0..{n_planes}")]
    Dispatch {
        /// Plane index carried by the frame.
        plane_index: usize,
        /// Planes per volume at the time of dispatch.
        n_planes: usize,
    },

    /// Waited too long for a hardware condition.
    #[error("Hardware timeout: {0}")]
    HardwareTimeout(String),

    /// A bounded queue stayed full past its put timeout.
    #[error("Queue '{0}' full past its put timeout")]
    QueueTimeout(&'static str),

    /// The dataset writer failed.
    #[error("Saving error: {0}")]
    Saving(String),

    /// Global phase change rejected by the transition table.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Phase before the request.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// The other end of a channel has gone away.
    #[error("Channel '{0}' closed")]
    ChannelClosed(&'static str),

    /// Tasks that failed to stop, one message each.
    #[error("Shutdown failed: {}", .0.join("; "))]
    ShutdownFailed(Vec<String>),
}

/// An error a pipeline task could not handle itself.
///
/// Tasks send faults to the global state, which decides whether the run
/// continues.
#[derive(Debug)]
pub struct Fault {
    /// Task that raised the fault
    pub source: &'static str,
    /// What went wrong
    pub error: DaqError,
}

/// Sending half of the fault channel.
pub type FaultSender = tokio::sync::mpsc::UnboundedSender<Fault>;

/// Receiving half of the fault channel.
pub type FaultReceiver = tokio::sync::mpsc::UnboundedReceiver<Fault>;

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether the pipeline keeps running after this error.
    ///
    /// Dropped frames and trigger-wait timeouts are logged and absorbed; every
    /// other error ends the current run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Dispatch { .. } | DaqError::HardwareTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_and_timeout_are_recoverable() {
        assert!(DaqError::Dispatch {
            plane_index: 12,
            n_planes: 10
        }
        .is_recoverable());
        assert!(DaqError::HardwareTimeout("no trigger".into()).is_recoverable());
    }

    #[test]
    fn saving_and_scanning_are_fatal() {
        assert!(!DaqError::Saving("disk full".into()).is_recoverable());
        assert!(!DaqError::Scanning("board fault".into()).is_recoverable());
        assert!(!DaqError::QueueTimeout("frames").is_recoverable());
    }

    #[test]
    fn overrun_message_names_sizes() {
        let err = DaqError::Overrun {
            requested: 100,
            free: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        match fails() {
            Err(DaqError::Io(err)) => assert_eq!(err.to_string(), "boom"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
