//! # Lightsheet DAQ Core Library
//!
//! Real-time synchronization and streaming pipeline of a volumetric
//! light-sheet microscope. The crate drives galvo mirrors and a piezo stage
//! through an analog IO board, triggers the camera once per plane, assembles
//! the camera frames into volumes and streams the volumes to disk in chunks.
//!
//! ## Crate Structure
//!
//! - **`waveforms`**: periodic scan waveforms, sweep alignment (`calc_sync`)
//!   and camera pulse placement.
//! - **`data`**: frames, volumes, the preallocated frame pool and the rolling
//!   buffers the scan loop stages samples in.
//! - **`hardware`**: capability traits for the analog IO board, the camera and
//!   the tracking instrument, plus mock implementations.
//! - **`scanning`**: the scan loop state machine and the task that keeps one
//!   mounted.
//! - **`camera`**: the camera task and its frame-rate recorder.
//! - **`dispatcher`**: assembles frames into volumes for the viewer and saver.
//! - **`storage`**: chunked streaming saver and dataset writers.
//! - **`external_comm`**: starts the tracking instrument with an experiment.
//! - **`state`**: `GlobalState`, the one owner of the global phase, and the
//!   pipeline wiring.
//! - **`events`**: typed signal bus shared by every task.
//! - **`config`**, **`error`**, **`logging`**: settings, the `DaqError` enum
//!   and tracing setup.

pub mod camera;
pub mod config;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod external_comm;
pub mod hardware;
pub mod logging;
pub mod scanning;
pub mod state;
pub mod storage;
pub mod waveforms;

pub use error::{AppResult, DaqError};
pub use events::{EventBus, SignalFlag};
pub use state::{GlobalPhase, GlobalState, Hardware};
