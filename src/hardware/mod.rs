//! Hardware capabilities and their mock implementations.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AnalogChunk, AnalogIOBoard, AnalogReadback, Camera, CameraSettings, ExternalTrigger, Roi,
    TriggerMode,
};
pub use mock::{MockBoard, MockCamera, MockExternalTrigger, TriggerLink};
