//! Sample rings, frames and the frame buffer pool.
pub mod frame;
pub mod frame_pool;
pub mod rolling_buffer;

pub use frame::{Frame, SharedVolume, Volume};
pub use frame_pool::{FramePool, PooledFrame};
pub use rolling_buffer::{FillingRollingBuffer, RollingBuffer};
