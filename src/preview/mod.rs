//! Live preview processes: framework profiles, port allocation, and the pool.

pub mod framework;
pub mod pool;
pub mod port;

pub use framework::{Framework, FrameworkProfile, ProfileOverride, Profiles};
pub use pool::{PoolConfig, PreviewStatus, ProcessPool, ProcessStatus, StartOutcome};
