//! Background workers that keep the cluster's view of liveness honest.
//!
//! - **Heartbeat**: stamps the local node record every interval
//! - **Crash detection**: declares stale peers dead, once, under a row lock
//! - **Zombie detection**: finds local work nobody is actually running
//!
//! # Components
//!
//! - [`HeartbeatEmitter`]: owns the local stamp and the [`HeartbeatCounter`]
//! - [`CrashDetector`]: cross-node failure detection and reclaim trigger
//! - [`ZombieDetector`]: double-sampled comparison of store claims against
//!   the [`ExecutionRegistry`](crate::registry::ExecutionRegistry)
//! - [`control`]: start / suspend / terminate plumbing shared by all three
//!
//! Each worker runs independently; none of them waits on another. They only
//! block on their own sleep and on store I/O.

pub mod control;
pub mod crash_detector;
pub mod heartbeat;
pub mod zombie_detector;

pub use control::{RunState, WorkerControl, WorkerHandle};
pub use crash_detector::{CrashDetector, DetectionReport};
pub use heartbeat::{HeartbeatCounter, HeartbeatEmitter};
pub use zombie_detector::{ZombieDetector, ZombieReport};
