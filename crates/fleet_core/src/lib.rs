pub mod clock;
pub mod dispatch;
pub mod ecs;
pub mod error;
pub mod optimization;
pub mod partition;
pub mod profiling;
pub mod runner;
pub mod scenario;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod systems;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;
