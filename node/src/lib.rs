pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod mode;
pub mod sync;
pub mod telemetry;
pub mod test_utils;

pub use download::{MissionOutcome, MissionScheduler, MissionState};
pub use sync::{SyncHandle, Synchronizer};
