//! The per-device lifecycle engine and the primitives it composes.
//!
//! - [`poll`]: bounded waiting on device-observed state
//! - [`preflight`]: disk capacity check before recording
//! - [`locator`]: time-windowed discovery of produced files
//! - [`machine`]: the `initialize → test → start → verify → stop → finalize →
//!   validate` state machine and the guaranteed-stop recording scope

pub mod locator;
pub mod machine;
pub mod poll;
pub mod preflight;

pub use locator::FileTime;
pub use machine::{Finalized, Lifecycle, LifecycleState, Timing};
pub use poll::PollPolicy;
pub use preflight::{DiskCheck, DiskSpace, SystemDisks};
