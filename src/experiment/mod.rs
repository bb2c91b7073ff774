//! Calibration run orchestration.
//!
//! - [`plan`]: sweep matrix, scope limits and progress accounting
//! - [`record`]: the persisted run record and run identifiers
//! - [`station`]: per-role wrappers that absorb instrument failures
//! - [`controller`]: the sequence state machine
//!
//! # Example
//!
//! ```rust,ignore
//! use ivy_daq::experiment::SequenceController;
//!
//! let (events, mut rx) = ivy_daq::messages::event_channel();
//! let handle = SequenceController::new(settings, registry, events)?.spawn();
//! while let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! let outcome = handle.join().await?;
//! ```

pub mod controller;
pub mod plan;
pub mod record;
pub mod station;

pub use controller::{
    abort_pair, AbortHandle, AbortSignal, RunHandle, RunOutcome, RunState, SequenceController,
};
pub use plan::{CalibrationPoint, LevelPlan, Node, Polarity, Progress, SkipReason, SweepPlan};
pub use record::{RunId, RunRecord};
