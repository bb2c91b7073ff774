//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can end a calibration run or prevent one from starting.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the following sources:
//!
//! - **`Config` / `Configuration`**: run settings that fail to load (figment) or that load
//!   but are semantically wrong (e.g. a non-positive series resistance).
//! - **`Io` / `Serialization`**: run-store file access and JSON encoding.
//! - **`MissingRole` / `RoleMismatch`**: the instrument registry handed to the controller
//!   does not bind every role, or binds a role to the wrong kind of device.
//! - **`SampleCount` / `PolaritySign` / `RangeReadback`**: internal consistency violations
//!   detected during a sweep. These are fatal to the run.
//! - **`Aborted`**: cooperative cancellation observed at a suspension point. Used for
//!   control flow inside the controller and never returned to the caller as an error.
//! - **`Task`**: the worker task running a sequence panicked or was cancelled.
//! - **`Unsaved`**: the run completed but the run store could not be written. The
//!   record travels with the error so the caller can retry.
//!
//! Instrument command failures have no variant: the controller absorbs them by
//! degrading the affected role to simulated readings.

use thiserror::Error;

use crate::experiment::record::RunRecord;
use crate::instrument::{Role, RoleKind};

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sequence task failed: {0}")]
    Task(String),

    #[error("No instrument bound to role {0}")]
    MissingRole(Role),

    #[error("Role {role} must be bound to a {expected} device")]
    RoleMismatch { role: Role, expected: RoleKind },

    #[error("Number of {channel} readings != {expected} (got {actual})")]
    SampleCount {
        channel: String,
        expected: usize,
        actual: usize,
    },

    #[error(
        "Output polarity mismatch on {node} at {level} V: negative-mask mean {negative}, positive-mask mean {positive}"
    )]
    PolaritySign {
        node: String,
        level: f64,
        negative: f64,
        positive: f64,
    },

    #[error("{channel} range wrong: range={range}, nominal={nominal}")]
    RangeReadback {
        channel: String,
        range: f64,
        nominal: f64,
    },

    #[error("Run aborted")]
    Aborted,

    #[error("Run '{run_id}' completed but could not be saved: {source}")]
    Unsaved {
        run_id: String,
        record: Box<RunRecord>,
        #[source]
        source: Box<DaqError>,
    },
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// True for the cancellation marker rather than a genuine failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, DaqError::Aborted)
    }
}
