//! Core library for the IVY I-V converter calibration rig.
//!
//! This library holds the instrument capability traits, the acquisition sequence
//! controller and the run file format. It is used by the `ivy_run` binary and by
//! any front end that wants to drive a run and display its events.

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod messages;

pub use error::{AppResult, DaqError};
