//! Run data persistence.

pub mod storage;

pub use storage::{RunDocument, RunStore};
