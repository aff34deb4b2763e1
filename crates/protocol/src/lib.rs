//! Hostbridge Protocol
//!
//! Defines the data exchanged between a sandboxed test script and its host.
//! This crate is the source of truth for operation names, HTTP shapes and the
//! assertion/test report model.

mod logs;
mod operations;
mod report;
mod types;

pub use logs::*;
pub use operations::*;
pub use report::*;
pub use types::*;
