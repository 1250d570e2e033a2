//! Worker-side glue: accepts assignments from the control plane, wires the
//! session manager, VU engine, and telemetry together, and runs each
//! assignment for its stage duration.

pub mod cli;
pub mod executor;

pub use executor::{AssignmentExecutor, AssignmentOutcome};
