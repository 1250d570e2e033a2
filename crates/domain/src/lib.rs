//! Shared domain model for MCPDrill.
//!
//! Everything that crosses a crate boundary lives here: the run configuration
//! and system policy, the worker assignment contract, operation and outcome
//! types, identifier validation, and the shared error type.

pub mod assignment;
pub mod config;
pub mod error;
pub mod ids;
pub mod outcome;

pub use error::{Error, Result};
