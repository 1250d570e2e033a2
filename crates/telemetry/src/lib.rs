//! Telemetry pipeline: a tiered bounded queue feeding a JSON Lines emitter,
//! with periodic worker-health snapshots.
//!
//! Backpressure is tiered: lifecycle records (tier 0) are never shed,
//! operation records (tier 1) shed verbose ones to get in, verbose records
//! (tier 2) shed each other or drop.

pub mod collector;
pub mod emitter;
pub mod queue;
pub mod record;

pub use collector::{Collector, CollectorConfig, HealthProvider};
pub use emitter::JsonLinesEmitter;
pub use queue::BoundedQueue;
pub use record::{Record, TelemetryRecord, Tier};
