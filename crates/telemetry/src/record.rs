//! Telemetry records and their queue-admission tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drill_domain::outcome::OperationResult;

/// Wire format version tag carried on every record.
pub const FORMAT_VERSION: &str = "op-log/v1";

/// Queue-admission priority. Governs shedding only; never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Session/VU lifecycle and worker health: never shed.
    Lifecycle = 0,
    /// Per-operation outcomes.
    Operation = 1,
    /// High-volume detail (per-attempt traces, stream chunks).
    Verbose = 2,
}

/// What actually goes on the wire: one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    OpLog(OpLogRecord),
    WorkerHealth(WorkerHealthRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogRecord {
    pub format: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub result: OperationResult,
}

impl OpLogRecord {
    pub fn new(result: OperationResult) -> Self {
        Self {
            format: FORMAT_VERSION.into(),
            ts: Utc::now(),
            result,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthRecord {
    pub format: String,
    pub ts: DateTime<Utc>,
    pub worker_id: String,
    pub active_vus: u32,
    pub active_sessions: u32,
    pub in_flight_ops: u32,
    pub rss_bytes: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Drops since the previous snapshot.
    pub dropped_tier1: u64,
    pub dropped_tier2: u64,
}

/// A record plus its admission tier, as handed to the queue. Ownership
/// transfers to the queue on enqueue.
#[derive(Debug, Clone)]
pub struct Record {
    pub tier: Tier,
    pub payload: TelemetryRecord,
}

impl Record {
    pub fn op_log(result: OperationResult) -> Self {
        Self {
            tier: Tier::Operation,
            payload: TelemetryRecord::OpLog(OpLogRecord::new(result)),
        }
    }

    pub fn verbose_op_log(result: OperationResult) -> Self {
        Self {
            tier: Tier::Verbose,
            payload: TelemetryRecord::OpLog(OpLogRecord::new(result)),
        }
    }

    pub fn worker_health(health: WorkerHealthRecord) -> Self {
        Self {
            tier: Tier::Lifecycle,
            payload: TelemetryRecord::WorkerHealth(health),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use drill_domain::outcome::{Correlation, OperationOutcome, OperationType};

    pub(crate) fn sample_result() -> OperationResult {
        OperationResult {
            correlation: Correlation {
                run_id: "run_0123456789abcdef".into(),
                execution_id: "exe_00000001".into(),
                stage: "baseline".into(),
                stage_id: "stg_001".into(),
                worker_id: "wkr_00000001".into(),
                vu_id: "vu_1".into(),
                session_id: "s1".into(),
                op_id: None,
                attempt: None,
            },
            outcome: OperationOutcome::ok(OperationType::Ping, 4),
        }
    }

    #[test]
    fn op_log_serializes_with_type_tag_and_format() {
        let record = Record::op_log(sample_result());
        let json = serde_json::to_value(&record.payload).unwrap();
        assert_eq!(json["type"], "op_log");
        assert_eq!(json["format"], "op-log/v1");
        assert_eq!(json["run_id"], "run_0123456789abcdef");
        assert_eq!(json["operation"], "ping");
        // The tier is queue metadata, not wire data.
        assert!(json.get("tier").is_none());
    }

    #[test]
    fn worker_health_serializes_with_type_tag() {
        let record = Record::worker_health(WorkerHealthRecord {
            format: FORMAT_VERSION.into(),
            ts: Utc::now(),
            worker_id: "wkr_00000001".into(),
            active_vus: 5,
            active_sessions: 3,
            in_flight_ops: 2,
            rss_bytes: 1024,
            queue_depth: 10,
            queue_capacity: 10_000,
            dropped_tier1: 0,
            dropped_tier2: 7,
        });
        assert_eq!(record.tier, Tier::Lifecycle);
        let json = serde_json::to_value(&record.payload).unwrap();
        assert_eq!(json["type"], "worker_health");
        assert_eq!(json["dropped_tier2"], 7);
    }

    #[test]
    fn roundtrip_as_maps() {
        let record = Record::op_log(sample_result());
        let serialized = serde_json::to_string(&record.payload).unwrap();
        let reparsed: TelemetryRecord = serde_json::from_str(&serialized).unwrap();
        let twice = serde_json::to_string(&reparsed).unwrap();
        let a: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        let b: serde_json::Value = serde_json::from_str(&twice).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tier_ordering() {
        assert!(Tier::Lifecycle < Tier::Operation);
        assert!(Tier::Operation < Tier::Verbose);
    }
}
