//! The control-plane → worker assignment contract.

use serde::{Deserialize, Serialize};

use crate::config::{
    SessionPolicyConfig, StageName, TargetConfig, TelemetryConfig, WorkloadConfig,
};

/// Load the engine should sustain for a stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LoadTarget {
    pub target_vus: u32,
    pub target_rps: f64,
}

/// Half-open VU index range `[start, end)` assigned to one worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VuRange {
    pub start: u32,
    pub end: u32,
}

impl VuRange {
    pub fn count(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }
}

/// One unit of work handed to a worker: run a VU range against a target for a
/// stage duration. The `lease_id` is the idempotency key for execute/stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub run_id: String,
    pub execution_id: String,
    pub stage: StageName,
    pub stage_id: String,
    pub worker_id: String,
    pub lease_id: String,
    pub target: TargetConfig,
    pub session_policy: SessionPolicyConfig,
    pub workload: WorkloadConfig,
    pub load: LoadTarget,
    pub vu_range: VuRange,
    pub duration_ms: u64,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vu_range_count() {
        let range = VuRange { start: 10, end: 25 };
        assert_eq!(range.count(), 15);
        let inverted = VuRange { start: 5, end: 5 };
        assert_eq!(inverted.count(), 0);
    }

    #[test]
    fn assignment_roundtrip() {
        let raw = r#"{
            "run_id": "run_0123456789abcdef",
            "execution_id": "exe_00000001",
            "stage": "baseline",
            "stage_id": "stg_001",
            "worker_id": "wkr_00000001",
            "lease_id": "lse_00000001",
            "target": { "url": "https://mcp.example.com/rpc" },
            "session_policy": { "mode": "pool", "pool_max_size": 4 },
            "workload": {},
            "load": { "target_vus": 8, "target_rps": 50.0 },
            "vu_range": { "start": 0, "end": 8 },
            "duration_ms": 60000
        }"#;
        let assignment: WorkerAssignment = serde_json::from_str(raw).unwrap();
        assert_eq!(assignment.vu_range.count(), 8);
        assert_eq!(assignment.session_policy.pool_max_size, 4);
        let back = serde_json::to_string(&assignment).unwrap();
        let reparsed: WorkerAssignment = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed.run_id, assignment.run_id);
        assert_eq!(reparsed.duration_ms, 60_000);
    }
}
