//! Run configuration and system policy.
//!
//! A run configuration is an opaque JSON blob handed to the validator before a
//! run is admitted; the system policy is a second blob loaded once at process
//! start. Both deserialize into the types here. Unknown fields are tolerated
//! (the control plane may be newer than the worker); missing fields take the
//! documented defaults.

use serde::{Deserialize, Serialize};

use crate::outcome::OperationType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run config (top level)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub session_policy: SessionPolicyConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_failure_policy: Option<WorkerFailurePolicy>,
}

/// What the scheduler does when a worker dies mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailurePolicy {
    FailFast,
    ReplaceIfPossible,
    BestEffort,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Target
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identification: Option<IdentificationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_policy: Option<RedirectPolicy>,
    /// Requested protocol version; the default tracks the streamable-HTTP
    /// protocol revision.
    #[serde(default = "d_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub version_policy: VersionPolicy,
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
}

/// How run traffic identifies itself to the target.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id_header: Option<RunIdHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<UserAgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunIdHeader {
    pub name: String,
    /// Template for the header value; `${run_id}` expands to the run id.
    pub value_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserAgentConfig {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectPolicy {
    pub mode: RedirectMode,
    #[serde(default)]
    pub max_redirects: u8,
    /// Hosts redirects may land on (`allowlist_only` mode).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectMode {
    Deny,
    SameOrigin,
    AllowlistOnly,
}

/// Protocol version acceptance policy applied after `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Server must return exactly the requested version.
    Strict,
    /// Any version not earlier than the requested minimum.
    #[default]
    Compatible,
    /// Accept anything.
    None,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The well-known stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Preflight,
    Baseline,
    Ramp,
    Soak,
    Spike,
    Custom,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Preflight => "preflight",
            Self::Baseline => "baseline",
            Self::Ramp => "ramp",
            Self::Soak => "soak",
            Self::Spike => "spike",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: StageName,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub target_vus: u32,
    #[serde(default)]
    pub target_rps: f64,
    #[serde(default)]
    pub stop_conditions: Vec<StopCondition>,
}

/// A metric predicate that aborts the run when sustained across `windows`
/// consecutive evaluation windows. Evaluated by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopCondition {
    pub metric: String,
    #[serde(default = "d_gte")]
    pub op: String,
    pub threshold: f64,
    #[serde(default = "d_1u32")]
    pub windows: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub operation_mix: Vec<OperationMixEntry>,
    #[serde(default = "d_1u32")]
    pub in_flight_per_vu: u32,
    #[serde(default)]
    pub think_time: ThinkTime,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub spawn_mode: SpawnMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<SwarmConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_journey: Option<UserJourneyConfig>,
}

/// One weighted entry in the operation mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMixEntry {
    pub op: OperationType,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,
}

/// Pause between operation iterations: `base + uniform(0, jitter)` ms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ThinkTime {
    #[serde(default)]
    pub base_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub templates: Vec<ToolTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTemplate {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub expects_streaming: bool,
}

/// How the engine brings VUs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Spawn exactly `target_vus` long-lived executors at start.
    #[default]
    Normal,
    /// Continuously spawn short-lived VUs on an interval.
    Swarm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "d_1000")]
    pub spawn_interval_ms: u64,
    #[serde(default = "d_30000")]
    pub vu_lifetime_ms: u64,
    #[serde(default = "d_100u32")]
    pub max_concurrent_vus: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            spawn_interval_ms: 1000,
            vu_lifetime_ms: 30_000,
            max_concurrent_vus: 100,
        }
    }
}

// ── user journey ────────────────────────────────────────────────────

/// Optional behaviors layered on top of the plain operation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJourneyConfig {
    /// Run `tools/list` once right after session establishment.
    #[serde(default)]
    pub startup_tools_list: bool,
    /// Re-run `tools/list` every this many milliseconds (0 = never).
    #[serde(default)]
    pub tools_list_interval_ms: u64,
    /// Re-run `tools/list` after this many consecutive failures (0 = never).
    #[serde(default = "d_3u32")]
    pub tools_list_after_errors: u32,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for UserJourneyConfig {
    fn default() -> Self {
        Self {
            startup_tools_list: false,
            tools_list_interval_ms: 0,
            tools_list_after_errors: 3,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Exponential backoff applied when session acquisition fails.
///
/// `delay_n = min(max_delay, initial_delay * multiplier^n)` with a uniform
/// `±jitter_fraction` noise term; the attempt counter resets on any success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "d_100")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_30000")]
    pub max_delay_ms: u64,
    #[serde(default = "d_2f64")]
    pub multiplier: f64,
    #[serde(default = "d_02f64")]
    pub jitter_fraction: f64,
    #[serde(default = "d_10u32")]
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_retries: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How VUs acquire sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One session per VU, kept across iterations.
    #[default]
    Reuse,
    /// A fresh session for every operation.
    PerRequest,
    /// A bounded shared pool.
    Pool,
    /// One session per VU, rotated on a time or operation-count boundary.
    Churn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicyConfig {
    #[serde(default)]
    pub mode: SessionMode,
    /// Session time-to-live in milliseconds (0 = never expires).
    #[serde(default)]
    pub ttl_ms: u64,
    /// Idle expiry in milliseconds (0 = never).
    #[serde(default)]
    pub max_idle_ms: u64,
    /// Pool capacity (pool mode only).
    #[serde(default = "d_10usize")]
    pub pool_max_size: usize,
    /// Rotate after this much wall time since creation (churn mode, 0 = off).
    #[serde(default)]
    pub churn_interval_ms: u64,
    /// Rotate after this many releases (churn mode, 0 = off).
    #[serde(default)]
    pub churn_interval_ops: u64,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Reuse,
            ttl_ms: 0,
            max_idle_ms: 0,
            pool_max_size: 10,
            churn_interval_ms: 0,
            churn_interval_ops: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Safety
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SafetyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_caps: Option<HardCaps>,
    #[serde(default)]
    pub identification_required: bool,
    /// Run-level forbidden tool patterns, unioned with the policy's.
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
}

/// Ceilings a run may never exceed, whatever the stages ask for.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HardCaps {
    #[serde(default)]
    pub max_vus: u32,
    #[serde(default)]
    pub max_duration_ms: u64,
    #[serde(default = "d_1u32")]
    pub max_in_flight_per_vu: u32,
    #[serde(default)]
    pub max_rps: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    /// References to secrets used by tool templates (e.g. `vault://...`).
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default = "d_deny_by_default")]
    pub mode: String,
    #[serde(default)]
    pub entries: Vec<AllowlistEntry>,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            mode: d_deny_by_default(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub kind: AllowlistKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistKind {
    Exact,
    Suffix,
}

impl AllowlistEntry {
    /// Boundary-safe host matching: an exact entry must equal the host; a
    /// suffix entry must equal the suffix or end with `"." + suffix`.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let value = self.value.to_ascii_lowercase();
        match self.kind {
            AllowlistKind::Exact => host == value,
            AllowlistKind::Suffix => {
                host == value || host.ends_with(&format!(".{value}"))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Telemetry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "d_10000usize")]
    pub queue_size: usize,
    #[serde(default = "d_64usize")]
    pub batch_size: usize,
    #[serde(default = "d_500")]
    pub flush_interval_ms: u64,
    #[serde(default = "d_5000")]
    pub health_snapshot_interval_ms: u64,
    #[serde(default)]
    pub sync_on_write: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 64,
            flush_interval_ms: 500,
            health_snapshot_interval_ms: 5000,
            sync_on_write: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operator-level policy loaded once at process start. Run configs are
/// admitted only within its bounds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemPolicy {
    /// CIDRs exempted from the SSRF block list. Membership of `127.0.0.1`
    /// here is the sole way to admit the hostname `localhost`.
    #[serde(default)]
    pub allow_private_networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_caps: Option<HardCaps>,
    #[serde(default)]
    pub identification_required: bool,
    /// Glob patterns a secret reference must match (trailing `*` wildcard).
    #[serde(default)]
    pub secret_ref_patterns: Vec<String>,
    /// Patterns forbidden in tool names; glob when metacharacters present,
    /// case-insensitive exact otherwise.
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
    /// Policy-level host allowlist, intersected with the run's.
    #[serde(default)]
    pub allowlist_entries: Vec<AllowlistEntry>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_gte() -> String {
    "gte".into()
}
fn d_1u32() -> u32 {
    1
}
fn d_3u32() -> u32 {
    3
}
fn d_10u32() -> u32 {
    10
}
fn d_100u32() -> u32 {
    100
}
fn d_100() -> u64 {
    100
}
fn d_500() -> u64 {
    500
}
fn d_1000() -> u64 {
    1000
}
fn d_5000() -> u64 {
    5000
}
fn d_30000() -> u64 {
    30_000
}
fn d_2f64() -> f64 {
    2.0
}
fn d_02f64() -> f64 {
    0.2
}
fn d_10usize() -> usize {
    10
}
fn d_64usize() -> usize {
    64
}
fn d_10000usize() -> usize {
    10_000
}
fn d_deny_by_default() -> String {
    "deny_by_default".into()
}
fn d_protocol_version() -> String {
    "2025-03-26".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_takes_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.session_policy.mode, SessionMode::Reuse);
        assert_eq!(config.workload.in_flight_per_vu, 1);
        assert_eq!(config.telemetry.queue_size, 10_000);
        assert_eq!(config.target.version_policy, VersionPolicy::Compatible);
        assert!(config.environment.allowlist.entries.is_empty());
        assert_eq!(config.environment.allowlist.mode, "deny_by_default");
    }

    #[test]
    fn reconnect_policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter_fraction, 0.2);
        assert_eq!(policy.max_retries, 10);
    }

    #[test]
    fn stage_name_snake_case() {
        let parsed: StageName = serde_json::from_str("\"preflight\"").unwrap();
        assert_eq!(parsed, StageName::Preflight);
        assert_eq!(serde_json::to_string(&StageName::Ramp).unwrap(), "\"ramp\"");
    }

    #[test]
    fn suffix_allowlist_is_boundary_safe() {
        let entry = AllowlistEntry {
            kind: AllowlistKind::Suffix,
            value: "staging.example.com".into(),
        };
        assert!(entry.matches_host("staging.example.com"));
        assert!(entry.matches_host("api.staging.example.com"));
        assert!(!entry.matches_host("staging.example.com.attacker.io"));
        assert!(!entry.matches_host("notstaging.example.com"));
    }

    #[test]
    fn exact_allowlist_ignores_case() {
        let entry = AllowlistEntry {
            kind: AllowlistKind::Exact,
            value: "API.Example.com".into(),
        };
        assert!(entry.matches_host("api.example.com"));
        assert!(!entry.matches_host("api2.example.com"));
    }

    #[test]
    fn mix_entry_parses_tool_call() {
        let raw = r#"{
            "op": "tools/call",
            "weight": 3.5,
            "tool_name": "echo",
            "arguments": { "text": "hi" }
        }"#;
        let entry: OperationMixEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.op, OperationType::ToolsCall);
        assert_eq!(entry.weight, 3.5);
        assert_eq!(entry.tool_name.as_deref(), Some("echo"));
    }

    #[test]
    fn worker_failure_policy_wire_names() {
        let parsed: WorkerFailurePolicy =
            serde_json::from_str("\"replace_if_possible\"").unwrap();
        assert_eq!(parsed, WorkerFailurePolicy::ReplaceIfPossible);
    }

    #[test]
    fn system_policy_defaults_are_closed() {
        let policy: SystemPolicy = serde_json::from_str("{}").unwrap();
        assert!(policy.allow_private_networks.is_empty());
        assert!(!policy.identification_required);
        assert!(policy.hard_caps.is_none());
    }
}
