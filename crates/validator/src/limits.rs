//! Effective-limits composition: what a run may actually do once both its own
//! config and the system policy have had their say.

use drill_domain::config::{AllowlistEntry, HardCaps, RunConfig, SystemPolicy};

/// The composed operating envelope. Numeric caps take the per-field minimum
/// (zero meaning "unbounded" on either side), identification requirements OR,
/// allowlists intersect, forbidden patterns union.
#[derive(Debug, Clone)]
pub struct EffectiveLimits {
    pub hard_caps: HardCaps,
    pub identification_required: bool,
    run_allowlist: Vec<AllowlistEntry>,
    policy_allowlist: Vec<AllowlistEntry>,
    pub forbidden_patterns: Vec<String>,
}

fn min_capped_u32(run: u32, policy: u32) -> u32 {
    match (run, policy) {
        (0, p) => p,
        (r, 0) => r,
        (r, p) => r.min(p),
    }
}

fn min_capped_u64(run: u64, policy: u64) -> u64 {
    match (run, policy) {
        (0, p) => p,
        (r, 0) => r,
        (r, p) => r.min(p),
    }
}

fn min_capped_f64(run: f64, policy: f64) -> f64 {
    if run <= 0.0 {
        policy
    } else if policy <= 0.0 {
        run
    } else {
        run.min(policy)
    }
}

impl EffectiveLimits {
    pub fn compose(config: &RunConfig, policy: &SystemPolicy) -> Self {
        let run_caps = config.safety.hard_caps.clone().unwrap_or_default();
        let policy_caps = policy.hard_caps.clone().unwrap_or_default();

        let hard_caps = HardCaps {
            max_vus: min_capped_u32(run_caps.max_vus, policy_caps.max_vus),
            max_duration_ms: min_capped_u64(run_caps.max_duration_ms, policy_caps.max_duration_ms),
            max_in_flight_per_vu: min_capped_u32(
                run_caps.max_in_flight_per_vu,
                policy_caps.max_in_flight_per_vu,
            ),
            max_rps: min_capped_f64(run_caps.max_rps, policy_caps.max_rps),
        };

        let mut forbidden_patterns = config.safety.forbidden_patterns.clone();
        for pattern in &policy.forbidden_patterns {
            if !forbidden_patterns.contains(pattern) {
                forbidden_patterns.push(pattern.clone());
            }
        }

        Self {
            hard_caps,
            identification_required: config.safety.identification_required
                || policy.identification_required,
            run_allowlist: config.environment.allowlist.entries.clone(),
            policy_allowlist: policy.allowlist_entries.clone(),
            forbidden_patterns,
        }
    }

    /// A host is allowed only when both lists admit it (an empty policy list
    /// admits everything the run list admits).
    pub fn host_allowed(&self, host: &str) -> bool {
        let run_ok = self.run_allowlist.iter().any(|e| e.matches_host(host));
        let policy_ok = self.policy_allowlist.is_empty()
            || self.policy_allowlist.iter().any(|e| e.matches_host(host));
        run_ok && policy_ok
    }
}
