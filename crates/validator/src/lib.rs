//! Run admission: a configuration is accepted or rejected before any load is
//! generated.
//!
//! Three passes run in order — schema, SSRF, semantic — each producing a
//! report; the reports merge into one verdict. If the schema pass fails the
//! rest is skipped (later passes would be reading garbage); otherwise all
//! passes run and every error is surfaced together.

pub mod glob;
pub mod limits;
pub mod rebind;
pub mod report;
pub mod schema;
pub mod semantic;
pub mod ssrf;

use drill_domain::config::{RunConfig, SystemPolicy};

pub use limits::EffectiveLimits;
pub use rebind::DnsRebindGuard;
pub use report::{ValidationIssue, ValidationReport};

/// Validates run configurations against one system policy.
pub struct Validator {
    policy: SystemPolicy,
}

impl Validator {
    pub fn new(policy: SystemPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SystemPolicy {
        &self.policy
    }

    /// Validate a typed run config. Deterministic: the same config always
    /// produces an identical report.
    pub fn validate(&self, config: &RunConfig) -> ValidationReport {
        let mut report = schema::check(config);
        if !report.ok() {
            return report;
        }
        report.merge(ssrf::check(config, &self.policy));
        report.merge(semantic::check(config, &self.policy));

        if report.ok() {
            tracing::debug!(run_id = %config.run_id, warnings = report.warnings.len(), "run config admitted");
        } else {
            tracing::info!(
                run_id = %config.run_id,
                errors = report.errors.len(),
                "run config rejected"
            );
        }
        report
    }

    /// Validate an opaque JSON blob: structural parse failures become schema
    /// errors. Returns the parsed config when the shape was readable at all.
    pub fn validate_value(
        &self,
        raw: &serde_json::Value,
    ) -> (Option<RunConfig>, ValidationReport) {
        match serde_json::from_value::<RunConfig>(raw.clone()) {
            Ok(config) => {
                let report = self.validate(&config);
                (Some(config), report)
            }
            Err(err) => {
                let mut report = ValidationReport::default();
                report.error(
                    "SCHEMA_PARSE",
                    format!("config does not match the expected shape: {err}"),
                    Some("".into()),
                );
                (None, report)
            }
        }
    }
}
