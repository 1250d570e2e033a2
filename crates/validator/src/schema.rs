//! Schema pass: structural shape and identifier formats.
//!
//! Runs first; if it fails, the SSRF and semantic passes are skipped because
//! they would be reasoning about malformed identifiers.

use drill_domain::config::RunConfig;
use drill_domain::ids;

use crate::report::ValidationReport;

pub fn check(config: &RunConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !ids::run_id_pattern().is_match(&config.run_id) {
        report.error_with_remediation(
            "INVALID_RUN_ID",
            format!("run_id {:?} does not match ^run_[0-9a-f]{{16,64}}$", config.run_id),
            Some("/run_id".into()),
            "run ids are `run_` followed by 16-64 lowercase hex characters",
        );
    }
    if !ids::execution_id_pattern().is_match(&config.execution_id) {
        report.error(
            "INVALID_EXECUTION_ID",
            format!(
                "execution_id {:?} does not match ^exe_[0-9a-f]{{8,64}}$",
                config.execution_id
            ),
            Some("/execution_id".into()),
        );
    }
    if let Some(scenario_id) = &config.scenario_id {
        if !ids::scenario_id_pattern().is_match(scenario_id) {
            report.error(
                "INVALID_SCENARIO_ID",
                format!(
                    "scenario_id {scenario_id:?} does not match ^scn_[a-z0-9][a-z0-9._-]{{2,80}}$"
                ),
                Some("/scenario_id".into()),
            );
        }
    }

    if config.target.url.is_empty() {
        report.error(
            "TARGET_URL_MISSING",
            "target.url must be set",
            Some("/target/url".into()),
        );
    }

    for (i, stage) in config.stages.iter().enumerate() {
        if !ids::stage_id_pattern().is_match(&stage.stage_id) {
            report.error(
                "INVALID_STAGE_ID",
                format!(
                    "stages[{i}].stage_id {:?} does not match ^stg_[0-9a-f]{{3,81}}$",
                    stage.stage_id
                ),
                Some(format!("/stages/{i}/stage_id")),
            );
        }
    }

    report
}
