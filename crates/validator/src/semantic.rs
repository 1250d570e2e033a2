//! Semantic pass: the config must describe a run that is safe and executable,
//! not just well-shaped.

use drill_domain::config::{RunConfig, StageName, SystemPolicy};
use drill_domain::outcome::OperationType;

use crate::glob;
use crate::report::ValidationReport;

pub fn check(config: &RunConfig, policy: &SystemPolicy) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_stages(&mut report, config);
    check_mix(&mut report, config, policy);
    check_caps(&mut report, config, policy);
    check_allowlist(&mut report, config, policy);
    check_secrets(&mut report, config, policy);
    check_identification(&mut report, config, policy);
    check_stop_conditions(&mut report, config);
    check_session_policy(&mut report, config);

    report
}

// ── stages ──────────────────────────────────────────────────────────

fn check_stages(report: &mut ValidationReport, config: &RunConfig) {
    if config.stages.is_empty() {
        report.error("STAGES_EMPTY", "stages must not be empty", Some("/stages".into()));
        return;
    }

    let enabled: Vec<_> = config.stages.iter().filter(|s| s.enabled).collect();
    if enabled.is_empty() {
        report.error(
            "STAGES_NONE_ENABLED",
            "at least one stage must be enabled",
            Some("/stages".into()),
        );
        return;
    }

    for required in [StageName::Preflight, StageName::Baseline, StageName::Ramp] {
        if !enabled.iter().any(|s| s.name == required) {
            report.error(
                "STAGE_REQUIRED_MISSING",
                format!("stage {required} must be present and enabled"),
                Some("/stages".into()),
            );
        }
    }

    if enabled[0].name != StageName::Preflight {
        report.error(
            "PREFLIGHT_NOT_FIRST",
            format!("the first enabled stage must be preflight, found {}", enabled[0].name),
            Some("/stages".into()),
        );
    }

    for (i, stage) in config.stages.iter().enumerate() {
        if !stage.enabled {
            continue;
        }
        if stage.duration_ms < 1000 {
            report.error(
                "STAGE_DURATION_TOO_SHORT",
                format!(
                    "stages[{i}] ({}) duration_ms {} is below the 1000 ms minimum",
                    stage.name, stage.duration_ms
                ),
                Some(format!("/stages/{i}/duration_ms")),
            );
        }
        if !stage.target_rps.is_finite() || stage.target_rps < 0.0 {
            report.error(
                "STAGE_RATE_INVALID",
                format!("stages[{i}] ({}) target_rps must be a finite number >= 0", stage.name),
                Some(format!("/stages/{i}/target_rps")),
            );
        }
    }
}

// ── operation mix ───────────────────────────────────────────────────

fn check_mix(report: &mut ValidationReport, config: &RunConfig, policy: &SystemPolicy) {
    let mix = &config.workload.operation_mix;
    if mix.is_empty() {
        report.error(
            "MIX_EMPTY",
            "workload.operation_mix must not be empty",
            Some("/workload/operation_mix".into()),
        );
        return;
    }

    let mut total = 0.0;
    for (i, entry) in mix.iter().enumerate() {
        if !entry.weight.is_finite() || entry.weight <= 0.0 {
            report.error(
                "MIX_WEIGHT_INVALID",
                format!("operation_mix[{i}] weight must be > 0"),
                Some(format!("/workload/operation_mix/{i}/weight")),
            );
        } else {
            total += entry.weight;
        }
        if entry.op == OperationType::Initialize {
            report.error(
                "MIX_OP_INVALID",
                format!("operation_mix[{i}]: initialize is not a mix operation"),
                Some(format!("/workload/operation_mix/{i}/op")),
            );
        }
    }
    if total <= 0.0 {
        report.error(
            "MIX_WEIGHT_ZERO",
            "operation_mix total weight must be > 0",
            Some("/workload/operation_mix".into()),
        );
    }

    let has_tool_calls = mix.iter().any(|e| e.op == OperationType::ToolsCall);
    if has_tool_calls && config.workload.tools.templates.is_empty() {
        report.error_with_remediation(
            "TOOL_TEMPLATES_MISSING",
            "operation_mix contains tools/call but workload.tools.templates is empty",
            Some("/workload/tools/templates".into()),
            "define at least one tool template to draw call arguments from",
        );
    }

    // Forbidden patterns apply to everything a run could invoke by name; the
    // run's own patterns and the policy's union.
    let forbidden: Vec<&String> = config
        .safety
        .forbidden_patterns
        .iter()
        .chain(policy.forbidden_patterns.iter())
        .collect();
    if !forbidden.is_empty() {
        let mut names: Vec<(String, String)> = Vec::new();
        for (i, entry) in mix.iter().enumerate() {
            if let Some(name) = &entry.tool_name {
                names.push((name.clone(), format!("/workload/operation_mix/{i}/tool_name")));
            }
        }
        for (i, template) in config.workload.tools.templates.iter().enumerate() {
            names.push((
                template.name.clone(),
                format!("/workload/tools/templates/{i}/name"),
            ));
        }
        for (name, pointer) in names {
            for pattern in &forbidden {
                if glob::forbidden_matches(pattern, &name) {
                    report.error(
                        "FORBIDDEN_PATTERN_MATCH",
                        format!("tool {name:?} matches forbidden pattern {pattern:?}"),
                        Some(pointer.clone()),
                    );
                    break;
                }
            }
        }
    }
}

// ── caps ────────────────────────────────────────────────────────────

fn check_caps(report: &mut ValidationReport, config: &RunConfig, policy: &SystemPolicy) {
    let Some(caps) = &config.safety.hard_caps else {
        report.error(
            "HARD_CAPS_MISSING",
            "safety.hard_caps must be present",
            Some("/safety/hard_caps".into()),
        );
        return;
    };

    if caps.max_vus == 0 {
        report.error(
            "HARD_CAPS_INVALID",
            "safety.hard_caps.max_vus must be positive",
            Some("/safety/hard_caps/max_vus".into()),
        );
    }
    if caps.max_duration_ms == 0 {
        report.error(
            "HARD_CAPS_INVALID",
            "safety.hard_caps.max_duration_ms must be positive",
            Some("/safety/hard_caps/max_duration_ms".into()),
        );
    }

    if config.workload.in_flight_per_vu > caps.max_in_flight_per_vu {
        report.error(
            "IN_FLIGHT_EXCEEDS_CAP",
            format!(
                "workload.in_flight_per_vu {} exceeds hard cap {}",
                config.workload.in_flight_per_vu, caps.max_in_flight_per_vu
            ),
            Some("/workload/in_flight_per_vu".into()),
        );
    }

    // Run caps must fit inside system-policy caps. A policy cap of zero means
    // the policy does not bound that axis.
    if let Some(policy_caps) = &policy.hard_caps {
        if policy_caps.max_vus > 0 && caps.max_vus > policy_caps.max_vus {
            report.error(
                "CAPS_EXCEED_POLICY",
                format!(
                    "hard_caps.max_vus {} exceeds the system policy cap {}",
                    caps.max_vus, policy_caps.max_vus
                ),
                Some("/safety/hard_caps/max_vus".into()),
            );
        }
        if policy_caps.max_duration_ms > 0 && caps.max_duration_ms > policy_caps.max_duration_ms {
            report.error(
                "CAPS_EXCEED_POLICY",
                format!(
                    "hard_caps.max_duration_ms {} exceeds the system policy cap {}",
                    caps.max_duration_ms, policy_caps.max_duration_ms
                ),
                Some("/safety/hard_caps/max_duration_ms".into()),
            );
        }
        if policy_caps.max_in_flight_per_vu > 0
            && caps.max_in_flight_per_vu > policy_caps.max_in_flight_per_vu
        {
            report.error(
                "CAPS_EXCEED_POLICY",
                format!(
                    "hard_caps.max_in_flight_per_vu {} exceeds the system policy cap {}",
                    caps.max_in_flight_per_vu, policy_caps.max_in_flight_per_vu
                ),
                Some("/safety/hard_caps/max_in_flight_per_vu".into()),
            );
        }
        if policy_caps.max_rps > 0.0 && caps.max_rps > policy_caps.max_rps {
            report.error(
                "CAPS_EXCEED_POLICY",
                format!(
                    "hard_caps.max_rps {} exceeds the system policy cap {}",
                    caps.max_rps, policy_caps.max_rps
                ),
                Some("/safety/hard_caps/max_rps".into()),
            );
        }
    }
}

// ── allowlist ───────────────────────────────────────────────────────

fn check_allowlist(report: &mut ValidationReport, config: &RunConfig, policy: &SystemPolicy) {
    let allowlist = &config.environment.allowlist;
    if allowlist.mode != "deny_by_default" {
        report.error(
            "ALLOWLIST_MODE_INVALID",
            format!(
                "environment.allowlist.mode must be \"deny_by_default\", found {:?}",
                allowlist.mode
            ),
            Some("/environment/allowlist/mode".into()),
        );
    }

    // The SSRF pass owns URL parse errors; skip host matching when the URL
    // is unreadable.
    let Some(host) = url::Url::parse(&config.target.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
    else {
        return;
    };

    if !allowlist.entries.iter().any(|e| e.matches_host(&host)) {
        report.error_with_remediation(
            "HOST_NOT_ALLOWLISTED",
            format!("target host {host:?} matches no environment.allowlist entry"),
            Some("/environment/allowlist/entries".into()),
            "add an exact or suffix entry covering the target host",
        );
    }

    // Allowlists intersect: a policy-level list further narrows the run's.
    if !policy.allowlist_entries.is_empty()
        && !policy.allowlist_entries.iter().any(|e| e.matches_host(&host))
    {
        report.error(
            "HOST_NOT_ALLOWLISTED",
            format!("target host {host:?} matches no system-policy allowlist entry"),
            Some("/environment/allowlist/entries".into()),
        );
    }
}

// ── secrets ─────────────────────────────────────────────────────────

fn check_secrets(report: &mut ValidationReport, config: &RunConfig, policy: &SystemPolicy) {
    for (i, reference) in config.environment.secrets.iter().enumerate() {
        let matched = policy
            .secret_ref_patterns
            .iter()
            .any(|p| glob::secret_ref_matches(p, reference));
        if !matched {
            report.error(
                "SECRET_REF_UNMATCHED",
                format!("secret reference {reference:?} matches no configured pattern"),
                Some(format!("/environment/secrets/{i}")),
            );
        }
    }
}

// ── identification ──────────────────────────────────────────────────

fn check_identification(report: &mut ValidationReport, config: &RunConfig, policy: &SystemPolicy) {
    let required = config.safety.identification_required || policy.identification_required;
    if !required {
        return;
    }

    let ident = config.target.identification.as_ref();
    let header = ident.and_then(|i| i.run_id_header.as_ref());
    match header {
        Some(h) if !h.name.is_empty() && !h.value_template.is_empty() => {}
        _ => {
            report.error(
                "IDENTIFICATION_MISSING",
                "identification is required: target.identification.run_id_header.{name, value_template} must be set",
                Some("/target/identification/run_id_header".into()),
            );
        }
    }

    let user_agent = ident.and_then(|i| i.user_agent.as_ref());
    match user_agent {
        Some(ua) if ua.value.contains("${run_id}") => {}
        _ => {
            report.error(
                "USER_AGENT_MISSING_RUN_ID",
                "identification is required: target.identification.user_agent.value must contain ${run_id}",
                Some("/target/identification/user_agent/value".into()),
            );
        }
    }
}

// ── stop conditions ─────────────────────────────────────────────────

fn check_stop_conditions(report: &mut ValidationReport, config: &RunConfig) {
    for (i, stage) in config.stages.iter().enumerate() {
        if !stage.enabled {
            continue;
        }
        if matches!(stage.name, StageName::Baseline | StageName::Ramp)
            && stage.stop_conditions.is_empty()
        {
            report.error(
                "STOP_CONDITIONS_MISSING",
                format!("stage {} must define at least one stop condition", stage.name),
                Some(format!("/stages/{i}/stop_conditions")),
            );
        }
    }

    let expects_streaming = config
        .workload
        .tools
        .templates
        .iter()
        .any(|t| t.expects_streaming);
    if expects_streaming {
        let guarded = config.stages.iter().any(|s| {
            s.enabled
                && s.stop_conditions
                    .iter()
                    .any(|c| c.metric.contains("stream_stall"))
        });
        if !guarded {
            report.error_with_remediation(
                "STREAM_STALL_GUARD_MISSING",
                "a tool template expects streaming but no enabled stage has a stream_stall stop condition",
                Some("/stages".into()),
                "add a stop condition on a stream_stall metric to an enabled stage",
            );
        }
    }
}

// ── session policy ──────────────────────────────────────────────────

fn check_session_policy(report: &mut ValidationReport, config: &RunConfig) {
    use drill_domain::config::SessionMode;

    let policy = &config.session_policy;
    if policy.churn_interval_ops > 0 && policy.mode != SessionMode::Churn {
        report.error(
            "CHURN_INTERVAL_INVALID",
            format!(
                "churn_interval_ops is set but session mode is {:?}",
                policy.mode
            ),
            Some("/session_policy/churn_interval_ops".into()),
        );
    }
    if policy.mode == SessionMode::Pool && policy.pool_max_size == 0 {
        report.error(
            "POOL_SIZE_INVALID",
            "pool mode requires pool_max_size >= 1",
            Some("/session_policy/pool_max_size".into()),
        );
    }
}
