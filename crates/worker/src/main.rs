use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use drill_telemetry::{Collector, CollectorConfig, JsonLinesEmitter};
use drill_transport::StreamableHttpAdapter;
use drill_validator::Validator;
use drill_worker::cli::{self, Cli, Command};
use drill_worker::AssignmentExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config, policy } => {
            let policy = cli::load_policy(policy.as_ref())?;
            let raw: serde_json::Value = cli::load_json(&config)?;
            let (_, report) = Validator::new(policy).validate_value(&raw);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Run {
            config,
            policy,
            assignment,
            telemetry,
        } => {
            let policy = cli::load_policy(policy.as_ref())?;
            let raw: serde_json::Value = cli::load_json(&config)?;
            let (run_config, report) = Validator::new(policy.clone()).validate_value(&raw);
            if !report.ok() {
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
                std::process::exit(1);
            }
            let run_config = run_config.context("validated config failed to parse")?;
            let assignment = cli::load_assignment(&assignment)?;

            // Telemetry sink: a JSONL file or stdout.
            let emitter = match telemetry {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    JsonLinesEmitter::for_file(file, run_config.telemetry.sync_on_write)?
                }
                None => JsonLinesEmitter::new(Box::new(std::io::stdout())),
            };

            let executor = Arc::new(AssignmentExecutor::new(
                Arc::new(StreamableHttpAdapter::new()),
                assignment.worker_id.clone(),
            ));
            executor.set_rebind_guard(Arc::new(drill_validator::DnsRebindGuard::new(&policy)));
            let collector = Collector::start(
                CollectorConfig {
                    worker_id: assignment.worker_id.clone(),
                    queue_size: run_config.telemetry.queue_size,
                    batch_size: run_config.telemetry.batch_size,
                    flush_interval: std::time::Duration::from_millis(
                        run_config.telemetry.flush_interval_ms,
                    ),
                    health_snapshot_interval: std::time::Duration::from_millis(
                        run_config.telemetry.health_snapshot_interval_ms,
                    ),
                },
                emitter,
                executor.clone(),
            );

            let result = executor.execute(assignment, collector.queue()).await;
            collector.stop().await;

            match result {
                Ok(outcome) => {
                    let stability = executor.tracker().stability_metrics(false, false);
                    tracing::info!(
                        lease_id = %outcome.lease_id,
                        ops = outcome.ops_total,
                        session_errors = outcome.session_errors,
                        dropped_results = outcome.dropped_results,
                        stability_score = stability.stability_score,
                        "assignment complete"
                    );
                    if !outcome.drained_clean {
                        std::process::exit(2);
                    }
                    Ok(())
                }
                Err(err) => {
                    tracing::error!(error = %err, "assignment failed");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
