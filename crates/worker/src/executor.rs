//! The assignment executor.
//!
//! One assignment = one session manager + one VU engine + one result
//! forwarder, run for the stage duration, then drained top-down: engine
//! cancel → session manager close, each bounded by the 10-second drain
//! deadline. The `lease_id` is the idempotency key; a lease can be executing
//! at most once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use drill_domain::assignment::WorkerAssignment;
use drill_domain::error::{Error, Result};
use drill_domain::ids;
use drill_domain::outcome::OperationResult;
use drill_engine::engine::{EngineConfig, VuEngine};
use drill_session::SessionManager;
use drill_telemetry::{BoundedQueue, HealthProvider, Record};
use drill_tracker::{ConnectionEventType, ConnectionTracker};
use drill_transport::{TransportAdapter, TransportConfig};
use drill_validator::DnsRebindGuard;

/// Stop-drain bound applied to the engine and the session manager.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// What one finished assignment reports back to the control plane.
#[derive(Debug, Clone)]
pub struct AssignmentOutcome {
    pub lease_id: String,
    pub ops_total: u64,
    pub dropped_results: u64,
    pub session_errors: u64,
    /// False when a drain deadline was exceeded.
    pub drained_clean: bool,
}

struct ActiveAssignment {
    run_id: String,
    cancel: CancellationToken,
    engine: Arc<VuEngine>,
    session_manager: Arc<SessionManager>,
}

pub struct AssignmentExecutor {
    worker_id: String,
    adapter: Arc<dyn TransportAdapter>,
    tracker: Arc<ConnectionTracker>,
    active: Mutex<HashMap<String, ActiveAssignment>>,
    rebind_guard: Mutex<Option<Arc<DnsRebindGuard>>>,
}

impl AssignmentExecutor {
    pub fn new(adapter: Arc<dyn TransportAdapter>, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            adapter,
            tracker: Arc::new(ConnectionTracker::default()),
            active: Mutex::new(HashMap::new()),
            rebind_guard: Mutex::new(None),
        }
    }

    /// Install the runtime DNS-rebinding guard; each assignment then
    /// validates the target's fresh resolution before generating load.
    pub fn set_rebind_guard(&self, guard: Arc<DnsRebindGuard>) {
        *self.rebind_guard.lock() = Some(guard);
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        self.tracker.clone()
    }

    /// Resolve the target hostname and run the resolution through the guard.
    /// Hosts that do not resolve are left to fail at connect time.
    async fn check_target_resolution(&self, target_url: &str) -> Result<()> {
        let Some(guard) = self.rebind_guard.lock().clone() else {
            return Ok(());
        };
        let Ok(url) = url::Url::parse(target_url) else {
            return Ok(()); // the validator already rejected unparseable URLs
        };
        let Some(url::Host::Domain(host)) = url.host() else {
            return Ok(()); // IP literals were vetted by the SSRF pass
        };
        let host = host.to_owned();
        let port = url.port_or_known_default().unwrap_or(443);

        let result = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => {
                let ips: Vec<std::net::IpAddr> = addrs.map(|a| a.ip()).collect();
                guard
                    .validate_resolved_ips(&host, &ips)
                    .map_err(|err| Error::Config(err.to_string()))
            }
            Err(err) => {
                tracing::debug!(host = %host, error = %err, "target did not pre-resolve");
                Ok(())
            }
        };
        result
    }

    /// Admission checks that do not require building anything.
    fn admit(&self, assignment: &WorkerAssignment) -> Result<()> {
        if assignment.vu_range.count() == 0 {
            return Err(Error::Config(format!(
                "vu_range [{}, {}) is empty",
                assignment.vu_range.start, assignment.vu_range.end
            )));
        }
        for (name, value, pattern) in [
            ("run_id", &assignment.run_id, ids::run_id_pattern()),
            (
                "execution_id",
                &assignment.execution_id,
                ids::execution_id_pattern(),
            ),
            ("stage_id", &assignment.stage_id, ids::stage_id_pattern()),
            ("worker_id", &assignment.worker_id, ids::worker_id_pattern()),
            ("lease_id", &assignment.lease_id, ids::lease_id_pattern()),
        ] {
            if !pattern.is_match(value) {
                return Err(Error::Config(format!("malformed {name}: {value:?}")));
            }
        }
        Ok(())
    }

    /// Run one assignment to completion (duration elapsed or stop signal).
    ///
    /// Results are forwarded into `telemetry` as op-log records and folded
    /// into the stability tracker as they arrive.
    pub async fn execute(
        &self,
        assignment: WorkerAssignment,
        telemetry: Arc<BoundedQueue>,
    ) -> Result<AssignmentOutcome> {
        self.admit(&assignment)?;
        self.check_target_resolution(&assignment.target.url).await?;

        let transport_config = TransportConfig::from_target(&assignment.target, &assignment.run_id);
        let session_manager = Arc::new(SessionManager::new(
            self.adapter.clone(),
            transport_config,
            &assignment.session_policy,
        ));
        session_manager.start();

        let engine = Arc::new(VuEngine::new(
            engine_config(&assignment, &self.worker_id),
            session_manager.clone(),
        )?);
        let mut results = engine
            .take_results()
            .ok_or_else(|| Error::Other("results channel already taken".into()))?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if active.contains_key(&assignment.lease_id) {
                return Err(Error::Config(format!(
                    "lease {} is already executing",
                    assignment.lease_id
                )));
            }
            active.insert(
                assignment.lease_id.clone(),
                ActiveAssignment {
                    run_id: assignment.run_id.clone(),
                    cancel: cancel.clone(),
                    engine: engine.clone(),
                    session_manager: session_manager.clone(),
                },
            );
        }

        tracing::info!(
            lease_id = %assignment.lease_id,
            run_id = %assignment.run_id,
            stage = %assignment.stage,
            vus = assignment.vu_range.count(),
            duration_ms = assignment.duration_ms,
            "assignment starting"
        );

        // Result forwarder: telemetry + stability counters.
        let forwarder = {
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                let mut seen_sessions: HashSet<String> = HashSet::new();
                while let Some(result) = results.recv().await {
                    track_result(&tracker, &mut seen_sessions, &result);
                    telemetry.enqueue(Record::op_log(result));
                }
                seen_sessions
            })
        };

        engine.start();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(assignment.duration_ms)) => {}
            _ = cancel.cancelled() => {
                tracing::info!(lease_id = %assignment.lease_id, "assignment stop requested");
            }
        }

        // Hierarchical teardown, each level bounded by the drain deadline.
        let mut drained_clean = true;
        if let Err(err) = engine.stop(DRAIN_DEADLINE).await {
            tracing::warn!(lease_id = %assignment.lease_id, error = %err, "engine drain exceeded deadline");
            drained_clean = false;
        }
        session_manager.close().await;

        // The channel is closed once the executors exit; the forwarder
        // finishes draining it.
        if let Ok(seen) = forwarder.await {
            for session_id in &seen {
                self.tracker
                    .record_event(session_id, ConnectionEventType::Terminated, None);
            }
        }

        self.active.lock().remove(&assignment.lease_id);

        let metrics = engine.metrics();
        tracing::info!(
            lease_id = %assignment.lease_id,
            ops = metrics.ops_total,
            session_errors = metrics.session_errors,
            dropped_results = metrics.dropped_results,
            "assignment finished"
        );
        Ok(AssignmentOutcome {
            lease_id: assignment.lease_id,
            ops_total: metrics.ops_total,
            dropped_results: metrics.dropped_results,
            session_errors: metrics.session_errors,
            drained_clean,
        })
    }

    /// Cancel every active assignment for a run. With `immediate` the drain
    /// deadline still applies; the flag is forwarded for symmetry with the
    /// control-plane contract.
    pub fn stop_run(&self, run_id: &str, immediate: bool) -> usize {
        let active = self.active.lock();
        let mut stopped = 0;
        for (lease_id, assignment) in active.iter() {
            if assignment.run_id == run_id {
                tracing::info!(lease_id = %lease_id, run_id = %run_id, immediate, "stopping assignment");
                assignment.cancel.cancel();
                stopped += 1;
            }
        }
        stopped
    }

    pub fn active_leases(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }
}

/// Worker health gauges: sums over every active assignment.
impl HealthProvider for AssignmentExecutor {
    fn active_vus(&self) -> u32 {
        self.active
            .lock()
            .values()
            .map(|a| a.engine.metrics().active_vus)
            .sum()
    }

    fn active_sessions(&self) -> u32 {
        self.active
            .lock()
            .values()
            .map(|a| {
                let m = a.session_manager.metrics();
                (m.active + m.idle) as u32
            })
            .sum()
    }

    fn in_flight_ops(&self) -> u32 {
        self.active
            .lock()
            .values()
            .map(|a| a.engine.metrics().in_flight_ops)
            .sum()
    }
}

fn engine_config(assignment: &WorkerAssignment, worker_id: &str) -> EngineConfig {
    EngineConfig {
        run_id: assignment.run_id.clone(),
        execution_id: assignment.execution_id.clone(),
        stage: assignment.stage.to_string(),
        stage_id: assignment.stage_id.clone(),
        worker_id: worker_id.to_owned(),
        assignment_id: assignment.lease_id.clone(),
        load: assignment.load,
        operation_mix: assignment.workload.operation_mix.clone(),
        tool_templates: assignment.workload.tools.templates.clone(),
        in_flight_per_vu: assignment.workload.in_flight_per_vu,
        think_time: assignment.workload.think_time,
        spawn_mode: assignment.workload.spawn_mode,
        swarm: assignment.workload.swarm.clone(),
        user_journey: assignment.workload.user_journey.clone(),
        vu_index_base: assignment.vu_range.start,
        results_capacity: 0,
    }
}

/// Fold one result into the stability tracker.
///
/// Convention: `Active` is recorded per attempted request (request count),
/// `record_success` only on success. The first sighting of a session id
/// records `Created`; transport failures record `Dropped`; session-acquire
/// failures record `Reconnect`.
fn track_result(
    tracker: &ConnectionTracker,
    seen_sessions: &mut HashSet<String>,
    result: &OperationResult,
) {
    let session_id = result.correlation.session_id.as_str();

    match result.outcome.error.as_ref().map(|e| e.kind.as_str()) {
        None => {
            note_session(tracker, seen_sessions, session_id);
            tracker.record_event(session_id, ConnectionEventType::Active, None);
            tracker.record_success(session_id, result.outcome.latency_ms);
        }
        Some("session") => {
            // No session came out of the attempt; count the reconnect
            // against the VU's correlation key instead.
            tracker.record_event(
                &result.correlation.vu_id,
                ConnectionEventType::Reconnect,
                result.outcome.error.as_ref().map(|e| e.message.clone()),
            );
        }
        Some("transport") => {
            note_session(tracker, seen_sessions, session_id);
            tracker.record_event(session_id, ConnectionEventType::Active, None);
            tracker.record_event(
                session_id,
                ConnectionEventType::Dropped,
                result.outcome.error.as_ref().map(|e| e.message.clone()),
            );
        }
        Some(_) => {
            // Protocol, HTTP, and tool-level failures: the connection lives.
            note_session(tracker, seen_sessions, session_id);
            tracker.record_event(session_id, ConnectionEventType::Active, None);
            tracker.record_protocol_error(session_id);
        }
    }
}

fn note_session(tracker: &ConnectionTracker, seen: &mut HashSet<String>, session_id: &str) {
    if !session_id.is_empty() && seen.insert(session_id.to_owned()) {
        tracker.record_event(session_id, ConnectionEventType::Created, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_domain::assignment::{LoadTarget, VuRange};
    use drill_domain::config::*;
    use drill_domain::outcome::OperationType;
    use drill_transport::testing::MockAdapter;

    fn assignment(lease: &str, duration_ms: u64) -> WorkerAssignment {
        WorkerAssignment {
            run_id: "run_0123456789abcdef".into(),
            execution_id: "exe_00000001".into(),
            stage: StageName::Baseline,
            stage_id: "stg_001".into(),
            worker_id: "wkr_00000001".into(),
            lease_id: lease.into(),
            target: TargetConfig {
                url: "http://target.test/rpc".into(),
                ..TargetConfig::default()
            },
            session_policy: SessionPolicyConfig::default(),
            workload: WorkloadConfig {
                operation_mix: vec![OperationMixEntry {
                    op: OperationType::Ping,
                    weight: 1.0,
                    tool_name: None,
                    arguments: None,
                    uri: None,
                    prompt_name: None,
                }],
                think_time: ThinkTime {
                    base_ms: 10,
                    jitter_ms: 0,
                },
                ..WorkloadConfig::default()
            },
            load: LoadTarget {
                target_vus: 2,
                target_rps: 0.0,
            },
            vu_range: VuRange { start: 0, end: 2 },
            duration_ms,
            telemetry: TelemetryConfig::default(),
        }
    }

    fn executor() -> AssignmentExecutor {
        AssignmentExecutor::new(Arc::new(MockAdapter::new()), "wkr_00000001")
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_runs_for_its_duration() {
        let executor = executor();
        let queue = Arc::new(BoundedQueue::new(1000));

        let outcome = executor
            .execute(assignment("lse_00000001", 500), queue.clone())
            .await
            .unwrap();
        assert!(outcome.drained_clean);
        assert!(outcome.ops_total > 0);
        assert!(queue.len() > 0);
        assert!(executor.active_leases().is_empty());
    }

    #[tokio::test]
    async fn empty_vu_range_is_rejected() {
        let executor = executor();
        let queue = Arc::new(BoundedQueue::new(100));
        let mut bad = assignment("lse_00000001", 500);
        bad.vu_range = VuRange { start: 5, end: 5 };
        assert!(matches!(
            executor.execute(bad, queue).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn malformed_lease_id_is_rejected() {
        let executor = executor();
        let queue = Arc::new(BoundedQueue::new(100));
        let mut bad = assignment("not-a-lease", 500);
        bad.duration_ms = 100;
        assert!(matches!(
            executor.execute(bad, queue).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_lease_is_rejected_while_active() {
        let executor = Arc::new(executor());
        let queue = Arc::new(BoundedQueue::new(1000));

        let long_running = {
            let executor = executor.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                executor
                    .execute(assignment("lse_00000001", 10_000), queue)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let duplicate = executor
            .execute(assignment("lse_00000001", 1000), queue.clone())
            .await;
        assert!(matches!(duplicate, Err(Error::Config(_))));

        executor.stop_run("run_0123456789abcdef", true);
        long_running.await.unwrap().unwrap();

        // After completion the lease can be executed again.
        let rerun = executor
            .execute(assignment("lse_00000001", 200), queue)
            .await;
        assert!(rerun.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_run_cancels_matching_assignments_only() {
        let executor = Arc::new(executor());
        let queue = Arc::new(BoundedQueue::new(1000));

        let victim = {
            let executor = executor.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                executor
                    .execute(assignment("lse_00000001", 60_000), queue)
                    .await
            })
        };
        let survivor = {
            let executor = executor.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut other = assignment("lse_00000002", 300);
                other.run_id = "run_ffffffffffffffff".into();
                executor.execute(other, queue).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(executor.stop_run("run_0123456789abcdef", false), 1);
        let stopped = victim.await.unwrap().unwrap();
        assert!(stopped.drained_clean);
        let finished = survivor.await.unwrap().unwrap();
        assert_eq!(finished.lease_id, "lse_00000002");
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_sees_sessions_and_successes() {
        let executor = executor();
        let queue = Arc::new(BoundedQueue::new(1000));
        executor
            .execute(assignment("lse_00000001", 300), queue)
            .await
            .unwrap();

        let metrics = executor.tracker().stability_metrics(false, false);
        // Reuse mode with 2 VUs: two sessions created, all requests ok.
        assert_eq!(metrics.created, 2);
        assert_eq!(metrics.terminated, 2);
        assert!(metrics.requests > 0);
        assert_eq!(metrics.requests, metrics.successes);
        assert_eq!(metrics.stability_score, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_provider_sums_active_assignments() {
        let executor = Arc::new(executor());
        let queue = Arc::new(BoundedQueue::new(1000));

        let running = {
            let executor = executor.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                executor
                    .execute(assignment("lse_00000001", 5000), queue)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.active_vus(), 2);
        assert!(executor.active_sessions() > 0);

        executor.stop_run("run_0123456789abcdef", true);
        running.await.unwrap().unwrap();
        assert_eq!(executor.active_vus(), 0);
    }
}
