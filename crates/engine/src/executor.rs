//! The per-VU executor loop.
//!
//! One iteration: sample an operation, acquire a session, take an in-flight
//! slot and a rate token, execute, release everything, emit the result,
//! think. Cancellation at any suspension point drains the VU.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use drill_domain::config::{ReconnectPolicy, ThinkTime, UserJourneyConfig};
use drill_domain::error::Error;
use drill_domain::outcome::{
    Correlation, ErrorInfo, OperationOutcome, OperationResult, OperationType,
};
use drill_session::{Session, SessionManager};
use drill_transport::{execute_operation, OperationSpec};

use crate::inflight::InFlightLimiter;
use crate::journey::{JourneyTracker, ReconnectBackoff};
use crate::rate::RateLimiter;
use crate::sampler::OperationSampler;
use crate::VuState;

/// Correlation fields shared by every result this engine emits.
#[derive(Debug, Clone)]
pub struct EngineIds {
    pub run_id: String,
    pub execution_id: String,
    pub stage: String,
    pub stage_id: String,
    pub worker_id: String,
}

/// State shared between the engine and all its executors.
pub(crate) struct EngineShared {
    pub ids: EngineIds,
    pub session_manager: Arc<SessionManager>,
    pub sampler: OperationSampler,
    pub rate: RateLimiter,
    pub think_time: ThinkTime,
    pub in_flight_per_vu: u32,
    pub journey: Option<UserJourneyConfig>,
    pub reconnect: ReconnectPolicy,
    /// Taken (set to `None`) exactly once at engine stop; executors clone the
    /// sender out at startup.
    pub results_tx: Mutex<Option<mpsc::Sender<OperationResult>>>,
    pub dropped_results: AtomicU64,
    pub session_errors: AtomicU64,
    pub active_vus: AtomicU32,
    pub in_flight_ops: AtomicU32,
    pub ops_total: AtomicU64,
}

impl EngineShared {
    fn emit(&self, tx: &mpsc::Sender<OperationResult>, result: OperationResult) {
        match tx.try_send(result) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_results.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Parameters for one executor task.
pub(crate) struct VuParams {
    /// Display name, `{assignment}-vu-{n}` or `{assignment}-swarm-vu-{n}`.
    pub name: String,
    /// Correlation id, `vu_{global_index}`.
    pub vu_id: String,
    pub seed: u64,
    pub lifetime: Option<Duration>,
    pub state: Arc<Mutex<VuState>>,
}

impl VuParams {
    fn set_state(&self, state: VuState) {
        *self.state.lock() = state;
    }
}

pub(crate) async fn run_vu(shared: Arc<EngineShared>, params: VuParams, cancel: CancellationToken) {
    let Some(tx) = shared.results_tx.lock().clone() else {
        params.set_state(VuState::Stopped);
        return;
    };

    params.set_state(VuState::Initializing);
    shared.active_vus.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(vu = %params.name, "VU starting");

    run_vu_inner(&shared, &params, &tx, &cancel).await;

    params.set_state(VuState::Stopped);
    shared.active_vus.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(vu = %params.name, "VU stopped");
}

async fn run_vu_inner(
    shared: &EngineShared,
    params: &VuParams,
    tx: &mpsc::Sender<OperationResult>,
    cancel: &CancellationToken,
) {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let inflight = InFlightLimiter::new(shared.in_flight_per_vu);
    let mut backoff = ReconnectBackoff::new(shared.reconnect.clone());
    let mut journey = shared.journey.clone().map(JourneyTracker::new);
    let deadline = params.lifetime.map(|d| Instant::now() + d);
    let mut op_seq = 0u64;

    loop {
        if cancel.is_cancelled() {
            params.set_state(VuState::Draining);
            return;
        }
        if matches!(deadline, Some(at) if Instant::now() >= at) {
            params.set_state(VuState::Draining);
            return;
        }

        // (1) sample the next operation.
        let spec = shared.sampler.sample(&mut rng);

        // (2) acquire a session, backing off on failure.
        let session = match acquire_session(shared, params, tx, cancel, &mut backoff, &mut rng)
            .await
        {
            Some(session) => session,
            None => {
                params.set_state(VuState::Draining);
                return;
            }
        };
        params.set_state(VuState::Running);

        // Optional journey step before the sampled operation.
        if let Some(journey) = &mut journey {
            if journey.should_run_tools_list() {
                let tools_list = OperationSpec {
                    op: OperationType::ToolsList,
                    tool_name: None,
                    arguments: None,
                    uri: None,
                    prompt_name: None,
                };
                if execute_once(
                    shared, params, tx, cancel, &session, &tools_list, &mut op_seq, None,
                )
                .await
                .is_none()
                {
                    continue; // session was invalidated; reacquire
                }
                journey.tools_list_ran();
            }
        }

        // (3)–(7) limiters, execute, release, emit.
        let slot = match inflight.acquire(cancel).await {
            Ok(slot) => slot,
            Err(_) => {
                shared.session_manager.release(&session).await;
                return;
            }
        };
        if shared.rate.acquire(cancel).await.is_err() {
            drop(slot);
            shared.session_manager.release(&session).await;
            return;
        }

        let outcome_ok = execute_once(
            shared, params, tx, cancel, &session, &spec, &mut op_seq, Some(slot),
        )
        .await;

        if let Some(journey) = &mut journey {
            if let Some(ok) = outcome_ok {
                journey.note_operation(ok);
            } else {
                journey.note_operation(false);
            }
        }

        // (8) think time.
        let think = think_delay(&shared.think_time, &mut rng);
        if !think.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(think) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// Acquire with reconnect backoff. `None` means the VU terminates (engine
/// stop, manager closed, or retries exhausted).
async fn acquire_session(
    shared: &EngineShared,
    params: &VuParams,
    tx: &mpsc::Sender<OperationResult>,
    cancel: &CancellationToken,
    backoff: &mut ReconnectBackoff,
    rng: &mut StdRng,
) -> Option<Arc<Session>> {
    loop {
        let result = tokio::select! {
            result = shared.session_manager.acquire(&params.vu_id, cancel) => result,
            _ = cancel.cancelled() => return None,
        };
        match result {
            Ok(session) => {
                backoff.reset();
                return Some(session);
            }
            Err(Error::ManagerClosed) => return None,
            Err(err) => {
                tracing::debug!(vu = %params.vu_id, error = %err, "session acquire failed");
                let outcome = OperationOutcome::failed(
                    OperationType::Initialize,
                    0,
                    ErrorInfo::session(err.to_string()),
                );
                shared.emit(
                    tx,
                    OperationResult {
                        correlation: correlation(shared, params, "", Some(backoff.attempt())),
                        outcome,
                    },
                );

                match backoff.next_delay(rng) {
                    Some(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return None,
                        }
                    }
                    None => {
                        shared.session_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(vu = %params.vu_id, "VU terminating: reconnect retries exhausted");
                        return None;
                    }
                }
            }
        }
    }
}

/// Execute one operation on the held session and emit its result.
///
/// Returns `Some(outcome_ok)` when the session was released normally, `None`
/// when a transport failure invalidated it.
#[allow(clippy::too_many_arguments)]
async fn execute_once(
    shared: &EngineShared,
    params: &VuParams,
    tx: &mpsc::Sender<OperationResult>,
    cancel: &CancellationToken,
    session: &Arc<Session>,
    spec: &OperationSpec,
    op_seq: &mut u64,
    slot: Option<crate::inflight::InFlightSlot>,
) -> Option<bool> {
    *op_seq += 1;
    let op_id = format!("{}-op-{}", params.name, op_seq);

    shared.in_flight_ops.fetch_add(1, Ordering::SeqCst);
    let result = tokio::select! {
        result = execute_operation(session.connection().as_ref(), spec) => Some(result),
        _ = cancel.cancelled() => None,
    };
    shared.in_flight_ops.fetch_sub(1, Ordering::SeqCst);
    // The in-flight slot frees before the session goes back.
    drop(slot);

    let Some(result) = result else {
        // Cancelled mid-operation: the iteration aborts, the VU drains.
        shared.session_manager.release(session).await;
        return Some(false);
    };

    match result {
        Ok(outcome) => {
            let ok = outcome.ok;
            shared.ops_total.fetch_add(1, Ordering::Relaxed);
            let mut correlation = correlation(shared, params, session.id(), None);
            correlation.op_id = Some(op_id);
            shared.emit(
                tx,
                OperationResult {
                    correlation,
                    outcome,
                },
            );
            shared.session_manager.release(session).await;
            Some(ok)
        }
        Err(err) => {
            // Connection-level failure: report it and invalidate the session;
            // the next iteration reconnects.
            let mut correlation = correlation(shared, params, session.id(), None);
            correlation.op_id = Some(op_id);
            shared.emit(
                tx,
                OperationResult {
                    correlation,
                    outcome: OperationOutcome::failed(
                        spec.op,
                        0,
                        ErrorInfo::transport(err.to_string()),
                    ),
                },
            );
            shared.session_manager.invalidate(session).await;
            None
        }
    }
}

fn correlation(
    shared: &EngineShared,
    params: &VuParams,
    session_id: &str,
    attempt: Option<u32>,
) -> Correlation {
    Correlation {
        run_id: shared.ids.run_id.clone(),
        execution_id: shared.ids.execution_id.clone(),
        stage: shared.ids.stage.clone(),
        stage_id: shared.ids.stage_id.clone(),
        worker_id: shared.ids.worker_id.clone(),
        vu_id: params.vu_id.clone(),
        session_id: session_id.to_owned(),
        op_id: None,
        attempt,
    }
}

fn think_delay(think: &ThinkTime, rng: &mut StdRng) -> Duration {
    let jitter = if think.jitter_ms > 0 {
        rng.gen_range(0..=think.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(think.base_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_delay_within_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let think = ThinkTime {
            base_ms: 100,
            jitter_ms: 50,
        };
        for _ in 0..200 {
            let d = think_delay(&think, &mut rng).as_millis() as u64;
            assert!((100..=150).contains(&d));
        }
    }

    #[test]
    fn think_delay_zero_is_zero() {
        let mut rng = StdRng::seed_from_u64(3);
        let think = ThinkTime {
            base_ms: 0,
            jitter_ms: 0,
        };
        assert!(think_delay(&think, &mut rng).is_zero());
    }
}
