//! The engine: spawns and supervises VU executors, applies live load
//! updates, and drains on stop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use drill_domain::assignment::LoadTarget;
use drill_domain::config::{
    OperationMixEntry, ReconnectPolicy, SpawnMode, SwarmConfig, ThinkTime, ToolTemplate,
    UserJourneyConfig,
};
use drill_domain::error::{Error, Result};
use drill_domain::outcome::OperationResult;
use drill_session::SessionManager;

use crate::executor::{run_vu, EngineIds, EngineShared, VuParams};
use crate::rate::RateLimiter;
use crate::sampler::OperationSampler;

const DEFAULT_RESULTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub run_id: String,
    pub execution_id: String,
    pub stage: String,
    pub stage_id: String,
    pub worker_id: String,
    /// Assignment handle used in VU names (`{assignment}-vu-{n}`).
    pub assignment_id: String,
    pub load: LoadTarget,
    pub operation_mix: Vec<OperationMixEntry>,
    pub tool_templates: Vec<ToolTemplate>,
    pub in_flight_per_vu: u32,
    pub think_time: ThinkTime,
    pub spawn_mode: SpawnMode,
    pub swarm: Option<SwarmConfig>,
    pub user_journey: Option<UserJourneyConfig>,
    /// Global index of this worker's first VU (the assignment's `vu_start`).
    pub vu_index_base: u32,
    pub results_capacity: usize,
}

/// Counters reported into worker health and exporters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    pub active_vus: u32,
    pub in_flight_ops: u32,
    pub ops_total: u64,
    pub dropped_results: u64,
    pub session_errors: u64,
}

/// One spawned VU, tracked for targeted stops (oldest first).
struct VuSlot {
    index: u32,
    cancel: CancellationToken,
    state: Arc<Mutex<crate::VuState>>,
}

struct EngineInner {
    shared: Arc<EngineShared>,
    config: EngineConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    vus: Mutex<VecDeque<VuSlot>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    spawner: Mutex<Option<JoinHandle<()>>>,
    next_index: AtomicU32,
    load: Mutex<LoadTarget>,
}

pub struct VuEngine {
    inner: Arc<EngineInner>,
    results_rx: Mutex<Option<mpsc::Receiver<OperationResult>>>,
}

impl VuEngine {
    pub fn new(config: EngineConfig, session_manager: Arc<SessionManager>) -> Result<Self> {
        let sampler = OperationSampler::new(&config.operation_mix, &config.tool_templates)?;
        let capacity = if config.results_capacity == 0 {
            DEFAULT_RESULTS_CAPACITY
        } else {
            config.results_capacity
        };
        let (tx, rx) = mpsc::channel(capacity);

        let shared = Arc::new(EngineShared {
            ids: EngineIds {
                run_id: config.run_id.clone(),
                execution_id: config.execution_id.clone(),
                stage: config.stage.clone(),
                stage_id: config.stage_id.clone(),
                worker_id: config.worker_id.clone(),
            },
            session_manager,
            sampler,
            rate: RateLimiter::new(config.load.target_rps),
            think_time: config.think_time,
            in_flight_per_vu: config.in_flight_per_vu,
            journey: config.user_journey.clone(),
            reconnect: config
                .user_journey
                .as_ref()
                .map(|j| j.reconnect.clone())
                .unwrap_or_else(ReconnectPolicy::default),
            results_tx: Mutex::new(Some(tx)),
            dropped_results: AtomicU64::new(0),
            session_errors: AtomicU64::new(0),
            active_vus: AtomicU32::new(0),
            in_flight_ops: AtomicU32::new(0),
            ops_total: AtomicU64::new(0),
        });

        let load = config.load;
        Ok(Self {
            inner: Arc::new(EngineInner {
                shared,
                config,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                vus: Mutex::new(VecDeque::new()),
                handles: Mutex::new(Vec::new()),
                spawner: Mutex::new(None),
                next_index: AtomicU32::new(0),
                load: Mutex::new(load),
            }),
            results_rx: Mutex::new(Some(rx)),
        })
    }

    /// The multi-producer single-consumer results stream. Closed exactly
    /// once, after every executor has exited.
    pub fn take_results(&self) -> Option<mpsc::Receiver<OperationResult>> {
        self.results_rx.lock().take()
    }

    /// Idempotent startup.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.inner.config.spawn_mode {
            SpawnMode::Normal => {
                let target = self.inner.load.lock().target_vus;
                for _ in 0..target {
                    spawn_executor(&self.inner, false, None);
                }
                tracing::info!(vus = target, "engine started");
            }
            SpawnMode::Swarm => {
                let inner = self.inner.clone();
                let handle = tokio::spawn(swarm_spawner(inner));
                *self.inner.spawner.lock() = Some(handle);
                tracing::info!("engine started in swarm mode");
            }
        }
    }

    /// Retarget the rate and, in normal mode, grow or shrink the executor
    /// set (oldest VUs stop first). Swarm mode picks the new caps up on
    /// subsequent spawns.
    pub fn update_load(&self, target: LoadTarget) {
        *self.inner.load.lock() = target;
        self.inner.shared.rate.update_target_rps(target.target_rps);

        if self.inner.config.spawn_mode != SpawnMode::Normal
            || !self.inner.started.load(Ordering::SeqCst)
            || self.inner.stopped.load(Ordering::SeqCst)
        {
            return;
        }

        let mut vus = self.inner.vus.lock();
        let current = vus.len() as u32;
        if target.target_vus > current {
            drop(vus);
            for _ in current..target.target_vus {
                spawn_executor(&self.inner, false, None);
            }
            tracing::info!(from = current, to = target.target_vus, "scaled VUs up");
        } else if target.target_vus < current {
            let excess = (current - target.target_vus) as usize;
            for _ in 0..excess {
                if let Some(slot) = vus.pop_front() {
                    slot.cancel.cancel();
                }
            }
            tracing::info!(from = current, to = target.target_vus, "scaling VUs down");
        }
    }

    /// Idempotent shutdown: cancel everything, wait up to `drain` for the
    /// executors, close the results channel exactly once.
    pub async fn stop(&self, drain: Duration) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let spawner = self.inner.spawner.lock().take();
        if let Some(spawner) = spawner {
            let _ = spawner.await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        let join_all = futures_util::future::join_all(handles);
        let timed_out = tokio::time::timeout(drain, join_all).await.is_err();

        // Executors hold sender clones; dropping ours closes the channel as
        // soon as the last of them exits.
        *self.inner.shared.results_tx.lock() = None;
        self.inner.vus.lock().clear();

        if timed_out {
            tracing::warn!("engine drain deadline exceeded");
            return Err(Error::DrainTimeout("VU executors still running".into()));
        }
        tracing::info!("engine stopped");
        Ok(())
    }

    /// Live VU states, in spawn order.
    pub fn vu_states(&self) -> Vec<crate::VuState> {
        self.inner.vus.lock().iter().map(|slot| *slot.state.lock()).collect()
    }

    pub fn metrics(&self) -> EngineMetrics {
        let shared = &self.inner.shared;
        EngineMetrics {
            active_vus: shared.active_vus.load(Ordering::SeqCst),
            in_flight_ops: shared.in_flight_ops.load(Ordering::SeqCst),
            ops_total: shared.ops_total.load(Ordering::Relaxed),
            dropped_results: shared.dropped_results.load(Ordering::Relaxed),
            session_errors: shared.session_errors.load(Ordering::Relaxed),
        }
    }
}

fn spawn_executor(inner: &Arc<EngineInner>, swarm: bool, lifetime: Option<Duration>) {
    let index = inner.next_index.fetch_add(1, Ordering::SeqCst);
    let kind = if swarm { "swarm-vu" } else { "vu" };
    let state = Arc::new(Mutex::new(crate::VuState::Idle));
    let params = VuParams {
        name: format!("{}-{kind}-{index}", inner.config.assignment_id),
        vu_id: format!("vu_{}", inner.config.vu_index_base + index),
        seed: vu_seed(&inner.config.run_id, &inner.config.stage_id, index),
        lifetime,
        state: state.clone(),
    };

    let vu_cancel = inner.cancel.child_token();
    inner.vus.lock().push_back(VuSlot {
        index,
        cancel: vu_cancel.clone(),
        state,
    });

    let shared = inner.shared.clone();
    let inner_cleanup = inner.clone();
    let handle = tokio::spawn(async move {
        run_vu(shared, params, vu_cancel).await;
        inner_cleanup.vus.lock().retain(|slot| slot.index != index);
    });
    inner.handles.lock().push(handle);
}

async fn swarm_spawner(inner: Arc<EngineInner>) {
    let swarm = inner.config.swarm.clone().unwrap_or_default();
    let interval = Duration::from_millis(swarm.spawn_interval_ms.max(1));
    let lifetime = Duration::from_millis(swarm.vu_lifetime_ms.max(1));

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.cancel.cancelled() => return,
        }
        let active = inner.shared.active_vus.load(Ordering::SeqCst);
        let target = inner.load.lock().target_vus;
        let cap = if target > 0 {
            swarm.max_concurrent_vus.min(target)
        } else {
            swarm.max_concurrent_vus
        };
        if active < cap {
            spawn_executor(&inner, true, Some(lifetime));
        }
    }
}

/// Deterministic per-VU seed: FNV-1a over the run, stage, and VU index, so a
/// stage replays with identical sampling streams.
fn vu_seed(run_id: &str, stage_id: &str, index: u32) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in run_id
        .as_bytes()
        .iter()
        .chain(stage_id.as_bytes())
        .chain(&index.to_le_bytes())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
