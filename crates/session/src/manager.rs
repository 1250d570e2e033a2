//! The session manager facade: one mode handler, one optional evictor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use drill_domain::config::{SessionMode, SessionPolicyConfig};
use drill_domain::error::{Error, Result};
use drill_transport::{TransportAdapter, TransportConfig};

use crate::evictor::{Evictor, EvictionSource};
use crate::modes::churn::ChurnHandler;
use crate::modes::per_request::PerRequestHandler;
use crate::modes::pool::PoolHandler;
use crate::modes::reuse::ReuseHandler;
use crate::modes::{Establisher, ModeHandler};
use crate::session::Session;

/// Counters exposed to health snapshots and exporters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetrics {
    pub mode: SessionMode,
    pub active: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_evicted: u64,
    pub reconnects: u64,
}

pub struct SessionManager {
    mode: SessionMode,
    handler: Arc<dyn ModeHandler>,
    eviction_source: Option<Arc<dyn EvictionSource>>,
    evictor: Mutex<Option<Evictor>>,
    ttl: Option<Duration>,
    idle: Option<Duration>,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        transport_config: TransportConfig,
        policy: &SessionPolicyConfig,
    ) -> Self {
        let ttl = (policy.ttl_ms > 0).then(|| Duration::from_millis(policy.ttl_ms));
        let idle = (policy.max_idle_ms > 0).then(|| Duration::from_millis(policy.max_idle_ms));
        let establisher = Establisher::new(adapter, transport_config, ttl, idle);

        let (handler, eviction_source): (Arc<dyn ModeHandler>, Option<Arc<dyn EvictionSource>>) =
            match policy.mode {
                SessionMode::Reuse => {
                    let handler = Arc::new(ReuseHandler::new(establisher));
                    let source = handler.eviction_source();
                    (handler, Some(source))
                }
                SessionMode::PerRequest => {
                    (Arc::new(PerRequestHandler::new(establisher)), None)
                }
                SessionMode::Pool => {
                    let handler =
                        Arc::new(PoolHandler::new(establisher, policy.pool_max_size));
                    let source = handler.eviction_source();
                    (handler, Some(source))
                }
                SessionMode::Churn => {
                    (Arc::new(ChurnHandler::new(establisher, policy)), None)
                }
            };

        Self {
            mode: policy.mode,
            handler,
            eviction_source,
            evictor: Mutex::new(None),
            ttl,
            idle,
            closed: AtomicBool::new(false),
        }
    }

    /// Start background eviction for the modes that track sessions centrally.
    /// Idempotent; a manager without deadlines gets no evictor.
    pub fn start(&self) {
        let mut evictor = self.evictor.lock();
        if evictor.is_some() {
            return;
        }
        if let Some(source) = &self.eviction_source {
            *evictor = Evictor::spawn(Arc::downgrade(source), self.ttl, self.idle);
            if evictor.is_some() {
                tracing::debug!(mode = ?self.mode, "session evictor started");
            }
        }
    }

    pub async fn acquire(
        &self,
        vu_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }
        self.handler.acquire(vu_id, cancel).await
    }

    /// Hand a session back. After `close` this is a silent no-op.
    pub async fn release(&self, session: &Arc<Session>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        session.record_operation();
        self.handler.release(session).await;
    }

    /// Force-close a session; the next acquire for that VU reconnects.
    pub async fn invalidate(&self, session: &Arc<Session>) {
        self.handler.invalidate(session).await;
    }

    /// Idempotent shutdown: stops eviction, closes idle and in-use sessions.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(evictor) = self.evictor.lock().take() {
            evictor.stop();
        }
        self.handler.close().await;
        tracing::debug!(mode = ?self.mode, "session manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> SessionMetrics {
        let mode_metrics = self.handler.metrics();
        SessionMetrics {
            mode: self.mode,
            active: mode_metrics.active,
            idle: mode_metrics.idle,
            total_created: mode_metrics.total_created,
            total_evicted: mode_metrics.total_evicted,
            reconnects: mode_metrics.reconnects,
        }
    }
}
