//! Churn mode: one session per VU, deliberately rotated on a boundary —
//! either wall time since creation or a count of releases. With neither
//! configured, every release rotates (ops interval of 1), which is the whole
//! point of the mode: constant session turnover against the target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use drill_domain::config::SessionPolicyConfig;
use drill_domain::error::{Error, Result};

use crate::session::{Session, SessionState};

use super::{Counters, Establisher, ModeHandler, ModeMetrics};

struct ChurnEntry {
    session: Arc<Session>,
    created: Instant,
    releases: u64,
}

/// Which boundary rotates sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Time(Duration),
    Ops(u64),
}

impl Boundary {
    fn from_policy(policy: &SessionPolicyConfig) -> Self {
        if policy.churn_interval_ms > 0 {
            Boundary::Time(Duration::from_millis(policy.churn_interval_ms))
        } else if policy.churn_interval_ops > 0 {
            Boundary::Ops(policy.churn_interval_ops)
        } else {
            Boundary::Ops(1)
        }
    }

    fn hit(&self, entry: &ChurnEntry) -> bool {
        match self {
            Boundary::Time(interval) => entry.created.elapsed() >= *interval,
            Boundary::Ops(interval) => entry.releases >= *interval,
        }
    }
}

pub struct ChurnHandler {
    establisher: Establisher,
    boundary: Boundary,
    entries: Mutex<HashMap<String, ChurnEntry>>,
    counters: Counters,
    closed: AtomicBool,
}

impl ChurnHandler {
    pub(crate) fn new(establisher: Establisher, policy: &SessionPolicyConfig) -> Self {
        Self {
            establisher,
            boundary: Boundary::from_policy(policy),
            entries: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ModeHandler for ChurnHandler {
    async fn acquire(&self, vu_id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }

        // Reuse the current session unless it hit its boundary or died.
        let retire = {
            let entries = self.entries.lock();
            match entries.get(vu_id) {
                Some(entry)
                    if !self.boundary.hit(entry) && !entry.session.is_expired_or_closed() =>
                {
                    entry.session.set_active();
                    return Ok(entry.session.clone());
                }
                Some(entry) => Some(entry.session.clone()),
                None => None,
            }
        };

        if let Some(old) = retire {
            self.entries.lock().remove(vu_id);
            old.mark_closed();
            old.close_connection().await;
            self.counters.evicted();
        }

        let session = tokio::select! {
            result = self.establisher.establish(vu_id) => result?,
            _ = cancel.cancelled() => return Err(Error::Other("acquire cancelled".into())),
        };
        self.counters.created();

        if self.closed.load(Ordering::SeqCst) {
            session.mark_closed();
            session.close_connection().await;
            return Err(Error::ManagerClosed);
        }

        self.entries.lock().insert(
            vu_id.to_owned(),
            ChurnEntry {
                session: session.clone(),
                created: Instant::now(),
                releases: 0,
            },
        );
        Ok(session)
    }

    async fn release(&self, session: &Arc<Session>) {
        session.set_idle();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(session.vu_id()) {
            if entry.session.id() == session.id() {
                entry.releases += 1;
            }
        }
    }

    async fn invalidate(&self, session: &Arc<Session>) {
        {
            let mut entries = self.entries.lock();
            if entries
                .get(session.vu_id())
                .is_some_and(|e| e.session.id() == session.id())
            {
                entries.remove(session.vu_id());
            }
        }
        session.mark_closed();
        session.close_connection().await;
        self.counters.reconnect();
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, e)| e.session).collect()
        };
        for session in &sessions {
            session.mark_closed();
        }
        futures_util::future::join_all(sessions.iter().map(|s| s.close_connection())).await;
    }

    fn metrics(&self) -> ModeMetrics {
        let entries = self.entries.lock();
        let mut active = 0;
        let mut idle = 0;
        for entry in entries.values() {
            match entry.session.state() {
                SessionState::Active => active += 1,
                SessionState::Idle => idle += 1,
                _ => {}
            }
        }
        ModeMetrics {
            active,
            idle,
            total_created: self.counters.total_created.load(Ordering::Relaxed),
            total_evicted: self.counters.total_evicted.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}
