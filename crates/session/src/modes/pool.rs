//! Pool mode: a bounded pool shared by all VUs.
//!
//! Capacity accounting is `idle + in_use + pending_creates <= max_size`,
//! where `pending_creates` reserves a slot while a connection is being
//! established outside the lock. A failed establishment cancels its
//! reservation and wakes one waiter so the slot is not stranded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result};

use crate::evictor::{EvictionSink, EvictionSource};
use crate::session::{EvictReason, Session};

use super::{Counters, Establisher, ModeHandler, ModeMetrics};

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Arc<Session>>,
    in_use: HashMap<String, Arc<Session>>,
    pending_creates: usize,
}

/// What one pass over the locked state decided.
enum Plan {
    Hit(Arc<Session>),
    Create(Reservation),
    Wait,
}

/// A reserved create slot. Dropping it without completing (failure, or the
/// acquire future being cancelled mid-establish) returns the slot and wakes
/// one waiter.
struct Reservation {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    /// Consume the reservation: the established session takes the slot.
    fn complete(mut self, session: &Arc<Session>) {
        let mut state = self.inner.state.lock();
        state.pending_creates -= 1;
        state.in_use.insert(session.id().to_owned(), session.clone());
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().pending_creates -= 1;
            self.inner.notify.notify_one();
        }
    }
}

pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
    notify: Notify,
    counters: Counters,
    closed: AtomicBool,
    max_size: usize,
}

impl EvictionSink for PoolInner {
    fn evict(&self, session_id: &str, _reason: EvictReason) {
        let mut state = self.state.lock();
        let before = state.idle.len();
        state.idle.retain(|s| s.id() != session_id);
        let removed = before != state.idle.len();
        drop(state);
        if removed {
            self.counters.evicted();
            self.notify.notify_one();
        }
    }
}

impl EvictionSource for PoolInner {
    fn tracked_sessions(&self) -> Vec<Arc<Session>> {
        let state = self.state.lock();
        // In-use sessions are included: TTL eviction skips Active entries on
        // its own, and nothing here ever idles out a held session.
        state
            .idle
            .iter()
            .cloned()
            .chain(state.in_use.values().cloned())
            .collect()
    }
}

pub struct PoolHandler {
    inner: Arc<PoolInner>,
    establisher: Establisher,
}

impl PoolHandler {
    pub(crate) fn new(establisher: Establisher, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                notify: Notify::new(),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
                max_size: max_size.max(1),
            }),
            establisher,
        }
    }

    pub(crate) fn eviction_source(&self) -> Arc<dyn EvictionSource> {
        self.inner.clone()
    }

    /// Scan the idle list (discarding dead entries), reserve a create slot,
    /// or decide to wait.
    fn plan(&self) -> Plan {
        let mut state = self.inner.state.lock();

        while let Some(session) = state.idle.pop_front() {
            if session.is_expired_or_closed() {
                self.inner.counters.evicted();
                tokio::spawn(async move {
                    session.mark_closed();
                    session.close_connection().await;
                });
                continue;
            }
            session.set_active();
            state.in_use.insert(session.id().to_owned(), session.clone());
            return Plan::Hit(session);
        }

        if state.idle.len() + state.in_use.len() + state.pending_creates < self.inner.max_size {
            state.pending_creates += 1;
            return Plan::Create(Reservation {
                inner: self.inner.clone(),
                armed: true,
            });
        }
        Plan::Wait
    }

    async fn create(&self, reservation: Reservation) -> Result<Arc<Session>> {
        // Pool sessions have no owning VU.
        let session = self.establisher.establish("").await?;

        if self.inner.closed.load(Ordering::SeqCst) {
            drop(reservation);
            session.mark_closed();
            session.close_connection().await;
            return Err(Error::ManagerClosed);
        }

        reservation.complete(&session);
        self.inner.counters.created();
        Ok(session)
    }
}

#[async_trait]
impl ModeHandler for PoolHandler {
    async fn acquire(&self, _vu_id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::ManagerClosed);
            }

            // Register interest before re-checking so a release between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.plan() {
                Plan::Hit(session) => return Ok(session),
                Plan::Create(reservation) => {
                    // Dropping the create mid-establish drops the reservation
                    // with it, so cancellation cannot strand the slot.
                    return tokio::select! {
                        result = self.create(reservation) => result,
                        _ = cancel.cancelled() => Err(Error::PoolTimeout),
                    };
                }
                Plan::Wait => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = cancel.cancelled() => return Err(Error::PoolTimeout),
                    }
                }
            }
        }
    }

    async fn release(&self, session: &Arc<Session>) {
        let is_expired_or_closed = {
            let mut state = self.inner.state.lock();
            state.in_use.remove(session.id());

            let is_expired_or_closed = session.is_expired_or_closed();
            if !is_expired_or_closed {
                session.set_idle();
                state.idle.push_back(session.clone());
            }
            is_expired_or_closed
        };

        if is_expired_or_closed {
            self.inner.counters.evicted();
            session.mark_closed();
            session.close_connection().await;
        }
        self.inner.notify.notify_one();
    }

    async fn invalidate(&self, session: &Arc<Session>) {
        {
            let mut state = self.inner.state.lock();
            state.in_use.remove(session.id());
            state.idle.retain(|s| s.id() != session.id());
        }
        session.mark_closed();
        session.close_connection().await;
        self.inner.counters.reconnect();
        self.inner.notify.notify_one();
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();

        let sessions: Vec<Arc<Session>> = {
            let mut state = self.inner.state.lock();
            let mut sessions: Vec<_> = state.idle.drain(..).collect();
            sessions.extend(state.in_use.drain().map(|(_, s)| s));
            sessions
        };
        for session in &sessions {
            session.mark_closed();
        }
        futures_util::future::join_all(sessions.iter().map(|s| s.close_connection())).await;
    }

    fn metrics(&self) -> ModeMetrics {
        let state = self.inner.state.lock();
        ModeMetrics {
            active: state.in_use.len(),
            idle: state.idle.len(),
            total_created: self.inner.counters.total_created.load(Ordering::Relaxed),
            total_evicted: self.inner.counters.total_evicted.load(Ordering::Relaxed),
            reconnects: self.inner.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}
