//! Reuse mode: one long-lived session per VU.
//!
//! Two indexes — `vu_id → session` and `session_id → vu_id` — are mutated
//! under the same lock so inversion stays O(1) and consistent. Each session
//! gets a fine-grained [`SessionTimer`]; the periodic evictor is the
//! backstop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result};

use crate::evictor::{EvictionSink, EvictionSource};
use crate::session::{EvictReason, Session, SessionState};
use crate::timer::SessionTimer;

use super::{Counters, Establisher, ModeHandler, ModeMetrics};

#[derive(Default)]
struct ReuseState {
    by_vu: HashMap<String, Arc<Session>>,
    by_session: HashMap<String, String>,
}

pub(crate) struct ReuseInner {
    state: Mutex<ReuseState>,
    timers: Mutex<HashMap<String, SessionTimer>>,
    counters: Counters,
    closed: AtomicBool,
}

impl ReuseInner {
    /// Remove a session from both indexes; returns it if it was tracked.
    fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut state = self.state.lock();
        let vu_id = state.by_session.remove(session_id)?;
        state.by_vu.remove(&vu_id)
    }
}

impl EvictionSink for ReuseInner {
    fn evict(&self, session_id: &str, _reason: EvictReason) {
        if let Some(session) = self.remove_session(session_id) {
            self.timers.lock().remove(session_id);
            self.counters.evicted();
            tokio::spawn(async move { session.close_connection().await });
        }
    }
}

impl EvictionSource for ReuseInner {
    fn tracked_sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().by_vu.values().cloned().collect()
    }
}

pub struct ReuseHandler {
    inner: Arc<ReuseInner>,
    establisher: Establisher,
}

impl ReuseHandler {
    pub(crate) fn new(establisher: Establisher) -> Self {
        Self {
            inner: Arc::new(ReuseInner {
                state: Mutex::new(ReuseState::default()),
                timers: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
            establisher,
        }
    }

    pub(crate) fn eviction_source(&self) -> Arc<dyn EvictionSource> {
        self.inner.clone()
    }

    fn install(&self, session: Arc<Session>) {
        let mut state = self.inner.state.lock();
        state
            .by_session
            .insert(session.id().to_owned(), session.vu_id().to_owned());
        state.by_vu.insert(session.vu_id().to_owned(), session.clone());
        drop(state);

        let sink: Arc<dyn EvictionSink> = self.inner.clone();
        let timer = SessionTimer::spawn(
            session.clone(),
            self.establisher.ttl(),
            self.establisher.idle(),
            Arc::downgrade(&sink),
        );
        self.inner.timers.lock().insert(session.id().to_owned(), timer);
    }
}

#[async_trait]
impl ModeHandler for ReuseHandler {
    async fn acquire(&self, vu_id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }

        // Fast path: the VU's session is still good.
        let stale = {
            let state = self.inner.state.lock();
            match state.by_vu.get(vu_id) {
                Some(session) if !session.is_expired_or_closed() => {
                    session.set_active();
                    return Ok(session.clone());
                }
                Some(session) => Some(session.clone()),
                None => None,
            }
        };

        // A deadline passed without the evictor noticing yet: same cleanup
        // path, then fall through to create.
        if let Some(stale) = stale {
            stale.try_expire(EvictReason::Ttl);
            stale.mark_closed();
            self.inner.evict(stale.id(), EvictReason::Ttl);
        }

        let session = tokio::select! {
            result = self.establisher.establish(vu_id) => result?,
            _ = cancel.cancelled() => return Err(Error::Other("acquire cancelled".into())),
        };
        self.inner.counters.created();

        if self.inner.closed.load(Ordering::SeqCst) {
            session.mark_closed();
            session.close_connection().await;
            return Err(Error::ManagerClosed);
        }

        self.install(session.clone());
        Ok(session)
    }

    async fn release(&self, session: &Arc<Session>) {
        session.set_idle();
    }

    async fn invalidate(&self, session: &Arc<Session>) {
        session.mark_closed();
        if self.inner.remove_session(session.id()).is_some() {
            self.inner.timers.lock().remove(session.id());
        }
        session.close_connection().await;
        self.inner.counters.reconnect();
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.inner.state.lock();
            state.by_session.clear();
            state.by_vu.drain().map(|(_, s)| s).collect()
        };
        self.inner.timers.lock().clear();

        for session in &sessions {
            session.mark_closed();
        }
        futures_util::future::join_all(sessions.iter().map(|s| s.close_connection())).await;
    }

    fn metrics(&self) -> ModeMetrics {
        let state = self.inner.state.lock();
        let mut active = 0;
        let mut idle = 0;
        for session in state.by_vu.values() {
            match session.state() {
                SessionState::Active => active += 1,
                SessionState::Idle => idle += 1,
                _ => {}
            }
        }
        ModeMetrics {
            active,
            idle,
            total_created: self.inner.counters.total_created.load(Ordering::Relaxed),
            total_evicted: self.inner.counters.total_evicted.load(Ordering::Relaxed),
            reconnects: self.inner.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_transport::testing::MockAdapter;

    use crate::modes::tests::transport_config;

    fn handler_with(adapter: Arc<MockAdapter>) -> ReuseHandler {
        ReuseHandler::new(Establisher::new(adapter, transport_config(), None, None))
    }

    #[tokio::test]
    async fn same_vu_reuses_its_session() {
        let adapter = Arc::new(MockAdapter::new());
        let handler = handler_with(adapter.clone());
        let cancel = CancellationToken::new();

        let first = handler.acquire("vu_1", &cancel).await.unwrap();
        handler.release(&first).await;
        let second = handler.acquire("vu_1", &cancel).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(adapter.stats().connects(), 1);
    }

    #[tokio::test]
    async fn different_vus_get_different_sessions() {
        let handler = handler_with(Arc::new(MockAdapter::new()));
        let cancel = CancellationToken::new();

        let a = handler.acquire("vu_1", &cancel).await.unwrap();
        let b = handler.acquire("vu_2", &cancel).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(handler.metrics().total_created, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_session() {
        let adapter = Arc::new(MockAdapter::new());
        let handler = handler_with(adapter.clone());
        let cancel = CancellationToken::new();

        let first = handler.acquire("vu_1", &cancel).await.unwrap();
        let first_id = first.id().to_owned();
        handler.invalidate(&first).await;
        assert_eq!(first.state(), SessionState::Closed);

        let second = handler.acquire("vu_1", &cancel).await.unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(handler.metrics().reconnects, 1);
        assert_eq!(adapter.stats().closes(), 1);
    }

    #[tokio::test]
    async fn release_sets_idle() {
        let handler = handler_with(Arc::new(MockAdapter::new()));
        let cancel = CancellationToken::new();
        let session = handler.acquire("vu_1", &cancel).await.unwrap();
        handler.release(&session).await;
        assert_eq!(session.state(), SessionState::Idle);
        let metrics = handler.metrics();
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn close_drains_everything_and_refuses_acquires() {
        let adapter = Arc::new(MockAdapter::new());
        let handler = handler_with(adapter.clone());
        let cancel = CancellationToken::new();

        let a = handler.acquire("vu_1", &cancel).await.unwrap();
        let _b = handler.acquire("vu_2", &cancel).await.unwrap();
        handler.close().await;

        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(adapter.stats().closes(), 2);
        assert!(matches!(
            handler.acquire("vu_3", &cancel).await,
            Err(Error::ManagerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_replaced_on_acquire() {
        let adapter = Arc::new(MockAdapter::new());
        let establisher = Establisher::new(
            adapter.clone(),
            transport_config(),
            Some(std::time::Duration::from_millis(50)),
            None,
        );
        let handler = ReuseHandler::new(establisher);
        let cancel = CancellationToken::new();

        let first = handler.acquire("vu_1", &cancel).await.unwrap();
        let first_id = first.id().to_owned();
        handler.release(&first).await;

        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        let second = handler.acquire("vu_1", &cancel).await.unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(handler.metrics().total_evicted, 1);
    }
}
