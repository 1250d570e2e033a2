//! Periodic TTL/idle eviction, shared by the reuse and pool handlers.
//!
//! Candidate collection reads each session's `{state, expires_at,
//! idle_expires_at}` under its read lock; the actual transition happens in
//! [`Session::try_expire`] under the write lock, so a session that got
//! touched (or expired by its own timer) between the two steps is left alone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::session::{EvictReason, Session, SessionState};

/// Where evicted sessions get cleaned up: the owning mode handler removes its
/// index entries and closes the connection. Keyed by id so the evictor never
/// holds a strong reference into the handler.
pub trait EvictionSink: Send + Sync {
    fn evict(&self, session_id: &str, reason: EvictReason);
}

/// A handler whose sessions the evictor can sweep.
pub trait EvictionSource: EvictionSink {
    fn tracked_sessions(&self) -> Vec<Arc<Session>>;
}

/// Check period: `max(1s, min(ttl, idle) / 2)`. `None` when neither bound is
/// set — there is nothing to evict on.
pub fn check_period(ttl: Option<Duration>, idle: Option<Duration>) -> Option<Duration> {
    let shortest = match (ttl, idle) {
        (Some(t), Some(i)) => t.min(i),
        (Some(t), None) => t,
        (None, Some(i)) => i,
        (None, None) => return None,
    };
    Some((shortest / 2).max(Duration::from_secs(1)))
}

pub struct Evictor {
    cancel: CancellationToken,
}

impl Evictor {
    /// Spawn the eviction loop, or return `None` when no deadline is
    /// configured.
    pub fn spawn(
        source: Weak<dyn EvictionSource>,
        ttl: Option<Duration>,
        idle: Option<Duration>,
    ) -> Option<Self> {
        let period = check_period(ttl, idle)?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_cancel.cancelled() => return,
                }
                let Some(source) = source.upgrade() else {
                    return;
                };
                sweep(&*source);
            }
        });

        Some(Self { cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sweep(source: &dyn EvictionSource) {
    let now = Instant::now();
    let mut candidates: Vec<(Arc<Session>, EvictReason)> = Vec::new();

    for session in source.tracked_sessions() {
        let (state, expires_at, idle_expires_at) = session.expiry_snapshot();
        if state.is_terminal() {
            continue;
        }
        // TTL eviction skips Active sessions until they go idle.
        if state != SessionState::Active && matches!(expires_at, Some(at) if now >= at) {
            candidates.push((session, EvictReason::Ttl));
            continue;
        }
        if state == SessionState::Idle && matches!(idle_expires_at, Some(at) if now >= at) {
            candidates.push((session, EvictReason::Idle));
        }
    }

    for (session, reason) in candidates {
        // Re-checked under the session's write lock; a racing touch or timer
        // makes this a no-op.
        if session.try_expire(reason) {
            tracing::debug!(session_id = %session.id(), ?reason, "session expired by evictor");
            source.evict(session.id(), reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use drill_transport::testing::MockConnection;

    struct TestSource {
        sessions: Mutex<Vec<Arc<Session>>>,
        evicted: Mutex<Vec<(String, EvictReason)>>,
    }

    impl EvictionSink for TestSource {
        fn evict(&self, session_id: &str, reason: EvictReason) {
            self.evicted.lock().push((session_id.to_owned(), reason));
            self.sessions.lock().retain(|s| s.id() != session_id);
        }
    }

    impl EvictionSource for TestSource {
        fn tracked_sessions(&self) -> Vec<Arc<Session>> {
            self.sessions.lock().clone()
        }
    }

    fn source_with(sessions: Vec<Arc<Session>>) -> Arc<TestSource> {
        Arc::new(TestSource {
            sessions: Mutex::new(sessions),
            evicted: Mutex::new(Vec::new()),
        })
    }

    fn session(id: &str, ttl: Option<Duration>, idle: Option<Duration>) -> Arc<Session> {
        Arc::new(Session::new(
            id.into(),
            "vu_1".into(),
            Arc::new(MockConnection::healthy()),
            ttl,
            idle,
        ))
    }

    #[test]
    fn check_period_floors_at_one_second() {
        assert_eq!(
            check_period(Some(Duration::from_millis(100)), None),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            check_period(Some(Duration::from_secs(60)), Some(Duration::from_secs(10))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(check_period(None, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions_past_ttl() {
        let s = session("s1", Some(Duration::from_millis(50)), None);
        s.set_idle();
        let source = source_with(vec![s.clone()]);
        tokio::time::advance(Duration::from_millis(100)).await;

        sweep(&*source);
        assert_eq!(source.evicted.lock().as_slice(), &[("s1".to_owned(), EvictReason::Ttl)]);
        assert_eq!(s.state(), SessionState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_leaves_active_sessions_alone() {
        let s = session("s1", Some(Duration::from_millis(50)), None);
        let source = source_with(vec![s.clone()]);
        tokio::time::advance(Duration::from_millis(100)).await;

        sweep(&*source);
        assert!(source.evicted.lock().is_empty());
        assert_eq!(s.state(), SessionState::Active);

        // Once it goes idle the next sweep collects it.
        s.set_idle();
        sweep(&*source);
        assert_eq!(source.evicted.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_respects_rearmed_idle_deadline() {
        let s = session("s1", None, Some(Duration::from_millis(100)));
        s.set_idle();
        let source = source_with(vec![s.clone()]);
        tokio::time::advance(Duration::from_millis(60)).await;
        s.touch();
        tokio::time::advance(Duration::from_millis(60)).await;

        sweep(&*source);
        assert!(source.evicted.lock().is_empty());

        tokio::time::advance(Duration::from_millis(60)).await;
        sweep(&*source);
        assert_eq!(source.evicted.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evictor_loop_runs_until_stopped() {
        let s = session("s1", None, Some(Duration::from_secs(2)));
        s.set_idle();
        let source = source_with(vec![s.clone()]);
        let weak: Weak<dyn EvictionSource> = {
            let arc: Arc<dyn EvictionSource> = source.clone();
            Arc::downgrade(&arc)
        };
        let evictor =
            Evictor::spawn(weak, None, Some(Duration::from_secs(2))).expect("period configured");

        // Period is max(1s, 2s/2) = 1s; after ~3s the idle deadline has hit
        // and at least one sweep has run.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(source.evicted.lock().len(), 1);
        evictor.stop();
    }
}
