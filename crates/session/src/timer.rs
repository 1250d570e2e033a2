//! Optional fine-grained per-session TTL and idle timers.
//!
//! The periodic evictor bounds staleness at half the shortest deadline; these
//! timers fire close to the actual deadline instead. Both re-verify the
//! session state under its write lock before transitioning, and neither can
//! race the evictor into a double transition — `try_expire` is the single
//! gate.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::evictor::EvictionSink;
use crate::session::{EvictReason, Session, SessionState};

pub struct SessionTimer {
    cancel: CancellationToken,
}

impl SessionTimer {
    /// Spawn the TTL and idle watcher tasks for one session. Either may be
    /// absent when the corresponding bound is unset.
    pub fn spawn(
        session: Arc<Session>,
        ttl: Option<Duration>,
        idle: Option<Duration>,
        sink: Weak<dyn EvictionSink>,
    ) -> Self {
        let cancel = CancellationToken::new();

        if ttl.is_some() {
            let session = session.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ttl_task(session, sink, cancel).await;
            });
        }

        if let Some(idle) = idle {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                idle_task(session, idle, sink, cancel).await;
            });
        }

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn ttl_task(session: Arc<Session>, sink: Weak<dyn EvictionSink>, cancel: CancellationToken) {
    let (_, expires_at, _) = session.expiry_snapshot();
    let Some(deadline) = expires_at else {
        return;
    };
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {}
        _ = cancel.cancelled() => return,
    }
    // If the session is mid-operation at the deadline, leave it to the
    // periodic evictor, which retries once the session goes idle.
    if session.try_expire(EvictReason::Ttl) {
        if let Some(sink) = sink.upgrade() {
            tracing::debug!(session_id = %session.id(), "session TTL fired");
            sink.evict(session.id(), EvictReason::Ttl);
        }
    }
}

async fn idle_task(
    session: Arc<Session>,
    idle: Duration,
    sink: Weak<dyn EvictionSink>,
    cancel: CancellationToken,
) {
    loop {
        let (state, _, idle_expires_at) = session.expiry_snapshot();
        if state.is_terminal() {
            return;
        }
        let Some(deadline) = idle_expires_at else {
            return;
        };

        // While the deadline keeps moving (the session is in use and being
        // touched), wake at the stale deadline and re-arm.
        let wake_at = if Instant::now() >= deadline {
            // Fired on a non-idle session: a no-op that must not cancel the
            // TTL timer — wait a full idle period and look again.
            Instant::now() + idle
        } else {
            deadline
        };
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = cancel.cancelled() => return,
        }

        let (state, _, current_deadline) = session.expiry_snapshot();
        if state.is_terminal() {
            return;
        }
        let Some(current_deadline) = current_deadline else {
            return;
        };
        if Instant::now() < current_deadline {
            continue; // re-armed by a touch
        }
        if state == SessionState::Idle && session.try_expire(EvictReason::Idle) {
            if let Some(sink) = sink.upgrade() {
                tracing::debug!(session_id = %session.id(), "session idle deadline fired");
                sink.evict(session.id(), EvictReason::Idle);
            }
            return;
        }
    }
}
