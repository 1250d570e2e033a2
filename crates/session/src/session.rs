//! The session object and its state machine.
//!
//! `Creating → Active ⇄ Idle → Expired | Closed`; `Invalidate` forces
//! `Closed` from any non-terminal state. `Expired` and `Closed` are sticky.
//! A session in `Active` has exactly one current holder; the holder is
//! whoever got it from `acquire` and has not released it yet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use drill_transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Active,
    Idle,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}

/// Why a session left the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Ttl,
    Idle,
    Invalidated,
    Shutdown,
}

/// Mutable session bookkeeping, guarded by one RwLock. The evictor and the
/// per-session timers both re-verify under the write lock before any
/// transition, which closes the check-then-act window between them.
#[derive(Debug)]
struct SessionMeta {
    state: SessionState,
    last_used_at: Instant,
    /// TTL deadline; `None` = never expires.
    expires_at: Option<Instant>,
    /// Idle deadline, re-armed on every touch; `None` = never.
    idle_expires_at: Option<Instant>,
}

pub struct Session {
    id: String,
    /// Owning VU, empty for pool-mode sessions.
    vu_id: String,
    created_at: Instant,
    ttl: Option<Duration>,
    idle: Option<Duration>,
    connection: Arc<dyn Connection>,
    meta: RwLock<SessionMeta>,
    operation_count: AtomicU64,
    connection_closed: AtomicBool,
}

impl Session {
    pub fn new(
        id: String,
        vu_id: String,
        connection: Arc<dyn Connection>,
        ttl: Option<Duration>,
        idle: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            vu_id,
            created_at: now,
            ttl,
            idle,
            connection,
            meta: RwLock::new(SessionMeta {
                state: SessionState::Active,
                last_used_at: now,
                expires_at: ttl.map(|d| now + d),
                idle_expires_at: idle.map(|d| now + d),
            }),
            operation_count: AtomicU64::new(0),
            connection_closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vu_id(&self) -> &str {
        &self.vu_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn state(&self) -> SessionState {
        self.meta.read().state
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    pub fn record_operation(&self) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot `{state, expires_at, idle_expires_at}` under the read lock —
    /// the evictor's candidate-collection view.
    pub fn expiry_snapshot(&self) -> (SessionState, Option<Instant>, Option<Instant>) {
        let meta = self.meta.read();
        (meta.state, meta.expires_at, meta.idle_expires_at)
    }

    /// Terminal, or past a TTL/idle deadline.
    pub fn is_expired_or_closed(&self) -> bool {
        let now = Instant::now();
        let meta = self.meta.read();
        if meta.state.is_terminal() {
            return true;
        }
        if matches!(meta.expires_at, Some(at) if now >= at) {
            return true;
        }
        // An Active session is being used right now; only its TTL counts.
        if meta.state == SessionState::Idle {
            if matches!(meta.idle_expires_at, Some(at) if now >= at) {
                return true;
            }
        }
        false
    }

    /// Mark active and refresh the deadlines. Fails on terminal states.
    pub fn set_active(&self) -> bool {
        let mut meta = self.meta.write();
        if meta.state.is_terminal() {
            return false;
        }
        meta.state = SessionState::Active;
        touch_locked(&mut meta, self.idle);
        true
    }

    /// Mark idle (released by its holder). Fails on terminal states.
    pub fn set_idle(&self) -> bool {
        let mut meta = self.meta.write();
        if meta.state.is_terminal() {
            return false;
        }
        meta.state = SessionState::Idle;
        touch_locked(&mut meta, self.idle);
        true
    }

    /// Refresh `last_used_at` and re-arm the idle deadline.
    pub fn touch(&self) {
        let mut meta = self.meta.write();
        touch_locked(&mut meta, self.idle);
    }

    /// Attempt the `→ Expired` transition for the given reason, re-verifying
    /// the invariants under the write lock. Returns whether the transition
    /// happened; callers that get `true` own closing the connection.
    pub fn try_expire(&self, reason: EvictReason) -> bool {
        let now = Instant::now();
        let mut meta = self.meta.write();
        if meta.state.is_terminal() {
            return false;
        }
        let eligible = match reason {
            // TTL eviction skips Active sessions until they go idle.
            EvictReason::Ttl => {
                meta.state != SessionState::Active
                    && matches!(meta.expires_at, Some(at) if now >= at)
            }
            // Only idle sessions are eligible for idle eviction.
            EvictReason::Idle => {
                meta.state == SessionState::Idle
                    && matches!(meta.idle_expires_at, Some(at) if now >= at)
            }
            EvictReason::Invalidated | EvictReason::Shutdown => false,
        };
        if !eligible {
            return false;
        }
        meta.state = SessionState::Expired;
        true
    }

    /// Force `→ Closed` from any non-terminal state. Returns whether the
    /// transition happened; callers that get `true` own closing the
    /// connection.
    pub fn mark_closed(&self) -> bool {
        let mut meta = self.meta.write();
        if meta.state.is_terminal() {
            return false;
        }
        meta.state = SessionState::Closed;
        true
    }

    /// Close the underlying connection exactly once, whatever path got here.
    pub async fn close_connection(&self) {
        if self.connection_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.connection.close().await {
            tracing::debug!(session_id = %self.id, error = %err, "error closing session connection");
        }
    }

    #[cfg(test)]
    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

fn touch_locked(meta: &mut SessionMeta, idle: Option<Duration>) {
    let now = Instant::now();
    meta.last_used_at = now;
    meta.idle_expires_at = idle.map(|d| now + d);
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("vu_id", &self.vu_id)
            .field("state", &self.state())
            .field("operation_count", &self.operation_count())
            .finish()
    }
}
