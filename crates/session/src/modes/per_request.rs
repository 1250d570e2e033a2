//! Per-request mode: a fresh session for every acquire, closed on release.
//! No shared state beyond the counters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result};

use crate::session::Session;

use super::{Counters, Establisher, ModeHandler, ModeMetrics};

pub struct PerRequestHandler {
    establisher: Establisher,
    counters: Counters,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl PerRequestHandler {
    pub(crate) fn new(establisher: Establisher) -> Self {
        Self {
            establisher,
            counters: Counters::default(),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ModeHandler for PerRequestHandler {
    async fn acquire(&self, vu_id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }
        let session = tokio::select! {
            result = self.establisher.establish(vu_id) => result?,
            _ = cancel.cancelled() => return Err(Error::Other("acquire cancelled".into())),
        };
        self.counters.created();
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn release(&self, session: &Arc<Session>) {
        session.mark_closed();
        session.close_connection().await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn invalidate(&self, session: &Arc<Session>) {
        session.mark_closed();
        session.close_connection().await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.counters.reconnect();
    }

    async fn close(&self) {
        // Outstanding sessions belong to their holders; each release closes
        // its own connection.
        self.closed.store(true, Ordering::SeqCst);
    }

    fn metrics(&self) -> ModeMetrics {
        ModeMetrics {
            active: self.outstanding.load(Ordering::SeqCst),
            idle: 0,
            total_created: self.counters.total_created.load(Ordering::Relaxed),
            total_evicted: self.counters.total_evicted.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }
}
