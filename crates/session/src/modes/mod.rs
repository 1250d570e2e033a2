//! The four session acquisition modes behind one dynamic interface.

pub mod churn;
pub mod per_request;
pub mod pool;
pub mod reuse;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drill_domain::error::{Error, Result, SessionOp};
use drill_domain::config::VersionPolicy;
use drill_transport::protocol::initialize_params;
use drill_transport::{Connection, TransportAdapter, TransportConfig};

use crate::session::Session;

/// Counts exposed by every mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeMetrics {
    pub active: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_evicted: u64,
    pub reconnects: u64,
}

/// The mode interface: acquire, release, invalidate, close, metrics.
#[async_trait]
pub trait ModeHandler: Send + Sync {
    async fn acquire(&self, vu_id: &str, cancel: &CancellationToken) -> Result<Arc<Session>>;
    async fn release(&self, session: &Arc<Session>);
    async fn invalidate(&self, session: &Arc<Session>);
    async fn close(&self);
    fn metrics(&self) -> ModeMetrics;
}

/// Shared lifetime counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total_created: AtomicU64,
    pub total_evicted: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }
    pub fn evicted(&self) {
        self.total_evicted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session establishment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every mode creates sessions the same way: connect → initialize → validate
/// the protocol version → send `notifications/initialized`. Any step failing
/// closes the underlying connection and surfaces a session error naming the
/// step.
pub(crate) struct Establisher {
    adapter: Arc<dyn TransportAdapter>,
    config: TransportConfig,
    ttl: Option<Duration>,
    idle: Option<Duration>,
}

impl Establisher {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        config: TransportConfig,
        ttl: Option<Duration>,
        idle: Option<Duration>,
    ) -> Self {
        Self {
            adapter,
            config,
            ttl,
            idle,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn idle(&self) -> Option<Duration> {
        self.idle
    }

    pub async fn establish(&self, vu_id: &str) -> Result<Arc<Session>> {
        let conn = self
            .adapter
            .connect(&self.config)
            .await
            .map_err(|e| Error::session(SessionOp::Connect, e))?;
        let conn: Arc<dyn Connection> = Arc::from(conn);

        let params = initialize_params(&self.config.protocol_version);
        let init = match conn.initialize(params).await {
            Ok(init) => init,
            Err(err) => {
                let _ = conn.close().await;
                return Err(Error::session(SessionOp::Initialize, err));
            }
        };
        if !init.outcome.ok {
            let message = init
                .outcome
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "initialize failed".into());
            let _ = conn.close().await;
            return Err(Error::session(SessionOp::Initialize, message));
        }

        if let Err(message) = negotiate_version(
            self.config.version_policy,
            &self.config.protocol_version,
            init.server_protocol_version.as_deref(),
        ) {
            let _ = conn.close().await;
            return Err(Error::session(SessionOp::VersionNegotiation, message));
        }

        if let Err(err) = conn.send_initialized().await {
            let _ = conn.close().await;
            return Err(Error::session(SessionOp::SendInitialized, err));
        }

        let session_id = conn
            .session_id()
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));
        tracing::debug!(session_id = %session_id, vu_id = %vu_id, "session established");
        Ok(Arc::new(Session::new(
            session_id,
            vu_id.to_owned(),
            conn,
            self.ttl,
            self.idle,
        )))
    }
}

/// Protocol versions are dated strings; ordering is lexicographic.
fn negotiate_version(
    policy: VersionPolicy,
    requested: &str,
    server: Option<&str>,
) -> std::result::Result<(), String> {
    match policy {
        VersionPolicy::None => Ok(()),
        VersionPolicy::Strict => match server {
            Some(v) if v == requested => Ok(()),
            Some(v) => Err(format!("server answered {v}, strict policy requires {requested}")),
            None => Err("server reported no protocol version".into()),
        },
        VersionPolicy::Compatible => match server {
            Some(v) if v >= requested => Ok(()),
            Some(v) => Err(format!("server version {v} is earlier than the minimum {requested}")),
            None => Err("server reported no protocol version".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_transport::testing::MockAdapter;

    pub(crate) fn transport_config() -> TransportConfig {
        TransportConfig {
            url: "http://target.test/rpc".into(),
            request_timeout: Duration::from_secs(5),
            protocol_version: "2025-03-26".into(),
            version_policy: VersionPolicy::Compatible,
            redirect: None,
            headers: vec![],
        }
    }

    #[test]
    fn strict_requires_equality() {
        assert!(negotiate_version(VersionPolicy::Strict, "2025-03-26", Some("2025-03-26")).is_ok());
        assert!(negotiate_version(VersionPolicy::Strict, "2025-03-26", Some("2025-06-18")).is_err());
        assert!(negotiate_version(VersionPolicy::Strict, "2025-03-26", None).is_err());
    }

    #[test]
    fn compatible_accepts_not_earlier() {
        assert!(
            negotiate_version(VersionPolicy::Compatible, "2025-03-26", Some("2025-06-18")).is_ok()
        );
        assert!(
            negotiate_version(VersionPolicy::Compatible, "2025-03-26", Some("2025-03-26")).is_ok()
        );
        assert!(
            negotiate_version(VersionPolicy::Compatible, "2025-03-26", Some("2024-11-05")).is_err()
        );
    }

    #[test]
    fn none_accepts_anything() {
        assert!(negotiate_version(VersionPolicy::None, "2025-03-26", Some("1999-01-01")).is_ok());
        assert!(negotiate_version(VersionPolicy::None, "2025-03-26", None).is_ok());
    }

    #[tokio::test]
    async fn establish_produces_active_session() {
        let adapter = Arc::new(MockAdapter::new());
        let establisher =
            Establisher::new(adapter.clone(), transport_config(), None, None);
        let session = establisher.establish("vu_1").await.unwrap();
        assert_eq!(session.vu_id(), "vu_1");
        assert_eq!(session.state(), crate::session::SessionState::Active);
        assert_eq!(session.id(), "mock-sess-0");
    }

    #[tokio::test]
    async fn establish_connect_failure_names_the_step() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_next_connects(1);
        let establisher = Establisher::new(adapter, transport_config(), None, None);
        let err = establisher.establish("vu_1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session {
                op: SessionOp::Connect,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn establish_version_mismatch_closes_connection() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_server_protocol_version("2024-11-05"); // earlier than requested
        let stats = adapter.stats();
        let establisher = Establisher::new(adapter, transport_config(), None, None);
        let err = establisher.establish("vu_1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session {
                op: SessionOp::VersionNegotiation,
                ..
            }
        ));
        assert_eq!(stats.closes(), 1);
    }
}
