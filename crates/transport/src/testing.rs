//! In-memory transport for tests.
//!
//! Downstream crates (session manager, engine, executor) test against this
//! instead of a live target. Failure injection covers the cases that matter:
//! connect refusal, transport-level operation errors, and protocol-level
//! failures carried in outcomes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use drill_domain::outcome::{ErrorInfo, OperationOutcome, OperationType};

use crate::adapter::{
    Connection, InitializeOutcome, TransportAdapter, TransportConfig, TransportError,
};
use crate::protocol::InitializeParams;

/// Counters shared between a [`MockAdapter`] and the tests observing it.
#[derive(Debug, Default)]
pub struct MockStats {
    pub connects: AtomicU32,
    pub closes: AtomicU32,
    pub operations: AtomicU64,
}

impl MockStats {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }
}

/// Knobs controlling mock behavior. Shared by the adapter and every
/// connection it hands out.
#[derive(Debug)]
struct MockBehavior {
    fail_next_connects: AtomicU32,
    fail_operations: AtomicBool,
    protocol_errors: AtomicBool,
    op_latency: Mutex<Duration>,
    server_protocol_version: Mutex<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_next_connects: AtomicU32::new(0),
            fail_operations: AtomicBool::new(false),
            protocol_errors: AtomicBool::new(false),
            op_latency: Mutex::new(Duration::ZERO),
            server_protocol_version: Mutex::new("2025-03-26".into()),
        }
    }
}

#[derive(Default)]
pub struct MockAdapter {
    stats: Arc<MockStats>,
    behavior: Arc<MockBehavior>,
    next_session: AtomicU64,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.behavior.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// All future operations return a transport error.
    pub fn set_fail_operations(&self, fail: bool) {
        self.behavior.fail_operations.store(fail, Ordering::SeqCst);
    }

    /// All future operations succeed at the wire level but carry a protocol
    /// error in the outcome.
    pub fn set_protocol_errors(&self, fail: bool) {
        self.behavior.protocol_errors.store(fail, Ordering::SeqCst);
    }

    pub fn set_operation_latency(&self, latency: Duration) {
        *self.behavior.op_latency.lock() = latency;
    }

    pub fn set_server_protocol_version(&self, version: impl Into<String>) {
        *self.behavior.server_protocol_version.lock() = version.into();
    }
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    async fn connect(
        &self,
        _config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let remaining = self.behavior.fail_next_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.behavior
                .fail_next_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Http("mock connect refused".into()));
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            stats: self.stats.clone(),
            behavior: self.behavior.clone(),
            assigned_session: format!("mock-sess-{n}"),
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockConnection {
    stats: Arc<MockStats>,
    behavior: Arc<MockBehavior>,
    assigned_session: String,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl MockConnection {
    /// A standalone connection that always succeeds, for direct unit tests.
    pub fn healthy() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            behavior: Arc::new(MockBehavior::default()),
            assigned_session: "mock-sess-0".into(),
            session_id: Mutex::new(Some("mock-sess-0".into())),
            closed: AtomicBool::new(false),
        }
    }

    async fn operate(&self, op: OperationType) -> Result<OperationOutcome, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let latency = *self.behavior.op_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.behavior.fail_operations.load(Ordering::SeqCst) {
            return Err(TransportError::Http("mock operation failure".into()));
        }
        self.stats.operations.fetch_add(1, Ordering::SeqCst);
        let latency_ms = latency.as_millis() as u64;
        if self.behavior.protocol_errors.load(Ordering::SeqCst) {
            return Ok(OperationOutcome::failed(
                op,
                latency_ms,
                ErrorInfo::protocol(Some(-32000), "mock protocol error"),
            ));
        }
        Ok(OperationOutcome::ok(op, latency_ms))
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn initialize(
        &self,
        _params: InitializeParams,
    ) -> Result<InitializeOutcome, TransportError> {
        let outcome = self.operate(OperationType::Initialize).await?;
        if outcome.ok {
            *self.session_id.lock() = Some(self.assigned_session.clone());
        }
        Ok(InitializeOutcome {
            outcome,
            server_protocol_version: Some(self.behavior.server_protocol_version.lock().clone()),
        })
    }

    async fn send_initialized(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.behavior.fail_operations.load(Ordering::SeqCst) {
            return Err(TransportError::Http("mock operation failure".into()));
        }
        Ok(())
    }

    async fn tools_list(&self) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::ToolsList).await
    }

    async fn tools_call(
        &self,
        _name: &str,
        _arguments: Value,
    ) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::ToolsCall).await
    }

    async fn ping(&self) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::Ping).await
    }

    async fn resources_list(&self) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::ResourcesList).await
    }

    async fn resources_read(&self, _uri: &str) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::ResourcesRead).await
    }

    async fn prompts_list(&self) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::PromptsList).await
    }

    async fn prompts_get(
        &self,
        _name: &str,
        _arguments: Option<Value>,
    ) -> Result<OperationOutcome, TransportError> {
        self.operate(OperationType::PromptsGet).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Every call counts so tests can detect double-closes.
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn set_session_id(&self, id: String) {
        *self.session_id.lock() = Some(id);
    }

    fn set_last_event_id(&self, _id: String) {}
}
