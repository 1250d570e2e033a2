//! The transport adapter boundary consumed by the session manager.
//!
//! A [`TransportAdapter`] turns a [`TransportConfig`] into a live
//! [`Connection`]; a connection exposes one method per protocol operation.
//! Protocol-level failures (JSON-RPC errors, tool `isError` results, bad HTTP
//! statuses) are carried *inside* the returned [`OperationOutcome`];
//! connection-level failures surface as [`TransportError`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use drill_domain::config::{
    OperationMixEntry, RedirectMode, RedirectPolicy, TargetConfig, VersionPolicy,
};
use drill_domain::outcome::{OperationOutcome, OperationType};

use crate::protocol::InitializeParams;

/// Errors that can occur at the connection level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection is closed")]
    Closed,

    #[error("malformed stream: {0}")]
    Stream(String),
}

impl TransportError {
    pub fn http(err: impl std::fmt::Display) -> Self {
        Self::Http(err.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the adapter needs to reach one target.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub protocol_version: String,
    pub version_policy: VersionPolicy,
    pub redirect: Option<RedirectPolicy>,
    /// Pre-expanded identification headers (`(name, value)` pairs).
    pub headers: Vec<(String, String)>,
}

impl TransportConfig {
    /// Build a transport config from a target, expanding `${run_id}` in the
    /// identification templates.
    pub fn from_target(target: &TargetConfig, run_id: &str) -> Self {
        let mut headers = Vec::new();
        if let Some(ident) = &target.identification {
            if let Some(h) = &ident.run_id_header {
                headers.push((h.name.clone(), h.value_template.replace("${run_id}", run_id)));
            }
            if let Some(ua) = &ident.user_agent {
                headers.push(("User-Agent".into(), ua.value.replace("${run_id}", run_id)));
            }
        }
        Self {
            url: target.url.clone(),
            request_timeout: Duration::from_millis(target.request_timeout_ms),
            protocol_version: target.protocol_version.clone(),
            version_policy: target.version_policy,
            redirect: target.redirect_policy.clone(),
            headers,
        }
    }

    /// Whether redirects are followed at all under this config.
    pub fn follows_redirects(&self) -> bool {
        match &self.redirect {
            Some(policy) => policy.mode != RedirectMode::Deny && policy.max_redirects > 0,
            None => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter & connection traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of the `initialize` call: the wire outcome plus the fields the
/// session manager needs for version negotiation.
#[derive(Debug, Clone)]
pub struct InitializeOutcome {
    pub outcome: OperationOutcome,
    /// The protocol version the server answered with, when parseable.
    pub server_protocol_version: Option<String>,
}

/// Factory for connections against one target.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One initialized (or initializing) protocol conversation.
///
/// Methods may be invoked concurrently from the same VU when
/// `in_flight_per_vu > 1`; implementations must be internally synchronized.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn initialize(
        &self,
        params: InitializeParams,
    ) -> Result<InitializeOutcome, TransportError>;

    /// Send the `notifications/initialized` notification.
    async fn send_initialized(&self) -> Result<(), TransportError>;

    async fn tools_list(&self) -> Result<OperationOutcome, TransportError>;

    async fn tools_call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<OperationOutcome, TransportError>;

    async fn ping(&self) -> Result<OperationOutcome, TransportError>;

    async fn resources_list(&self) -> Result<OperationOutcome, TransportError>;

    async fn resources_read(&self, uri: &str) -> Result<OperationOutcome, TransportError>;

    async fn prompts_list(&self) -> Result<OperationOutcome, TransportError>;

    async fn prompts_get(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<OperationOutcome, TransportError>;

    /// Close the connection. Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    fn session_id(&self) -> Option<String>;
    fn set_session_id(&self, id: String);
    fn set_last_event_id(&self, id: String);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operation dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully resolved operation ready to execute — a mix entry after template
/// resolution.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub op: OperationType,
    pub tool_name: Option<String>,
    pub arguments: Option<Value>,
    pub uri: Option<String>,
    pub prompt_name: Option<String>,
}

impl From<&OperationMixEntry> for OperationSpec {
    fn from(entry: &OperationMixEntry) -> Self {
        Self {
            op: entry.op,
            tool_name: entry.tool_name.clone(),
            arguments: entry.arguments.clone(),
            uri: entry.uri.clone(),
            prompt_name: entry.prompt_name.clone(),
        }
    }
}

/// Dispatch one operation to the matching connection method.
///
/// Missing operation parameters (a `tools/call` without a tool name slips
/// past a mis-validated config) produce a failed outcome rather than a
/// transport error so the VU loop keeps going.
pub async fn execute_operation(
    conn: &dyn Connection,
    spec: &OperationSpec,
) -> Result<OperationOutcome, TransportError> {
    use drill_domain::outcome::ErrorInfo;

    match spec.op {
        OperationType::ToolsList => conn.tools_list().await,
        OperationType::Ping => conn.ping().await,
        OperationType::ResourcesList => conn.resources_list().await,
        OperationType::PromptsList => conn.prompts_list().await,
        OperationType::ToolsCall => match &spec.tool_name {
            Some(name) => {
                let args = spec.arguments.clone().unwrap_or(Value::Null);
                let mut outcome = conn.tools_call(name, args).await?;
                outcome.tool_name = Some(name.clone());
                Ok(outcome)
            }
            None => Ok(OperationOutcome::failed(
                spec.op,
                0,
                ErrorInfo::protocol(None, "tools/call entry has no tool name"),
            )),
        },
        OperationType::ResourcesRead => match &spec.uri {
            Some(uri) => conn.resources_read(uri).await,
            None => Ok(OperationOutcome::failed(
                spec.op,
                0,
                ErrorInfo::protocol(None, "resources/read entry has no URI"),
            )),
        },
        OperationType::PromptsGet => match &spec.prompt_name {
            Some(name) => conn.prompts_get(name, spec.arguments.clone()).await,
            None => Ok(OperationOutcome::failed(
                spec.op,
                0,
                ErrorInfo::protocol(None, "prompts/get entry has no prompt name"),
            )),
        },
        OperationType::Initialize => Ok(OperationOutcome::failed(
            spec.op,
            0,
            ErrorInfo::protocol(None, "initialize is not a dispatchable mix operation"),
        )),
    }
}
