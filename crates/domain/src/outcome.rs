//! Operation types and outcomes — the telemetry atom.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operation types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The protocol operations a VU can issue against the target.
///
/// `Initialize` appears in telemetry for session establishment but is not a
/// valid operation-mix entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "initialize")]
    Initialize,
    #[serde(rename = "tools/list")]
    ToolsList,
    #[serde(rename = "tools/call")]
    ToolsCall,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "resources/list")]
    ResourcesList,
    #[serde(rename = "resources/read")]
    ResourcesRead,
    #[serde(rename = "prompts/list")]
    PromptsList,
    #[serde(rename = "prompts/get")]
    PromptsGet,
}

impl OperationType {
    /// The JSON-RPC method name on the wire.
    pub fn method(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::Ping => "ping",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.method())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classified failure carried inside an outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Failure class: `transport`, `protocol`, `http`, `tool`, `session`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

impl ErrorInfo {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: "transport".into(),
            code: None,
            message: message.into(),
        }
    }

    pub fn protocol(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            kind: "protocol".into(),
            code,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: "http".into(),
            code: Some(status as i64),
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self {
            kind: "session".into(),
            code: None,
            message: message.into(),
        }
    }
}

/// Streaming-response detail for SSE-backed operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub event_count: u64,
    pub byte_count: u64,
    /// Milliseconds between the first and last stream event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_duration_ms: Option<u64>,
}

/// Coarse phase breakdown of one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ms: Option<u64>,
}

/// The result of one operation against the target, as observed by the
/// transport. Protocol-level failures are carried inside (`ok == false` with
/// `error` set); connection-level failures never produce an outcome at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation: OperationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_timing: Option<PhaseTiming>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc_error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_info: Option<StreamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl OperationOutcome {
    /// A successful outcome with only the required fields set.
    pub fn ok(operation: OperationType, latency_ms: u64) -> Self {
        Self {
            operation,
            tool_name: None,
            latency_ms,
            first_byte_ms: None,
            phase_timing: None,
            bytes_in: 0,
            bytes_out: 0,
            ok: true,
            error: None,
            http_status: None,
            jsonrpc_error_code: None,
            stream_info: None,
            trace_id: None,
            span_id: None,
        }
    }

    /// A failed outcome carrying the classified error.
    pub fn failed(operation: OperationType, latency_ms: u64, error: ErrorInfo) -> Self {
        let jsonrpc_error_code = (error.kind == "protocol").then_some(error.code).flatten();
        Self {
            error: Some(error),
            ok: false,
            jsonrpc_error_code,
            ..Self::ok(operation, latency_ms)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keys that tie an outcome back to its run, stage, worker, VU, and session.
/// All non-optional fields are required on emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub run_id: String,
    pub execution_id: String,
    pub stage: String,
    pub stage_id: String,
    pub worker_id: String,
    pub vu_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// One VU-observed operation result: the outcome plus its correlation keys.
/// This is what flows over the engine's results channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(flatten)]
    pub correlation: Correlation,
    #[serde(flatten)]
    pub outcome: OperationOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_wire_names() {
        let json = serde_json::to_string(&OperationType::ToolsCall).unwrap();
        assert_eq!(json, "\"tools/call\"");
        let parsed: OperationType = serde_json::from_str("\"resources/read\"").unwrap();
        assert_eq!(parsed, OperationType::ResourcesRead);
    }

    #[test]
    fn failed_outcome_carries_jsonrpc_code() {
        let outcome = OperationOutcome::failed(
            OperationType::ToolsCall,
            12,
            ErrorInfo::protocol(Some(-32601), "method not found"),
        );
        assert!(!outcome.ok);
        assert_eq!(outcome.jsonrpc_error_code, Some(-32601));
    }

    #[test]
    fn http_error_does_not_set_jsonrpc_code() {
        let outcome =
            OperationOutcome::failed(OperationType::Ping, 5, ErrorInfo::http(502, "bad gateway"));
        assert_eq!(outcome.jsonrpc_error_code, None);
        assert_eq!(outcome.error.as_ref().unwrap().code, Some(502));
    }

    #[test]
    fn ok_outcome_omits_optional_fields() {
        let json = serde_json::to_string(&OperationOutcome::ok(OperationType::Ping, 3)).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("stream_info"));
        assert!(!json.contains("tool_name"));
    }

    #[test]
    fn operation_result_flattens() {
        let result = OperationResult {
            correlation: Correlation {
                run_id: "run_0123456789abcdef".into(),
                execution_id: "exe_00000001".into(),
                stage: "baseline".into(),
                stage_id: "stg_001".into(),
                worker_id: "wkr_00000001".into(),
                vu_id: "vu_1".into(),
                session_id: "s1".into(),
                op_id: None,
                attempt: None,
            },
            outcome: OperationOutcome::ok(OperationType::Ping, 1),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["run_id"], "run_0123456789abcdef");
        assert_eq!(value["operation"], "ping");
        assert!(value.get("correlation").is_none());
    }
}
