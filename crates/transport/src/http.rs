//! Streamable-HTTP transport: one JSON-RPC request per HTTP POST.
//!
//! The server assigns a session via the `Mcp-Session-Id` response header on
//! `initialize`; every later request replays it. Responses arrive either as
//! plain JSON or as an SSE stream; for streams, the call completes when a
//! `message` event carries the JSON-RPC response matching the request id.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use drill_domain::config::{RedirectMode, RedirectPolicy};
use drill_domain::outcome::{ErrorInfo, OperationOutcome, OperationType, PhaseTiming, StreamInfo};

use crate::adapter::{
    Connection, InitializeOutcome, TransportAdapter, TransportConfig, TransportError,
};
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ToolCallResult,
};
use crate::sse::SseParser;

const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapter producing [`HttpConnection`]s. All connections from one adapter
/// share a single `reqwest::Client` (and therefore its connection pool).
#[derive(Default)]
pub struct StreamableHttpAdapter {
    client: Mutex<Option<reqwest::Client>>,
}

impl StreamableHttpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, config: &TransportConfig) -> Result<reqwest::Client, TransportError> {
        let mut guard = self.client.lock();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(config.redirect.as_ref()))
            .timeout(config.request_timeout)
            .build()
            .map_err(TransportError::http)?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

fn redirect_policy(policy: Option<&RedirectPolicy>) -> reqwest::redirect::Policy {
    use reqwest::redirect::Policy;

    let Some(policy) = policy else {
        return Policy::none();
    };
    if policy.max_redirects == 0 || policy.mode == RedirectMode::Deny {
        return Policy::none();
    }

    let max = policy.max_redirects as usize;
    match policy.mode {
        RedirectMode::Deny => Policy::none(),
        RedirectMode::SameOrigin => Policy::custom(move |attempt| {
            if attempt.previous().len() > max {
                return attempt.error("too many redirects");
            }
            let first = &attempt.previous()[0];
            let next = attempt.url();
            let same_origin = first.scheme() == next.scheme()
                && first.host_str() == next.host_str()
                && first.port_or_known_default() == next.port_or_known_default();
            if same_origin {
                attempt.follow()
            } else {
                attempt.error("cross-origin redirect denied")
            }
        }),
        RedirectMode::AllowlistOnly => {
            let allowed = policy.allowed_hosts.clone();
            Policy::custom(move |attempt| {
                if attempt.previous().len() > max {
                    return attempt.error("too many redirects");
                }
                let host = attempt.url().host_str().unwrap_or_default().to_owned();
                if allowed.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
                    attempt.follow()
                } else {
                    attempt.error("redirect host not in allowlist")
                }
            })
        }
    }
}

#[async_trait]
impl TransportAdapter for StreamableHttpAdapter {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let client = self.client_for(config)?;
        Ok(Box::new(HttpConnection {
            client,
            config: config.clone(),
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            last_event_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpConnection {
    client: reqwest::Client,
    config: TransportConfig,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

/// What one wire exchange produced: the outcome plus the parsed result for
/// callers that need the payload (initialize).
struct Exchange {
    outcome: OperationOutcome,
    result: Option<Value>,
}

impl HttpConnection {
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build_request(
        &self,
        body: Vec<u8>,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);
        if let Some(sid) = self.session_id.lock().as_deref() {
            req = req.header(SESSION_ID_HEADER, sid);
        }
        if let Some(eid) = self.last_event_id.lock().as_deref() {
            req = req.header(LAST_EVENT_ID_HEADER, eid);
        }
        for (name, value) in &self.config.headers {
            req = req.header(name, value);
        }
        Ok(req)
    }

    /// Send one JSON-RPC request and wait for its response.
    async fn send_request(
        &self,
        operation: OperationType,
        method: &str,
        params: Option<Value>,
    ) -> Result<Exchange, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.next_request_id();
        let body = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))?;
        let bytes_out = body.len() as u64;

        let start = Instant::now();
        let response = self
            .build_request(body)?
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let headers_at = start.elapsed();

        // The server may assign or rotate the session on any response.
        if let Some(sid) = header_str(&response, SESSION_ID_HEADER) {
            *self.session_id.lock() = Some(sid);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map_err(classify_reqwest_error)?;
            let mut outcome = OperationOutcome::failed(
                operation,
                start.elapsed().as_millis() as u64,
                ErrorInfo::http(status.as_u16(), format!("HTTP {status}")),
            );
            outcome.http_status = Some(status.as_u16());
            outcome.bytes_in = body.len() as u64;
            outcome.bytes_out = bytes_out;
            return Ok(Exchange {
                outcome,
                result: None,
            });
        }

        let content_type = header_str(&response, "Content-Type").unwrap_or_default();
        let mut exchange = if content_type.starts_with("text/event-stream") {
            self.read_stream_response(operation, id, response, start)
                .await?
        } else {
            read_json_response(operation, id, response, start, headers_at).await?
        };
        exchange.outcome.bytes_out = bytes_out;
        exchange.outcome.http_status = Some(status.as_u16());
        Ok(exchange)
    }

    /// Consume an SSE body until the matching response id arrives.
    async fn read_stream_response(
        &self,
        operation: OperationType,
        id: u64,
        response: reqwest::Response,
        start: Instant,
    ) -> Result<Exchange, TransportError> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut first_byte_ms = None;
        let mut first_event_at = None;
        let mut event_count = 0u64;
        let mut byte_count = 0u64;
        let mut matched: Option<JsonRpcResponse> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_reqwest_error)?;
            if first_byte_ms.is_none() {
                first_byte_ms = Some(start.elapsed().as_millis() as u64);
            }
            byte_count += chunk.len() as u64;

            for event in parser.feed(&chunk) {
                event_count += 1;
                if first_event_at.is_none() {
                    first_event_at = Some(start.elapsed());
                }
                if let Some(eid) = &event.id {
                    *self.last_event_id.lock() = Some(eid.clone());
                }
                if event.event != "message" {
                    continue;
                }
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    if resp.id == id {
                        matched = Some(resp);
                        break;
                    }
                    tracing::debug!(
                        expected_id = id,
                        got_id = resp.id,
                        "skipping response for different request on stream"
                    );
                }
            }
            if matched.is_some() {
                break;
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let stream_duration_ms = first_event_at.map(|at| (start.elapsed() - at).as_millis() as u64);
        let stream_info = StreamInfo {
            event_count,
            byte_count,
            stream_duration_ms,
        };

        let Some(resp) = matched else {
            let mut outcome = OperationOutcome::failed(
                operation,
                latency_ms,
                ErrorInfo::protocol(None, "stream ended before a matching response"),
            );
            outcome.first_byte_ms = first_byte_ms;
            outcome.bytes_in = byte_count;
            outcome.stream_info = Some(stream_info);
            return Ok(Exchange {
                outcome,
                result: None,
            });
        };

        let mut exchange = response_to_exchange(operation, resp, latency_ms);
        exchange.outcome.first_byte_ms = first_byte_ms;
        exchange.outcome.bytes_in = byte_count;
        exchange.outcome.stream_info = Some(stream_info);
        Ok(exchange)
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(err.to_string())
    }
}

async fn read_json_response(
    operation: OperationType,
    id: u64,
    response: reqwest::Response,
    start: Instant,
    headers_at: std::time::Duration,
) -> Result<Exchange, TransportError> {
    let body = response.bytes().await.map_err(classify_reqwest_error)?;
    let latency_ms = start.elapsed().as_millis() as u64;
    let first_byte_ms = headers_at.as_millis() as u64;

    let resp: JsonRpcResponse = match serde_json::from_slice(&body) {
        Ok(resp) => resp,
        Err(err) => {
            let mut outcome = OperationOutcome::failed(
                operation,
                latency_ms,
                ErrorInfo::protocol(None, format!("unparseable response body: {err}")),
            );
            outcome.bytes_in = body.len() as u64;
            outcome.first_byte_ms = Some(first_byte_ms);
            return Ok(Exchange {
                outcome,
                result: None,
            });
        }
    };

    if resp.id != id {
        let mut outcome = OperationOutcome::failed(
            operation,
            latency_ms,
            ErrorInfo::protocol(None, format!("response id {} != request id {id}", resp.id)),
        );
        outcome.bytes_in = body.len() as u64;
        return Ok(Exchange {
            outcome,
            result: None,
        });
    }

    let mut exchange = response_to_exchange(operation, resp, latency_ms);
    exchange.outcome.bytes_in = body.len() as u64;
    exchange.outcome.first_byte_ms = Some(first_byte_ms);
    exchange.outcome.phase_timing = Some(PhaseTiming {
        send_ms: Some(first_byte_ms),
        first_byte_ms: Some(first_byte_ms),
        read_ms: Some(latency_ms.saturating_sub(first_byte_ms)),
    });
    Ok(exchange)
}

/// Fold a parsed JSON-RPC response into an outcome.
fn response_to_exchange(
    operation: OperationType,
    resp: JsonRpcResponse,
    latency_ms: u64,
) -> Exchange {
    if let Some(err) = resp.error {
        let outcome = OperationOutcome::failed(
            operation,
            latency_ms,
            ErrorInfo::protocol(Some(err.code), err.message),
        );
        return Exchange {
            outcome,
            result: None,
        };
    }

    let result = resp.result.unwrap_or(Value::Null);

    // A tools/call can fail at the tool level while the RPC succeeds.
    if operation == OperationType::ToolsCall {
        if let Ok(call) = serde_json::from_value::<ToolCallResult>(result.clone()) {
            if call.is_error {
                let mut outcome = OperationOutcome::failed(
                    operation,
                    latency_ms,
                    ErrorInfo {
                        kind: "tool".into(),
                        code: None,
                        message: "tool reported isError".into(),
                    },
                );
                outcome.jsonrpc_error_code = None;
                return Exchange {
                    outcome,
                    result: Some(result),
                };
            }
        }
    }

    Exchange {
        outcome: OperationOutcome::ok(operation, latency_ms),
        result: Some(result),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection trait impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl Connection for HttpConnection {
    async fn initialize(
        &self,
        params: InitializeParams,
    ) -> Result<InitializeOutcome, TransportError> {
        let params_value = serde_json::to_value(&params)?;
        let exchange = self
            .send_request(OperationType::Initialize, "initialize", Some(params_value))
            .await?;

        let server_protocol_version = exchange
            .result
            .as_ref()
            .and_then(|v| serde_json::from_value::<InitializeResult>(v.clone()).ok())
            .map(|r| r.protocol_version);

        Ok(InitializeOutcome {
            outcome: exchange.outcome,
            server_protocol_version,
        })
    }

    async fn send_initialized(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let body = serde_json::to_vec(&JsonRpcNotification::new("notifications/initialized"))?;
        let response = self
            .build_request(body)?
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        // 202 Accepted is the expected answer for a notification.
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "notifications/initialized returned HTTP {status}"
            )));
        }
        Ok(())
    }

    async fn tools_list(&self) -> Result<OperationOutcome, TransportError> {
        let exchange = self
            .send_request(OperationType::ToolsList, "tools/list", None)
            .await?;
        Ok(exchange.outcome)
    }

    async fn tools_call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<OperationOutcome, TransportError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let exchange = self
            .send_request(OperationType::ToolsCall, "tools/call", Some(params))
            .await?;
        Ok(exchange.outcome)
    }

    async fn ping(&self) -> Result<OperationOutcome, TransportError> {
        let exchange = self.send_request(OperationType::Ping, "ping", None).await?;
        Ok(exchange.outcome)
    }

    async fn resources_list(&self) -> Result<OperationOutcome, TransportError> {
        let exchange = self
            .send_request(OperationType::ResourcesList, "resources/list", None)
            .await?;
        Ok(exchange.outcome)
    }

    async fn resources_read(&self, uri: &str) -> Result<OperationOutcome, TransportError> {
        let params = serde_json::json!({ "uri": uri });
        let exchange = self
            .send_request(OperationType::ResourcesRead, "resources/read", Some(params))
            .await?;
        Ok(exchange.outcome)
    }

    async fn prompts_list(&self) -> Result<OperationOutcome, TransportError> {
        let exchange = self
            .send_request(OperationType::PromptsList, "prompts/list", None)
            .await?;
        Ok(exchange.outcome)
    }

    async fn prompts_get(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<OperationOutcome, TransportError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        let exchange = self
            .send_request(OperationType::PromptsGet, "prompts/get", Some(params))
            .await?;
        Ok(exchange.outcome)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // already closed
        }
        // Best-effort session teardown; the server may not support DELETE.
        let sid = self.session_id.lock().clone();
        if let Some(sid) = sid {
            let result = self
                .client
                .delete(&self.config.url)
                .header(SESSION_ID_HEADER, &sid)
                .send()
                .await;
            if let Err(err) = result {
                tracing::debug!(error = %err, "session DELETE failed during close");
            }
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn set_session_id(&self, id: String) {
        *self.session_id.lock() = Some(id);
    }

    fn set_last_event_id(&self, id: String) {
        *self.last_event_id.lock() = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcError;

    fn response(id: u64, result: Option<Value>, error: Option<JsonRpcError>) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result,
            error,
        }
    }

    #[test]
    fn rpc_error_becomes_failed_protocol_outcome() {
        let resp = response(
            1,
            None,
            Some(JsonRpcError {
                code: -32601,
                message: "nope".into(),
                data: None,
            }),
        );
        let exchange = response_to_exchange(OperationType::ToolsList, resp, 9);
        assert!(!exchange.outcome.ok);
        assert_eq!(exchange.outcome.jsonrpc_error_code, Some(-32601));
    }

    #[test]
    fn tool_is_error_fails_the_outcome() {
        let result = serde_json::json!({
            "content": [{ "type": "text", "text": "denied" }],
            "isError": true
        });
        let resp = response(3, Some(result), None);
        let exchange = response_to_exchange(OperationType::ToolsCall, resp, 4);
        assert!(!exchange.outcome.ok);
        assert_eq!(exchange.outcome.error.as_ref().unwrap().kind, "tool");
        // The payload is still available to callers.
        assert!(exchange.result.is_some());
    }

    #[test]
    fn successful_exchange_keeps_result() {
        let resp = response(7, Some(serde_json::json!({ "tools": [] })), None);
        let exchange = response_to_exchange(OperationType::ToolsList, resp, 2);
        assert!(exchange.outcome.ok);
        assert_eq!(exchange.result.unwrap()["tools"], serde_json::json!([]));
    }

    #[test]
    fn redirect_policy_defaults_to_deny() {
        // No policy configured means no redirects are followed; this only
        // checks the mapping is total over the enum.
        let _ = redirect_policy(None);
        let _ = redirect_policy(Some(&RedirectPolicy {
            mode: RedirectMode::Deny,
            max_redirects: 3,
            allowed_hosts: vec![],
        }));
        let _ = redirect_policy(Some(&RedirectPolicy {
            mode: RedirectMode::SameOrigin,
            max_redirects: 3,
            allowed_hosts: vec![],
        }));
        let _ = redirect_policy(Some(&RedirectPolicy {
            mode: RedirectMode::AllowlistOnly,
            max_redirects: 3,
            allowed_hosts: vec!["cdn.example.com".into()],
        }));
    }
}
