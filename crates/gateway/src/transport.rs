use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use medsum_contracts::AuthorizationContext;
use reqwest::{StatusCode, header};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::rate_limit::UpstreamFailure;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug)]
pub enum ToolError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(StatusCode),
    Protocol(String),
    ToolReported { tool: String },
    EmptyContent { tool: String },
    InvalidContent { tool: String, snippet: String },
    Upstream { tool: String, message: String },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Timeout => write!(f, "tool server request timed out"),
            ToolError::Http(err) => write!(f, "tool server HTTP error: {}", err),
            ToolError::BadStatus(status) => write!(f, "tool server returned status {}", status),
            ToolError::Protocol(message) => write!(f, "tool server protocol error: {}", message),
            ToolError::ToolReported { tool } => write!(f, "tool {} returned an error", tool),
            ToolError::EmptyContent { tool } => write!(f, "tool {} returned empty content", tool),
            ToolError::InvalidContent { tool, snippet } => {
                write!(f, "tool {} returned invalid JSON: {}", tool, snippet)
            }
            ToolError::Upstream { tool, message } => write!(f, "{} failed: {}", tool, message),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<reqwest::Error> for ToolError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ToolError::Timeout
        } else {
            ToolError::Http(value)
        }
    }
}

impl UpstreamFailure for ToolError {
    fn status_code(&self) -> Option<u16> {
        match self {
            ToolError::BadStatus(status) => Some(status.as_u16()),
            _ => None,
        }
    }
}

/// Decoded `tools/call` result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallResult {
    pub is_error: bool,
    pub content: Vec<Value>,
}

impl ToolCallResult {
    /// Non-blank text parts joined by newlines.
    pub fn text(&self) -> Option<String> {
        let parts = self
            .content
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError>;

    async fn cleanup(&self) -> Result<(), ToolError>;
}

/// Opens a transport scoped to one authorization context.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(
        &self,
        context: &AuthorizationContext,
    ) -> Result<Arc<dyn ToolTransport>, ToolError>;
}

#[derive(Clone)]
pub struct HttpToolConnector {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpToolConnector {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ToolError::Http)?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl ToolConnector for HttpToolConnector {
    async fn connect(
        &self,
        context: &AuthorizationContext,
    ) -> Result<Arc<dyn ToolTransport>, ToolError> {
        Ok(Arc::new(HttpToolTransport {
            endpoint: self.endpoint.clone(),
            http: self.http.clone(),
            bearer: context.session_token().to_string(),
            duz: context.user_site_identifier().to_string(),
            station: context.site_id().to_string(),
            session: Mutex::new(SessionState::default()),
            next_id: AtomicU64::new(1),
        }))
    }
}

#[derive(Default)]
struct SessionState {
    initialized: bool,
    session_id: Option<String>,
}

/// JSON-RPC over streamable HTTP. The session is opened lazily on the first
/// tool call.
pub struct HttpToolTransport {
    endpoint: String,
    http: reqwest::Client,
    bearer: String,
    duz: String,
    station: String,
    session: Mutex<SessionState>,
    next_id: AtomicU64,
}

impl HttpToolTransport {
    async fn ensure_session(&self) -> Result<Option<String>, ToolError> {
        let mut session = self.session.lock().await;
        if session.initialized {
            return Ok(session.session_id.clone());
        }

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "medsum", "version": env!("CARGO_PKG_VERSION")},
        });
        let (session_id, _) = self.request("initialize", params, None).await?;

        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        self.post(&notification, session_id.as_deref()).await?;

        tracing::debug!(
            session = if session_id.is_some() { "present" } else { "missing" },
            "gateway.tool_session_opened"
        );
        session.initialized = true;
        session.session_id = session_id.clone();
        Ok(session_id)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<(Option<String>, Value), ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (session_header, message) = self.post(&body, session_id).await?;
        let message = message
            .ok_or_else(|| ToolError::Protocol(format!("{} returned no message", method)))?;

        if let Some(error) = message.get("error") {
            let detail = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(ToolError::Protocol(format!("{}: {}", method, detail)));
        }

        let result = message
            .get("result")
            .cloned()
            .ok_or_else(|| ToolError::Protocol(format!("{} response has no result", method)))?;
        Ok((session_header.or_else(|| session_id.map(str::to_string)), result))
    }

    async fn post(
        &self,
        body: &Value,
        session_id: Option<&str>,
    ) -> Result<(Option<String>, Option<Value>), ToolError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.bearer)
            .header("X-Vista-DUZ", &self.duz)
            .header("X-Vista-Station", &self.station)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::BadStatus(status));
        }

        let session_header = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok((session_header, None));
        }

        let message = if is_event_stream {
            parse_event_stream(&text)
                .ok_or_else(|| ToolError::Protocol("event stream carried no message".into()))?
        } else {
            serde_json::from_str::<Value>(&text)
                .map_err(|_| ToolError::Protocol("response body is not JSON".into()))?
        };
        Ok((session_header, Some(message)))
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
        let session_id = self.ensure_session().await?;
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let (_, result) = self
            .request("tools/call", params, session_id.as_deref())
            .await?;

        Ok(ToolCallResult {
            is_error: result
                .get("isError")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            content: result
                .get("content")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn cleanup(&self) -> Result<(), ToolError> {
        let session_id = {
            let mut session = self.session.lock().await;
            let session_id = session.session_id.take();
            session.initialized = false;
            session_id
        };
        let Some(session_id) = session_id else {
            return Ok(());
        };

        let response = self
            .http
            .delete(&self.endpoint)
            .bearer_auth(&self.bearer)
            .header(SESSION_HEADER, &session_id)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        Err(ToolError::BadStatus(status))
    }
}

/// Returns the last JSON-RPC message found in an SSE body.
fn parse_event_stream(body: &str) -> Option<Value> {
    let mut last = None;
    let mut data = String::new();

    let mut flush = |data: &mut String| {
        if data.is_empty() {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data)
            && (value.get("result").is_some() || value.get("error").is_some())
        {
            last = Some(value);
        }
        data.clear();
    };

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            flush(&mut data);
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    flush(&mut data);

    last
}

/// Owns a tool transport for one pipeline run. Dropping an open session
/// schedules cleanup on the current runtime.
pub struct ToolSession {
    transport: Arc<dyn ToolTransport>,
    closed: bool,
}

impl ToolSession {
    pub fn new(transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            transport,
            closed: false,
        }
    }

    pub fn transport(&self) -> Arc<dyn ToolTransport> {
        self.transport.clone()
    }

    pub async fn close(mut self) {
        self.closed = true;
        if let Err(err) = self.transport.cleanup().await {
            tracing::warn!(error = %err, "gateway.tool_cleanup_failed");
        }
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = transport.cleanup().await {
                        tracing::warn!(error = %err, "gateway.tool_cleanup_failed");
                    }
                });
            }
            Err(_) => tracing::warn!("gateway.tool_cleanup_skipped"),
        }
    }
}
