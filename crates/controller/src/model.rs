use std::time::Instant;

use async_trait::async_trait;
use medsum_gateway::{RateLimitedExecutor, ToolError, UpstreamFailure};
use reqwest::header;
use serde_json::{Value, json};
use tracing::Instrument;

use crate::config::{ModelConfig, ModelProvider};

#[derive(Debug)]
pub enum ModelError {
    Timeout,
    Http(reqwest::Error),
    BadStatus { status: u16, body: String },
    InvalidResponse(String),
    MaxTurnsExceeded(u32),
    Tool(ToolError),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Timeout => write!(f, "model request timed out"),
            ModelError::Http(err) => write!(f, "model HTTP error: {}", err),
            ModelError::BadStatus { status, body } => {
                write!(f, "model returned status {}: {}", status, body)
            }
            ModelError::InvalidResponse(reason) => write!(f, "invalid model response: {}", reason),
            ModelError::MaxTurnsExceeded(turns) => {
                write!(f, "model did not finish within {} turns", turns)
            }
            ModelError::Tool(err) => write!(f, "tool call failed: {}", err),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(value)
        }
    }
}

impl UpstreamFailure for ModelError {
    fn status_code(&self) -> Option<u16> {
        match self {
            ModelError::BadStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_rate_limited(&self) -> bool {
        matches!(self, ModelError::BadStatus { status: 429, .. })
    }
}

/// A function the model may call during a stage.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSettings {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub parallel_tool_calls: bool,
}

pub struct StageRequest<'a> {
    pub stage: &'a str,
    pub instructions: &'a str,
    pub input: &'a Value,
    pub tools: &'a [ToolSpec],
    pub settings: StageSettings,
    pub max_turns: u32,
}

/// Executes one named tool call on the model's behalf.
///
/// `Ok` text goes back to the model, including refusals for unknown tools or
/// bad arguments. `Err` aborts the stage.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<String, ToolError>;
}

/// Runs one stage to completion and returns the model's final text.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn run(
        &self,
        request: StageRequest<'_>,
        tools: &dyn ToolInvoker,
    ) -> Result<String, ModelError>;
}

/// OpenAI-compatible chat completions with a sequential tool loop.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    config: ModelConfig,
    http: reqwest::Client,
    executor: RateLimitedExecutor,
}

impl ChatCompletionsClient {
    pub fn new(config: ModelConfig, executor: RateLimitedExecutor) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ModelError::Http)?;

        Ok(Self {
            config,
            http,
            executor,
        })
    }

    fn completions_url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        match self.config.provider {
            ModelProvider::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, self.config.deployment, self.config.api_version
            ),
            ModelProvider::OpenAi => format!("{}/chat/completions", base),
        }
    }

    async fn complete(&self, body: &Value) -> Result<Value, ModelError> {
        self.executor.run(|| self.send(body)).await
    }

    async fn send(&self, body: &Value) -> Result<Value, ModelError> {
        let mut request = self.http.post(self.completions_url()).json(body);
        if let Some(key) = self.config.api_key.as_ref() {
            request = match self.config.provider {
                ModelProvider::Azure => request.header("api-key", key),
                ModelProvider::OpenAi => request.header(header::AUTHORIZATION, format!("Bearer {}", key)),
            };
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::BadStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|_| ModelError::InvalidResponse("body is not JSON".to_string()))
    }

    fn request_body(&self, request: &StageRequest<'_>, messages: &[Value]) -> Value {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "messages": messages,
            "temperature": request.settings.temperature,
            "top_p": request.settings.top_p,
            "max_tokens": request.settings.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
            body["parallel_tool_calls"] = json!(request.settings.parallel_tool_calls);
        }
        if self.config.provider == ModelProvider::OpenAi {
            body["model"] = json!(self.config.deployment);
        }
        body
    }
}

#[async_trait]
impl ModelClient for ChatCompletionsClient {
    async fn run(
        &self,
        request: StageRequest<'_>,
        tools: &dyn ToolInvoker,
    ) -> Result<String, ModelError> {
        let mut messages = vec![
            json!({"role": "system", "content": request.instructions}),
            json!({"role": "user", "content": request.input.to_string()}),
        ];

        for turn in 1..=request.max_turns {
            let span = tracing::info_span!(
                "model.turn",
                stage = %request.stage,
                turn,
                tool_calls = tracing::field::Empty,
                latency_ms = tracing::field::Empty,
                outcome = tracing::field::Empty,
            );
            let started = Instant::now();

            let body = self.request_body(&request, &messages);
            let response = self
                .complete(&body)
                .instrument(span.clone())
                .await;
            span.record("latency_ms", started.elapsed().as_millis() as u64);
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    span.record("outcome", "error");
                    return Err(err);
                }
            };

            let message = response
                .pointer("/choices/0/message")
                .cloned()
                .ok_or_else(|| ModelError::InvalidResponse("no choices".to_string()))?;
            let tool_calls = message
                .get("tool_calls")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            span.record("tool_calls", tool_calls.len() as u64);

            if tool_calls.is_empty() {
                span.record("outcome", "final");
                return message
                    .get("content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| ModelError::InvalidResponse("empty final message".to_string()));
            }
            span.record("outcome", "tool_calls");

            messages.push(json!({
                "role": "assistant",
                "content": message.get("content").cloned().unwrap_or(Value::Null),
                "tool_calls": tool_calls,
            }));

            for call in &tool_calls {
                let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let raw_args = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or("{}");

                let output = match serde_json::from_str::<Value>(raw_args) {
                    Ok(arguments) => tools.invoke(name, arguments).await.map_err(ModelError::Tool)?,
                    Err(_) => format!("error: arguments for {} are not valid JSON", name),
                };

                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": output,
                }));
            }
        }

        Err(ModelError::MaxTurnsExceeded(request.max_turns))
    }
}
