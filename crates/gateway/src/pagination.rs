use serde_json::{Map, Value};
use tracing::Instrument;

use crate::rate_limit::RateLimitedExecutor;
use crate::transport::{ToolError, ToolTransport};

#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub tool_name: &'a str,
    pub base_args: Map<String, Value>,
    pub item_key: &'a str,
    pub page_size: usize,
    pub max_pages: usize,
}

/// One tool call through the executor, decoded into the tool's JSON payload.
///
/// `isError`, empty content, non-JSON content and `success: false` are all
/// [`ToolError`]s. An empty page is not.
pub async fn call_tool_json(
    transport: &dyn ToolTransport,
    executor: &RateLimitedExecutor,
    tool_name: &str,
    arguments: Value,
) -> Result<Map<String, Value>, ToolError> {
    let span = tracing::debug_span!("gateway.tool_call", tool = %tool_name);
    let result = executor
        .run(|| transport.call_tool(tool_name, arguments.clone()))
        .instrument(span)
        .await?;

    if result.is_error {
        return Err(ToolError::ToolReported {
            tool: tool_name.to_string(),
        });
    }

    let text = result.text().ok_or_else(|| ToolError::EmptyContent {
        tool: tool_name.to_string(),
    })?;

    let payload = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        _ => {
            return Err(ToolError::InvalidContent {
                tool: tool_name.to_string(),
                snippet: text.chars().take(200).collect(),
            });
        }
    };

    if payload.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let message = payload
            .get("error")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("tool reported failure");
        return Err(ToolError::Upstream {
            tool: tool_name.to_string(),
            message: message.to_string(),
        });
    }

    Ok(payload)
}

/// Pulls pages with advancing `offset`/`limit` until a page is empty, the
/// reported total is reached, or `max_pages` calls were made.
pub async fn collect_paginated(
    transport: &dyn ToolTransport,
    executor: &RateLimitedExecutor,
    request: PageRequest<'_>,
) -> Result<Vec<Value>, ToolError> {
    let mut offset = 0u64;
    let mut items = Vec::new();

    for page_index in 0..request.max_pages {
        let mut args = request.base_args.clone();
        args.insert("offset".to_string(), Value::from(offset));
        args.insert("limit".to_string(), Value::from(request.page_size as u64));

        let payload =
            call_tool_json(transport, executor, request.tool_name, Value::Object(args)).await?;

        let page_items = page_items(&payload, request.item_key);
        let page_len = page_items.len();
        items.extend(page_items);

        if page_len == 0 {
            tracing::debug!(
                tool = %request.tool_name,
                page_index,
                "gateway.pagination_empty_page"
            );
            break;
        }

        let pagination = payload
            .get("metadata")
            .and_then(|m| m.get("pagination"));
        let total_available = pagination
            .and_then(|p| p.get("total_available_items"))
            .and_then(loose_u64);
        let returned = pagination
            .and_then(|p| p.get("returned"))
            .and_then(loose_u64)
            .filter(|n| *n > 0)
            .unwrap_or(page_len as u64);

        offset += returned;
        if total_available.is_some_and(|total| offset >= total) {
            break;
        }
    }

    tracing::debug!(
        tool = %request.tool_name,
        items = items.len(),
        "gateway.pagination_completed"
    );
    Ok(items)
}

fn page_items(payload: &Map<String, Value>, item_key: &str) -> Vec<Value> {
    let list = payload
        .get("data")
        .and_then(|d| d.get(item_key))
        .or_else(|| payload.get(item_key))
        .and_then(|v| v.as_array());

    list.map(|items| items.iter().filter(|v| v.is_object()).cloned().collect())
        .unwrap_or_default()
}

fn loose_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
