use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use medsum_contracts::canonical;
use tokio::sync::{Mutex, OnceCell};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCallKey {
    pub tool_name: String,
    pub params_hash: String,
}

impl ToolCallKey {
    pub fn new(tool_name: &str, params: &[serde_json::Value]) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            params_hash: canonical::params_fingerprint(params),
        }
    }
}

/// Memoizes tool results for a single pipeline run.
///
/// Concurrent lookups of the same key share one in-flight load. A failed load
/// leaves the key empty so the next lookup retries it.
#[derive(Clone, Default)]
pub struct RunCache {
    cells: Arc<Mutex<HashMap<ToolCallKey, Arc<OnceCell<serde_json::Value>>>>>,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load<F, Fut, E>(
        &self,
        tool_name: &str,
        params: &[serde_json::Value],
        loader: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        let key = ToolCallKey::new(tool_name, params);
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key).or_default().clone()
        };

        if let Some(value) = cell.get() {
            tracing::debug!(tool = %tool_name, "gateway.run_cache_hit");
            return Ok(value.clone());
        }

        cell.get_or_try_init(loader).await.cloned()
    }

    pub async fn len(&self) -> usize {
        let cells = self.cells.lock().await;
        cells.values().filter(|c| c.initialized()).count()
    }
}
