use async_trait::async_trait;
use medsum_contracts::SummaryOptions;
use medsum_gateway::{ClinicalTools, RunCache, ToolError};
use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::metrics;
use crate::model::{ToolInvoker, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Grouping,
    Enrichment,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Grouping => "grouping",
            Stage::Enrichment => "enrichment",
        }
    }

    pub fn tool_names(self) -> &'static [&'static str] {
        match self {
            Stage::Grouping => &["fetch_medications", "fetch_problems"],
            Stage::Enrichment => &["fetch_labs", "fetch_vitals"],
        }
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FetchMedicationsArgs {
    /// Include pending orders alongside active ones.
    pub include_pending: Option<bool>,
    /// How far back to look, in days.
    pub days_back: Option<u32>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FetchProblemsArgs {
    /// Only return active problems.
    pub active_only: Option<bool>,
    /// How far back to look, in days.
    pub days_back: Option<u32>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FetchObservationsArgs {
    /// How far back to look, in days.
    pub days_back: Option<u32>,
    /// Number of most recent results to keep per test or vital type.
    pub n_most_recent: Option<u32>,
}

pub fn tool_specs(stage: Stage) -> Vec<ToolSpec> {
    stage
        .tool_names()
        .iter()
        .filter_map(|name| tool_spec(name))
        .collect()
}

fn tool_spec(name: &str) -> Option<ToolSpec> {
    let (name, description, parameters) = match name {
        "fetch_medications" => (
            "fetch_medications",
            "Fetch and cache medications needed for grouping.",
            parameters_schema::<FetchMedicationsArgs>(),
        ),
        "fetch_problems" => (
            "fetch_problems",
            "Fetch problem list entries for indication matching.",
            parameters_schema::<FetchProblemsArgs>(),
        ),
        "fetch_labs" => (
            "fetch_labs",
            "Retrieve recent lab results for medication monitoring.",
            parameters_schema::<FetchObservationsArgs>(),
        ),
        "fetch_vitals" => (
            "fetch_vitals",
            "Retrieve recent vital sign measurements for monitoring.",
            parameters_schema::<FetchObservationsArgs>(),
        ),
        _ => return None,
    };

    Some(ToolSpec {
        name,
        description,
        parameters,
    })
}

fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

/// Tool state shared by both stages of one run.
pub struct RunTools {
    clinical: ClinicalTools,
    cache: RunCache,
    options: SummaryOptions,
}

impl RunTools {
    pub fn new(clinical: ClinicalTools, options: SummaryOptions) -> Self {
        Self {
            clinical,
            cache: RunCache::new(),
            options,
        }
    }

    pub fn cache(&self) -> &RunCache {
        &self.cache
    }

    pub fn for_stage(&self, stage: Stage) -> StageTools<'_> {
        StageTools { stage, tools: self }
    }

    async fn medications(&self, args: FetchMedicationsArgs) -> Result<String, ToolError> {
        let include_pending = args
            .include_pending
            .unwrap_or(self.options.medication_include_pending);
        let days_back = or_default(args.days_back, self.options.medication_days_back);

        let medications = self
            .cache
            .get_or_load(
                "fetch_medications",
                &[json!(include_pending), json!(days_back)],
                || async {
                    let records = self
                        .clinical
                        .fetch_medications(include_pending, days_back)
                        .await?;
                    to_payload(&records)
                },
            )
            .await?;
        Ok(json!({ "medications": medications }).to_string())
    }

    async fn problems(&self, args: FetchProblemsArgs) -> Result<String, ToolError> {
        let active_only = args.active_only.unwrap_or(true);
        let days_back = or_default(args.days_back, self.options.problems_days_back);

        let problems = self
            .cache
            .get_or_load(
                "fetch_problems",
                &[json!(active_only), json!(days_back)],
                || async {
                    let records = self.clinical.fetch_problems(active_only, days_back).await?;
                    to_payload(&records)
                },
            )
            .await?;
        Ok(json!({ "problems": problems }).to_string())
    }

    async fn labs(&self, args: FetchObservationsArgs) -> Result<String, ToolError> {
        let days_back = or_default(args.days_back, self.options.labs_days_back);
        let n_most_recent = or_default(args.n_most_recent, self.options.labs_n_most_recent);

        let labs = self
            .cache
            .get_or_load(
                "fetch_labs",
                &[json!(days_back), json!(n_most_recent)],
                || async {
                    let series = self.clinical.fetch_labs(days_back, n_most_recent).await?;
                    to_payload(&series)
                },
            )
            .await?;
        Ok(json!({ "labs": labs }).to_string())
    }

    async fn vitals(&self, args: FetchObservationsArgs) -> Result<String, ToolError> {
        let days_back = or_default(args.days_back, self.options.vitals_days_back);
        let n_most_recent = or_default(args.n_most_recent, self.options.vitals_n_most_recent);

        let vitals = self
            .cache
            .get_or_load(
                "fetch_vitals",
                &[json!(days_back), json!(n_most_recent)],
                || async {
                    let series = self.clinical.fetch_vitals(days_back, n_most_recent).await?;
                    to_payload(&series)
                },
            )
            .await?;
        Ok(json!({ "vitals": vitals }).to_string())
    }
}

/// The tools one stage may call. Anything else is refused back to the model.
pub struct StageTools<'a> {
    stage: Stage,
    tools: &'a RunTools,
}

#[async_trait]
impl<'a> ToolInvoker for StageTools<'a> {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        if !self.stage.tool_names().contains(&name) {
            tracing::warn!(stage = self.stage.as_str(), tool = %name, "controller.tool_refused");
            metrics::observe_tool_invocation("unknown", "refused");
            return Ok(format!(
                "error: tool {} is not available in the {} stage",
                name,
                self.stage.as_str()
            ));
        }

        let result = match name {
            "fetch_medications" => match parse_args(name, arguments) {
                Ok(args) => self.tools.medications(args).await,
                Err(refusal) => Ok(refusal),
            },
            "fetch_problems" => match parse_args(name, arguments) {
                Ok(args) => self.tools.problems(args).await,
                Err(refusal) => Ok(refusal),
            },
            "fetch_labs" => match parse_args(name, arguments) {
                Ok(args) => self.tools.labs(args).await,
                Err(refusal) => Ok(refusal),
            },
            "fetch_vitals" => match parse_args(name, arguments) {
                Ok(args) => self.tools.vitals(args).await,
                Err(refusal) => Ok(refusal),
            },
            _ => Ok(format!("error: unknown tool {}", name)),
        };

        let outcome = if result.is_ok() { "success" } else { "error" };
        tracing::info!(
            stage = self.stage.as_str(),
            tool = %name,
            outcome,
            "controller.tool_invoked"
        );
        metrics::observe_tool_invocation(name, outcome);
        result
    }
}

fn parse_args<T: DeserializeOwned + Default>(name: &str, arguments: Value) -> Result<T, String> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments)
        .map_err(|err| format!("error: invalid arguments for {}: {}", name, err))
}

// Zero is treated as "not provided".
fn or_default(value: Option<u32>, default: u32) -> u32 {
    value.filter(|v| *v > 0).unwrap_or(default)
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|err| ToolError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use medsum_contracts::AuthorizationContext;
    use medsum_gateway::transport::{ToolCallResult, ToolTransport};
    use medsum_gateway::{ExecutorConfig, Paging, RateLimitedExecutor};

    use super::*;

    struct RecordingTransport {
        payloads: BTreeMap<&'static str, Value>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolTransport for RecordingTransport {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((name.to_string(), arguments));
            match self.payloads.get(name) {
                Some(payload) => Ok(ToolCallResult {
                    is_error: false,
                    content: vec![json!({"type": "text", "text": payload.to_string()})],
                }),
                None => Ok(ToolCallResult {
                    is_error: false,
                    content: vec![json!({
                        "type": "text",
                        "text": json!({"success": false, "error": "station offline"}).to_string()
                    })],
                }),
            }
        }

        async fn cleanup(&self) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn run_tools(transport: Arc<RecordingTransport>) -> RunTools {
        let executor = RateLimitedExecutor::new(ExecutorConfig {
            max_concurrency: 2,
            max_attempts: 1,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        })
        .expect("config is valid");
        let context = AuthorizationContext::new("tok", "530", "10000000219", "1012345678V123456")
            .expect("context is valid");
        let clinical = ClinicalTools::new(
            transport,
            executor,
            &context,
            Paging {
                page_size: 100,
                max_pages: 4,
            },
        );
        RunTools::new(clinical, SummaryOptions::default())
    }

    fn medication_transport() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            payloads: BTreeMap::from([(
                "get_patient_medications",
                json!({"data": {"medications": [
                    {"name": "METFORMIN 500MG TAB", "vaStatus": "ACTIVE"}
                ]}, "metadata": {"pagination": {"total_available_items": 1}}}),
            )]),
            calls: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn specs_follow_the_stage_allowlist() {
        let grouping = tool_specs(Stage::Grouping);
        assert_eq!(
            grouping.iter().map(|s| s.name).collect::<Vec<_>>(),
            vec!["fetch_medications", "fetch_problems"]
        );
        let params = &grouping[0].parameters;
        assert!(params.get("$schema").is_none());
        assert!(params["properties"].get("include_pending").is_some());
        assert!(params["properties"].get("days_back").is_some());

        let enrichment = tool_specs(Stage::Enrichment);
        assert_eq!(enrichment[1].name, "fetch_vitals");
        assert!(enrichment[1].parameters["properties"].get("n_most_recent").is_some());
    }

    #[tokio::test]
    async fn repeated_calls_with_same_resolved_args_hit_upstream_once() {
        let transport = medication_transport();
        let tools = run_tools(transport.clone());
        let grouping = tools.for_stage(Stage::Grouping);

        let first = grouping
            .invoke("fetch_medications", json!({}))
            .await
            .expect("first call succeeds");
        let second = grouping
            .invoke("fetch_medications", json!({"include_pending": true, "days_back": 183}))
            .await
            .expect("second call succeeds");

        assert_eq!(first, second);
        let payload: Value = serde_json::from_str(&first).expect("payload is JSON");
        assert_eq!(payload["medications"][0]["name"], "METFORMIN 500MG TAB");
        assert_eq!(transport.calls.lock().expect("calls lock").len(), 1);
        assert_eq!(tools.cache().len().await, 1);
    }

    #[tokio::test]
    async fn disallowed_tool_is_refused_without_upstream_call() {
        let transport = medication_transport();
        let tools = run_tools(transport.clone());

        let reply = tools
            .for_stage(Stage::Enrichment)
            .invoke("fetch_medications", json!({}))
            .await
            .expect("refusal is returned to the model");
        assert!(reply.contains("not available in the enrichment stage"));

        let reply = tools
            .for_stage(Stage::Grouping)
            .invoke("drop_tables", json!({}))
            .await
            .expect("refusal is returned to the model");
        assert!(reply.starts_with("error:"));
        assert!(transport.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn bad_arguments_are_reported_back() {
        let transport = medication_transport();
        let tools = run_tools(transport.clone());

        let reply = tools
            .for_stage(Stage::Grouping)
            .invoke("fetch_problems", json!({"days_back": "a year"}))
            .await
            .expect("refusal is returned to the model");
        assert!(reply.starts_with("error: invalid arguments for fetch_problems"));
        assert!(transport.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_aborts_and_is_not_cached() {
        let transport = Arc::new(RecordingTransport {
            payloads: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let tools = run_tools(transport.clone());
        let enrichment = tools.for_stage(Stage::Enrichment);

        let err = enrichment
            .invoke("fetch_labs", Value::Null)
            .await
            .expect_err("success:false aborts the stage");
        assert!(matches!(err, ToolError::Upstream { .. }));

        let _ = enrichment.invoke("fetch_labs", Value::Null).await;
        assert_eq!(transport.calls.lock().expect("calls lock").len(), 2);
        assert_eq!(tools.cache().len().await, 0);
    }

    #[tokio::test]
    async fn zero_days_back_falls_back_to_options() {
        let transport = Arc::new(RecordingTransport {
            payloads: BTreeMap::from([("get_patient_vitals", json!({"data": {"vital_signs": []}}))]),
            calls: Mutex::new(Vec::new()),
        });
        let tools = run_tools(transport.clone());

        let reply = tools
            .for_stage(Stage::Enrichment)
            .invoke("fetch_vitals", json!({"days_back": 0, "n_most_recent": 2}))
            .await
            .expect("call succeeds");
        assert_eq!(reply, r#"{"vitals":{}}"#);

        let calls = transport.calls.lock().expect("calls lock").clone();
        assert_eq!(calls[0].1["days_back"], 365);
        assert_eq!(calls[0].1["n_most_recent"], 2);
    }
}
