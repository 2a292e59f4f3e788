use std::sync::Arc;
use std::time::Instant;

use medsum_auth::{
    Authenticator, ClaimNames, IdentityResolver, SessionCache, SessionExchange, resolve_context,
};
use medsum_contracts::{
    AuthorizationContext, GroupingOutput, MedicationSummary, MedicationSummaryResponse,
    StructuredOutput, SummaryOptions, SummaryRequest, SummaryType,
};
use medsum_gateway::{
    ClinicalTools, HttpToolConnector, Paging, RateLimitedExecutor, ToolConnector, ToolSession,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::Instrument;

use crate::config::{ControllerConfig, StagePrompts, StartupError};
use crate::error::PipelineError;
use crate::metrics;
use crate::model::{ChatCompletionsClient, ModelClient, ModelError, StageRequest, StageSettings};
use crate::output::parse_structured_output;
use crate::tools::{RunTools, Stage, tool_specs};

pub const GROUPING_SETTINGS: StageSettings = StageSettings {
    temperature: 0.2,
    top_p: 0.1,
    max_tokens: 1400,
    parallel_tool_calls: false,
};

pub const ENRICHMENT_SETTINGS: StageSettings = StageSettings {
    temperature: 0.15,
    top_p: 0.1,
    max_tokens: 4096,
    parallel_tool_calls: false,
};

/// Two fixed stages: group medications by indication, then enrich each group
/// with labs and vitals.
pub struct SummaryService {
    connector: Arc<dyn ToolConnector>,
    executor: RateLimitedExecutor,
    model: Arc<dyn ModelClient>,
    prompts: StagePrompts,
    paging: Paging,
    max_turns: u32,
}

impl SummaryService {
    pub fn new(
        connector: Arc<dyn ToolConnector>,
        executor: RateLimitedExecutor,
        model: Arc<dyn ModelClient>,
        prompts: StagePrompts,
        paging: Paging,
        max_turns: u32,
    ) -> Self {
        Self {
            connector,
            executor,
            model,
            prompts,
            paging,
            max_turns,
        }
    }

    pub async fn run(
        &self,
        context: &AuthorizationContext,
        options: &SummaryOptions,
    ) -> Result<MedicationSummary, PipelineError> {
        options.validate().map_err(PipelineError::invalid_options)?;

        let run_id = ulid::Ulid::new().to_string();
        let span = tracing::info_span!(
            "summary.run",
            run_id = %run_id,
            station = %context.site_id(),
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        let started = Instant::now();

        let result = self
            .run_stages(context, options)
            .instrument(span.clone())
            .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind.as_str(),
        };
        span.record("outcome", outcome);
        span.record("latency_ms", started.elapsed().as_millis() as u64);
        metrics::observe_run(outcome);

        match &result {
            Ok(summary) => tracing::info!(
                parent: &span,
                groups = summary.groups.len(),
                "controller.summary_completed"
            ),
            Err(err) => tracing::warn!(
                parent: &span,
                code = err.code,
                kind = err.kind.as_str(),
                error = %err.message,
                "controller.summary_failed"
            ),
        }

        result
    }

    async fn run_stages(
        &self,
        context: &AuthorizationContext,
        options: &SummaryOptions,
    ) -> Result<MedicationSummary, PipelineError> {
        let transport = self
            .connector
            .connect(context)
            .await
            .map_err(|err| PipelineError::tool("connect", &err))?;
        let session = ToolSession::new(transport);

        let clinical = ClinicalTools::new(
            session.transport(),
            self.executor.clone(),
            context,
            self.paging,
        );
        let tools = RunTools::new(clinical, options.clone());

        let result = self.stages(context, &tools).await;
        session.close().await;
        result
    }

    async fn stages(
        &self,
        context: &AuthorizationContext,
        tools: &RunTools,
    ) -> Result<MedicationSummary, PipelineError> {
        let grouping_input = json!({
            "task": "group_medications",
            "patient_icn": context.patient_identifier(),
            "patient_station": context.site_id(),
        });
        let grouping: GroupingOutput = self
            .stage(
                Stage::Grouping,
                &self.prompts.grouping,
                &grouping_input,
                GROUPING_SETTINGS,
                tools,
            )
            .await?;

        let enrichment_input = json!({
            "task": "enrich_medication_summary",
            "medication_groups": grouping,
        });
        let enrichment_instructions = format!(
            "{}\n\nRespond with a single JSON document matching this schema:\n{}",
            self.prompts.enrichment,
            MedicationSummary::json_schema()
        );
        self.stage(
            Stage::Enrichment,
            &enrichment_instructions,
            &enrichment_input,
            ENRICHMENT_SETTINGS,
            tools,
        )
        .await
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        instructions: &str,
        input: &Value,
        settings: StageSettings,
        tools: &RunTools,
    ) -> Result<T, PipelineError>
    where
        T: DeserializeOwned + StructuredOutput,
    {
        let span = tracing::info_span!(
            "summary.stage",
            stage = stage.as_str(),
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        let started = Instant::now();

        let specs = tool_specs(stage);
        let invoker = tools.for_stage(stage);
        let result = async {
            let text = self
                .model
                .run(
                    StageRequest {
                        stage: stage.as_str(),
                        instructions,
                        input,
                        tools: &specs,
                        settings,
                        max_turns: self.max_turns,
                    },
                    &invoker,
                )
                .await
                .map_err(|err| match err {
                    ModelError::Tool(tool_err) => PipelineError::tool(stage.as_str(), &tool_err),
                    other => PipelineError::model(stage.as_str(), &other),
                })?;
            parse_structured_output::<T>(stage.as_str(), &text)
        }
        .instrument(span.clone())
        .await;

        let elapsed = started.elapsed();
        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind.as_str(),
        };
        span.record("outcome", outcome);
        span.record("latency_ms", elapsed.as_millis() as u64);
        metrics::observe_stage(stage.as_str(), outcome, elapsed);

        result
    }
}

/// Entry point for embedders: session credential and request in, summary out.
#[derive(Clone)]
pub struct Controller {
    authenticator: Authenticator,
    service: Arc<SummaryService>,
}

impl Controller {
    pub fn new(authenticator: Authenticator, service: SummaryService) -> Self {
        Self {
            authenticator,
            service: Arc::new(service),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Result<Self, StartupError> {
        let prompts = StagePrompts::load(config)?;

        let executor =
            RateLimitedExecutor::new(config.executor_config()).map_err(|reason| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: reason.to_string(),
            })?;

        let exchange =
            SessionExchange::new(config.session_exchange()).map_err(|err| StartupError {
                code: "ERR_HTTP_CLIENT",
                message: err.message,
            })?;
        let authenticator = Authenticator::new(
            exchange,
            IdentityResolver::new(ClaimNames::default()),
            SessionCache::new(config.session_refresh_ahead),
        );

        let connector = HttpToolConnector::new(config.tool_server_url.clone(), config.tool_timeout)
            .map_err(|err| StartupError {
                code: "ERR_HTTP_CLIENT",
                message: err.to_string(),
            })?;
        let model = ChatCompletionsClient::new(config.model.clone(), executor.clone()).map_err(
            |err| StartupError {
                code: "ERR_HTTP_CLIENT",
                message: err.to_string(),
            },
        )?;

        let service = SummaryService::new(
            Arc::new(connector),
            executor,
            Arc::new(model),
            prompts,
            config.paging(),
            config.model.max_turns,
        );
        Ok(Self::new(authenticator, service))
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub async fn summarize(
        &self,
        raw_credential: &str,
        request: &SummaryRequest,
    ) -> Result<MedicationSummaryResponse, PipelineError> {
        request
            .options
            .validate()
            .map_err(PipelineError::invalid_options)?;

        let context = match self.authorize(raw_credential, request).await {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(
                    code = err.code,
                    kind = err.kind.as_str(),
                    error = %err.message,
                    "controller.summary_rejected"
                );
                metrics::observe_run(err.kind.as_str());
                return Err(err);
            }
        };

        let data = self.service.run(&context, &request.options).await?;
        Ok(MedicationSummaryResponse {
            summary_type: SummaryType::Medication,
            data,
        })
    }

    async fn authorize(
        &self,
        raw_credential: &str,
        request: &SummaryRequest,
    ) -> Result<AuthorizationContext, PipelineError> {
        let token = self.authenticator.authenticate(raw_credential).await?;
        Ok(resolve_context(&token, &request.patient)?)
    }
}
