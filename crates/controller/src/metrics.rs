use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static SUMMARY_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STAGE_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static TOOL_INVOCATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn summary_runs_total() -> &'static IntCounterVec {
    SUMMARY_RUNS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("medsum_summary_runs_total", "Summary runs by outcome."),
                &["outcome"],
            )
            .expect("create medsum_summary_runs_total"),
        )
    })
}

fn stage_duration_seconds() -> &'static HistogramVec {
    STAGE_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "medsum_stage_duration_seconds",
                    "Pipeline stage duration in seconds.",
                )
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
                &["stage", "outcome"],
            )
            .expect("create medsum_stage_duration_seconds"),
        )
    })
}

fn tool_invocations_total() -> &'static IntCounterVec {
    TOOL_INVOCATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "medsum_tool_invocations_total",
                    "Model-initiated tool invocations by outcome.",
                ),
                &["tool", "outcome"],
            )
            .expect("create medsum_tool_invocations_total"),
        )
    })
}

pub fn observe_run(outcome: &str) {
    summary_runs_total().with_label_values(&[outcome]).inc();
}

pub fn observe_stage(stage: &str, outcome: &str, duration: Duration) {
    stage_duration_seconds()
        .with_label_values(&[stage, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_tool_invocation(tool: &str, outcome: &str) {
    tool_invocations_total()
        .with_label_values(&[tool, outcome])
        .inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_series_show_up_in_render() {
        observe_run("success");
        observe_stage("grouping", "success", Duration::from_millis(1200));
        observe_tool_invocation("fetch_medications", "success");

        let (body, content_type) = render().expect("render should succeed");
        let text = String::from_utf8(body).expect("metrics are utf-8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("medsum_summary_runs_total{outcome=\"success\"}"));
        assert!(text.contains("medsum_stage_duration_seconds_bucket"));
        assert!(text.contains("tool=\"fetch_medications\""));
    }
}
