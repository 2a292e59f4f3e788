use medsum_contracts::{ErrorKind, StructuredOutput};
use serde::de::DeserializeOwned;

use crate::error::PipelineError;

const DECLINE_MARKERS: &[&str] = &["unable to", "error", "failed"];

/// Strips one optional surrounding code fence (```json … ``` or ``` … ```).
/// Text that is empty once unfenced is returned trimmed but otherwise as is.
pub fn extract_json_content(text: &str) -> &str {
    let input = text.trim();

    let mut body = input;
    if let Some(rest) = body.strip_prefix("```") {
        body = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }

    let body = body.trim();
    if body.is_empty() { input } else { body }
}

/// Decodes a stage's final text into `T`.
///
/// Text that does not decode but reads like a refusal is
/// [`ErrorKind::ModelDeclined`]; anything else is
/// [`ErrorKind::OutputParseFailure`].
pub fn parse_structured_output<T>(stage: &str, text: &str) -> Result<T, PipelineError>
where
    T: DeserializeOwned + StructuredOutput,
{
    let content = extract_json_content(text);

    let reason = match serde_json::from_str::<T>(content) {
        Ok(value) => match value.validate() {
            Ok(()) => return Ok(value),
            Err(reason) => reason.to_string(),
        },
        Err(err) => err.to_string(),
    };

    let snippet = content.chars().take(200).collect::<String>();
    let lowered = content.to_lowercase();
    if DECLINE_MARKERS.iter().any(|m| lowered.contains(m)) {
        tracing::warn!(stage = %stage, "controller.model_declined");
        return Err(PipelineError::new(
            ErrorKind::ModelDeclined,
            "ERR_MODEL_DECLINED",
            format!("{} stage output was a refusal", stage),
        )
        .with_detail(snippet));
    }

    tracing::error!(stage = %stage, reason = %reason, "controller.output_parse_failed");
    Err(PipelineError::new(
        ErrorKind::OutputParseFailure,
        "ERR_OUTPUT_PARSE",
        format!("{} stage output did not parse: {}", stage, reason),
    )
    .with_detail(snippet))
}

#[cfg(test)]
mod tests {
    use medsum_contracts::{GroupingOutput, MedicationSummary};

    use super::*;

    const GROUPING: &str = r#"{"groups":[{"group_number":1,"treatment_indication":"Hypertension","medications":[{"name":"LISINOPRIL 10MG TAB"}],"problem_list_match_type":"Exact","reasoning":"ACE inhibitor"}]}"#;

    #[test]
    fn fence_variants_extract_the_same_body() {
        assert_eq!(extract_json_content(GROUPING), GROUPING);
        assert_eq!(
            extract_json_content(&format!("```json\n{}\n```", GROUPING)),
            GROUPING
        );
        assert_eq!(
            extract_json_content(&format!("  ```\n{}\n```  \n", GROUPING)),
            GROUPING
        );
        assert_eq!(extract_json_content("```json\n```"), "```json\n```");
    }

    #[test]
    fn fenced_and_unfenced_outputs_parse_identically() {
        let plain: GroupingOutput =
            parse_structured_output("grouping", GROUPING).expect("plain output parses");
        let fenced: GroupingOutput =
            parse_structured_output("grouping", &format!("```json\n{}\n```", GROUPING))
                .expect("fenced output parses");
        assert_eq!(plain, fenced);
    }

    #[test]
    fn refusal_text_is_model_declined() {
        let err = parse_structured_output::<MedicationSummary>(
            "enrichment",
            "I am unable to retrieve the patient's labs right now.",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelDeclined);
        assert_eq!(err.status_code(), 503);
        assert!(err.detail.as_deref().is_some_and(|d| d.contains("unable to")));
    }

    #[test]
    fn other_garbage_is_a_parse_failure() {
        let err =
            parse_structured_output::<GroupingOutput>("grouping", "Here are the groups: none")
                .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputParseFailure);
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn zero_group_number_fails_validation() {
        let bad = GROUPING.replace("\"group_number\":1", "\"group_number\":0");
        let err = parse_structured_output::<GroupingOutput>("grouping", &bad).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputParseFailure);
        assert!(err.message.contains("group_number"));
    }
}
