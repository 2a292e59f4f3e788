use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod canonical;

/// Failure classes surfaced to callers. Each maps to a status class and a
/// generic caller-facing message; diagnostic detail never travels with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthenticationFailure,
    AuthorizationGap,
    InvalidRequest,
    UpstreamTransient,
    ToolFailure,
    ModelDeclined,
    OutputParseFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            ErrorKind::AuthorizationGap => "AUTHORIZATION_GAP",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::UpstreamTransient => "UPSTREAM_TRANSIENT",
            ErrorKind::ToolFailure => "TOOL_FAILURE",
            ErrorKind::ModelDeclined => "MODEL_DECLINED",
            ErrorKind::OutputParseFailure => "OUTPUT_PARSE_FAILURE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthenticationFailure
                | ErrorKind::AuthorizationGap
                | ErrorKind::InvalidRequest
        )
    }

    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailure => "Authentication is required.",
            ErrorKind::AuthorizationGap => {
                "The signed-in user does not have access to the requested site."
            }
            ErrorKind::InvalidRequest => "The request is missing required patient information.",
            ErrorKind::UpstreamTransient => {
                "Clinical data services are busy. Please try again shortly."
            }
            ErrorKind::ToolFailure => "Clinical data could not be retrieved.",
            ErrorKind::ModelDeclined => "The summary service is currently unavailable.",
            ErrorKind::OutputParseFailure | ErrorKind::Internal => {
                "The summary could not be generated."
            }
        }
    }
}

/// Request-scoped authorization bundle required before any remote tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    session_token: String,
    site_id: String,
    user_site_identifier: String,
    patient_identifier: String,
}

impl AuthorizationContext {
    pub fn new(
        session_token: impl Into<String>,
        site_id: impl Into<String>,
        user_site_identifier: impl Into<String>,
        patient_identifier: impl Into<String>,
    ) -> Result<Self, &'static str> {
        let session_token = session_token.into();
        let site_id = site_id.into().trim().to_string();
        let user_site_identifier = user_site_identifier.into().trim().to_string();
        let patient_identifier = patient_identifier.into().trim().to_string();

        if site_id.is_empty() {
            return Err("site_id must be non-empty");
        }
        if user_site_identifier.is_empty() {
            return Err("user_site_identifier must be non-empty");
        }
        if patient_identifier.is_empty() {
            return Err("patient_identifier must be non-empty");
        }

        Ok(Self {
            session_token,
            site_id,
            user_site_identifier,
            patient_identifier,
        })
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn user_site_identifier(&self) -> &str {
        &self.user_site_identifier
    }

    pub fn patient_identifier(&self) -> &str {
        &self.patient_identifier
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRef {
    #[serde(default)]
    pub icn: Option<String>,
    #[serde(default)]
    pub station: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryOptions {
    #[serde(default = "default_medication_days_back")]
    pub medication_days_back: u32,
    #[serde(default = "default_true")]
    pub medication_include_pending: bool,
    #[serde(default = "default_problems_days_back")]
    pub problems_days_back: u32,
    #[serde(default = "default_labs_days_back")]
    pub labs_days_back: u32,
    #[serde(default = "default_n_most_recent")]
    pub labs_n_most_recent: u32,
    #[serde(default = "default_vitals_days_back")]
    pub vitals_days_back: u32,
    #[serde(default = "default_n_most_recent")]
    pub vitals_n_most_recent: u32,
}

impl SummaryOptions {
    pub const MAX_DAYS_BACK: u32 = 3650;
    pub const MAX_N_MOST_RECENT: u32 = 10;

    pub fn validate(&self) -> Result<(), &'static str> {
        let days = 1..=Self::MAX_DAYS_BACK;
        let recent = 1..=Self::MAX_N_MOST_RECENT;

        if !days.contains(&self.medication_days_back) {
            return Err("medication_days_back out of range");
        }
        if !days.contains(&self.problems_days_back) {
            return Err("problems_days_back out of range");
        }
        if !days.contains(&self.labs_days_back) {
            return Err("labs_days_back out of range");
        }
        if !recent.contains(&self.labs_n_most_recent) {
            return Err("labs_n_most_recent out of range");
        }
        if !days.contains(&self.vitals_days_back) {
            return Err("vitals_days_back out of range");
        }
        if !recent.contains(&self.vitals_n_most_recent) {
            return Err("vitals_n_most_recent out of range");
        }
        Ok(())
    }
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            medication_days_back: default_medication_days_back(),
            medication_include_pending: true,
            problems_days_back: default_problems_days_back(),
            labs_days_back: default_labs_days_back(),
            labs_n_most_recent: default_n_most_recent(),
            vitals_days_back: default_vitals_days_back(),
            vitals_n_most_recent: default_n_most_recent(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_medication_days_back() -> u32 {
    183
}

fn default_problems_days_back() -> u32 {
    365
}

fn default_labs_days_back() -> u32 {
    1825
}

fn default_vitals_days_back() -> u32 {
    365
}

fn default_n_most_recent() -> u32 {
    3
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub patient: PatientRef,
    #[serde(default)]
    pub options: SummaryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drug_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_filled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fills_allowed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fills_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icd_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabObservation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitalObservation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MedicationItem {
    pub name: String,
    #[serde(default)]
    pub dose: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub sig: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub drug_class: Option<String>,
    #[serde(default)]
    pub ordered_date: Option<String>,
    #[serde(default)]
    pub last_filled: Option<String>,
    #[serde(default)]
    pub fills_allowed: Option<i64>,
    #[serde(default)]
    pub fills_remaining: Option<i64>,
    #[serde(default)]
    pub provider_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MeasurementValue {
    pub value: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MeasurementSeries {
    pub name: String,
    pub values: Vec<MeasurementValue>,
    pub trend: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ProblemListMatchType {
    Exact,
    Approximate,
    #[serde(rename = "Not on Problem List")]
    NotOnProblemList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MedicationGroup {
    pub group_number: u32,
    pub treatment_indication: String,
    pub medications: Vec<MedicationItem>,
    pub problem_list_match_type: ProblemListMatchType,
    pub reasoning: String,
    #[serde(default)]
    pub relevant_labs: Vec<MeasurementSeries>,
    #[serde(default)]
    pub relevant_vitals: Vec<MeasurementSeries>,
}

/// Stage 1 output: medications grouped by treatment indication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GroupingOutput {
    pub groups: Vec<MedicationGroup>,
}

/// Stage 2 output: the grouping enriched with per-group labs and vitals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MedicationSummary {
    pub groups: Vec<MedicationGroup>,
}

/// Structural checks serde cannot express.
pub trait StructuredOutput {
    fn validate(&self) -> Result<(), &'static str>;
}

fn validate_groups(groups: &[MedicationGroup]) -> Result<(), &'static str> {
    if groups.iter().any(|g| g.group_number < 1) {
        return Err("group_number must be >= 1");
    }
    Ok(())
}

impl StructuredOutput for GroupingOutput {
    fn validate(&self) -> Result<(), &'static str> {
        validate_groups(&self.groups)
    }
}

impl StructuredOutput for MedicationSummary {
    fn validate(&self) -> Result<(), &'static str> {
        validate_groups(&self.groups)
    }
}

impl MedicationSummary {
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(MedicationSummary))
            .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    Medication,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationSummaryResponse {
    pub summary_type: SummaryType,
    pub data: MedicationSummary,
}
