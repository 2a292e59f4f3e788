use medsum_auth::AuthError;
use medsum_contracts::ErrorKind;
use medsum_gateway::{ToolError, UpstreamFailure};

use crate::model::ModelError;

/// Terminal failure of a summary run.
///
/// `message` is the internal diagnostic; callers only ever see
/// [`PipelineError::public_message`].
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,
    status: u16,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            detail: None,
            status: default_status(kind),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn public_message(&self) -> &'static str {
        self.kind.public_message()
    }

    pub fn invalid_options(reason: &'static str) -> Self {
        Self::new(ErrorKind::InvalidRequest, "ERR_INVALID_OPTIONS", reason)
    }

    /// Only timeouts and throttling statuses from the tool server are
    /// transient. A `success: false` payload is a tool failure whatever its
    /// message says.
    pub fn tool(stage: &str, err: &ToolError) -> Self {
        if matches!(err, ToolError::Timeout) || is_transient_status(err.status_code()) {
            return Self::new(
                ErrorKind::UpstreamTransient,
                "ERR_TOOL_UNAVAILABLE",
                format!("{} stage: {}", stage, err),
            );
        }
        Self::new(
            ErrorKind::ToolFailure,
            "ERR_TOOL_FAILED",
            format!("{} stage: {}", stage, err),
        )
    }

    pub fn model(stage: &str, err: &ModelError) -> Self {
        let kind = if matches!(err, ModelError::Timeout) || is_transient_status(err.status_code()) {
            ErrorKind::UpstreamTransient
        } else {
            ErrorKind::Internal
        };
        Self::new(kind, "ERR_MODEL_UNAVAILABLE", format!("{} stage: {}", stage, err))
    }
}

fn is_transient_status(status: Option<u16>) -> bool {
    matches!(status, Some(429 | 503))
}

fn default_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::AuthenticationFailure => 401,
        ErrorKind::AuthorizationGap | ErrorKind::InvalidRequest => 400,
        ErrorKind::UpstreamTransient | ErrorKind::ModelDeclined => 503,
        ErrorKind::ToolFailure => 502,
        ErrorKind::OutputParseFailure | ErrorKind::Internal => 500,
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PipelineError {}

impl From<AuthError> for PipelineError {
    fn from(value: AuthError) -> Self {
        let mut err = Self::new(value.kind(), value.code, value.message.clone());
        err.status = value.status_code();
        err
    }
}
