use serde::Serialize;
use thiserror::Error;

/// Caller-visible failure of one `execute` call. Every variant maps to a
/// stable machine-readable code plus an HTTP status hint; the upstream
/// variant propagates whatever status the Heroku API returned.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("unknown operation '{0}'")]
    OperationNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("root schema is not loaded; request body cannot be validated")]
    SchemaUnavailable,
    #[error("writes are disabled on this server (set ALLOW_WRITES=true to enable)")]
    WritesDisabled,
    #[error("{0}")]
    WriteConfirmationRequired(String),
    #[error("no usable access token for this caller; complete the OAuth flow first")]
    AuthRequired,
    #[error("upstream API returned status {status}: {body_preview}")]
    UpstreamApi { status: u16, body_preview: String },
    #[error("upstream request timed out after {0} ms")]
    Timeout(u64),
    #[error("upstream request failed: {0}")]
    RequestFailed(String),
}

impl ExecuteError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OperationNotFound(_) => "OPERATION_NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SchemaUnavailable => "SCHEMA_UNAVAILABLE",
            Self::WritesDisabled => "WRITES_DISABLED",
            Self::WriteConfirmationRequired(_) => "WRITE_CONFIRMATION_REQUIRED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::UpstreamApi { .. } => "HEROKU_API_ERROR",
            Self::Timeout(_) => "REQUEST_TIMEOUT",
            Self::RequestFailed(_) => "REQUEST_FAILED",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::OperationNotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::SchemaUnavailable => 503,
            Self::WritesDisabled | Self::WriteConfirmationRequired(_) => 403,
            Self::AuthRequired => 401,
            Self::UpstreamApi { status, .. } => *status,
            Self::Timeout(_) => 504,
            Self::RequestFailed(_) => 502,
        }
    }

    pub fn into_envelope(self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            status: Some(self.status()),
            message: self.to_string(),
        }
    }
}

/// Uniform error shape returned by the tool facade.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorEnvelope {
    pub fn schema_unavailable(message: impl Into<String>) -> Self {
        Self {
            code: "SCHEMA_UNAVAILABLE".to_string(),
            message: message.into(),
            status: Some(503),
        }
    }
}
