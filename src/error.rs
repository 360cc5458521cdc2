//! Engine error taxonomy.
//!
//! Every fallible path in the engine surfaces one of these variants; gateway
//! and provider failures are never swallowed. The taxonomy maps 1:1 onto the
//! structured error shape the API layer renders (popup/banner/field).

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input or unresolvable parameter mapping. No side effects attempted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Gateway/provider timeout or non-success response.
    #[error("external service failure: {0}")]
    ExternalService(String),

    /// Durable write failed after a successful hold. Compensation has already
    /// been attempted by the time this surfaces.
    #[error("consistency failure: {0}")]
    Consistency(String),

    /// Execution not IN_PROGRESS, stale step cursor, or expired session.
    #[error("operation not allowed in current state: {0}")]
    Concurrency(String),

    /// One-time code past its expiry, or already consumed.
    #[error("one-time code has expired")]
    OtpExpired,

    /// Too many failed one-time code attempts.
    #[error("one-time code locked after too many attempts")]
    OtpLocked,

    /// Inactive workflow, malformed step config, missing trigger endpoint.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    System(String),
}

impl EngineError {
    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            EngineError::Consistency(_) => "CONSISTENCY_ERROR",
            EngineError::Concurrency(_) => "CONCURRENCY_ERROR",
            EngineError::OtpExpired => "OTP_EXPIRED",
            EngineError::OtpLocked => "OTP_LOCKED",
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// True when the caller may retry the same step without operator help
    /// (wrong OTP digits, transient provider outage).
    pub fn is_retriable_by_user(&self) -> bool {
        matches!(self, EngineError::OtpExpired | EngineError::ExternalService(_))
    }

    pub fn to_structured(&self) -> StructuredError {
        StructuredError::from(self)
    }
}

/// Render hint for the client: how the failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPresentation {
    /// Modal popup, blocking the current step.
    Popup,
    /// Non-blocking banner (workflow state problems, stale sessions).
    Banner,
    /// Field-level message next to the offending input.
    Field,
}

/// Client-facing error shape.
///
/// The API layer renders this without inspecting the internal taxonomy.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub title: String,
    pub message: String,
    pub code: String,
    pub kind: ErrorPresentation,
}

impl From<&EngineError> for StructuredError {
    fn from(err: &EngineError) -> Self {
        let (title, kind) = match err {
            EngineError::Validation(_) => ("Invalid request", ErrorPresentation::Field),
            EngineError::ExternalService(_) => ("Service unavailable", ErrorPresentation::Popup),
            EngineError::Consistency(_) => ("Transaction problem", ErrorPresentation::Popup),
            EngineError::Concurrency(_) => ("Session problem", ErrorPresentation::Banner),
            EngineError::OtpExpired => ("Code expired", ErrorPresentation::Popup),
            EngineError::OtpLocked => ("Too many attempts", ErrorPresentation::Popup),
            EngineError::Configuration(_) => ("Workflow unavailable", ErrorPresentation::Banner),
            EngineError::NotFound(_) => ("Not found", ErrorPresentation::Banner),
            EngineError::Storage(_) | EngineError::System(_) => {
                ("Something went wrong", ErrorPresentation::Popup)
            }
        };

        StructuredError {
            title: title.to_string(),
            message: err.to_string(),
            code: err.code().to_string(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(EngineError::OtpLocked.code(), "OTP_LOCKED");
        assert_eq!(EngineError::Consistency("x".into()).code(), "CONSISTENCY_ERROR");
    }

    #[test]
    fn test_structured_error_carries_message() {
        let err = EngineError::ExternalService("gateway timed out".to_string());
        let structured = err.to_structured();
        assert_eq!(structured.code, "EXTERNAL_SERVICE_ERROR");
        assert!(structured.message.contains("gateway timed out"));
        assert_eq!(structured.kind, ErrorPresentation::Popup);
    }

    #[test]
    fn test_validation_renders_field_level() {
        let err = EngineError::Validation("amount missing".to_string());
        assert_eq!(err.to_structured().kind, ErrorPresentation::Field);
    }
}
