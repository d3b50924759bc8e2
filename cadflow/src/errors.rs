//! Error types for the cadflow orchestrator.
//!
//! The taxonomy follows the pipeline's retry policy: validation problems are
//! raised before anything runs, execution and timeout failures are subject to a
//! stage's retry budget, and the remote-only errors carry their own escalation
//! rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for cadflow operations.
#[derive(Debug, Error)]
pub enum CadflowError {
    /// Bad parameter, missing input or invalid configuration.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Non-zero exit or a failure reported by the external tool.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A stage exceeded its wall-clock budget.
    #[error("Timed out after {seconds:.1}s")]
    Timeout {
        /// The configured timeout in seconds.
        seconds: f64,
    },

    /// The remote host could not be reached (after the reconnect budget).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote host rejected the credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A staged file did not arrive intact.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CadflowError {
    /// Returns the coarse error class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the stage retry budget applies to this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Converts the error into a record-friendly detail.
    #[must_use]
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

impl From<serde_json::Error> for CadflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Coarse error classes used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised before execution; never retried.
    Validation,
    /// Non-zero exit or tool-reported failure.
    Execution,
    /// Wall-clock budget exceeded.
    Timeout,
    /// Remote host unreachable.
    Connection,
    /// Credentials rejected.
    Auth,
    /// Size or checksum mismatch while staging files.
    Transfer,
    /// Cooperative cancellation.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns true if the stage retry budget applies to this class.
    ///
    /// Connection errors have already consumed the session reconnect budget
    /// by the time they reach a record, so they escalate directly.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Transfer => "transfer",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error information attached verbatim to execution records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// The error class.
    pub kind: ErrorKind,
    /// The error message (tool output is kept verbatim).
    pub message: String,
    /// Exit code of the process, when one was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// The last lines of stderr.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

impl ErrorDetail {
    /// Creates a new error detail.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            stderr_tail: Vec::new(),
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Sets the stderr tail.
    #[must_use]
    pub fn with_stderr_tail(mut self, tail: Vec<String>) -> Self {
        self.stderr_tail = tail;
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

/// What a validation error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// Parameter type name is not recognised.
    UnknownType,
    /// Parameter value does not fit its type.
    InvalidValue,
    /// A name appears twice where it must be unique.
    Duplicate,
    /// A declared required input is absent.
    MissingInput,
    /// A command template references something that does not exist.
    Template,
    /// Configuration or pipeline definition is inconsistent.
    Config,
    /// The interchange file could not be parsed.
    Syntax,
}

/// Error raised before any process or job is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// What went wrong.
    pub code: ValidationCode,
    /// The error message.
    pub message: String,
    /// Names of the parameters, inputs or stages involved.
    pub subjects: Vec<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            subjects: Vec::new(),
        }
    }

    /// Sets the subjects involved.
    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    /// An unrecognised parameter type name.
    #[must_use]
    pub fn unknown_type(type_name: &str) -> Self {
        Self::new(
            ValidationCode::UnknownType,
            format!("Invalid expression type: {type_name}"),
        )
        .with_subjects(vec![type_name.to_string()])
    }

    /// A value that does not fit the parameter's type.
    #[must_use]
    pub fn invalid_value(name: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ValidationCode::InvalidValue,
            format!("Invalid value for '{name}': {reason}"),
        )
        .with_subjects(vec![name.to_string()])
    }

    /// A duplicate name.
    #[must_use]
    pub fn duplicate(what: &str, name: &str) -> Self {
        Self::new(
            ValidationCode::Duplicate,
            format!("Duplicate {what} '{name}'"),
        )
        .with_subjects(vec![name.to_string()])
    }

    /// Declared inputs that are not available to a stage.
    #[must_use]
    pub fn missing_inputs(stage_id: &str, missing: Vec<String>) -> Self {
        Self::new(
            ValidationCode::MissingInput,
            format!(
                "Stage '{stage_id}' is missing required inputs: {}",
                missing.join(", ")
            ),
        )
        .with_subjects(missing)
    }

    /// A configuration problem.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ValidationCode::Config, message)
    }

    /// Returns true if this is a missing-input error.
    #[must_use]
    pub fn is_missing_input(&self) -> bool {
        self.code == ValidationCode::MissingInput
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = CadflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CadflowError::from(ValidationError::unknown_type("matrix")).kind(),
            ErrorKind::Validation
        );
        assert_eq!(CadflowError::Timeout { seconds: 1.0 }.kind(), ErrorKind::Timeout);
        assert_eq!(CadflowError::Auth("denied".into()).kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(CadflowError::Execution("exit 1".into()).is_retryable());
        assert!(CadflowError::Timeout { seconds: 5.0 }.is_retryable());
        assert!(!CadflowError::Auth("denied".into()).is_retryable());
        assert!(!CadflowError::Transfer("size".into()).is_retryable());
        assert!(!CadflowError::Connection("refused".into()).is_retryable());
        assert!(!CadflowError::from(ValidationError::config("bad")).is_retryable());
    }

    #[test]
    fn test_missing_inputs_message() {
        let err = ValidationError::missing_inputs("mesh", vec!["geometry".into(), "L4".into()]);
        assert!(err.is_missing_input());
        assert_eq!(err.subjects, vec!["geometry".to_string(), "L4".to_string()]);
        assert!(err.to_string().contains("geometry, L4"));
    }

    #[test]
    fn test_error_detail_display() {
        let detail = ErrorDetail::new(ErrorKind::Execution, "solver diverged").with_exit_code(3);
        assert_eq!(detail.to_string(), "[execution] solver diverged (exit code 3)");
    }

    #[test]
    fn test_error_detail_serialize() {
        let detail = ErrorDetail::new(ErrorKind::Transfer, "size mismatch");
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "transfer");
        assert!(json.get("exit_code").is_none());
    }
}
