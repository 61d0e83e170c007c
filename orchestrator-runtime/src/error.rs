use std::fmt;

/// Errors returned by orchestrator operations.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Login or enrollment completion before any authenticator secret exists.
    NotEnrolled,
    /// Enrollment attempted while an authenticator secret is already stored.
    AlreadyEnrolled,
    /// TOTP code outside the accepted window.
    InvalidCode,
    /// Missing, unknown, or expired session credential.
    Unauthorized(String),
    /// Spawn refused because a tagged instance already exists.
    AlreadyRunning(u64),
    /// Operation requires a running sandbox and none exists.
    NotRunning,
    /// Cloud provider returned a non-success response.
    Provider(String),
    /// A bounded wait inside the snapshot saga elapsed.
    SagaTimeout(String),
    /// The in-instance agent rejected or failed a config push.
    ConfigApply(String),
    /// Invalid operator input or configuration.
    Validation(String),
    /// Internal storage/state error.
    Storage(String),
    /// Transport-level HTTP failure (connect, TLS, URL).
    Http(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NotEnrolled => write!(f, "not enrolled: no authenticator configured"),
            OrchestratorError::AlreadyEnrolled => write!(f, "already enrolled: authenticator exists"),
            OrchestratorError::InvalidCode => write!(f, "invalid authentication code"),
            OrchestratorError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            OrchestratorError::AlreadyRunning(id) => {
                write!(f, "sandbox already running (instance {id})")
            }
            OrchestratorError::NotRunning => write!(f, "no sandbox running"),
            OrchestratorError::Provider(msg) => write!(f, "provider error: {msg}"),
            OrchestratorError::SagaTimeout(msg) => write!(f, "saga step timed out: {msg}"),
            OrchestratorError::ConfigApply(msg) => write!(f, "config apply error: {msg}"),
            OrchestratorError::Validation(msg) => write!(f, "validation error: {msg}"),
            OrchestratorError::Storage(msg) => write!(f, "storage error: {msg}"),
            OrchestratorError::Http(msg) => write!(f, "http error: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
