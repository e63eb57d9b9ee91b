use thiserror::Error;

/// Coarse classification of an [`IdentityError`].
///
/// Callers branch on the kind instead of inspecting message text. In
/// particular, [`ErrorKind::Absence`] marks expected "nothing configured"
/// signals that are part of normal credential discovery and must not be
/// reported as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or contradictory configuration. Permanent, never retried.
    Configuration,
    /// An optional source (environment variable, cached token) is not present.
    Absence,
    /// The request could not be sent, or the response could not be read.
    Transport,
    /// The identity provider or control plane answered with a failure.
    Provider,
    /// Internal state that should be impossible was observed.
    Invariant,
    /// The caller's cancellation signal fired.
    Cancelled,
}

/// Errors produced by credential resolution, token caching and the
/// management client.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("environment variable {name} is not set")]
    EnvVarNotSet { name: String },

    #[error("{0}")]
    NoCachedToken(String),

    #[error("Request during {operation} failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("{operation} failed (resp code {status}): {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Async operation ended with status {status}: {code} - {message}")]
    OperationFailed {
        status: String,
        code: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid state, {0}")]
    InvalidState(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::Configuration(_) => ErrorKind::Configuration,
            IdentityError::EnvVarNotSet { .. } | IdentityError::NoCachedToken(_) => {
                ErrorKind::Absence
            }
            IdentityError::Transport { .. } => ErrorKind::Transport,
            IdentityError::Api { .. }
            | IdentityError::Authentication(_)
            | IdentityError::OperationFailed { .. }
            | IdentityError::Serialization(_) => ErrorKind::Provider,
            IdentityError::InvariantViolation(_) | IdentityError::InvalidState(_) => {
                ErrorKind::Invariant
            }
            IdentityError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Single check used everywhere an optional credential source may be missing.
    pub fn is_absence(&self) -> bool {
        self.kind() == ErrorKind::Absence
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, request timeouts, throttling and server-side
    /// errors qualify. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            IdentityError::Transport { .. } => true,
            IdentityError::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    pub fn transport(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        IdentityError::Transport {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Builds an [`IdentityError::Api`] from a non-success response, keeping
    /// the raw body for diagnostics.
    pub async fn from_response(response: reqwest::Response, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => IdentityError::Api {
                operation,
                status,
                body,
            },
            Err(e) => IdentityError::Transport {
                operation,
                reason: format!("failed to read response body (resp code {status}): {e}"),
            },
        }
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for IdentityError {
    fn from(err: url::ParseError) -> Self {
        IdentityError::Configuration(format!("invalid URL: {err}"))
    }
}

pub type IdentityResult<T> = Result<T, IdentityError>;
