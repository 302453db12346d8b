use std::fmt;
use std::time::Duration;

/// The error codes the core itself raises. Executor-supplied errors are
/// carried through unchanged via [`ExecutorError`] and are not re-encoded
/// into this enum; `MarkResult` classifies them by HTTP status instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ProviderNotFound,
    AuthNotFound,
    AuthUnavailable,
    AuthRequired,
    InvalidRequest,
    NotSupported,
    ExecutorNotFound,
    AllUpstreamModelsFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProviderNotFound => "provider_not_found",
            ErrorCode::AuthNotFound => "auth_not_found",
            ErrorCode::AuthUnavailable => "auth_unavailable",
            ErrorCode::AuthRequired => "auth_required",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::NotSupported => "not_supported",
            ErrorCode::ExecutorNotFound => "executor_not_found",
            ErrorCode::AllUpstreamModelsFailed => "all_upstream_models_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, user-visible dispatch outcome.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            http_status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn auth_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthNotFound, message)
    }

    pub fn auth_unavailable() -> Self {
        Self::new(ErrorCode::AuthUnavailable, "no usable credential")
    }

    pub fn provider_not_found(provider: &str) -> Self {
        Self::new(
            ErrorCode::ProviderNotFound,
            format!("no executor registered for provider '{provider}'"),
        )
    }

    pub fn all_upstream_models_failed(alias: &str, tried: &[String]) -> Self {
        Self::new(
            ErrorCode::AllUpstreamModelsFailed,
            format!(
                "all upstream models failed for alias '{alias}': {}",
                tried.join(", ")
            ),
        )
    }
}

/// Every candidate credential is in a timed cooldown for the requested
/// model; this is the sole trigger for cross-model fallback in the
/// conductor's execute cascade.
#[derive(Debug, Clone, thiserror::Error)]
#[error("model '{model}' is in cooldown, resets in {reset_in:?}")]
pub struct ModelCooldownError {
    pub model: String,
    pub provider: Option<String>,
    pub reset_in: Duration,
}

/// Outcome returned by a [`crate::selector::Selector`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    Cooldown(#[from] ModelCooldownError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Marker trait an executor's error type may implement to expose the HTTP
/// status it observed upstream, so `MarkResult` can classify the failure
/// without downcasting to a concrete provider error type.
pub trait HasStatusCode {
    fn status_code(&self) -> Option<u16>;
}

/// Marker trait exposing an upstream `Retry-After` duration, honored
/// verbatim for rate-limit cooldowns instead of the exponential schedule.
pub trait HasRetryAfter {
    fn retry_after(&self) -> Option<Duration>;
}

/// Opaque error returned by an [`crate::executor::Executor`] call.
///
/// Carries the boxed source error plus the two optional facets `MarkResult`
/// inspects, without requiring every executor to share a concrete error type.
#[derive(Debug)]
pub struct ExecutorError {
    pub source: Box<dyn std::error::Error + Send + Sync>,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl ExecutorError {
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            status_code: None,
            retry_after: None,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        struct Msg(String);
        Self {
            source: Box::new(Msg(message.into())),
            status_code: Some(status),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl HasStatusCode for ExecutorError {
    fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

impl HasRetryAfter for ExecutorError {
    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}
