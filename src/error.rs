use crate::error_code::StandardErrorCode;
use crate::service::ServiceId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Additional context about the error (e.g., offending value, file path)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "file_cache", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Failure reported by a caller-supplied remote operation.
///
/// The resilience layer never inspects the transport; it only needs the
/// classification carried here to decide on retries and breaker accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub code: StandardErrorCode,
    pub message: String,
    /// HTTP-equivalent status, when the upstream reported one.
    pub status: Option<u16>,
    /// Upstream hint for how long to back off before the next call.
    pub retry_after: Option<Duration>,
}

impl OperationError {
    pub fn new(code: StandardErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Classify a failure from an HTTP-equivalent status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(StandardErrorCode::from_http_status(status), message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::Network, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::ServerError, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::InvalidRequest, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::Authentication, message)
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} ({}, HTTP {}): {}",
                self.code.name(),
                self.code,
                status,
                self.message
            ),
            None => write!(f, "{} ({}): {}", self.code.name(), self.code, self.message),
        }
    }
}

impl std::error::Error for OperationError {}

/// Coarse classification of [`Error`], one variant per failure a caller handles differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CacheUnavailable,
    RateLimited,
    BreakerOpen,
    OperationFailedRetryable,
    OperationFailedPermanent,
    Timeout,
    Configuration,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheUnavailable => "cache_unavailable",
            Self::RateLimited => "rate_limited",
            Self::BreakerOpen => "breaker_open",
            Self::OperationFailedRetryable => "operation_failed_retryable",
            Self::OperationFailedPermanent => "operation_failed_permanent",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the resilience layer.
///
/// No variant is fatal to the process: each one fails a single request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cache unavailable: {message}{}", format_context(.context))]
    CacheUnavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("Rate limited: service '{service}' has no quota left in the current window")]
    RateLimited {
        service: ServiceId,
        retry_after: Option<Duration>,
    },

    #[error("Circuit breaker open for service '{service}'")]
    BreakerOpen {
        service: ServiceId,
        open_remaining: Option<Duration>,
    },

    #[error("Operation on service '{service}' failed after {attempts} attempt(s): {source}")]
    OperationFailed {
        service: ServiceId,
        attempts: u32,
        retryable: bool,
        #[source]
        source: OperationError,
    },

    #[error("Timed out on service '{service}' after {waited:?}{}", format_context(.context))]
    Timeout {
        service: ServiceId,
        waited: Duration,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn cache_unavailable(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::CacheUnavailable {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new().with_source("config"),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CacheUnavailable { .. } => ErrorKind::CacheUnavailable,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            Error::OperationFailed { retryable: true, .. } => ErrorKind::OperationFailedRetryable,
            Error::OperationFailed { .. } => ErrorKind::OperationFailedPermanent,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Configuration { .. } | Error::Yaml(_) => ErrorKind::Configuration,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Number of attempts made before the operation gave up, if it ran at all.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::OperationFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The underlying remote failure, if the operation ran and failed.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Error::OperationFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Service the error is scoped to, if any.
    pub fn service(&self) -> Option<&ServiceId> {
        match self {
            Error::RateLimited { service, .. }
            | Error::BreakerOpen { service, .. }
            | Error::OperationFailed { service, .. }
            | Error::Timeout { service, .. } => Some(service),
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::CacheUnavailable { context, .. }
            | Error::Timeout { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}
