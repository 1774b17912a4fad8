//! Standard failure codes for remote operations.
//!
//! Every failure an operation reports is classified into one of these codes. The
//! code decides whether the retry policy may try again and whether the failure says
//! anything about the health of the upstream service.
//!
//! ## Code Categories
//!
//! | Prefix | Category    | Description                      |
//! |--------|-------------|----------------------------------|
//! | E1xxx  | client      | Request-side errors              |
//! | E2xxx  | rate        | Upstream rate limit and quota    |
//! | E3xxx  | server      | Provider-side and network errors |
//! | E4xxx  | operational | Lifecycle and state conflicts    |
//! | E9xxx  | unknown     | Catch-all / unclassified         |
//!
//! ## Example
//!
//! ```rust
//! use coursegen_resilience::error_code::StandardErrorCode;
//!
//! let code = StandardErrorCode::from_http_status(503);
//! assert_eq!(code.code(), "E3002");
//! assert!(code.retryable());
//! assert_eq!(code.category(), "server");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardErrorCode {
    /// E1001: The request was rejected as malformed or refused by a content filter
    InvalidRequest,
    /// E1002: Credentials were missing or not accepted
    Authentication,
    /// E1003: Credentials accepted, but this model or voice is not allowed
    PermissionDenied,
    /// E1004: Unknown model, voice or image size
    NotFound,
    /// E1005: Prompt or narration text too long for the model
    RequestTooLarge,
    /// E2001: Throttled by the provider; may carry a retry-after hint
    RateLimited,
    /// E2002: Billing or usage quota used up; waiting will not help
    QuotaExhausted,
    /// E3001: The provider failed while handling the request
    ServerError,
    /// E3002: The provider is shedding load (503/529)
    Overloaded,
    /// E3003: No response in time, from us or from a gateway
    Timeout,
    /// E3004: The connection failed before a response arrived
    Network,
    /// E4001: The provider reported a conflicting concurrent request
    Conflict,
    /// E4002: The caller abandoned the request
    Cancelled,
    /// E9999: Anything else; treated as an upstream fault
    Unknown,
}

impl StandardErrorCode {
    /// Stable code string used in logs and metric tags.
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E1001",
            Self::Authentication => "E1002",
            Self::PermissionDenied => "E1003",
            Self::NotFound => "E1004",
            Self::RequestTooLarge => "E1005",
            Self::RateLimited => "E2001",
            Self::QuotaExhausted => "E2002",
            Self::ServerError => "E3001",
            Self::Overloaded => "E3002",
            Self::Timeout => "E3003",
            Self::Network => "E3004",
            Self::Conflict => "E4001",
            Self::Cancelled => "E4002",
            Self::Unknown => "E9999",
        }
    }

    /// snake_case name, identical to the serde representation.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::RequestTooLarge => "request_too_large",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "server_error",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Whether repeating the same request could plausibly succeed.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError
                | Self::Overloaded
                | Self::Timeout
                | Self::Network
                | Self::Conflict
        )
    }

    /// Returns whether this failure is evidence that the upstream is unhealthy.
    ///
    /// Client-side mistakes (bad input, bad credentials) say nothing about the
    /// upstream and must not trip a circuit breaker.
    #[inline]
    pub fn counts_against_upstream(&self) -> bool {
        matches!(
            self,
            Self::ServerError | Self::Overloaded | Self::Timeout | Self::Network | Self::Unknown
        )
    }

    /// Returns the category: `"client"`, `"rate"`, `"server"`, `"operational"`, or `"unknown"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest
            | Self::Authentication
            | Self::PermissionDenied
            | Self::NotFound
            | Self::RequestTooLarge => "client",
            Self::RateLimited | Self::QuotaExhausted => "rate",
            Self::ServerError | Self::Overloaded | Self::Timeout | Self::Network => "server",
            Self::Conflict | Self::Cancelled => "operational",
            Self::Unknown => "unknown",
        }
    }

    /// Classifies the error `type`/`code` string found in a provider's JSON error body.
    ///
    /// Accepts this crate's own names as well as the spellings LLM, image and
    /// speech providers commonly use. Unrecognised strings yield `None`.
    pub fn from_provider_code(provider_code: &str) -> Option<Self> {
        let code = match provider_code {
            "invalid_request" | "invalid_request_error" | "content_policy_violation"
            | "safety_rejection" | "unsupported_image_size" => {
                Self::InvalidRequest
            }
            "authentication" | "invalid_api_key" | "authentication_error" => Self::Authentication,
            "permission_denied" | "permission_error" => Self::PermissionDenied,
            "not_found" | "model_not_found" | "voice_not_found" => Self::NotFound,
            "request_too_large" | "context_length_exceeded" | "text_too_long" => {
                Self::RequestTooLarge
            }
            "rate_limited" | "rate_limit_exceeded" => Self::RateLimited,
            "quota_exhausted" | "insufficient_quota" | "quota_exceeded" | "billing_hard_limit_reached" => {
                Self::QuotaExhausted
            }
            "server_error" | "api_error" => Self::ServerError,
            "overloaded" | "overloaded_error" => Self::Overloaded,
            "timeout" | "request_timeout" | "gateway_timeout" => Self::Timeout,
            "network" | "connection_error" => Self::Network,
            "conflict" => Self::Conflict,
            "cancelled" => Self::Cancelled,
            _ => return None,
        };
        Some(code)
    }

    /// Best guess from an HTTP status alone. Unlisted 5xx statuses are server errors;
    /// anything else unlisted is `Unknown`.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 => Self::Authentication,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            413 => Self::RequestTooLarge,
            429 => Self::RateLimited,
            503 | 529 => Self::Overloaded,
            504 => Self::Timeout,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StandardErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
