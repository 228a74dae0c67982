//! Normalized provider errors.
//!
//! Every failure surfaced by a provider is a [`ProviderError`]: a code, a
//! human-readable message and an `is_operational` flag separating transient
//! (retryable) conditions from permanent ones.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Boxed error accepted by [`format_error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A normalized error raised by a completion provider.
///
/// Created once per failed call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    code: ErrorCode,
    message: String,
    is_operational: bool,
}

/// Discriminated error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Anything not recognized by the taxonomy
    Unknown,
    /// Credential missing or rejected
    Authentication,
    /// Malformed request parameters
    InvalidRequest,
    /// Invalid provider or rate-limit configuration
    InvalidConfig,
    /// Upstream or local rate limit hit
    RateLimited {
        /// Server-suggested wait, if any
        retry_after: Option<Duration>,
    },
    /// A rate-limit request larger than the bucket can ever hold
    CapacityExceeded,
    /// Connection-level failure
    Network,
    /// Request exceeded its timeout
    Timeout,
    /// The model is temporarily overloaded
    Overloaded,
    /// The API returned an error status not covered above
    Api {
        /// HTTP status code
        status_code: u16,
    },
    /// Response body could not be decoded
    Parse,
    /// Transport failure while reading a streamed response
    Stream,
}

impl ErrorCode {
    /// Stable string form of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN_ERROR",
            Self::Authentication => "AUTHENTICATION_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Overloaded => "OVERLOADED",
            Self::Api { .. } => "API_ERROR",
            Self::Parse => "PARSE_ERROR",
            Self::Stream => "STREAM_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`format_error_with`] classifies errors it does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownErrorPolicy {
    /// Treat unknown errors as transient so they are retried
    #[default]
    Operational,
    /// Treat unknown errors as fatal so they propagate immediately
    Permanent,
}

impl UnknownErrorPolicy {
    /// Returns the `is_operational` value this policy assigns.
    #[must_use]
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Operational)
    }
}

impl ProviderError {
    /// Creates an operational error with the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_operational(code, message, true)
    }

    /// Creates an error with an explicit operational flag.
    #[must_use]
    pub fn with_operational(
        code: ErrorCode,
        message: impl Into<String>,
        is_operational: bool,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            is_operational,
        }
    }

    /// Creates an unknown error (operational).
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::with_operational(ErrorCode::Authentication, message, false)
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_operational(ErrorCode::InvalidRequest, message, false)
    }

    /// Creates an invalid configuration error naming the offending field.
    #[must_use]
    pub fn invalid_config(field: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::with_operational(
            ErrorCode::InvalidConfig,
            format!("invalid configuration for '{field}': {reason}"),
            false,
        )
    }

    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::new(ErrorCode::RateLimited { retry_after }, message)
    }

    /// Creates a capacity exceeded error for an unsatisfiable token request.
    #[must_use]
    pub fn capacity_exceeded(requested: f64, capacity: f64) -> Self {
        Self::with_operational(
            ErrorCode::CapacityExceeded,
            format!("requested {requested} tokens but the bucket only holds {capacity}"),
            false,
        )
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("request timed out after {} seconds", duration.as_secs()),
        )
    }

    /// Creates a model overloaded error.
    #[must_use]
    pub fn overloaded(model: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Overloaded, format!("model '{model}' is overloaded"))
    }

    /// Creates an API error. Server-side statuses (5xx) are operational.
    #[must_use]
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::with_operational(
            ErrorCode::Api { status_code },
            message,
            (500..=599).contains(&status_code),
        )
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::with_operational(ErrorCode::Parse, message, false)
    }

    /// Creates a stream transport error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Stream, message)
    }

    /// The error code.
    #[must_use]
    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the failure is transient and worth retrying.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.is_operational
    }

    /// Returns the retry-after hint if this is a rate limit error.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self.code {
            ErrorCode::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Normalizes any error into a [`ProviderError`].
///
/// A `ProviderError` passes through unchanged; anything else becomes an
/// operational [`ErrorCode::Unknown`].
pub fn format_error(err: impl Into<BoxError>) -> ProviderError {
    format_error_with(err, UnknownErrorPolicy::default())
}

/// Normalizes any error, classifying unrecognized ones with `policy`.
pub fn format_error_with(err: impl Into<BoxError>, policy: UnknownErrorPolicy) -> ProviderError {
    match err.into().downcast::<ProviderError>() {
        Ok(known) => *known,
        Err(other) => ProviderError::with_operational(
            ErrorCode::Unknown,
            other.to_string(),
            policy.is_operational(),
        ),
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(ErrorCode::Timeout, format!("request timed out: {error}"))
        } else if error.is_connect() {
            Self::network(format!("connection failed: {error}"))
        } else if error.is_decode() {
            Self::parse(format!("failed to decode response: {error}"))
        } else if let Some(status) = error.status() {
            Self::api(status.as_u16(), error.to_string())
        } else {
            Self::network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(error: serde_json::Error) -> Self {
        Self::parse(format!("failed to parse JSON: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_operational() {
        let error = ProviderError::new(ErrorCode::Network, "reset by peer");
        assert!(error.is_operational());
        assert_eq!(error.code(), &ErrorCode::Network);
        assert_eq!(error.message(), "reset by peer");
    }

    #[test]
    fn display_includes_code_and_message() {
        let error = ProviderError::authentication("invalid x-api-key");
        assert_eq!(error.to_string(), "[AUTHENTICATION_ERROR] invalid x-api-key");
    }

    #[test]
    fn permanent_kinds_are_not_operational() {
        assert!(!ProviderError::authentication("bad key").is_operational());
        assert!(!ProviderError::invalid_request("bad field").is_operational());
        assert!(!ProviderError::invalid_config("model", "empty").is_operational());
        assert!(!ProviderError::capacity_exceeded(10.0, 5.0).is_operational());
        assert!(!ProviderError::parse("truncated").is_operational());
    }

    #[test]
    fn transient_kinds_are_operational() {
        assert!(ProviderError::network("refused").is_operational());
        assert!(ProviderError::timeout(Duration::from_secs(5)).is_operational());
        assert!(ProviderError::rate_limited("slow down", None).is_operational());
        assert!(ProviderError::overloaded("claude").is_operational());
        assert!(ProviderError::stream("eof").is_operational());
    }

    #[test]
    fn api_errors_are_operational_only_for_server_statuses() {
        assert!(ProviderError::api(500, "internal").is_operational());
        assert!(ProviderError::api(503, "unavailable").is_operational());
        assert!(!ProviderError::api(400, "bad request").is_operational());
        assert!(!ProviderError::api(404, "not found").is_operational());
    }

    #[test]
    fn retry_after_only_for_rate_limited() {
        let limited = ProviderError::rate_limited("429", Some(Duration::from_secs(30)));
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(ProviderError::network("x").retry_after(), None);
    }

    #[test]
    fn format_error_passes_provider_errors_through() {
        let original = ProviderError::authentication("nope");
        let formatted = format_error(original.clone());
        assert_eq!(formatted, original);
        assert!(!formatted.is_operational());
    }

    #[test]
    fn format_error_is_idempotent() {
        let once = format_error("socket closed");
        let twice = format_error(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn format_error_wraps_foreign_errors_as_unknown() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let formatted = format_error(io);
        assert_eq!(formatted.code(), &ErrorCode::Unknown);
        assert_eq!(formatted.message(), "disk on fire");
        assert!(formatted.is_operational());
    }

    #[test]
    fn permanent_policy_marks_unknown_errors_fatal() {
        let formatted = format_error_with("malformed payload", UnknownErrorPolicy::Permanent);
        assert_eq!(formatted.code(), &ErrorCode::Unknown);
        assert!(!formatted.is_operational());
    }

    #[test]
    fn policy_does_not_touch_known_errors() {
        let known = ProviderError::network("refused");
        let formatted = format_error_with(known.clone(), UnknownErrorPolicy::Permanent);
        assert_eq!(formatted, known);
    }

    #[test]
    fn serde_json_errors_map_to_parse() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = ProviderError::from(err);
        assert_eq!(error.code(), &ErrorCode::Parse);
    }

    #[test]
    fn code_strings_are_stable() {
        assert_eq!(ErrorCode::Unknown.as_str(), "UNKNOWN_ERROR");
        assert_eq!(ErrorCode::Api { status_code: 502 }.as_str(), "API_ERROR");
        assert_eq!(
            ErrorCode::RateLimited { retry_after: None }.to_string(),
            "RATE_LIMITED"
        );
    }
}
