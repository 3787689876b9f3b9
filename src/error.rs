use http::{Method, StatusCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutPhase {
    Transport,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Transport => "transport",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

/// Which middleware chain aborted the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiddlewarePhase {
    Request,
    Response,
}

impl std::fmt::Display for MiddlewarePhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Request => "request",
            Self::Response => "response",
        };
        formatter.write_str(text)
    }
}

/// Where the caller's cancellation token interrupted an `execute` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelPhase {
    InFlight,
    Backoff,
    ResponseBody,
}

impl std::fmt::Display for CancelPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::InFlight => "in_flight",
            Self::Backoff => "backoff",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Configuration,
    InvalidUri,
    InvalidMethod,
    MethodNotAllowed,
    RequestBuild,
    RateLimitCanceled,
    Middleware,
    Transport,
    Timeout,
    UnexpectedStatus,
    RetryExhausted,
    Canceled,
    ReadBody,
    Deserialize,
    InvalidHeaderName,
    InvalidHeaderValue,
    DecodeContentEncoding,
    ConcurrencyLimitClosed,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidMethod => "invalid_method",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::RequestBuild => "request_build",
            Self::RateLimitCanceled => "rate_limit_canceled",
            Self::Middleware => "middleware",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::UnexpectedStatus => "unexpected_status",
            Self::RetryExhausted => "retry_exhausted",
            Self::Canceled => "canceled",
            Self::ReadBody => "read_body",
            Self::Deserialize => "deserialize",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::ConcurrencyLimitClosed => "concurrency_limit_closed",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid request method: {method}")]
    InvalidMethod { method: String },
    #[error("request method {method} is not allowed")]
    MethodNotAllowed { method: Method },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("rate limiter wait canceled for {method} {uri}")]
    RateLimitCanceled { method: Method, uri: String },
    #[error("{phase} middleware failed: {source}")]
    Middleware {
        phase: MiddlewarePhase,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri} after {attempts} attempt(s): {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        attempts: usize,
        #[source]
        source: BoxError,
    },
    #[error(
        "http request timed out in {phase} after {timeout_ms}ms for {method} {uri} on attempt {attempts}"
    )]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
        attempts: usize,
    },
    #[error("unexpected http status {status} for {method} {uri}")]
    UnexpectedStatus {
        status: StatusCode,
        method: Method,
        uri: String,
    },
    #[error("giving up on {method} {uri} after {attempts} attempt(s): {source}")]
    RetryExhausted {
        method: Method,
        uri: String,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("request canceled during {phase} for {method} {uri} after {attempts} attempt(s)")]
    Canceled {
        phase: CancelPhase,
        method: Method,
        uri: String,
        attempts: usize,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("connection limiter for {host} is closed")]
    ConcurrencyLimitClosed { host: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidMethod { .. } => ErrorCode::InvalidMethod,
            Self::MethodNotAllowed { .. } => ErrorCode::MethodNotAllowed,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::RateLimitCanceled { .. } => ErrorCode::RateLimitCanceled,
            Self::Middleware { .. } => ErrorCode::Middleware,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::Canceled { .. } => ErrorCode::Canceled,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::ConcurrencyLimitClosed { .. } => ErrorCode::ConcurrencyLimitClosed,
        }
    }

    /// Returns the error a middleware returned, if it was one of this crate's own errors.
    pub fn middleware_cause(&self) -> Option<&Error> {
        match self {
            Self::Middleware { source, .. } => source.downcast_ref::<Error>(),
            _ => None,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
