//! `shttp` executes HTTP requests through a fixed pipeline: rate limiting, request
//! middleware, an attempt loop with retries, redirects and cookies, then response
//! middleware that reads the body.
//!
//! # Quick Start
//!
//! ```no_run
//! use shttp::prelude::{Client, ClientOptions, Request};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new_redirect(ClientOptions::default().with_fail_retries(2), None)?;
//!
//!     let mut request = Request::parse("GET", "https://api.example.com/v1/items")?;
//!     request.set_header("Accept", "application/json")?;
//!     request.enable_trace();
//!
//!     let token = CancellationToken::new();
//!     let response = client.execute(&token, &mut request).await?;
//!     println!("status={} latency={:?}", response.status(), response.latency());
//!     println!("trace={:?}", response.request().trace_info());
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - No retries; set `fail_retries` to retry 429 and 5xx replies (except 501) and
//!   transport failures other than TLS errors.
//! - Waits between attempts grow from `retry_wait_min_ms` and never exceed
//!   `retry_wait_max_ms`.
//! - Response bodies are cut at `max_resp_body_size` bytes without an error.

mod body;
mod client;
mod connector;
mod content_encoding;
mod cookie;
mod error;
mod limiters;
mod middleware;
mod options;
mod rate_limit;
mod request;
mod response;
mod retry;
mod tls;
mod trace;
mod transport;
mod util;

pub use crate::body::{ReqBody, ResBody, full_res_body};
pub use crate::client::Client;
pub use crate::cookie::{CookieStore, Jar};
pub use crate::error::{
    BoxError, CancelPhase, Error, ErrorCode, MiddlewarePhase, TimeoutPhase, TransportErrorKind,
};
pub use crate::middleware::{RequestMiddleware, ResponseMiddleware};
pub use crate::options::{ClientOptions, DEFAULT_USER_AGENT};
pub use crate::rate_limit::{RateLimitPolicy, RateLimiter, WaitCanceled};
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy, RetryVerdict};
pub use crate::tls::{ClientIdentity, TlsOptions, TlsVersion};
pub use crate::trace::{TraceInfo, TraceRecorder};
pub use crate::transport::{
    ConnectionInfo, HyperTransport, Transport, TransportError, TransportFactory,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientOptions, CookieStore, Error, ErrorCode, Jar, Request, RequestMiddleware,
        Response, ResponseMiddleware, RetryPolicy, TlsOptions, TraceInfo, Transport,
    };
}
