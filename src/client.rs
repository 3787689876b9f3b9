use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Method;
use http::header::{ACCEPT_ENCODING, HeaderValue, SET_COOKIE};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::body::{ResBody, build_http_request};
use crate::cookie::{CookieStore, Jar};
use crate::error::{BoxError, CancelPhase, Error, MiddlewarePhase, TimeoutPhase};
use crate::limiters::HostConnectionLimiter;
use crate::middleware::{
    DumpExchange, ReadResponseBody, RequestMiddleware, ResponseMiddleware, prepare_request,
    verify_request_method,
};
use crate::options::ClientOptions;
use crate::rate_limit::RateLimiter;
use crate::request::Request;
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::trace::TraceRecorder;
use crate::transport::{
    HyperTransport, SoloConnectionFactory, Transport, TransportError, TransportFactory,
};
use crate::util::{
    append_cookie_pairs, host_key, is_redirect_status, lock_unpoisoned, redact_uri_for_logs,
    redirect_method, redirect_target, same_origin, sanitize_headers_for_redirect,
};

const DECODABLE_ENCODINGS: &str = "gzip, deflate, br, zstd";

/// Executes [`Request`]s: rate limiting, middleware, retries, redirects and cookies.
///
/// Cloning a client, or deriving one with the `with_*` methods, copies the middleware
/// lists and options but keeps the transport, rate limiter and cookie store shared.
#[derive(Clone)]
pub struct Client {
    options: ClientOptions,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    follow_redirects: bool,
    close_connection: bool,
    retry_policy: RetryPolicy,
    host_limiter: Option<HostConnectionLimiter>,
    request_middleware: Vec<Arc<dyn RequestMiddleware>>,
    response_middleware: Vec<Arc<dyn ResponseMiddleware>>,
    local_address: Arc<Mutex<Option<SocketAddr>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("options", &self.options)
            .field("follow_redirects", &self.follow_redirects)
            .field("close_connection", &self.close_connection)
            .field("retry_policy", &self.retry_policy)
            .field("cookie_store", &self.cookie_store.is_some())
            .field("request_middleware", &self.request_middleware.len())
            .field("response_middleware", &self.response_middleware.len())
            .finish_non_exhaustive()
    }
}

/// Final hop of one attempt.
struct Exchange {
    response: http::Response<ResBody>,
    url: Url,
    decode_body: bool,
}

impl Client {
    /// Client that returns redirect replies to the caller.
    ///
    /// Without a cookie store the client gets a jar of its own.
    pub fn new(
        options: ClientOptions,
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> Result<Self, Error> {
        Self::build(options, cookie_store, false)
    }

    /// Client that follows up to `max_redirect` redirects.
    pub fn new_redirect(
        options: ClientOptions,
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> Result<Self, Error> {
        Self::build(options, cookie_store, true)
    }

    pub fn new_default(cookie_store: Option<Arc<dyn CookieStore>>) -> Result<Self, Error> {
        Self::new(ClientOptions::default(), cookie_store)
    }

    pub fn new_default_redirect(
        cookie_store: Option<Arc<dyn CookieStore>>,
    ) -> Result<Self, Error> {
        Self::new_redirect(ClientOptions::default(), cookie_store)
    }

    /// Client over a caller-supplied transport. `solo_conn` has no effect here.
    pub fn with_transport(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        cookie_store: Option<Arc<dyn CookieStore>>,
        follow_redirects: bool,
    ) -> Result<Self, Error> {
        options.verify()?;
        Self::assemble(
            options,
            transport,
            None,
            cookie_store,
            follow_redirects,
            Arc::new(Mutex::new(None)),
        )
    }

    fn build(
        options: ClientOptions,
        cookie_store: Option<Arc<dyn CookieStore>>,
        follow_redirects: bool,
    ) -> Result<Self, Error> {
        options.verify()?;
        let local_address = Arc::new(Mutex::new(None));
        let transport: Arc<dyn Transport> = Arc::new(HyperTransport::from_options(&options)?);
        let transport_factory: Option<Arc<dyn TransportFactory>> = if options.solo_conn {
            Some(Arc::new(SoloConnectionFactory::new(
                &options,
                Arc::clone(&local_address),
            )?))
        } else {
            None
        };
        Self::assemble(
            options,
            transport,
            transport_factory,
            cookie_store,
            follow_redirects,
            local_address,
        )
    }

    fn assemble(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        transport_factory: Option<Arc<dyn TransportFactory>>,
        cookie_store: Option<Arc<dyn CookieStore>>,
        follow_redirects: bool,
        local_address: Arc<Mutex<Option<SocketAddr>>>,
    ) -> Result<Self, Error> {
        let limiter = options
            .limiter()
            .cloned()
            .ok_or_else(|| Error::configuration("rate limiter is not set"))?;
        let (min_wait, max_wait) = options.retry_wait_bounds();
        let retry_policy = RetryPolicy::standard()
            .max_retries(options.fail_retries)
            .min_wait(min_wait)
            .max_wait(max_wait);
        let cookie_store =
            cookie_store.unwrap_or_else(|| Arc::new(Jar::new()) as Arc<dyn CookieStore>);

        Ok(Self {
            host_limiter: HostConnectionLimiter::new(options.max_conns_per_host),
            options,
            limiter,
            transport,
            transport_factory,
            cookie_store: Some(cookie_store),
            follow_redirects,
            close_connection: false,
            retry_policy,
            request_middleware: Vec::new(),
            response_middleware: Vec::new(),
            local_address,
        })
    }

    pub fn with_redirect(&self, follow_redirects: bool) -> Self {
        let mut client = self.clone();
        client.follow_redirects = follow_redirects;
        client
    }

    /// Derived client that neither sends nor stores cookies from a store.
    pub fn without_cookie_store(&self) -> Self {
        let mut client = self.clone();
        client.cookie_store = None;
        client
    }

    /// Derived client that sends `Connection: close` on every request.
    pub fn with_close_connection(&self, close_connection: bool) -> Self {
        let mut client = self.clone();
        client.close_connection = close_connection;
        client
    }

    /// Derived client with a different retry table. The retry ceiling comes from the
    /// policy, not from `fail_retries`.
    pub fn with_retry_policy(&self, retry_policy: RetryPolicy) -> Self {
        let mut client = self.clone();
        client.retry_policy = retry_policy;
        client
    }

    pub fn add_request_middleware(&mut self, middleware: impl RequestMiddleware + 'static) {
        self.request_middleware.push(Arc::new(middleware));
    }

    pub fn add_response_middleware(&mut self, middleware: impl ResponseMiddleware + 'static) {
        self.response_middleware.push(Arc::new(middleware));
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn cookie_store(&self) -> Option<&Arc<dyn CookieStore>> {
        self.cookie_store.as_ref()
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Local socket address of the last single-connection call.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *lock_unpoisoned(&self.local_address)
    }

    /// Runs `request` to completion.
    ///
    /// Waits for the rate limiter, runs the request middleware, then makes up to
    /// `fail_retries + 1` attempts. The returned response has its body read already.
    /// Canceling `token` aborts any wait, the in-flight attempt or the body read.
    pub async fn execute<'r>(
        &self,
        token: &CancellationToken,
        request: &'r mut Request,
    ) -> Result<Response<'r>, Error> {
        request.begin_execute(token);
        if self.limiter.wait(token).await.is_err() {
            return Err(Error::RateLimitCanceled {
                method: request.method().clone(),
                uri: redact_uri_for_logs(request.url().as_str()),
            });
        }

        self.run_request_middleware(request)?;

        let transport = match &self.transport_factory {
            Some(factory) => factory.transport_for_call()?,
            None => Arc::clone(&self.transport),
        };
        let exchange = self.send_with_retry(transport.as_ref(), request).await?;

        let request: &'r Request = request;
        let mut response = Response::new(
            request,
            exchange.url,
            exchange.response,
            exchange.decode_body,
        );
        self.run_response_middleware(&mut response).await?;
        Ok(response)
    }

    fn run_request_middleware(&self, request: &mut Request) -> Result<(), Error> {
        for middleware in &self.request_middleware {
            middleware
                .handle(request, self)
                .map_err(request_middleware_error)?;
        }
        verify_request_method(request, self).map_err(request_middleware_error)?;
        prepare_request(request, self).map_err(request_middleware_error)?;
        Ok(())
    }

    async fn run_response_middleware(&self, response: &mut Response<'_>) -> Result<(), Error> {
        ReadResponseBody
            .handle(response, self)
            .await
            .map_err(response_middleware_error)?;
        DumpExchange
            .handle(response, self)
            .await
            .map_err(response_middleware_error)?;
        for middleware in &self.response_middleware {
            middleware
                .handle(response, self)
                .await
                .map_err(response_middleware_error)?;
        }
        Ok(())
    }

    async fn send_with_retry(
        &self,
        transport: &dyn Transport,
        request: &mut Request,
    ) -> Result<Exchange, Error> {
        let token = request.cancellation_token().clone();
        let uri = redact_uri_for_logs(request.url().as_str());
        let max_attempts = self.retry_policy.configured_max_attempts();
        let mut retries = 0;

        loop {
            request.begin_attempt();
            let attempt = request.attempt();
            let method = request.method().clone();
            let span = info_span!(
                "shttp.request",
                method = %method,
                uri = %uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let current: &Request = request;
            let outcome = async {
                debug!("sending request");
                tokio::select! {
                    _ = token.cancelled() => None,
                    outcome = self.exchange(transport, current) => Some(outcome),
                }
            }
            .instrument(span)
            .await;
            let Some(outcome) = outcome else {
                return Err(Error::Canceled {
                    phase: CancelPhase::InFlight,
                    method,
                    uri,
                    attempts: attempt,
                });
            };

            let decision = RetryDecision {
                attempt,
                max_attempts,
                method: method.clone(),
                uri: uri.clone(),
                status: outcome
                    .as_ref()
                    .ok()
                    .map(|exchange| exchange.response.status()),
                transport_error_kind: match &outcome {
                    Err(Error::Transport { kind, .. }) => Some(*kind),
                    _ => None,
                },
                timeout_phase: match &outcome {
                    Err(Error::Timeout { phase, .. }) => Some(*phase),
                    _ => None,
                },
            };
            let verdict = self.retry_policy.evaluate(&token, &decision);
            if !verdict.should_retry {
                return outcome;
            }

            let delay = match &outcome {
                Ok(exchange) => self.retry_policy.backoff(
                    retries,
                    Some(exchange.response.status()),
                    Some(exchange.response.headers()),
                ),
                Err(_) => self.retry_policy.backoff(retries, None, None),
            };
            let last_error = match (outcome, verdict.error) {
                (_, Some(error)) | (Err(error), None) => error,
                (Ok(exchange), None) => Error::UnexpectedStatus {
                    status: exchange.response.status(),
                    method: method.clone(),
                    uri: uri.clone(),
                },
            };

            if retries >= self.retry_policy.configured_max_retries() {
                return Err(Error::RetryExhausted {
                    method,
                    uri,
                    attempts: attempt,
                    source: Box::new(last_error),
                });
            }

            warn!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt,
                error = %last_error,
                "retrying request"
            );
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Canceled {
                        phase: CancelPhase::Backoff,
                        method,
                        uri,
                        attempts: attempt,
                    });
                }
                _ = sleep(delay) => {}
            }
            retries += 1;
        }
    }

    /// One attempt: every hop of a redirect chain, with cookies applied per hop.
    async fn exchange(
        &self,
        transport: &dyn Transport,
        request: &Request,
    ) -> Result<Exchange, Error> {
        let attempts = request.attempt();
        let trace: Option<Arc<TraceRecorder>> = request.trace_recorder().cloned();
        let mut method = request.method().clone();
        let mut url = request.url().clone();
        let mut headers = request.headers().clone();
        let mut body = request.body().clone();
        let decode_body = !headers.contains_key(ACCEPT_ENCODING);
        if decode_body {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(DECODABLE_ENCODINGS));
        }
        let mut redirects = 0;

        loop {
            let mut hop_headers = headers.clone();
            if let Some(cookie_store) = &self.cookie_store
                && let Some(stored) = cookie_store.cookies(&url)
                && let Ok(pairs) = stored.to_str()
            {
                append_cookie_pairs(&mut hop_headers, pairs)?;
            }

            let permit = match (&self.host_limiter, host_key(&url)) {
                (Some(limiter), Some(host)) => Some(limiter.acquire(&host).await?),
                _ => None,
            };
            if let Some(recorder) = &trace {
                recorder.get_conn();
            }
            let http_request = build_http_request(method.clone(), &url, &hop_headers, body.clone())?;
            let response = transport
                .exchange(http_request, trace.clone())
                .await
                .map_err(|error| attempt_error(error, &method, &url, attempts))?;
            drop(permit);
            if let Some(recorder) = &trace {
                recorder.response_head_received();
            }

            if let Some(cookie_store) = &self.cookie_store {
                let mut set_cookies = response.headers().get_all(SET_COOKIE).iter();
                cookie_store.set_cookies(&mut set_cookies, &url);
            }

            let status = response.status();
            if !self.follow_redirects
                || !is_redirect_status(status)
                || redirects >= self.options.max_redirect
            {
                return Ok(Exchange {
                    response,
                    url,
                    decode_body,
                });
            }
            let Some(target) = redirect_target(&url, response.headers()) else {
                return Ok(Exchange {
                    response,
                    url,
                    decode_body,
                });
            };

            redirects += 1;
            let next_method = redirect_method(&method, status);
            let switched_to_get = next_method == Method::GET && method != Method::GET;
            if switched_to_get {
                body = Bytes::new();
            }
            sanitize_headers_for_redirect(&mut headers, switched_to_get, same_origin(&url, &target));
            debug!(
                status = status.as_u16(),
                location = %redact_uri_for_logs(target.as_str()),
                redirects = redirects,
                "following redirect"
            );
            method = next_method;
            url = target;
        }
    }
}

fn attempt_error(error: TransportError, method: &Method, url: &Url, attempts: usize) -> Error {
    let uri = redact_uri_for_logs(url.as_str());
    match error {
        TransportError::Failed { kind, source } => Error::Transport {
            kind,
            method: method.clone(),
            uri,
            attempts,
            source,
        },
        TransportError::TimedOut { after } => Error::Timeout {
            phase: TimeoutPhase::Transport,
            timeout_ms: after.as_millis(),
            method: method.clone(),
            uri,
            attempts,
        },
    }
}

fn request_middleware_error(source: BoxError) -> Error {
    Error::Middleware {
        phase: MiddlewarePhase::Request,
        source,
    }
}

/// A canceled body read is reported as a cancellation, not as a middleware failure.
fn response_middleware_error(source: BoxError) -> Error {
    match source.downcast::<Error>() {
        Ok(error) if matches!(*error, Error::Canceled { .. }) => *error,
        Ok(error) => Error::Middleware {
            phase: MiddlewarePhase::Response,
            source: error,
        },
        Err(source) => Error::Middleware {
            phase: MiddlewarePhase::Response,
            source,
        },
    }
}
