use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpInfo;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::time::timeout;

use crate::body::{ReqBody, ResBody};
use crate::connector::{ProxyConfig, ProxyConnector, TraceConnector};
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::options::ClientOptions;
use crate::tls::build_rustls_tls_config;
use crate::trace::{self, TraceRecorder};
use crate::util::{classify_transport_error, lock_unpoisoned, seconds};

/// Socket addresses of the connection a response arrived on.
///
/// Transports insert it into the response extensions when they know it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{kind} failure: {source}")]
    Failed {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("no response within {}ms", .after.as_millis())]
    TimedOut { after: Duration },
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            kind,
            source: source.into(),
        }
    }
}

/// One HTTP exchange: send a request, return the response head with an unread body.
///
/// Redirects, cookies and retries are handled by the caller. A transport that can
/// observe connection setup reports it to `trace`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        request: http::Request<ReqBody>,
        trace: Option<Arc<TraceRecorder>>,
    ) -> Result<http::Response<ResBody>, TransportError>;
}

/// Picks the transport for one `execute` call.
pub trait TransportFactory: Send + Sync {
    fn transport_for_call(&self) -> Result<Arc<dyn Transport>, Error>;
}

type Connector = TraceConnector<HttpsConnector<ProxyConnector>>;

/// Default transport: a pooled hyper client over rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<Connector, ReqBody>,
    proxy_authorization: Option<HeaderValue>,
    response_timeout: Option<Duration>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn from_options(options: &ClientOptions) -> Result<Self, Error> {
        let tls_config = build_rustls_tls_config(&options.tls)?;
        Self::build(options, tls_config, true)
    }

    fn build(
        options: &ClientOptions,
        tls_config: rustls::ClientConfig,
        pooled: bool,
    ) -> Result<Self, Error> {
        let proxy_config = options.proxy_config()?;
        let proxy_authorization = proxy_config
            .as_ref()
            .and_then(|config: &ProxyConfig| config.authorization.clone());
        let dial_timeout = seconds(options.dial_timeout);
        let tcp = ProxyConnector::new(proxy_config, dial_timeout);
        let https = if options.enable_http2 {
            HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(tcp)
        } else {
            HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .wrap_connector(tcp)
        };
        let connector = TraceConnector::new(
            https,
            dial_timeout,
            seconds(options.tls_handshake_timeout),
        );

        let max_idle_per_host = if pooled && !options.disable_keep_alives {
            options.max_idle_conns
        } else {
            0
        };
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(seconds(options.idle_conn_timeout))
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector);

        let response_timeout =
            seconds(options.read_timeout).map(|read| read + dial_timeout.unwrap_or_default());

        Ok(Self {
            client,
            proxy_authorization,
            response_timeout,
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn exchange(
        &self,
        mut request: http::Request<ReqBody>,
        trace: Option<Arc<TraceRecorder>>,
    ) -> Result<http::Response<ResBody>, TransportError> {
        if let Some(authorization) = &self.proxy_authorization
            && request.uri().scheme_str() == Some("http")
        {
            request.headers_mut().insert(
                HeaderName::from_static("proxy-authorization"),
                authorization.clone(),
            );
        }

        let pending = trace::scoped(trace, self.client.request(request));
        let outcome = match self.response_timeout {
            Some(limit) => timeout(limit, pending)
                .await
                .map_err(|_| TransportError::TimedOut { after: limit })?,
            None => pending.await,
        };
        let response = outcome.map_err(|source| {
            TransportError::new(classify_transport_error(&source), source)
        })?;

        let (mut parts, body) = response.into_parts();
        if let Some(info) = parts.extensions.get::<HttpInfo>() {
            let connection = ConnectionInfo {
                remote_addr: Some(info.remote_addr()),
                local_addr: Some(info.local_addr()),
            };
            parts.extensions.insert(connection);
        }
        let body = body.map_err(|error| Box::new(error) as BoxError).boxed_unsync();
        Ok(http::Response::from_parts(parts, body))
    }
}

/// Single-connection mode: every call dials its own unpooled connection.
pub(crate) struct SoloConnectionFactory {
    options: ClientOptions,
    tls_config: rustls::ClientConfig,
    local_address: Arc<Mutex<Option<SocketAddr>>>,
}

impl SoloConnectionFactory {
    pub(crate) fn new(
        options: &ClientOptions,
        local_address: Arc<Mutex<Option<SocketAddr>>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            options: options.clone(),
            tls_config: build_rustls_tls_config(&options.tls)?,
            local_address,
        })
    }
}

impl TransportFactory for SoloConnectionFactory {
    fn transport_for_call(&self) -> Result<Arc<dyn Transport>, Error> {
        let inner = HyperTransport::build(&self.options, self.tls_config.clone(), false)?;
        Ok(Arc::new(LocalAddressRecorder {
            inner,
            local_address: Arc::clone(&self.local_address),
        }))
    }
}

struct LocalAddressRecorder {
    inner: HyperTransport,
    local_address: Arc<Mutex<Option<SocketAddr>>>,
}

#[async_trait]
impl Transport for LocalAddressRecorder {
    async fn exchange(
        &self,
        request: http::Request<ReqBody>,
        trace: Option<Arc<TraceRecorder>>,
    ) -> Result<http::Response<ResBody>, TransportError> {
        let response = self.inner.exchange(request, trace).await?;
        if let Some(local_addr) = response
            .extensions()
            .get::<ConnectionInfo>()
            .and_then(|info| info.local_addr)
        {
            *lock_unpoisoned(&self.local_address) = Some(local_addr);
        }
        Ok(response)
    }
}
